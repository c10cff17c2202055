//! A cancellable proof-of-work search over one candidate block, run on its
//! own OS thread. The worker never touches the ledger; it reports a
//! finalised `Block` back to the engine thread through a channel.

use crate::block::Block;
use crate::crypto::{sha256_hex, BlockHash};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub struct MiningWorker {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MiningWorker {
    /// Starts mining `candidate` (with `nonce` ignored; the worker searches
    /// its own nonce space from 0) and reports the finished block — found
    /// or cancelled — through `result_tx`.
    pub fn start(
        mut candidate: Block,
        difficulty: u32,
        result_tx: Sender<Block>,
    ) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = cancel.clone();

        let handle = thread::spawn(move || {
            // The transaction-data string never changes across nonce
            // attempts; compute it once.
            let tx_data = candidate.tx_data();
            let mut nonce: u64 = 0;

            loop {
                if worker_cancel.load(Ordering::Relaxed) {
                    debug!("mining worker for height {} cancelled", candidate.height);
                    candidate.nonce = nonce;
                    candidate.hash = hash_attempt(&candidate, nonce, &tx_data);
                    let _ = result_tx.send(candidate);
                    return;
                }

                let hash = hash_attempt(&candidate, nonce, &tx_data);

                if leading_zero_hex_digits(&hash.0) >= difficulty as usize {
                    candidate.nonce = nonce;
                    candidate.hash = hash;
                    info!("mined block at height {} with nonce {}", candidate.height, nonce);
                    let _ = result_tx.send(candidate);
                    return;
                }

                nonce = nonce.wrapping_add(1);
            }
        });

        MiningWorker {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MiningWorker {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn hash_attempt(candidate: &Block, nonce: u64, tx_data: &str) -> BlockHash {
    let preimage = format!(
        "{}{}{}{}",
        candidate.timestamp, candidate.previous_hash, nonce, tx_data
    );
    BlockHash(sha256_hex(preimage.as_bytes()))
}

fn leading_zero_hex_digits(hash: &str) -> usize {
    hash.chars().take_while(|&c| c == '0').count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeySigner;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn finds_a_nonce_meeting_low_difficulty() {
        let miner = LocalKeySigner::generate();
        let candidate = Block::genesis(&miner.address(), 10, 1);
        // Rebuild with nonce 0 and difficulty low enough to find quickly.
        let candidate = Block::new(
            candidate.timestamp,
            candidate.previous_hash,
            1,
            0,
            candidate.height,
            candidate.transactions,
        );

        let (tx, rx) = channel();
        let worker = MiningWorker::start(candidate, 1, tx);
        let mined = rx.recv_timeout(Duration::from_secs(5)).expect("worker reports a block");

        assert!(mined.meets_difficulty());
        worker.join();
    }

    #[test]
    fn cancellation_stops_the_search_promptly() {
        let miner = LocalKeySigner::generate();
        // A difficulty this high is unreachable in the test's lifetime, so
        // the only way `rx` yields a block is via the cancellation path.
        let candidate = Block::genesis(&miner.address(), 10, 64);

        let (tx, rx) = channel();
        let worker = MiningWorker::start(candidate, 64, tx);
        worker.cancel();

        rx.recv_timeout(Duration::from_secs(5))
            .expect("worker reports a block promptly after cancellation");
        worker.join();
    }
}
