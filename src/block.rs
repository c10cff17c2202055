//! An ordered bundle of transactions with a deterministic hash. No fork
//! bookkeeping lives here: the engine only ever extends a strictly taller
//! chain (see `engine.rs` and `DESIGN.md`'s "Fork handling" resolution).

use crate::crypto::{sha256_hex, Address, BlockHash};
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

pub const GENESIS_NONCE: u64 = 1670;
pub const GENESIS_TIMESTAMP: u128 = 0;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub timestamp: u128,
    pub previous_hash: BlockHash,
    pub difficulty: u32,
    pub nonce: u64,
    pub height: u64,
    pub transactions: Vec<Transaction>,
    pub hash: BlockHash,
}

impl Block {
    /// Builds a block and computes its hash from `nonce`. Used both by the
    /// `MiningWorker` (which tries many nonces) and for the genesis block
    /// (which has a precomputed nonce and needs no search).
    pub fn new(
        timestamp: u128,
        previous_hash: BlockHash,
        difficulty: u32,
        nonce: u64,
        height: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        let tx_data = ordered_tx_data(&transactions);
        let hash = compute_hash(timestamp, &previous_hash, nonce, &tx_data);

        Block {
            timestamp,
            previous_hash,
            difficulty,
            nonce,
            height,
            transactions,
            hash,
        }
    }

    /// The literal string hashed to produce `hash`: transactions ordered by
    /// timestamp, each contributing its own `tx_data()`.
    pub fn tx_data(&self) -> String {
        ordered_tx_data(&self.transactions)
    }

    /// Recomputes the hash from the block's current fields; used to check
    /// that a received block's `hash` field matches its contents.
    pub fn recompute_hash(&self) -> BlockHash {
        compute_hash(self.timestamp, &self.previous_hash, self.nonce, &self.tx_data())
    }

    pub fn meets_difficulty(&self) -> bool {
        leading_zero_hex_digits(&self.hash.0) >= self.difficulty as usize
    }

    /// Whether `hash` begins with at least `required` leading zero hex
    /// digits, independent of the block's own declared `difficulty` field.
    pub fn meets_required_difficulty(&self, required: u32) -> bool {
        leading_zero_hex_digits(&self.hash.0) >= required as usize
    }

    pub fn validate_transactions(&self, mining_reward: u64) -> bool {
        self.transactions.iter().all(|t| t.verify(mining_reward))
    }

    pub fn genesis(miner: &Address, reward: u64, difficulty: u32) -> Self {
        let coinbase = Transaction::new_coinbase(miner, reward, GENESIS_TIMESTAMP);

        Block::new(
            GENESIS_TIMESTAMP,
            BlockHash("0".repeat(64)),
            difficulty,
            GENESIS_NONCE,
            0,
            vec![coinbase],
        )
    }
}

fn ordered_tx_data(transactions: &[Transaction]) -> String {
    let mut ordered: Vec<&Transaction> = transactions.iter().collect();
    ordered.sort_by_key(|t| t.timestamp);

    ordered.iter().map(|t| t.tx_data()).collect::<Vec<_>>().join("")
}

fn compute_hash(timestamp: u128, previous_hash: &BlockHash, nonce: u64, tx_data: &str) -> BlockHash {
    let preimage = format!("{}{}{}{}", timestamp, previous_hash, nonce, tx_data);
    BlockHash(sha256_hex(preimage.as_bytes()))
}

fn leading_zero_hex_digits(hash: &str) -> usize {
    hash.chars().take_while(|&c| c == '0').count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeySigner;

    #[test]
    fn genesis_block_has_expected_shape() {
        let miner = LocalKeySigner::generate();
        let genesis = Block::genesis(&miner.address(), 10, 6);

        assert_eq!(genesis.height, 0);
        assert_eq!(genesis.timestamp, 0);
        assert_eq!(genesis.previous_hash.as_str().len(), 64);
        assert!(genesis.previous_hash.as_str().chars().all(|c| c == '0'));
        assert_eq!(genesis.nonce, GENESIS_NONCE);
        assert_eq!(genesis.hash, genesis.recompute_hash());
    }

    #[test]
    fn recompute_hash_is_deterministic() {
        let miner = LocalKeySigner::generate();
        let genesis = Block::genesis(&miner.address(), 10, 6);
        let rebuilt = Block::new(
            genesis.timestamp,
            genesis.previous_hash.clone(),
            genesis.difficulty,
            genesis.nonce,
            genesis.height,
            genesis.transactions.clone(),
        );

        assert_eq!(genesis.hash, rebuilt.hash);
    }

    #[test]
    fn difficulty_check_counts_leading_zero_hex_digits() {
        assert_eq!(leading_zero_hex_digits("000abc"), 3);
        assert_eq!(leading_zero_hex_digits("0"), 1);
        assert_eq!(leading_zero_hex_digits(""), 0);
        assert_eq!(leading_zero_hex_digits("abc"), 0);
    }
}
