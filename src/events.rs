//! The UI-facing observer surface (spec.md §6, §9 "Shared mutable UI
//! state"). The engine emits typed events instead of writing directly to
//! shared fields; `Facade` is the thin command/query wrapper the GUI
//! collaborator is specified to consume.

use crate::block::Block;
use crate::crypto::Address;
use crate::engine::Blockchain;
use crate::token::TokenKind;
use crate::transaction::Transaction;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A block accepted from the network. `source_peer`, if set, is the
    /// node id it arrived from; gossip excludes that peer on rebroadcast.
    BlockAdded { block: Block, source_peer: Option<String> },
    /// A block this node mined itself. Never carries a source peer.
    BlockMined(Block),
    TxAdded {
        txn: Transaction,
        /// The node id of the peer we received this from, if any. Gossip
        /// uses this to avoid echoing a transaction back to its source.
        source_peer: Option<String>,
    },
    PeerConnected { node_id: String, inbound: bool },
    PeerDisconnected { node_id: String },
    NetworkCountersChanged { sent: u64, received: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    NotConnected,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WalletBalances {
    pub empty_spendable: u64,
    pub pending_ballots: u64,
    pub submitted: u64,
    pub confirmed: u64,
}

/// The facade the GUI collaborator is specified to drive: current height,
/// peer lists, wallet balances, and the handful of command methods that
/// mutate engine state. Every mutation goes through the engine's own
/// `Mutex`, so concurrent callers (the GUI thread, a REPL) serialise
/// naturally with the peer-connection threads.
pub struct Facade {
    engine: Arc<Mutex<Blockchain>>,
    events_rx: Mutex<Receiver<EngineEvent>>,
}

impl Facade {
    /// Registers its own event sink on `engine` and wraps it. `GossipHandler`
    /// registers a separate sink the same way, so the UI and the rebroadcast
    /// pump each see every event without contending over one receiver.
    pub fn new(engine: Arc<Mutex<Blockchain>>) -> Self {
        let (tx, rx) = std::sync::mpsc::channel();
        engine.lock().unwrap().add_event_sink(tx);

        Facade {
            engine,
            events_rx: Mutex::new(rx),
        }
    }

    pub fn engine(&self) -> &Arc<Mutex<Blockchain>> {
        &self.engine
    }

    /// Drains every event queued since the last call without blocking.
    /// The GUI collaborator polls this on a timer; a REPL can ignore it.
    pub fn poll_events(&self) -> Vec<EngineEvent> {
        let rx = self.events_rx.lock().unwrap();
        rx.try_iter().collect()
    }

    pub fn height(&self) -> u64 {
        self.engine.lock().unwrap().height()
    }

    pub fn last_block_hash(&self) -> String {
        self.engine.lock().unwrap().last_block_hash().to_string()
    }

    pub fn blocks_mined(&self) -> u64 {
        self.engine.lock().unwrap().blocks_mined()
    }

    pub fn balances(&self, address: &Address) -> WalletBalances {
        let engine = self.engine.lock().unwrap();
        WalletBalances {
            empty_spendable: engine.token_balance(address, TokenKind::Empty),
            pending_ballots: engine.token_balance(address, TokenKind::Serialized),
            submitted: engine.submitted_votes(address),
            confirmed: engine.confirmed_votes(address),
        }
    }

    pub fn enable_mining(&self, miner: Address) {
        self.engine.lock().unwrap().enable_mining(miner);
    }

    pub fn disable_mining(&self) {
        self.engine.lock().unwrap().disable_mining();
    }

    pub fn submit_transaction(&self, txn: Transaction) -> bool {
        self.engine.lock().unwrap().add_transaction(txn, None).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeySigner;
    use crate::store::LedgerStore;

    #[test]
    fn facade_reports_genesis_height_zero() {
        let miner = LocalKeySigner::generate();
        let store = LedgerStore::open_in_memory().expect("open store");
        let engine = Blockchain::new(store, miner.address(), 6, 10).expect("engine boots");
        let facade = Facade::new(Arc::new(Mutex::new(engine)));

        assert_eq!(facade.height(), 0);
        assert_eq!(facade.balances(&miner.address()).empty_spendable, 10);
    }
}
