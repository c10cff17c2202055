//! REPL command processors (spec.md §6). Grounded on the teacher's
//! `commands/session.rs`: each processor locks the shared state just long
//! enough to do its work and print a result, the way `getpeerinfo`/
//! `send-coins-p2pkh` do there.

pub mod top_level;

use crate::crypto::LocalKeySigner;
use crate::events::Facade;
use crate::net::{GossipHandler, PeerServer};
use std::sync::Arc;

/// Everything a REPL command needs: the facade for engine queries/
/// mutations, this node's own signing key, and the network handles for
/// `peers`/`connect`.
pub struct Session {
    pub facade: Arc<Facade>,
    pub signer: LocalKeySigner,
    pub server: Arc<PeerServer>,
    pub gossip: Arc<GossipHandler>,
}

pub fn now_nanos() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}
