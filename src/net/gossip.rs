//! The wire protocol and peer-discovery driver (spec.md §4.7-4.8). Handshake,
//! peers gossip, mempool exchange, block/transaction broadcast, and the
//! block catch-up loop all live here, dispatched from one `FrameSink` impl.
//!
//! Grounded directly on `original_source/handler.py`'s `NodeHandler`: the
//! message shapes (`version_req`/`version`, `peers`, `new_tx`, `new_block`,
//! `get_blocks`/`blocks`, `block_height`, `mem_pool_req`/`mem_pool`), its
//! `handler()` dispatch, and its `block_mined`/`block_added`/`tx_added`
//! callbacks — reproduced here as the event-pump thread below.

use crate::block::Block;
use crate::engine::{Blockchain, CATCHUP_WINDOW, MAX_CATCHUP_STALLS};
use crate::events::EngineEvent;
use crate::net::connection::{FrameSink, PeerConnection, PeerDirection};
use crate::net::server::{PeerServer, DEFAULT_PORT, MAX_PEERS};
use crate::transaction::Transaction;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

const PROTOCOL_VERSION: &str = "1.0";
const SERVICES: u32 = 0;

/// One wire frame. Every field the protocol can carry is optional; a given
/// message sets only the ones relevant to it, matching the original's
/// loosely-typed JSON dictionaries.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
struct Frame {
    time: Option<String>,
    snid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg: Option<String>,
    /// `[version, services, block_height]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<(String, u32, u64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    peers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_tx: Option<Transaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_block: Option<Block>,
    /// `[from_height, to_height]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    get_blocks: Option<(u64, u64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocks: Option<Vec<Block>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    block_height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mem_pool: Option<Vec<Transaction>>,
}

impl Frame {
    fn new() -> Self {
        Frame {
            time: Some(now_nanos().to_string()),
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct CatchupState {
    /// Local height the last time we asked this peer for more blocks.
    last_requested_at: u64,
    stalls: u32,
}

/// Handshake, gossip, and catch-up state layered over a `PeerServer`. Holds
/// no back-reference to the server's socket plumbing beyond the `Arc` it was
/// built with, so there is no reference cycle to reason about: the server
/// only ever borrows this as a `FrameSink` for the lifetime of one call.
pub struct GossipHandler {
    engine: Arc<Mutex<Blockchain>>,
    server: Arc<PeerServer>,
    known_peers: Mutex<Vec<SocketAddr>>,
    visited: Mutex<Vec<SocketAddr>>,
    catchup: Mutex<HashMap<String, CatchupState>>,
}

impl GossipHandler {
    pub fn new(engine: Arc<Mutex<Blockchain>>, server: Arc<PeerServer>, seed_peer: Option<SocketAddr>) -> Arc<Self> {
        Arc::new(GossipHandler {
            engine,
            server,
            known_peers: Mutex::new(seed_peer.into_iter().collect()),
            visited: Mutex::new(vec![]),
            catchup: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribes to engine events and rebroadcasts per the original's
    /// `block_mined`/`block_added`/`tx_added` callbacks. Runs for the life
    /// of the process on its own thread.
    pub fn spawn_event_pump(self: &Arc<Self>) {
        let (tx, rx) = channel();
        self.engine.lock().unwrap().add_event_sink(tx);

        let handler = Arc::clone(self);
        thread::spawn(move || {
            for event in rx {
                match event {
                    EngineEvent::BlockMined(block) => {
                        handler.server.broadcast(&handler.frame_with(|f| f.new_block = Some(block)), None);
                        handler.broadcast_block_height(None);
                    }
                    EngineEvent::BlockAdded { source_peer, .. } => {
                        handler.broadcast_block_height(source_peer.as_deref());
                    }
                    EngineEvent::TxAdded { txn, source_peer } => {
                        handler.server.broadcast(
                            &handler.frame_with(|f| f.new_tx = Some(txn)),
                            source_peer.as_deref(),
                        );
                    }
                    EngineEvent::PeerConnected { .. }
                    | EngineEvent::PeerDisconnected { .. }
                    | EngineEvent::NetworkCountersChanged { .. } => {}
                }
            }
        });
    }

    /// Breadth-first crawl of `known_peers`: dials the next unvisited
    /// address as long as we have fewer than two outbound connections.
    /// Deliberately never revisits an address once it moves to `visited`,
    /// even if it never panned out — matching the original's behavior
    /// (see DESIGN.md's "Open questions" section).
    pub fn establish_connection_with_network(self: &Arc<Self>) {
        if self.server.outbound_peers().len() >= 2 {
            return;
        }

        let next = {
            let mut known = self.known_peers.lock().unwrap();
            if known.is_empty() {
                return;
            }
            known.remove(0)
        };

        self.visited.lock().unwrap().push(next);
        let sink: Arc<dyn FrameSink> = Arc::clone(self);
        self.server.dial(next, sink);
    }

    fn frame_with(&self, set: impl FnOnce(&mut Frame)) -> String {
        let mut frame = Frame::new();
        frame.snid = Some(self.server.node_id().to_owned());
        set(&mut frame);
        serde_json::to_string(&frame).unwrap_or_default()
    }

    fn send(&self, conn: &Arc<PeerConnection>, set: impl FnOnce(&mut Frame)) {
        conn.send(&self.frame_with(set));
    }

    fn broadcast_block_height(&self, exclude: Option<&str>) {
        let height = self.engine.lock().unwrap().height();
        self.server
            .broadcast(&self.frame_with(|f| f.block_height = Some(height)), exclude);
    }

    fn handshake(&self, conn: &Arc<PeerConnection>) {
        self.send(conn, |f| f.msg = Some("version_req".to_owned()));
    }

    fn send_peers(&self, conn: &Arc<PeerConnection>) {
        let peers: Vec<String> = self
            .server
            .inbound_peers()
            .iter()
            .chain(self.server.outbound_peers().iter())
            .map(|c| c.remote_addr.to_string())
            .collect();

        if peers.len() > MAX_PEERS {
            self.send(conn, |f| {
                f.msg = Some("disconnect".to_owned());
                f.peers = Some(peers);
            });
        } else {
            self.send(conn, |f| f.peers = Some(peers));
        }
    }

    fn request_blocks(&self, conn: &Arc<PeerConnection>) {
        let height = self.engine.lock().unwrap().height();
        self.send(conn, |f| f.get_blocks = Some((height, height + CATCHUP_WINDOW)));
    }

    fn request_mem_pool(&self, conn: &Arc<PeerConnection>) {
        self.send(conn, |f| f.msg = Some("mem_pool_req".to_owned()));
    }

    fn send_mem_pool(&self, conn: &Arc<PeerConnection>) {
        let pool = self.engine.lock().unwrap().pool().to_vec();
        self.send(conn, |f| f.mem_pool = Some(pool));
    }

    fn learn_peers(&self, addrs: Vec<String>) {
        let mut known = self.known_peers.lock().unwrap();
        let visited = self.visited.lock().unwrap();

        for addr_str in addrs {
            let Ok(addr) = addr_str.parse::<SocketAddr>() else { continue };
            if !known.contains(&addr) && !visited.contains(&addr) {
                known.push(addr);
            }
        }
    }

    fn handle_new_block(&self, conn: &Arc<PeerConnection>, block: Block) {
        let mut engine = self.engine.lock().unwrap();
        match engine.add_block(block.clone(), false, Some(conn.node_id.clone())) {
            Ok(()) => {
                drop(engine);
                info!("accepted block {} from {}", block.hash, conn.node_id);
                self.server.broadcast(
                    &self.frame_with(|f| f.new_block = Some(block)),
                    Some(&conn.node_id),
                );
            }
            Err(err) => debug!("rejected block from {}: {err}", conn.node_id),
        }
    }

    fn handle_new_tx(&self, conn: &Arc<PeerConnection>, txn: Transaction) {
        let result = self.engine.lock().unwrap().add_transaction(txn, Some(conn.node_id.clone()));
        if let Err(err) = result {
            debug!("rejected transaction from {}: {err}", conn.node_id);
        }
    }

    fn handle_get_blocks(&self, conn: &Arc<PeerConnection>, from: u64, to: u64) {
        let engine = self.engine.lock().unwrap();
        let height = engine.height();
        let upper = to.min(height);

        let blocks: Vec<Block> = ((from + 1)..=upper).filter_map(|h| engine.block_at(h)).collect();
        drop(engine);

        self.send(conn, |f| f.blocks = Some(blocks));
    }

    /// Applies each block in a catch-up batch, then decides whether to
    /// keep requesting, settle up with a mempool exchange, or give up on
    /// this peer for now. Mirrors `handler.py`'s `blocks` handling,
    /// including the `MAX_CATCHUP_STALLS` guard against an infinite loop.
    fn handle_blocks(&self, conn: &Arc<PeerConnection>, blocks: Vec<Block>) {
        let height_before = self.engine.lock().unwrap().height();

        for block in blocks {
            let mut engine = self.engine.lock().unwrap();
            let _ = engine.add_block(block, false, Some(conn.node_id.clone()));
        }

        let height_after = self.engine.lock().unwrap().height();
        let peer_height = conn.meta.lock().unwrap().block_height;

        let mut catchup = self.catchup.lock().unwrap();
        let state = catchup.entry(conn.node_id.clone()).or_default();

        if peer_height > height_after && state.stalls < MAX_CATCHUP_STALLS {
            if height_after == height_before {
                state.stalls += 1;
            } else {
                state.stalls = 0;
            }
            state.last_requested_at = height_after;
            drop(catchup);
            self.request_blocks(conn);
        } else if peer_height == height_after {
            catchup.remove(&conn.node_id);
            drop(catchup);
            self.broadcast_block_height(None);
            self.request_mem_pool(conn);
        } else {
            state.stalls = 0;
        }
    }
}

impl FrameSink for GossipHandler {
    fn on_connected(&self, conn: &Arc<PeerConnection>) {
        match conn.direction {
            PeerDirection::Outbound => self.handshake(conn),
            PeerDirection::Inbound => self.send_peers(conn),
        }
    }

    fn on_frame(&self, conn: &Arc<PeerConnection>, frame: String) {
        let msg: Frame = match serde_json::from_str(&frame) {
            Ok(m) => m,
            Err(err) => {
                warn!("malformed frame from {}: {err}", conn.node_id);
                return;
            }
        };

        if let Some(block) = msg.new_block {
            self.handle_new_block(conn, block);
        }

        if let Some(txn) = msg.new_tx {
            self.handle_new_tx(conn, txn);
        }

        if let Some(peers) = msg.peers {
            self.learn_peers(peers);
            if conn.direction == PeerDirection::Outbound && msg.msg.is_none() {
                self.handshake(conn);
            }
        }

        if let Some((version, services, block_height)) = msg.version {
            let mut meta = conn.meta.lock().unwrap();
            meta.version = Some(version);
            meta.services = Some(services);
            meta.block_height = block_height;
            drop(meta);

            let my_height = self.engine.lock().unwrap().height();
            if block_height > my_height {
                self.request_blocks(conn);
            } else {
                self.request_mem_pool(conn);
            }
        }

        if let Some(command) = msg.msg.as_deref() {
            match command {
                "version_req" => {
                    if self.server.peer_count() > MAX_PEERS {
                        self.send(conn, |f| f.msg = Some("disconnect".to_owned()));
                        conn.terminate();
                        return;
                    }

                    let height = self.engine.lock().unwrap().height();
                    let known_version = conn.meta.lock().unwrap().version.is_some();
                    self.send(conn, |f| {
                        f.version = Some((PROTOCOL_VERSION.to_owned(), SERVICES, height));
                        if !known_version {
                            f.msg = Some("version_req".to_owned());
                        }
                    });
                }
                "disconnect" => conn.terminate(),
                "mem_pool_req" => self.send_mem_pool(conn),
                _ => {}
            }
        }

        if let Some((from, to)) = msg.get_blocks {
            self.handle_get_blocks(conn, from, to);
        }

        if let Some(blocks) = msg.blocks {
            self.handle_blocks(conn, blocks);
        }

        if let Some(height) = msg.block_height {
            conn.meta.lock().unwrap().block_height = height;
        }

        if let Some(pool) = msg.mem_pool {
            let mut engine = self.engine.lock().unwrap();
            for txn in pool {
                let _ = engine.add_transaction(txn, None);
            }
        }
    }

    fn on_disconnect(&self, conn: &Arc<PeerConnection>) {
        self.server.remove_peer(&conn.node_id);
        self.catchup.lock().unwrap().remove(&conn.node_id);
        self.establish_connection_with_network();
    }
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// The listen address a freshly bootstrapped `PeerServer` binds to when no
/// explicit port is configured.
pub fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeySigner;
    use crate::net::connection::PeerDirection;
    use crate::store::LedgerStore;
    use std::net::TcpListener;

    fn loopback_connection(node_id: &str) -> Arc<PeerConnection> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || std::net::TcpStream::connect(addr).unwrap());
        let (stream, remote) = listener.accept().unwrap();
        client.join().unwrap();
        PeerConnection::new(node_id.to_owned(), PeerDirection::Inbound, remote, stream)
    }

    fn new_handler() -> Arc<GossipHandler> {
        let miner = LocalKeySigner::generate();
        let store = LedgerStore::open_in_memory().expect("open store");
        let engine = Arc::new(Mutex::new(Blockchain::new(store, miner.address(), 1, 10).unwrap()));
        let server = PeerServer::new("127.0.0.1:0".parse().unwrap());
        GossipHandler::new(engine, server, None)
    }

    /// Boundary scenario from spec.md §8 #6: the catch-up loop gives up
    /// after `MAX_CATCHUP_STALLS` consecutive rounds with no local height
    /// advance, rather than looping forever against an unresponsive peer.
    #[test]
    fn catchup_gives_up_after_max_consecutive_stalls() {
        let handler = new_handler();
        let conn = loopback_connection("deadbeef");

        // The peer claims a much higher height than we can ever reach with
        // an empty `blocks` batch, so every round stalls.
        conn.meta.lock().unwrap().block_height = 1_000;

        for _ in 0..MAX_CATCHUP_STALLS {
            handler.handle_blocks(&conn, vec![]);
        }

        let catchup = handler.catchup.lock().unwrap();
        let state = catchup.get(&conn.node_id).expect("catchup state tracked for this peer");
        assert_eq!(state.stalls, MAX_CATCHUP_STALLS);
    }

    #[test]
    fn catchup_state_clears_once_heights_match() {
        let handler = new_handler();
        let conn = loopback_connection("cafef00d");

        conn.meta.lock().unwrap().block_height = 0;
        handler.handle_blocks(&conn, vec![]);

        assert!(!handler.catchup.lock().unwrap().contains_key(&conn.node_id));
    }
}
