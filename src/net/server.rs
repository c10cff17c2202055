//! Accept/dial and the inbound/outbound peer registries (spec.md §4.7).
//!
//! Grounded on `original_source/node.py` (`init_server`, `connect_to_node`,
//! the 8-char `sha512(host+port)` node id exchanged before framing begins)
//! and the teacher's `v1/net.rs::listen_for_connections` (accept loop on
//! its own thread, one connection object per accepted socket).

use crate::crypto::sha512_hex;
use crate::error::NetError;
use crate::events::ConnectionStatus;
use crate::net::connection::{dial_and_exchange_id, FrameSink, PeerConnection, PeerDirection};
use log::{info, warn};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 54846;
pub const MAX_PEERS: usize = 5;

pub struct PeerServer {
    node_id: String,
    listen_addr: SocketAddr,
    inbound: Mutex<Vec<Arc<PeerConnection>>>,
    outbound: Mutex<Vec<Arc<PeerConnection>>>,
    /// At most one outbound dial in flight at a time (spec.md §5).
    dialing: Mutex<bool>,
    /// Whether this node has ever registered a peer, inbound or outbound.
    /// Distinguishes "never found the network" (`Disconnected`) from "had
    /// peers, lost them all" (`NotConnected`) once the registries are empty.
    ever_connected: Mutex<bool>,
    /// The peer this node was configured to bootstrap from (spec.md §6's
    /// `set_root_peer` facade method). Changing it while any peer is
    /// connected is rejected — the GUI surfaces this as "Cannot change root
    /// node whilst connected" (spec.md §7).
    root_peer: Mutex<Option<SocketAddr>>,
}

impl PeerServer {
    pub fn new(listen_addr: SocketAddr) -> Arc<Self> {
        Self::with_root_peer(listen_addr, None)
    }

    pub fn with_root_peer(listen_addr: SocketAddr, root_peer: Option<SocketAddr>) -> Arc<Self> {
        let node_id = sha512_hex(format!("{}{}", listen_addr.ip(), listen_addr.port()).as_bytes())[..8].to_owned();

        Arc::new(PeerServer {
            node_id,
            listen_addr,
            inbound: Mutex::new(vec![]),
            outbound: Mutex::new(vec![]),
            dialing: Mutex::new(false),
            ever_connected: Mutex::new(false),
            root_peer: Mutex::new(root_peer),
        })
    }

    pub fn root_peer(&self) -> Option<SocketAddr> {
        *self.root_peer.lock().unwrap()
    }

    /// Replaces the configured root (bootstrap) peer. Rejected while any
    /// peer, inbound or outbound, is connected.
    pub fn set_root_peer(&self, addr: SocketAddr) -> Result<(), NetError> {
        if self.peer_count() > 0 {
            return Err(NetError::RootPeerChangeWhileConnected);
        }

        *self.root_peer.lock().unwrap() = Some(addr);
        Ok(())
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn inbound_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.inbound.lock().unwrap().clone()
    }

    pub fn outbound_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.outbound.lock().unwrap().clone()
    }

    pub fn peer_count(&self) -> usize {
        self.inbound.lock().unwrap().len() + self.outbound.lock().unwrap().len()
    }

    /// The facade-visible connection status (spec.md §6): `Connecting`
    /// while an outbound dial is in flight, `Connected` once any peer is
    /// registered, `NotConnected` once we have dialed out before and have
    /// no peers left, `Disconnected` if we have never had a peer at all.
    pub fn connection_status(&self) -> ConnectionStatus {
        if *self.dialing.lock().unwrap() {
            return ConnectionStatus::Connecting;
        }

        if self.peer_count() > 0 {
            return ConnectionStatus::Connected;
        }

        if *self.ever_connected.lock().unwrap() {
            ConnectionStatus::NotConnected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    pub fn remove_peer(&self, node_id: &str) {
        self.inbound.lock().unwrap().retain(|c| c.node_id != node_id);
        self.outbound.lock().unwrap().retain(|c| c.node_id != node_id);
    }

    /// Sends `text` to every peer but `exclude`, in parallel: each
    /// connection's socket write happens on its own scoped thread so one
    /// slow/blocked peer cannot stall delivery to the rest.
    pub fn broadcast(&self, text: &str, exclude: Option<&str>) {
        let targets: Vec<Arc<PeerConnection>> = self
            .inbound_peers()
            .into_iter()
            .chain(self.outbound_peers())
            .filter(|conn| Some(conn.node_id.as_str()) != exclude)
            .collect();

        crossbeam::scope(|scope| {
            for conn in &targets {
                scope.spawn(move |_| conn.send(text));
            }
        })
        .expect("broadcast scope threads do not panic");
    }

    /// Runs the accept loop on the calling thread (the caller spawns it).
    /// Binds `listen_addr`, and for every accepted socket, exchanges node
    /// ids, registers an inbound `PeerConnection`, and starts its receive
    /// loop feeding `sink`.
    pub fn run_accept_loop(self: &Arc<Self>, sink: Arc<dyn FrameSink>) -> Result<(), NetError> {
        let listener = TcpListener::bind(self.listen_addr)
            .map_err(|err| NetError::BindFailed(self.listen_addr.to_string(), err))?;
        info!("listening for peers on {}", self.listen_addr);

        for incoming in listener.incoming() {
            let stream = match incoming {
                Ok(s) => s,
                Err(err) => {
                    warn!("error accepting connection: {err}");
                    continue;
                }
            };

            let remote = match stream.peer_addr() {
                Ok(addr) => addr,
                Err(_) => continue,
            };

            let (peer_id, conn) = match exchange_inbound_id(&self.node_id, stream, remote) {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("node id exchange with {remote} failed: {err}");
                    continue;
                }
            };

            if self.peer_count() >= MAX_PEERS {
                info!("max peers exceeded; not registering {peer_id}");
                continue;
            }

            self.inbound.lock().unwrap().push(conn.clone());
            *self.ever_connected.lock().unwrap() = true;
            sink.on_connected(&conn);
            conn.spawn_receive_loop(sink.clone());
        }

        Ok(())
    }

    /// Dials `addr` on a short-lived helper thread. At most one outbound
    /// dial is in flight at a time; a second call while one is pending is
    /// a no-op.
    pub fn dial(self: &Arc<Self>, addr: SocketAddr, sink: Arc<dyn FrameSink>) {
        {
            let mut dialing = self.dialing.lock().unwrap();
            if *dialing {
                info!("already dialing a peer; ignoring request to dial {addr}");
                return;
            }
            *dialing = true;
        }

        let server = Arc::clone(self);
        let node_id = self.node_id.clone();

        thread::spawn(move || {
            match dial_and_exchange_id(addr, &node_id) {
                Ok((conn, peer_id)) => {
                    info!("connected to peer {peer_id} at {addr}");
                    server.outbound.lock().unwrap().push(conn.clone());
                    *server.ever_connected.lock().unwrap() = true;
                    sink.on_connected(&conn);
                    conn.spawn_receive_loop(sink);
                }
                Err(err) => warn!("failed to connect to {addr}: {err}"),
            }

            *server.dialing.lock().unwrap() = false;
        });
    }
}

fn exchange_inbound_id(
    my_id: &str,
    mut stream: std::net::TcpStream,
    remote: SocketAddr,
) -> Result<(String, Arc<PeerConnection>), NetError> {
    use std::io::{Read, Write};

    stream.set_read_timeout(Some(Duration::from_secs(10)))?;

    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf)?;
    if n == 0 {
        return Err(NetError::ConnectionClosed);
    }
    let peer_id = String::from_utf8_lossy(&buf[..n]).into_owned();

    stream.write_all(my_id.as_bytes())?;

    let conn = PeerConnection::new(peer_id.clone(), PeerDirection::Inbound, remote, stream);
    Ok((peer_id, conn))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_eight_hex_characters() {
        let server = PeerServer::new("127.0.0.1:54846".parse().unwrap());
        assert_eq!(server.node_id().len(), 8);
        assert!(server.node_id().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
