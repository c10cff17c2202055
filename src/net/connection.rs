//! A framed TCP session (spec.md §4.6). Frames are UTF-8 JSON documents
//! terminated by the literal ASCII sequence `-TSN`; there is no length
//! prefix, so the receiver buffers bytes and splits on the terminator.
//!
//! Grounded directly on `original_source/connection.py`'s `send`/`run`
//! loop: a per-connection thread with a short read timeout, one
//! `terminate_flag`, and the exact `-TSN` buffering discipline.

use crate::error::NetError;
use log::debug;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const FRAME_TERMINATOR: &str = "-TSN";
const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDirection {
    Inbound,
    Outbound,
}

/// Anything a connection's receive loop can hand a completed frame to.
/// Implemented by `GossipHandler`; kept as a trait so `PeerConnection`
/// never needs to know about the gossip layer's internals.
pub trait FrameSink: Send + Sync {
    /// Called once a peer is registered, before its receive loop starts
    /// consuming frames. Outbound connections use this to send the
    /// opening handshake.
    fn on_connected(&self, conn: &Arc<PeerConnection>);
    fn on_frame(&self, conn: &Arc<PeerConnection>, frame: String);
    fn on_disconnect(&self, conn: &Arc<PeerConnection>);
}

/// Everything the gossip layer learns about a peer over the life of a
/// connection.
#[derive(Debug, Clone, Default)]
pub struct PeerMeta {
    pub version: Option<String>,
    pub services: Option<u32>,
    pub block_height: u64,
}

pub struct PeerConnection {
    pub node_id: String,
    pub direction: PeerDirection,
    pub remote_addr: SocketAddr,
    stream: Mutex<TcpStream>,
    terminate: Arc<AtomicBool>,
    last_send_nanos: AtomicU64,
    last_recv_nanos: AtomicU64,
    pub meta: Mutex<PeerMeta>,
}

impl PeerConnection {
    pub fn new(node_id: String, direction: PeerDirection, remote_addr: SocketAddr, stream: TcpStream) -> Arc<Self> {
        let _ = stream.set_read_timeout(Some(READ_TIMEOUT));

        Arc::new(PeerConnection {
            node_id,
            direction,
            remote_addr,
            stream: Mutex::new(stream),
            terminate: Arc::new(AtomicBool::new(false)),
            last_send_nanos: AtomicU64::new(0),
            last_recv_nanos: AtomicU64::new(0),
            meta: Mutex::new(PeerMeta::default()),
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }

    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::Relaxed);
    }

    pub fn last_send_nanos(&self) -> u64 {
        self.last_send_nanos.load(Ordering::Relaxed)
    }

    pub fn last_recv_nanos(&self) -> u64 {
        self.last_recv_nanos.load(Ordering::Relaxed)
    }

    /// Appends the frame terminator, writes, and updates `last_send`. Sets
    /// the terminate flag on any I/O error rather than propagating it —
    /// per spec.md §7, transport errors drop the peer, they are never
    /// fatal to the engine.
    pub fn send(&self, text: &str) {
        let mut framed = String::with_capacity(text.len() + FRAME_TERMINATOR.len());
        framed.push_str(text);
        framed.push_str(FRAME_TERMINATOR);

        let result = {
            let mut stream = self.stream.lock().unwrap();
            stream.write_all(framed.as_bytes())
        };

        match result {
            Ok(()) => self.last_send_nanos.store(now_nanos(), Ordering::Relaxed),
            Err(err) => {
                debug!("connection to {} stopping: {err}", self.remote_addr);
                self.terminate();
            }
        }
    }

    /// Spawns the receive loop on its own thread. Each extracted frame is
    /// handed to `sink` without interpretation; a zero-length read or any
    /// I/O error sets the terminate flag and ends the loop.
    pub fn spawn_receive_loop(self: &Arc<Self>, sink: Arc<dyn FrameSink>) -> JoinHandle<()> {
        let conn = Arc::clone(self);

        thread::spawn(move || {
            let mut buffer = String::new();
            let mut chunk = [0u8; 4096];

            while !conn.is_terminated() {
                let read_result = {
                    let mut stream = conn.stream.lock().unwrap();
                    stream.read(&mut chunk)
                };

                match read_result {
                    Ok(0) => {
                        conn.terminate();
                        break;
                    }
                    Ok(n) => {
                        conn.last_recv_nanos.store(now_nanos(), Ordering::Relaxed);
                        buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));

                        while let Some(idx) = buffer.find(FRAME_TERMINATOR) {
                            let frame = buffer[..idx].to_owned();
                            buffer.drain(..idx + FRAME_TERMINATOR.len());
                            sink.on_frame(&conn, frame);
                        }
                    }
                    Err(err) if is_timeout(&err) => continue,
                    Err(_) => {
                        conn.terminate();
                        break;
                    }
                }
            }

            sink.on_disconnect(&conn);
        })
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Connects to `addr` and performs the frameless 8-char node-id exchange
/// that precedes JSON framing (spec.md §4.7).
pub fn dial_and_exchange_id(addr: SocketAddr, my_id: &str) -> Result<(Arc<PeerConnection>, String), NetError> {
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(my_id.as_bytes())?;

    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf)?;
    if n == 0 {
        return Err(NetError::ConnectionClosed);
    }
    let peer_id = String::from_utf8_lossy(&buf[..n]).into_owned();

    let conn = PeerConnection::new(peer_id.clone(), PeerDirection::Outbound, addr, stream);
    Ok((conn, peer_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Mutex as StdMutex;

    struct CollectingSink {
        frames: StdMutex<Vec<String>>,
    }

    impl FrameSink for CollectingSink {
        fn on_connected(&self, _conn: &Arc<PeerConnection>) {}

        fn on_frame(&self, _conn: &Arc<PeerConnection>, frame: String) {
            self.frames.lock().unwrap().push(frame);
        }

        fn on_disconnect(&self, _conn: &Arc<PeerConnection>) {}
    }

    #[test]
    fn frames_are_split_on_the_terminator() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server_thread = thread::spawn(move || {
            let (stream, remote) = listener.accept().unwrap();
            PeerConnection::new("abcd1234".to_owned(), PeerDirection::Inbound, remote, stream)
        });

        let client = TcpStream::connect(addr).unwrap();
        let server_conn = server_thread.join().unwrap();

        let sink = Arc::new(CollectingSink { frames: StdMutex::new(vec![]) });
        server_conn.spawn_receive_loop(sink.clone());

        let mut client = client;
        client.write_all(b"{\"a\":1}-TSN{\"b\":2}-TSN").unwrap();

        thread::sleep(Duration::from_millis(200));
        server_conn.terminate();

        let frames = sink.frames.lock().unwrap();
        assert_eq!(*frames, vec!["{\"a\":1}".to_owned(), "{\"b\":2}".to_owned()]);
    }
}
