//! The peer-to-peer transport: framed connections, the accept/dial
//! registry, and the gossip protocol layered over both (spec.md §4.6-§4.8).

pub mod connection;
pub mod gossip;
pub mod server;

pub use connection::{FrameSink, PeerConnection, PeerDirection};
pub use gossip::GossipHandler;
pub use server::PeerServer;
