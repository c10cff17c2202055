//! Process-level configuration (spec.md §6 "process bootstrap"). The
//! teacher's own `main.rs` has no flag parsing at all — it forwards
//! `env::args()` straight into its command dispatcher — so this is a new
//! ambient layer, grounded on `mintlayer-core`'s workspace-wide use of
//! `clap` derive CLIs rather than ported from the teacher.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "votechain-node", about = "A peer-to-peer voting ledger node")]
pub struct NodeConfig {
    /// Address to listen for peer connections on.
    #[arg(long, default_value = "0.0.0.0:54846")]
    pub listen_addr: SocketAddr,

    /// Address of an existing node to bootstrap peers from. Omit to start
    /// a fresh network.
    #[arg(long)]
    pub seed_peer: Option<SocketAddr>,

    /// Path to the sqlite ledger file. Defaults to an in-memory store if
    /// omitted, useful for local experimentation.
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Start mining immediately on boot.
    #[arg(long)]
    pub mine: bool,

    /// Address credited for mined blocks and genesis's initial supply.
    /// Generates a throwaway key if omitted.
    #[arg(long)]
    pub miner_address: Option<String>,

    /// Required leading zero hex digits in a block hash.
    #[arg(long, default_value_t = 6)]
    pub difficulty: u32,

    /// Empty tokens awarded per mined block.
    #[arg(long, default_value_t = 10)]
    pub mining_reward: u64,
}
