//! Process bootstrap (spec.md §6). The teacher's own `main.rs` is a thin
//! shim that forwards `env::args()` into `dispatch_command` with no state
//! at all; everything below it — config parsing, store/engine/network
//! wiring, the mining poll thread, the REPL loop — is new, grounded on how
//! the teacher's `commands/session.rs::listen_for_commands` assembles a
//! `Mutex<State>` before handing control to the command dispatcher.

use clap::Parser;
use std::error::Error;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use votechain_core::command::dispatch_command;
use votechain_core::commands::top_level::make_command_map;
use votechain_core::commands::Session;
use votechain_core::config::NodeConfig;
use votechain_core::crypto::{Address, LocalKeySigner, Signer};
use votechain_core::engine::Blockchain;
use votechain_core::events::Facade;
use votechain_core::net::{FrameSink, GossipHandler, PeerServer};
use votechain_core::store::LedgerStore;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let config = NodeConfig::parse();

    let store = match &config.db_path {
        Some(path) => LedgerStore::open(path)?,
        None => LedgerStore::open_in_memory()?,
    };

    let signer = LocalKeySigner::generate();
    let miner_address = match &config.miner_address {
        Some(addr) => Address::from(addr.as_str()),
        None => signer.address(),
    };
    log::info!("wallet address: {}", signer.address());
    if config.miner_address.is_none() {
        log::info!("no --miner-address given, genesis/mining credited to the generated wallet above");
    }

    let engine = Arc::new(Mutex::new(Blockchain::new(
        store,
        miner_address.clone(),
        config.difficulty,
        config.mining_reward,
    )?));

    let server = PeerServer::with_root_peer(config.listen_addr, config.seed_peer);
    let facade = Arc::new(Facade::new(engine.clone()));
    let gossip = GossipHandler::new(engine.clone(), server.clone(), config.seed_peer);
    gossip.spawn_event_pump();

    {
        let server = server.clone();
        let sink: Arc<dyn FrameSink> = gossip.clone();
        thread::spawn(move || {
            if let Err(err) = server.run_accept_loop(sink) {
                log::error!("accept loop exited: {err}");
            }
        });
    }

    if config.seed_peer.is_some() {
        gossip.establish_connection_with_network();
    }

    {
        let engine = engine.clone();
        thread::spawn(move || loop {
            engine.lock().unwrap().poll_mining();
            thread::sleep(Duration::from_millis(100));
        });
    }

    if config.mine {
        facade.enable_mining(miner_address);
    }

    run_repl(facade, signer, server, gossip, config.listen_addr);
    Ok(())
}

fn run_repl(facade: Arc<Facade>, signer: LocalKeySigner, server: Arc<PeerServer>, gossip: Arc<GossipHandler>, listen_addr: SocketAddr) {
    let session = Session { facade, signer, server, gossip };
    let command_map = make_command_map();

    println!("Listening on {listen_addr}. Type 'help' for a list of commands.");

    let stdin = io::stdin();
    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            break;
        }

        let mut line = String::new();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }

        let args: Vec<String> = line.split_whitespace().map(|s| s.to_owned()).collect();
        if args.is_empty() {
            continue;
        }
        if args[0] == "exit" || args[0] == "quit" {
            break;
        }

        dispatch_command(&args, &command_map, Some(&session));
    }
}
