//! The REPL's command table (spec.md §6): balances, transfers, poll
//! creation/voting, mining toggles, and peer/network introspection.
//! Grounded on the teacher's `commands/session.rs::listen_for_commands`
//! shape, generalized from a P2PKH wallet to the three-kind token model.

use crate::command::{Command, CommandInvocation, CommandMap, Field, FieldType};
use crate::commands::{now_nanos, Session};
use crate::crypto::{Address, Signer, TkId};
use crate::net::FrameSink;
use crate::transaction::Transaction;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

fn whoami(_invocation: &CommandInvocation, session: Option<&Session>) -> Result<(), Box<dyn Error>> {
    let session = session.ok_or("no active session")?;
    println!("{}", session.signer.address());
    Ok(())
}

fn balance(_invocation: &CommandInvocation, session: Option<&Session>) -> Result<(), Box<dyn Error>> {
    let session = session.ok_or("no active session")?;
    let balances = session.facade.balances(&session.signer.address());

    println!("Empty tokens (spendable): {}", balances.empty_spendable);
    println!("Pending ballots held:     {}", balances.pending_ballots);
    println!("Votes submitted:          {}", balances.submitted);
    println!("Votes confirmed:          {}", balances.confirmed);
    Ok(())
}

fn send(invocation: &CommandInvocation, session: Option<&Session>) -> Result<(), Box<dyn Error>> {
    let session = session.ok_or("no active session")?;
    let to = Address::from(invocation.get_field("to-address").unwrap().as_str());
    let amount = invocation.get_field("amount").unwrap().parse::<u64>()?;

    let engine = session.facade.engine().lock().unwrap();
    let txn = Transaction::transfer(&session.signer.address(), &to, amount, now_nanos(), &*engine, &session.signer);
    drop(engine);

    match txn {
        None => println!("Insufficient empty tokens for that transfer"),
        Some(txn) => {
            if session.facade.submit_transaction(txn) {
                println!("Submitted transfer of {amount} to {to}");
            } else {
                println!("Transaction was rejected");
            }
        }
    }

    Ok(())
}

fn create_poll(invocation: &CommandInvocation, session: Option<&Session>) -> Result<(), Box<dyn Error>> {
    let session = session.ok_or("no active session")?;
    let voter = Address::from(invocation.get_field("voter-address").unwrap().as_str());
    let question = invocation.get_field("question").unwrap();
    let options: Vec<String> = invocation
        .get_field("options")
        .unwrap()
        .split(',')
        .map(|s| s.trim().to_owned())
        .collect();

    let engine = session.facade.engine().lock().unwrap();
    let txn = Transaction::serialize_ballot(
        &session.signer.address(),
        &voter,
        question,
        options,
        now_nanos(),
        &*engine,
        &session.signer,
    );
    drop(engine);

    match txn {
        None => println!("You hold no spendable empty token to mint a ballot with"),
        Some(txn) => {
            if session.facade.submit_transaction(txn) {
                println!("Serialized a ballot for {voter}");
            } else {
                println!("Transaction was rejected");
            }
        }
    }

    Ok(())
}

fn vote(invocation: &CommandInvocation, session: Option<&Session>) -> Result<(), Box<dyn Error>> {
    let session = session.ok_or("no active session")?;
    let poll = Address::from(invocation.get_field("poll-address").unwrap().as_str());
    let tkid = TkId::from(invocation.get_field("tkid").unwrap().as_str());
    let option_index = invocation.get_field("option-index").unwrap().parse::<usize>()?;

    let engine = session.facade.engine().lock().unwrap();
    let txn = Transaction::cast_ballot(
        &session.signer.address(),
        &poll,
        &tkid,
        option_index,
        now_nanos(),
        &*engine,
        &session.signer,
    );
    drop(engine);

    match txn {
        None => println!("No matching serialized ballot found for this address"),
        Some(txn) => {
            if session.facade.submit_transaction(txn) {
                println!("Cast vote on poll {poll}");
            } else {
                println!("Transaction was rejected");
            }
        }
    }

    Ok(())
}

fn mine_on(_invocation: &CommandInvocation, session: Option<&Session>) -> Result<(), Box<dyn Error>> {
    let session = session.ok_or("no active session")?;
    session.facade.enable_mining(session.signer.address());
    println!("Mining enabled");
    Ok(())
}

fn mine_off(_invocation: &CommandInvocation, session: Option<&Session>) -> Result<(), Box<dyn Error>> {
    let session = session.ok_or("no active session")?;
    session.facade.disable_mining();
    println!("Mining disabled");
    Ok(())
}

fn status(_invocation: &CommandInvocation, session: Option<&Session>) -> Result<(), Box<dyn Error>> {
    let session = session.ok_or("no active session")?;
    println!("Height:         {}", session.facade.height());
    println!("Last block:     {}", session.facade.last_block_hash());
    println!("Blocks mined:   {}", session.facade.blocks_mined());
    println!("Peer count:     {}", session.server.peer_count());
    println!("Connection:     {:?}", session.server.connection_status());
    Ok(())
}

fn peers(_invocation: &CommandInvocation, session: Option<&Session>) -> Result<(), Box<dyn Error>> {
    let session = session.ok_or("no active session")?;
    println!("Node id: {}", session.server.node_id());

    for conn in session.server.inbound_peers() {
        println!("  <- {} ({})", conn.remote_addr, conn.node_id);
    }
    for conn in session.server.outbound_peers() {
        println!("  -> {} ({})", conn.remote_addr, conn.node_id);
    }

    Ok(())
}

fn connect(invocation: &CommandInvocation, session: Option<&Session>) -> Result<(), Box<dyn Error>> {
    let session = session.ok_or("no active session")?;
    let addr = invocation.get_field("addr").unwrap().parse()?;

    let sink: Arc<dyn FrameSink> = Arc::clone(&session.gossip);
    session.server.dial(addr, sink);
    println!("Dialing {addr}");
    Ok(())
}

fn set_root_peer(invocation: &CommandInvocation, session: Option<&Session>) -> Result<(), Box<dyn Error>> {
    let session = session.ok_or("no active session")?;
    let addr = invocation.get_field("addr").unwrap().parse()?;

    match session.server.set_root_peer(addr) {
        Ok(()) => println!("Root peer set to {addr}"),
        Err(err) => println!("{err}"),
    }
    Ok(())
}

pub fn make_command_map<'a>() -> CommandMap<&'a Session> {
    let mut out: CommandMap<&'a Session> = HashMap::new();

    out.insert(
        "whoami".to_owned(),
        Command {
            processor: whoami,
            expected_fields: vec![],
            flags: vec![],
            desc: "Print this node's own address".to_owned(),
        },
    );
    out.insert(
        "balance".to_owned(),
        Command {
            processor: balance,
            expected_fields: vec![],
            flags: vec![],
            desc: "Show this node's token balances and vote counts".to_owned(),
        },
    );
    out.insert(
        "send".to_owned(),
        Command {
            processor: send,
            expected_fields: vec![
                Field::new("to-address", FieldType::Pos(0), "Recipient address"),
                Field::new("amount", FieldType::Pos(1), "Amount of empty tokens to send"),
            ],
            flags: vec![],
            desc: "Transfer empty tokens to another address".to_owned(),
        },
    );
    out.insert(
        "create-poll".to_owned(),
        Command {
            processor: create_poll,
            expected_fields: vec![
                Field::new("voter-address", FieldType::Pos(0), "Address the ballot is issued to"),
                Field::new("options", FieldType::Pos(1), "Comma-separated answer options"),
                Field::new("question", FieldType::Spaces(2), "The poll question"),
            ],
            flags: vec![],
            desc: "Mint a serialized (unanswered) ballot for a voter".to_owned(),
        },
    );
    out.insert(
        "vote".to_owned(),
        Command {
            processor: vote,
            expected_fields: vec![
                Field::new("poll-address", FieldType::Pos(0), "Address of the poll to vote on"),
                Field::new("tkid", FieldType::Pos(1), "The serialized ballot's token id"),
                Field::new("option-index", FieldType::Pos(2), "Index of the chosen option"),
            ],
            flags: vec![],
            desc: "Cast a vote against a serialized ballot held by this address".to_owned(),
        },
    );
    out.insert(
        "mine-on".to_owned(),
        Command {
            processor: mine_on,
            expected_fields: vec![],
            flags: vec![],
            desc: "Start mining blocks with this node's address as beneficiary".to_owned(),
        },
    );
    out.insert(
        "mine-off".to_owned(),
        Command {
            processor: mine_off,
            expected_fields: vec![],
            flags: vec![],
            desc: "Stop mining".to_owned(),
        },
    );
    out.insert(
        "status".to_owned(),
        Command {
            processor: status,
            expected_fields: vec![],
            flags: vec![],
            desc: "Show chain height, last block hash, and peer count".to_owned(),
        },
    );
    out.insert(
        "peers".to_owned(),
        Command {
            processor: peers,
            expected_fields: vec![],
            flags: vec![],
            desc: "List this node's inbound and outbound peer connections".to_owned(),
        },
    );
    out.insert(
        "connect".to_owned(),
        Command {
            processor: connect,
            expected_fields: vec![Field::new(
                "addr",
                FieldType::Pos(0),
                "Address (ip:port) of a node to connect to",
            )],
            flags: vec![],
            desc: "Dial a peer directly".to_owned(),
        },
    );
    out.insert(
        "set-root-peer".to_owned(),
        Command {
            processor: set_root_peer,
            expected_fields: vec![Field::new(
                "addr",
                FieldType::Pos(0),
                "Address (ip:port) of the bootstrap peer to remember",
            )],
            flags: vec![],
            desc: "Configure the bootstrap peer; rejected while any peer is connected".to_owned(),
        },
    );

    out
}
