//! SQLite-backed ledger store: the seven tables from spec.md §6. Owned
//! exclusively by the engine thread; never touched by the mining worker.

use crate::block::Block;
use crate::crypto::{Address, BlockHash, TkId, TxId};
use crate::error::StoreError;
use crate::token::{Token, TokenKind};
use crate::transaction::{Input, Output, Transaction, TxnKind, UtxoSource};
use crate::value::{Value, MINING_REWARD_SENTINEL};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = LedgerStore { conn };
        store.create_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = LedgerStore { conn };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS Blocks (
                hash TEXT PRIMARY KEY,
                previous_hash TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                difficulty INTEGER NOT NULL,
                nonce INTEGER NOT NULL,
                height INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS Transactions (
                txid TEXT PRIMARY KEY,
                block_hash TEXT NOT NULL REFERENCES Blocks(hash),
                type INTEGER NOT NULL,
                value TEXT NOT NULL,
                from_address TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS Inputs (
                txid TEXT NOT NULL,
                output_txid TEXT NOT NULL,
                ind INTEGER NOT NULL,
                value TEXT NOT NULL,
                recipient TEXT NOT NULL,
                sig BLOB NOT NULL,
                type INTEGER NOT NULL,
                PRIMARY KEY (txid, output_txid, ind)
            );

            CREATE TABLE IF NOT EXISTS Outputs (
                txid TEXT NOT NULL,
                ind INTEGER NOT NULL,
                value TEXT NOT NULL,
                recipient TEXT NOT NULL,
                sig BLOB NOT NULL,
                utxo BOOLEAN NOT NULL,
                type INTEGER NOT NULL,
                PRIMARY KEY (txid, ind)
            );

            CREATE TABLE IF NOT EXISTS Serialised_Tokens (
                tkid TEXT PRIMARY KEY,
                poll_address TEXT NOT NULL,
                voter_address TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                question TEXT NOT NULL,
                options TEXT NOT NULL,
                ans TEXT NOT NULL,
                sig BLOB NOT NULL,
                txid TEXT NOT NULL,
                ind INTEGER NOT NULL,
                locked BOOLEAN NOT NULL
            );

            CREATE TABLE IF NOT EXISTS Locked_Tokens (
                tkid TEXT PRIMARY KEY,
                poll_address TEXT NOT NULL,
                voter_address TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                question TEXT NOT NULL,
                options TEXT NOT NULL,
                ans TEXT NOT NULL,
                sig BLOB NOT NULL,
                txid TEXT NOT NULL,
                ind INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS Memory_Pool (
                txid TEXT NOT NULL,
                ind INTEGER NOT NULL,
                PRIMARY KEY (txid, ind)
            );
            ",
        )?;

        Ok(())
    }

    /// Inserts the block and, transitively, every transaction, input, and
    /// output; flips kind-1 outputs into `Serialised_Tokens` and kind-2
    /// outputs into `Locked_Tokens` (marking the matching serialised row
    /// `locked`).
    pub fn add_block(&mut self, block: &Block) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO Blocks (hash, previous_hash, timestamp, difficulty, nonce, height)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                block.hash.as_str(),
                block.previous_hash.as_str(),
                block.timestamp.to_string(),
                block.difficulty,
                block.nonce as i64,
                block.height as i64,
            ],
        )?;

        for txn in &block.transactions {
            tx.execute(
                "INSERT INTO Transactions (txid, block_hash, type, value, from_address, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    txn.txid.as_str(),
                    block.hash.as_str(),
                    txn.kind as u8,
                    txn.value.to_storage_string(),
                    txn.from_address,
                    txn.timestamp.to_string(),
                ],
            )?;

            for input in &txn.inputs {
                tx.execute(
                    "INSERT INTO Inputs (txid, output_txid, ind, value, recipient, sig, type)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        txn.txid.as_str(),
                        input.txid.as_str(),
                        input.index as i64,
                        input.value.to_storage_string(),
                        input.recipient.as_str(),
                        input.sig.as_bytes(),
                        input.kind as u8,
                    ],
                )?;

                // Clear the utxo bit on the output this input spent.
                tx.execute(
                    "UPDATE Outputs SET utxo = 0 WHERE txid = ?1 AND ind = ?2",
                    params![input.txid.as_str(), input.index],
                )?;
            }

            for output in &txn.outputs {
                tx.execute(
                    "INSERT INTO Outputs (txid, ind, value, recipient, sig, utxo, type)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                    params![
                        output.txid.as_str(),
                        output.index,
                        output.value.to_storage_string(),
                        output.recipient.as_str(),
                        output.sig.as_bytes(),
                        output.kind as u8,
                    ],
                )?;

                match (&output.kind, &output.value) {
                    (TokenKind::Serialized, Value::Ballot(token)) => {
                        tx.execute(
                            "INSERT INTO Serialised_Tokens
                                (tkid, poll_address, voter_address, timestamp, question, options, ans, sig, txid, ind, locked)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
                            params![
                                token.tkid.as_str(),
                                token.poll_address.as_str(),
                                token.voter_address.as_str(),
                                token.timestamp.to_string(),
                                token.question,
                                serde_json::to_string(&token.options).unwrap_or_default(),
                                token.ans,
                                token.sig.as_bytes(),
                                output.txid.as_str(),
                                output.index,
                            ],
                        )?;
                    }
                    (TokenKind::Cast, Value::Ballot(token)) => {
                        tx.execute(
                            "UPDATE Serialised_Tokens SET locked = 1 WHERE tkid = ?1",
                            params![token.tkid.as_str()],
                        )?;
                        tx.execute(
                            "INSERT INTO Locked_Tokens
                                (tkid, poll_address, voter_address, timestamp, question, options, ans, sig, txid, ind)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                            params![
                                token.tkid.as_str(),
                                token.poll_address.as_str(),
                                token.voter_address.as_str(),
                                token.timestamp.to_string(),
                                token.question,
                                serde_json::to_string(&token.options).unwrap_or_default(),
                                token.ans,
                                token.sig.as_bytes(),
                                output.txid.as_str(),
                                output.index,
                            ],
                        )?;
                    }
                    _ => {}
                }
            }

            tx.execute(
                "DELETE FROM Memory_Pool WHERE txid = ?1",
                params![txn.txid.as_str()],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn add_pending(&self, txid: &TxId) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO Memory_Pool (txid, ind) VALUES (?1, 0)",
            params![txid.as_str()],
        )?;
        Ok(())
    }

    pub fn remove_pending(&self, txid: &TxId) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM Memory_Pool WHERE txid = ?1", params![txid.as_str()])?;
        Ok(())
    }

    /// Unspent outputs matching both `address` and `kind`.
    pub fn utxos(&self, address: &Address, kind: TokenKind) -> Result<Vec<Output>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT txid, ind, value, recipient, sig, type FROM Outputs
             WHERE recipient = ?1 AND type = ?2 AND utxo = 1",
        )?;

        let rows = stmt.query_map(params![address.as_str(), kind as u8], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Vec<u8>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut out = vec![];
        for row in rows {
            let (txid, ind, value_raw, recipient, sig, kind_raw) = row?;
            let kind = TokenKind::from_u8(kind_raw as u8).unwrap_or(TokenKind::Empty);
            let value = self.resolve_value(kind, &value_raw)?;

            out.push(Output {
                txid: TxId(txid),
                index: ind as usize,
                value,
                recipient: Address(recipient),
                sig: String::from_utf8_lossy(&sig).into_owned(),
                kind,
            });
        }

        Ok(out)
    }

    fn resolve_value(&self, kind: TokenKind, raw: &str) -> Result<Value, StoreError> {
        match kind {
            TokenKind::Empty => raw
                .parse::<u64>()
                .map(Value::Amount)
                .or_else(|_| if raw == MINING_REWARD_SENTINEL { Ok(Value::MiningReward) } else {
                    Err(StoreError::MalformedValue { kind: kind as u8, raw: raw.to_owned() })
                }),
            TokenKind::Serialized | TokenKind::Cast => {
                let token = self
                    .load_token(raw, matches!(kind, TokenKind::Cast))?
                    .ok_or_else(|| StoreError::MalformedValue {
                        kind: kind as u8,
                        raw: raw.to_owned(),
                    })?;
                Ok(Value::Ballot(token))
            }
        }
    }

    fn load_token(&self, tkid: &str, locked_table: bool) -> Result<Option<Token>, StoreError> {
        let table = if locked_table { "Locked_Tokens" } else { "Serialised_Tokens" };
        let sql = format!(
            "SELECT poll_address, voter_address, timestamp, question, options, ans, sig
             FROM {table} WHERE tkid = ?1"
        );

        self.conn
            .query_row(&sql, params![tkid], |row| {
                let options_raw: String = row.get(4)?;
                let options: Vec<String> = serde_json::from_str(&options_raw).unwrap_or_default();
                let timestamp_raw: String = row.get(2)?;
                let sig_raw: Vec<u8> = row.get(6)?;

                Ok(Token {
                    tkid: TkId(tkid.to_owned()),
                    poll_address: Address(row.get::<_, String>(0)?),
                    voter_address: Address(row.get::<_, String>(1)?),
                    timestamp: timestamp_raw.parse().unwrap_or(0),
                    question: row.get(3)?,
                    options,
                    ans: row.get(5)?,
                    sig: String::from_utf8_lossy(&sig_raw).into_owned(),
                })
            })
            .optional()
            .map_err(StoreError::from)
    }

    /// The unspent `Serialized` output matching `tkid`, owned by `voter`,
    /// for `poll`.
    pub fn find_serialized_utxo(
        &self,
        tkid: &TkId,
        voter: &Address,
        poll: &Address,
    ) -> Result<Option<Output>, StoreError> {
        let outputs = self.utxos(voter, TokenKind::Serialized)?;
        Ok(outputs.into_iter().find(|o| {
            o.value
                .as_ballot()
                .map(|t| &t.tkid == tkid && &t.poll_address == poll)
                .unwrap_or(false)
        }))
    }

    /// Sum of values if `kind == Empty`, count of matching outputs
    /// otherwise.
    pub fn token_balance(&self, address: &Address, kind: TokenKind) -> Result<u64, StoreError> {
        let outputs = self.utxos(address, kind)?;

        Ok(match kind {
            TokenKind::Empty => outputs.iter().filter_map(|o| o.value.as_amount()).sum(),
            _ => outputs.len() as u64,
        })
    }

    pub fn block_at(&self, height: u64) -> Result<Option<Block>, StoreError> {
        let hash: Option<String> = self
            .conn
            .query_row(
                "SELECT hash FROM Blocks WHERE height = ?1",
                params![height],
                |row| row.get(0),
            )
            .optional()?;

        match hash {
            Some(hash) => self.block_by_hash(&hash),
            None => Ok(None),
        }
    }

    pub fn block_by_previous_hash(&self, previous_hash: &BlockHash) -> Result<Option<Block>, StoreError> {
        let hash: Option<String> = self
            .conn
            .query_row(
                "SELECT hash FROM Blocks WHERE previous_hash = ?1",
                params![previous_hash.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match hash {
            Some(hash) => self.block_by_hash(&hash),
            None => Ok(None),
        }
    }

    fn block_by_hash(&self, hash: &str) -> Result<Option<Block>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT previous_hash, timestamp, difficulty, nonce, height FROM Blocks WHERE hash = ?1",
                params![hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, u64>(3)?,
                        row.get::<_, u64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((previous_hash, timestamp_raw, difficulty, nonce, height)) = row else {
            return Ok(None);
        };

        let transactions = self.transactions_for_block(hash)?;

        Ok(Some(Block {
            timestamp: timestamp_raw.parse().unwrap_or(0),
            previous_hash: BlockHash(previous_hash),
            difficulty,
            nonce,
            height,
            transactions,
            hash: BlockHash(hash.to_owned()),
        }))
    }

    fn transactions_for_block(&self, block_hash: &str) -> Result<Vec<Transaction>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT txid, type, value, from_address, timestamp FROM Transactions WHERE block_hash = ?1",
        )?;

        let txn_rows = stmt.query_map(params![block_hash], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u8>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut out = vec![];
        for row in txn_rows {
            let (txid, kind_raw, value_raw, from_address, timestamp_raw) = row?;
            let kind = match kind_raw {
                0 => TxnKind::Transfer,
                1 => TxnKind::Serialize,
                _ => TxnKind::Cast,
            };

            let inputs = self.inputs_for_txn(&txid)?;
            let outputs = self.outputs_for_txn(&txid)?;
            let value_kind = outputs.first().map(|o| o.kind).unwrap_or(TokenKind::Empty);
            let value = self.resolve_value(value_kind, &value_raw)?;

            let to_address = outputs.iter().map(|o| o.recipient.to_string()).collect();

            out.push(Transaction {
                txid: TxId(txid),
                timestamp: timestamp_raw.parse().unwrap_or(0),
                kind,
                from_address,
                to_address,
                inputs,
                outputs,
                value,
            });
        }

        Ok(out)
    }

    fn inputs_for_txn(&self, txid: &str) -> Result<Vec<Input>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT output_txid, ind, value, recipient, sig, type FROM Inputs WHERE txid = ?1 ORDER BY ind",
        )?;

        let rows = stmt.query_map(params![txid], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Vec<u8>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut out = vec![];
        for row in rows {
            let (output_txid, ind, value_raw, recipient, sig, kind_raw) = row?;
            let kind = TokenKind::from_u8(kind_raw as u8).unwrap_or(TokenKind::Empty);
            let value = self.resolve_value(kind, &value_raw)?;

            out.push(Input {
                txid: TxId(output_txid),
                index: ind as usize,
                value,
                recipient: Address(recipient),
                sig: String::from_utf8_lossy(&sig).into_owned(),
                kind,
            });
        }

        Ok(out)
    }

    fn outputs_for_txn(&self, txid: &str) -> Result<Vec<Output>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT ind, value, recipient, sig, type FROM Outputs WHERE txid = ?1 ORDER BY ind")?;

        let rows = stmt.query_map(params![txid], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut out = vec![];
        for row in rows {
            let (ind, value_raw, recipient, sig, kind_raw) = row?;
            let kind = TokenKind::from_u8(kind_raw as u8).unwrap_or(TokenKind::Empty);
            let value = self.resolve_value(kind, &value_raw)?;

            out.push(Output {
                txid: TxId(txid.to_owned()),
                index: ind as usize,
                value,
                recipient: Address(recipient),
                sig: String::from_utf8_lossy(&sig).into_owned(),
                kind,
            });
        }

        Ok(out)
    }

    /// Rebuilds the last up-to-16 blocks by height, oldest to newest.
    pub fn recent_tail(&self) -> Result<Vec<Block>, StoreError> {
        let height: Option<u64> = self
            .conn
            .query_row("SELECT MAX(height) FROM Blocks", [], |row| row.get(0))
            .optional()?
            .flatten();

        let Some(top) = height else {
            return Ok(vec![]);
        };

        let bottom = top.saturating_sub(15);
        let mut out = vec![];

        for h in bottom..=top {
            if let Some(block) = self.block_at(h)? {
                out.push(block);
            }
        }

        Ok(out)
    }

    /// Count of serialized (not necessarily cast) ballots minted for
    /// `poll_address`.
    pub fn serialized_votes(&self, poll_address: &Address) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM Serialised_Tokens WHERE poll_address = ?1",
            params![poll_address.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Count of ballots `voter` has cast.
    pub fn confirmed_votes(&self, voter: &Address) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM Locked_Tokens WHERE voter_address = ?1",
            params![voter.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// The answer cast by every ballot locked to a poll, one entry per
    /// cast vote, in no particular order.
    pub fn get_results(&self, poll_address: &Address) -> Result<Vec<usize>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT ans FROM Locked_Tokens WHERE poll_address = ?1")?;
        let rows = stmt.query_map(params![poll_address.as_str()], |row| row.get::<_, String>(0))?;

        let mut results = Vec::new();
        for row in rows {
            let ans = row?;
            if let Ok(idx) = ans.parse::<usize>() {
                results.push(idx);
            }
        }

        Ok(results)
    }

    /// Whether the output `(txid, index)` is still marked unspent. Used by
    /// the engine to re-validate inputs on transactions arriving from the
    /// network, since their inputs were not drawn from our own UTXO view.
    pub fn output_unspent(&self, txid: &TxId, index: usize) -> Result<bool, StoreError> {
        let utxo: Option<bool> = self
            .conn
            .query_row(
                "SELECT utxo FROM Outputs WHERE txid = ?1 AND ind = ?2",
                params![txid.as_str(), index as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(utxo.unwrap_or(false))
    }

    pub fn block_height(&self) -> Result<Option<u64>, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT MAX(height) FROM Blocks", [], |row| row.get(0))
            .optional()?
            .flatten())
    }
}

impl UtxoSource for LedgerStore {
    fn empty_utxos(&self, owner: &Address) -> Vec<Output> {
        self.utxos(owner, TokenKind::Empty).unwrap_or_default()
    }

    fn serialized_utxo(&self, tkid: &TkId, voter: &Address, poll: &Address) -> Option<Output> {
        self.find_serialized_utxo(tkid, voter, poll).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeySigner;

    #[test]
    fn genesis_round_trips_through_storage() {
        let miner = LocalKeySigner::generate();
        let genesis = Block::genesis(&miner.address(), 10, 6);

        let mut store = LedgerStore::open_in_memory().expect("open store");
        store.add_block(&genesis).expect("insert genesis");

        let rehydrated = store.block_at(0).expect("query").expect("genesis exists");
        assert_eq!(rehydrated.hash, genesis.hash);
        assert_eq!(rehydrated.height, 0);

        let balance = store
            .token_balance(&miner.address(), TokenKind::Empty)
            .expect("balance query");
        assert_eq!(balance, 10);
    }

    #[test]
    fn genesis_survives_reopening_the_same_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.sqlite3");
        let miner = LocalKeySigner::generate();
        let genesis = Block::genesis(&miner.address(), 10, 6);

        {
            let mut store = LedgerStore::open(&path).expect("open store");
            store.add_block(&genesis).expect("insert genesis");
        }

        let store = LedgerStore::open(&path).expect("reopen store");
        let rehydrated = store.block_at(0).expect("query").expect("genesis persisted to disk");
        assert_eq!(rehydrated.hash, genesis.hash);
    }

    #[test]
    fn mark_spent_clears_the_utxo_bit() {
        let miner = LocalKeySigner::generate();
        let bob = LocalKeySigner::generate();
        let genesis = Block::genesis(&miner.address(), 10, 6);

        let mut store = LedgerStore::open_in_memory().expect("open store");
        store.add_block(&genesis).expect("insert genesis");

        let txn = Transaction::transfer(&miner.address(), &bob.address(), 3, 1, &store, &miner)
            .expect("miner has a spendable coinbase output");

        let block = Block::new(
            2,
            genesis.hash.clone(),
            0,
            0,
            1,
            vec![Transaction::new_coinbase(&miner.address(), 10, 2), txn],
        );
        store.add_block(&block).expect("insert second block");

        let miner_balance = store
            .token_balance(&miner.address(), TokenKind::Empty)
            .expect("balance query");
        // original 10 spent down to a 7 change output, plus a fresh 10
        // coinbase reward for the second block.
        assert_eq!(miner_balance, 17);

        let bob_balance = store
            .token_balance(&bob.address(), TokenKind::Empty)
            .expect("balance query");
        assert_eq!(bob_balance, 3);
    }
}
