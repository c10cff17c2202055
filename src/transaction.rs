//! The three-kind transaction model: transfer of empty tokens (kind 0),
//! serializing a ballot (kind 1), and casting a ballot (kind 2).

use crate::crypto::{sha256_hex, verify as crypto_verify, Address, Signer, TxId, COINBASE_SENTINEL};
use crate::token::{Token, TokenKind};
use crate::value::{Value, MINING_REWARD_SENTINEL};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxnKind {
    Transfer = 0,
    Serialize = 1,
    Cast = 2,
}

/// What `add_output` stacks onto an already-built transaction.
pub enum StackedOutput {
    Transfer(u64),
    Ballot { timestamp: u128, question: String, options: Vec<String> },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Output {
    /// The transaction that owns this output.
    pub txid: TxId,
    pub index: usize,
    pub value: Value,
    pub recipient: Address,
    pub sig: String,
    pub kind: TokenKind,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Input {
    /// The source transaction whose output this spends.
    pub txid: TxId,
    pub index: usize,
    pub value: Value,
    pub recipient: Address,
    pub sig: String,
    pub kind: TokenKind,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub txid: TxId,
    pub timestamp: u128,
    pub kind: TxnKind,
    pub from_address: String,
    pub to_address: Vec<String>,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub value: Value,
}

/// What `LedgerStore`/the in-memory pool expose so a new transaction can
/// pick its inputs without this module depending on either directly.
pub trait UtxoSource {
    /// Unspent `Empty` outputs owned by `owner`.
    fn empty_utxos(&self, owner: &Address) -> Vec<Output>;

    /// The unspent `Serialized` output matching `tkid`, owned by `voter`,
    /// for `poll`.
    fn serialized_utxo(&self, tkid: &crate::crypto::TkId, voter: &Address, poll: &Address) -> Option<Output>;
}

fn format_list(items: &[String]) -> String {
    format!("{:?}", items)
}

fn core_data_string(timestamp: u128, kind: TxnKind, from: &str, to: &[String]) -> String {
    format!("{}{}{}{}", timestamp, kind as u8, from, format_list(to))
}

pub fn compute_txid(timestamp: u128, kind: TxnKind, from: &str, to: &[String]) -> TxId {
    let preimage = core_data_string(timestamp, kind, from, to);
    let digest = sha256_hex(preimage.as_bytes());
    TxId(digest[..32].to_owned())
}

fn value_signing_repr(value: &Value) -> String {
    match value {
        Value::Amount(n) => n.to_string(),
        Value::MiningReward => MINING_REWARD_SENTINEL.to_owned(),
        Value::Ballot(token) => format!("{:?}", token),
    }
}

fn amount_of(output: &Output) -> u64 {
    output.value.as_amount().unwrap_or(0)
}

/// Stable bottom-up merge sort over a sender's UTXOs by ascending amount.
/// Ties do not matter: outputs are distinguished by `(txid, index)`, which
/// a stable sort preserves the relative order of.
fn merge_sort_by_value(utxos: Vec<Output>) -> Vec<Output> {
    let mut runs: Vec<Vec<Output>> = utxos.into_iter().map(|o| vec![o]).collect();

    while runs.len() > 1 {
        let mut merged = Vec::with_capacity(runs.len().div_ceil(2));
        let mut it = runs.into_iter();

        while let Some(a) = it.next() {
            match it.next() {
                Some(b) => merged.push(merge_runs(a, b)),
                None => merged.push(a),
            }
        }

        runs = merged;
    }

    runs.pop().unwrap_or_default()
}

fn merge_runs(a: Vec<Output>, b: Vec<Output>) -> Vec<Output> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut ai, mut bi) = (0, 0);

    while ai < a.len() && bi < b.len() {
        if amount_of(&a[ai]) <= amount_of(&b[bi]) {
            out.push(a[ai].clone());
            ai += 1;
        } else {
            out.push(b[bi].clone());
            bi += 1;
        }
    }

    out.extend_from_slice(&a[ai..]);
    out.extend_from_slice(&b[bi..]);
    out
}

/// Greedily takes smallest-first outputs from `sorted` until the running
/// sum reaches `target`. Returns the selected outputs and their total;
/// the caller must check `total >= target` to know whether selection
/// succeeded.
fn take_until(sorted: &[Output], target: u64) -> (Vec<Output>, u64) {
    let mut total = 0u64;
    let mut selected = vec![];

    for utxo in sorted {
        if total >= target {
            break;
        }

        total += amount_of(utxo);
        selected.push(utxo.clone());
    }

    (selected, total)
}

fn to_input(output: &Output) -> Input {
    Input {
        txid: output.txid.clone(),
        index: output.index,
        value: output.value.clone(),
        recipient: output.recipient.clone(),
        sig: output.sig.clone(),
        kind: output.kind,
    }
}

fn signing_string(output: &Output) -> String {
    format!(
        "{}{}{}{}",
        value_signing_repr(&output.value),
        output.recipient,
        output.txid,
        output.index
    )
}

impl Transaction {
    /// Builds the synthetic coinbase transaction paying the mining reward
    /// to `miner`.
    pub fn new_coinbase(miner: &Address, reward: u64, timestamp: u128) -> Self {
        let from_address = COINBASE_SENTINEL.to_owned();
        let to_address = vec![miner.to_string()];
        let txid = compute_txid(timestamp, TxnKind::Transfer, &from_address, &to_address);

        let input = Input {
            txid: txid.clone(),
            index: 0,
            value: Value::MiningReward,
            recipient: miner.clone(),
            sig: String::new(),
            kind: TokenKind::Empty,
        };

        let output = Output {
            txid: txid.clone(),
            index: 0,
            value: Value::Amount(reward),
            recipient: miner.clone(),
            sig: String::new(),
            kind: TokenKind::Empty,
        };

        Transaction {
            txid,
            timestamp,
            kind: TxnKind::Transfer,
            from_address,
            to_address,
            inputs: vec![input],
            outputs: vec![output],
            value: Value::Amount(reward),
        }
    }

    /// Kind 0: transfer `amount` empty tokens from `from` to `to`. Returns
    /// `None` ("Insufficient funds") if `from`'s empty UTXOs don't cover
    /// `amount`.
    pub fn transfer(
        from: &Address,
        to: &Address,
        amount: u64,
        timestamp: u128,
        ledger: &dyn UtxoSource,
        signer: &dyn Signer,
    ) -> Option<Self> {
        let sorted = merge_sort_by_value(ledger.empty_utxos(from));
        let (selected, total) = take_until(&sorted, amount);

        if total < amount {
            return None;
        }

        let change = total - amount;
        let mut to_address = vec![to.to_string()];
        if change > 0 {
            to_address.push(from.to_string());
        }

        let txid = compute_txid(timestamp, TxnKind::Transfer, from.as_str(), &to_address);
        let inputs = selected.iter().map(to_input).collect();

        let mut outputs = vec![Output {
            txid: txid.clone(),
            index: 0,
            value: Value::Amount(amount),
            recipient: to.clone(),
            sig: String::new(),
            kind: TokenKind::Empty,
        }];

        if change > 0 {
            outputs.push(Output {
                txid: txid.clone(),
                index: 1,
                value: Value::Amount(change),
                recipient: from.clone(),
                sig: String::new(),
                kind: TokenKind::Empty,
            });
        }

        let mut txn = Transaction {
            txid,
            timestamp,
            kind: TxnKind::Transfer,
            from_address: from.to_string(),
            to_address,
            inputs,
            outputs,
            value: Value::Amount(amount),
        };
        txn.sign_outputs(signer);
        Some(txn)
    }

    /// Kind 1: the poll owner `from` mints a `Serialized` ballot for
    /// `voter`. Costs 1 empty token, same change handling as `transfer`.
    #[allow(clippy::too_many_arguments)]
    pub fn serialize_ballot(
        from: &Address,
        voter: &Address,
        question: String,
        options: Vec<String>,
        timestamp: u128,
        ledger: &dyn UtxoSource,
        signer: &dyn Signer,
    ) -> Option<Self> {
        let sorted = merge_sort_by_value(ledger.empty_utxos(from));
        let (selected, total) = take_until(&sorted, 1);

        if total < 1 {
            return None;
        }

        let change = total - 1;
        let mut to_address = vec![voter.to_string()];
        if change > 0 {
            to_address.push(from.to_string());
        }

        let txid = compute_txid(timestamp, TxnKind::Serialize, from.as_str(), &to_address);
        let inputs = selected.iter().map(to_input).collect();

        let token = Token::new(
            from.clone(),
            voter.clone(),
            timestamp,
            question,
            options,
        );

        let mut outputs = vec![Output {
            txid: txid.clone(),
            index: 0,
            value: Value::Ballot(token.clone()),
            recipient: voter.clone(),
            sig: String::new(),
            kind: TokenKind::Serialized,
        }];

        if change > 0 {
            outputs.push(Output {
                txid: txid.clone(),
                index: 1,
                value: Value::Amount(change),
                recipient: from.clone(),
                sig: String::new(),
                kind: TokenKind::Empty,
            });
        }

        let mut txn = Transaction {
            txid,
            timestamp,
            kind: TxnKind::Serialize,
            from_address: from.to_string(),
            to_address,
            inputs,
            outputs,
            value: Value::Ballot(token),
        };
        txn.sign_outputs(signer);
        Some(txn)
    }

    /// Kind 2: `voter` answers a previously serialized ballot for `poll`,
    /// producing a `Cast` output owned by the poll. Returns `None` if the
    /// voter holds no matching `Serialized` UTXO.
    #[allow(clippy::too_many_arguments)]
    pub fn cast_ballot(
        voter: &Address,
        poll: &Address,
        tkid: &crate::crypto::TkId,
        option_index: usize,
        timestamp: u128,
        ledger: &dyn UtxoSource,
        signer: &dyn Signer,
    ) -> Option<Self> {
        let utxo = ledger.serialized_utxo(tkid, voter, poll)?;
        let mut token = utxo.value.as_ballot()?.clone();
        token.cast(option_index, signer);

        let to_address = vec![poll.to_string()];
        let txid = compute_txid(timestamp, TxnKind::Cast, voter.as_str(), &to_address);

        let input = to_input(&utxo);
        let output = Output {
            txid: txid.clone(),
            index: 0,
            value: Value::Ballot(token.clone()),
            recipient: poll.clone(),
            sig: String::new(),
            kind: TokenKind::Cast,
        };

        let mut txn = Transaction {
            txid,
            timestamp,
            kind: TxnKind::Cast,
            from_address: voter.to_string(),
            to_address,
            inputs: vec![input],
            outputs: vec![output],
            value: Value::Ballot(token),
        };
        txn.sign_outputs(signer);
        Some(txn)
    }

    /// Stacks an additional output onto a transaction that has not been
    /// signed yet, reserving its cost out of the existing change output
    /// (index 1). Used when one input set is meant to fund several
    /// recipients. Only `(Transfer, Transfer)` and `(Serialize, Serialize)`
    /// kind combinations are valid: the former adds another plain payment at
    /// the caller's chosen amount, the latter mints another `Serialized`
    /// ballot at the fixed cost of 1, same as the first ballot output
    /// `serialize_ballot` produces.
    pub fn add_output(&mut self, recipient: &Address, output: StackedOutput) -> bool {
        let valid_combo = matches!(
            (self.kind, &output),
            (TxnKind::Transfer, StackedOutput::Transfer(_)) | (TxnKind::Serialize, StackedOutput::Ballot { .. })
        );

        if !valid_combo || self.outputs.len() < 2 {
            return false;
        }

        let change_amount = match self.outputs[1].value.as_amount() {
            Some(n) => n,
            None => return false,
        };

        let cost = match &output {
            StackedOutput::Transfer(amount) => *amount,
            StackedOutput::Ballot { .. } => 1,
        };

        if cost > change_amount {
            return false;
        }

        let remainder = change_amount - cost;

        if remainder == 0 {
            self.outputs.remove(1);
            if let Some(pos) = self.to_address.iter().position(|a| a == &self.from_address) {
                self.to_address.remove(pos);
            }
        } else {
            self.outputs[1].value = Value::Amount(remainder);
        }

        let new_index = self.outputs.len();
        let (value, kind) = match output {
            StackedOutput::Transfer(amount) => (Value::Amount(amount), TokenKind::Empty),
            StackedOutput::Ballot { timestamp, question, options } => {
                let token = Token::new(
                    Address::from(self.from_address.clone()),
                    recipient.clone(),
                    timestamp,
                    question,
                    options,
                );
                (Value::Ballot(token), TokenKind::Serialized)
            }
        };

        self.outputs.push(Output {
            txid: self.txid.clone(),
            index: new_index,
            value,
            recipient: recipient.clone(),
            sig: String::new(),
            kind,
        });
        self.to_address.push(recipient.to_string());

        true
    }

    /// Signs every output's signing string with `signer`. Called once
    /// after all desired outputs (including any via `add_output`) have
    /// been assembled.
    pub fn sign_outputs(&mut self, signer: &dyn Signer) {
        for output in &mut self.outputs {
            output.sig = signer.sign(signing_string(output).as_bytes());
        }
    }

    pub fn core_data(&self) -> String {
        core_data_string(self.timestamp, self.kind, &self.from_address, &self.to_address)
    }

    pub fn ordered_inputs(&self) -> Vec<&Input> {
        let mut v: Vec<&Input> = self.inputs.iter().collect();
        v.sort_by(|a, b| (a.txid.as_str(), a.index).cmp(&(b.txid.as_str(), b.index)));
        v
    }

    pub fn ordered_outputs(&self) -> Vec<&Output> {
        let mut v: Vec<&Output> = self.outputs.iter().collect();
        v.sort_by_key(|o| o.index);
        v
    }

    /// The exact string a `Block` hashes: core data followed by every
    /// input's and output's `txid, value, index, kind, recipient, sig`, in
    /// that order, inputs first.
    pub fn tx_data(&self) -> String {
        let mut s = self.core_data();

        for input in self.ordered_inputs() {
            s.push_str(&input.txid.to_string());
            s.push_str(&value_signing_repr(&input.value));
            s.push_str(&input.index.to_string());
            s.push_str(&(input.kind as u8).to_string());
            s.push_str(&input.recipient.to_string());
            s.push_str(&input.sig);
        }

        for output in self.ordered_outputs() {
            s.push_str(&output.txid.to_string());
            s.push_str(&value_signing_repr(&output.value));
            s.push_str(&output.index.to_string());
            s.push_str(&(output.kind as u8).to_string());
            s.push_str(&output.recipient.to_string());
            s.push_str(&output.sig);
        }

        s
    }

    /// Verifies the transaction per spec.md §4.1, in order: non-empty
    /// inputs/outputs, the coinbase special case, kind-specific balance or
    /// ownership checks, and per-output signature verification. All
    /// failures are value-level; nothing here is fatal.
    pub fn verify(&self, mining_reward: u64) -> bool {
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return false;
        }

        if self.from_address == COINBASE_SENTINEL {
            let pseudo_input_ok = self.inputs.len() == 1 && self.inputs[0].value.is_mining_reward();
            let output_ok =
                self.outputs.len() == 1 && self.outputs[0].value.as_amount() == Some(mining_reward);
            return pseudo_input_ok && output_ok;
        }

        match self.kind {
            TxnKind::Transfer => {
                let out_sum: u64 = self.outputs.iter().filter_map(|o| o.value.as_amount()).sum();
                let in_sum: u64 = self.inputs.iter().filter_map(|i| i.value.as_amount()).sum();

                if out_sum != in_sum {
                    return false;
                }

                let claimed = self.value.as_amount().unwrap_or(0);
                let to_others: u64 = self
                    .outputs
                    .iter()
                    .filter(|o| o.recipient.as_str() != self.from_address)
                    .filter_map(|o| o.value.as_amount())
                    .sum();

                if claimed > to_others {
                    return false;
                }
            }
            TxnKind::Serialize => {
                for output in &self.outputs {
                    if output.kind == TokenKind::Serialized {
                        let Some(token) = output.value.as_ballot() else {
                            return false;
                        };
                        if token.voter_address != output.recipient {
                            return false;
                        }
                    }
                }
            }
            TxnKind::Cast => {
                let all_verify = self.outputs.iter().all(|o| {
                    o.value
                        .as_ballot()
                        .map(|t| t.verify())
                        .unwrap_or(false)
                });
                if !all_verify {
                    return false;
                }
            }
        }

        self.outputs
            .iter()
            .all(|o| crypto_verify(&Address(self.from_address.clone()), signing_string(o).as_bytes(), &o.sig))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeySigner;
    use std::cell::RefCell;

    struct FakeLedger {
        empty: RefCell<Vec<Output>>,
        serialized: RefCell<Vec<Output>>,
    }

    impl FakeLedger {
        fn new() -> Self {
            FakeLedger {
                empty: RefCell::new(vec![]),
                serialized: RefCell::new(vec![]),
            }
        }

        fn give_empty(&self, owner: &Address, txid: &str, index: usize, amount: u64) {
            self.empty.borrow_mut().push(Output {
                txid: TxId(txid.to_owned()),
                index,
                value: Value::Amount(amount),
                recipient: owner.clone(),
                sig: String::new(),
                kind: TokenKind::Empty,
            });
        }

        fn give_serialized(&self, output: Output) {
            self.serialized.borrow_mut().push(output);
        }
    }

    impl UtxoSource for FakeLedger {
        fn empty_utxos(&self, owner: &Address) -> Vec<Output> {
            self.empty
                .borrow()
                .iter()
                .filter(|o| &o.recipient == owner)
                .cloned()
                .collect()
        }

        fn serialized_utxo(
            &self,
            tkid: &crate::crypto::TkId,
            voter: &Address,
            poll: &Address,
        ) -> Option<Output> {
            self.serialized
                .borrow()
                .iter()
                .find(|o| {
                    o.value
                        .as_ballot()
                        .map(|t| &t.tkid == tkid && &t.voter_address == voter && &t.poll_address == poll)
                        .unwrap_or(false)
                })
                .cloned()
        }
    }

    #[test]
    fn coinbase_then_transfer() {
        let miner = LocalKeySigner::generate();
        let bob = LocalKeySigner::generate();

        let coinbase = Transaction::new_coinbase(&miner.address(), 10, 0);
        assert!(coinbase.verify(10));

        let ledger = FakeLedger::new();
        ledger.give_empty(&miner.address(), coinbase.txid.as_str(), 0, 10);

        let txn = Transaction::transfer(&miner.address(), &bob.address(), 3, 1, &ledger, &miner)
            .expect("sufficient funds");

        assert_eq!(txn.outputs.len(), 2);
        assert_eq!(txn.outputs[0].value.as_amount(), Some(3));
        assert_eq!(txn.outputs[0].recipient, bob.address());
        assert_eq!(txn.outputs[1].value.as_amount(), Some(7));
        assert_eq!(txn.outputs[1].recipient, miner.address());
        assert!(txn.verify(10));
    }

    #[test]
    fn insufficient_funds_leaves_no_transaction() {
        let alice = LocalKeySigner::generate();
        let bob = LocalKeySigner::generate();
        let ledger = FakeLedger::new();
        ledger.give_empty(&alice.address(), "a".repeat(32).as_str(), 0, 2);

        let txn = Transaction::transfer(&alice.address(), &bob.address(), 5, 1, &ledger, &alice);
        assert!(txn.is_none());
    }

    #[test]
    fn flipping_a_signature_byte_fails_verify() {
        let miner = LocalKeySigner::generate();
        let bob = LocalKeySigner::generate();
        let ledger = FakeLedger::new();
        ledger.give_empty(&miner.address(), "b".repeat(32).as_str(), 0, 10);

        let mut txn = Transaction::transfer(&miner.address(), &bob.address(), 3, 1, &ledger, &miner)
            .expect("sufficient funds");
        assert!(txn.verify(10));

        let mut chars: Vec<char> = txn.outputs[0].sig.chars().collect();
        chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
        txn.outputs[0].sig = chars.into_iter().collect();

        assert!(!txn.verify(10));
    }

    #[test]
    fn ballot_life_cycle() {
        let alice = LocalKeySigner::generate(); // poll owner
        let bob = LocalKeySigner::generate(); // voter
        let ledger = FakeLedger::new();
        ledger.give_empty(&alice.address(), "c".repeat(32).as_str(), 0, 1);

        let serialize_txn = Transaction::serialize_ballot(
            &alice.address(),
            &bob.address(),
            "Q?".to_owned(),
            vec!["A".to_owned(), "B".to_owned()],
            1,
            &ledger,
            &alice,
        )
        .expect("alice has a spendable empty token");

        assert!(serialize_txn.verify(10));

        let ballot_output = serialize_txn.outputs[0].clone();
        ledger.give_serialized(ballot_output.clone());

        let tkid = ballot_output.value.as_ballot().unwrap().tkid.clone();

        let cast_txn = Transaction::cast_ballot(
            &bob.address(),
            &alice.address(),
            &tkid,
            1,
            2,
            &ledger,
            &bob,
        )
        .expect("bob holds the serialized ballot");

        assert!(cast_txn.verify(10));
        assert_eq!(cast_txn.outputs[0].recipient, alice.address());
        assert_eq!(cast_txn.outputs[0].kind, TokenKind::Cast);
    }

    #[test]
    fn add_output_reserves_from_change() {
        let alice = LocalKeySigner::generate();
        let bob = LocalKeySigner::generate();
        let carol = LocalKeySigner::generate();
        let ledger = FakeLedger::new();
        ledger.give_empty(&alice.address(), "d".repeat(32).as_str(), 0, 10);

        let mut txn = Transaction::transfer(&alice.address(), &bob.address(), 3, 1, &ledger, &alice)
            .expect("sufficient funds");
        assert_eq!(txn.outputs[1].value.as_amount(), Some(7));

        let added = txn.add_output(&carol.address(), StackedOutput::Transfer(7));
        assert!(added);
        // Change output (7) was fully consumed by carol's output; it's
        // dropped rather than left at zero.
        assert_eq!(txn.outputs.len(), 2);
        assert_eq!(txn.outputs[1].recipient, carol.address());

        txn.sign_outputs(&alice);
        assert!(txn.verify(10));
    }

    #[test]
    fn add_output_mints_a_second_ballot_for_one_more_token() {
        let alice = LocalKeySigner::generate(); // poll owner
        let bob = LocalKeySigner::generate(); // first voter
        let carol = LocalKeySigner::generate(); // second voter
        let ledger = FakeLedger::new();
        ledger.give_empty(&alice.address(), "e".repeat(32).as_str(), 0, 2);

        let mut txn = Transaction::serialize_ballot(
            &alice.address(),
            &bob.address(),
            "Q?".to_owned(),
            vec!["A".to_owned(), "B".to_owned()],
            1,
            &ledger,
            &alice,
        )
        .expect("alice has a spendable empty token");
        assert_eq!(txn.outputs[1].value.as_amount(), Some(1));

        let added = txn.add_output(
            &carol.address(),
            StackedOutput::Ballot {
                timestamp: 1,
                question: "Q?".to_owned(),
                options: vec!["A".to_owned(), "B".to_owned()],
            },
        );
        assert!(added);

        // The single remaining empty token was fully consumed by carol's
        // ballot; change is dropped rather than left at zero.
        assert_eq!(txn.outputs.len(), 2);
        assert_eq!(txn.outputs[1].recipient, carol.address());
        assert_eq!(txn.outputs[1].kind, TokenKind::Serialized);

        let second_ballot = txn.outputs[1].value.as_ballot().expect("ballot value");
        assert_eq!(second_ballot.voter_address, carol.address());

        txn.sign_outputs(&alice);
        assert!(txn.verify(10));
    }
}
