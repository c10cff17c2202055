//! The three-kind vote token: `Empty` (fungible currency), `Serialized`
//! (unanswered ballot stub), `Cast` (answered, self-signed ballot).

use crate::crypto::{sha256_hex, verify, Address, TkId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TokenKind {
    Empty = 0,
    Serialized = 1,
    Cast = 2,
}

impl TokenKind {
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(TokenKind::Empty),
            1 => Some(TokenKind::Serialized),
            2 => Some(TokenKind::Cast),
            _ => None,
        }
    }
}

/// A serialized ballot, minted by a poll owner and owned by a voter until
/// the voter answers it (at which point it becomes a `Cast` output).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub tkid: TkId,
    pub poll_address: Address,
    pub voter_address: Address,
    pub timestamp: u128,
    pub question: String,
    pub options: Vec<String>,
    /// Empty until the voter casts a vote; then the chosen option's index,
    /// stringified.
    pub ans: String,
    /// Empty until cast; then a base64 SECP256k1 signature over
    /// `get_signing_data()`.
    pub sig: String,
}

impl Token {
    /// Mints a fresh, unanswered ballot stub.
    pub fn new(
        poll_address: Address,
        voter_address: Address,
        timestamp: u128,
        question: String,
        options: Vec<String>,
    ) -> Self {
        let tkid = compute_tkid(&poll_address, &voter_address, timestamp, &question, &options);

        Token {
            tkid,
            poll_address,
            voter_address,
            timestamp,
            question,
            options,
            ans: String::new(),
            sig: String::new(),
        }
    }

    /// The literal string signed by the voter on casting a vote.
    pub fn signing_data(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.poll_address,
            self.voter_address,
            self.question,
            format_options(&self.options),
            self.ans
        )
    }

    pub fn is_cast(&self) -> bool {
        !self.ans.is_empty()
    }

    /// Voter answers the ballot: sets `ans` to the chosen option index and
    /// signs `signing_data()` with the voter's key.
    pub fn cast(&mut self, option_index: usize, signer: &dyn crate::crypto::Signer) {
        self.ans = option_index.to_string();
        self.sig = signer.sign(self.signing_data().as_bytes());
    }

    /// A ballot verifies iff it has been answered, carries a signature, and
    /// that signature validates under the voter's public key.
    pub fn verify(&self) -> bool {
        if self.ans.is_empty() || self.sig.is_empty() {
            return false;
        }

        verify(&self.voter_address, self.signing_data().as_bytes(), &self.sig)
    }
}

fn format_options(options: &[String]) -> String {
    format!("{:?}", options)
}

pub fn compute_tkid(
    poll_address: &Address,
    voter_address: &Address,
    timestamp: u128,
    question: &str,
    options: &[String],
) -> TkId {
    let preimage = format!(
        "{}{}{}{}{}",
        poll_address,
        voter_address,
        timestamp,
        question,
        format_options(options)
    );
    let digest = sha256_hex(preimage.as_bytes());
    TkId(digest[..16].to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeySigner;

    fn sample_token(poll: &Address, voter: &Address) -> Token {
        Token::new(
            poll.clone(),
            voter.clone(),
            1_000,
            "Q?".to_owned(),
            vec!["A".to_owned(), "B".to_owned()],
        )
    }

    #[test]
    fn unanswered_ballot_does_not_verify() {
        let poll = LocalKeySigner::generate();
        let voter = LocalKeySigner::generate();
        let token = sample_token(&poll.address(), &voter.address());

        assert!(!token.verify());
    }

    #[test]
    fn cast_ballot_verifies() {
        let poll = LocalKeySigner::generate();
        let voter = LocalKeySigner::generate();
        let mut token = sample_token(&poll.address(), &voter.address());

        token.cast(1, &voter);

        assert!(token.verify());
    }

    #[test]
    fn clearing_ans_invalidates_signature() {
        let poll = LocalKeySigner::generate();
        let voter = LocalKeySigner::generate();
        let mut token = sample_token(&poll.address(), &voter.address());

        token.cast(1, &voter);
        assert!(token.verify());

        token.ans.clear();
        assert!(!token.verify());
    }

    #[test]
    fn tkid_is_16_hex_chars() {
        let poll = LocalKeySigner::generate();
        let voter = LocalKeySigner::generate();
        let token = sample_token(&poll.address(), &voter.address());

        assert_eq!(token.tkid.as_str().len(), 16);
    }
}
