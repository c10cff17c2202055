//! The tagged replacement for the source's dictionary-typed wire value
//! (spec.md §9): an `Empty`-kind output carries an amount, a
//! `Serialized`/`Cast`-kind output carries a `Token`, and a coinbase's
//! pseudo-input carries the literal "Mining Reward" sentinel.

use crate::token::Token;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const MINING_REWARD_SENTINEL: &str = "Mining Reward";

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Amount(u64),
    Ballot(Token),
    MiningReward,
}

/// Matches the wire format's untyped `value` field exactly (spec.md §6): a
/// JSON number for `Amount`, a JSON object for `Ballot`, and the literal
/// string `"Mining Reward"` for the coinbase pseudo-input's value — never
/// `null`, since that string is what a real peer on the wire expects.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Amount(n) => serializer.serialize_u64(*n),
            Value::Ballot(token) => token.serialize(serializer),
            Value::MiningReward => serializer.serialize_str(MINING_REWARD_SENTINEL),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;

        if let Some(n) = raw.as_u64() {
            return Ok(Value::Amount(n));
        }

        if let Some(s) = raw.as_str() {
            return if s == MINING_REWARD_SENTINEL {
                Ok(Value::MiningReward)
            } else {
                Err(D::Error::custom(format!("unexpected string value {s:?}")))
            };
        }

        serde_json::from_value(raw)
            .map(Value::Ballot)
            .map_err(D::Error::custom)
    }
}

impl Value {
    pub fn as_amount(&self) -> Option<u64> {
        match self {
            Value::Amount(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_ballot(&self) -> Option<&Token> {
        match self {
            Value::Ballot(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_mining_reward(&self) -> bool {
        matches!(self, Value::MiningReward)
    }

    /// The literal string embedded in signing payloads and SQL `value TEXT`
    /// columns: a decimal integer for `Amount`, a token's `tkid` for
    /// `Ballot` (the full record is reconstructed from the Serialised_Tokens
    /// table, not from this column), and the literal sentinel string for
    /// `MiningReward`.
    pub fn to_storage_string(&self) -> String {
        match self {
            Value::Amount(n) => n.to_string(),
            Value::Ballot(token) => token.tkid.to_string(),
            Value::MiningReward => MINING_REWARD_SENTINEL.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_storage_string_is_decimal() {
        assert_eq!(Value::Amount(42).to_storage_string(), "42");
    }

    #[test]
    fn mining_reward_storage_string_is_sentinel() {
        assert_eq!(Value::MiningReward.to_storage_string(), "Mining Reward");
    }
}
