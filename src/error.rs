//! Per-subsystem error enums. Granular like the teacher's
//! `block_verify_error`/`txn_verify_error`, built with `thiserror` instead
//! of hand-written `StdError`/`Display` impls. Per spec.md §7, validation
//! and cryptographic failures are never fatal — these types exist for
//! logging and for the rare case (storage, network bind) where the caller
//! genuinely needs to distinguish failure reasons.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("malformed value column for kind {kind}: {raw}")]
    MalformedValue { kind: u8, raw: String },
    #[error("block {0} references unknown transaction {1}")]
    DanglingTransaction(String, String),
}

/// Why a transaction was rejected by `Blockchain::add_transaction`. Never
/// propagated as a hard error — logged at `warn!` and folded into a
/// boolean at the facade boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxnError {
    #[error("transaction has no inputs or no outputs")]
    EmptyInputsOrOutputs,
    #[error("insufficient funds: needed {needed}, found {available}")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("transaction does not verify")]
    FailedVerification,
    #[error("transaction {0} already admitted")]
    Duplicate(String),
    #[error("input ({0}, {1}) already referenced by a pool entry")]
    DoubleSpentInPool(String, usize),
}

/// Why a block was rejected by `Blockchain::add_block`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block contains a transaction that fails verification: {0}")]
    InvalidTransaction(String),
    #[error("block's previous_hash does not match the current tip")]
    WrongParent,
    #[error("block's stored hash does not match its recomputed hash")]
    InvalidHash,
    #[error("block height {actual} is not current height {current} + 1")]
    WrongHeight { current: u64, actual: u64 },
    #[error("block hash does not meet the required {required} leading zero hex digits")]
    FailedProofOfWork { required: u32 },
    #[error("block declares difficulty {declared} below the engine's {required}")]
    InsufficientDifficulty { declared: u32, required: u32 },
    #[error("block has no transactions")]
    EmptyBlock,
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the connection")]
    ConnectionClosed,
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("listener bind failed on {0}: {1}")]
    BindFailed(String, std::io::Error),
    #[error("cannot change root node whilst connected")]
    RootPeerChangeWhileConnected,
}
