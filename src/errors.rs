//! Error types for the signaling stack

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, SignalingError>;

/// Top-level signaling error
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("ISUP error: {0}")]
    Isup(#[from] IsupError),

    #[error("circuit error: {0}")]
    Circuit(#[from] CircuitError),

    #[error("IAX error: {0}")]
    Iax(#[from] IaxError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameter/frame codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer too short")]
    BufferTooShort,

    #[error("invalid length {got} for fixed-size parameter of {expected} octets")]
    FixedSizeMismatch { expected: u8, got: usize },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid offset {offset} (remaining {remaining})")]
    InvalidOffset { offset: usize, remaining: usize },

    #[error("unknown keyword: {0}")]
    UnknownKeyword(String),
}

/// ISUP layer errors
#[derive(Debug, Error)]
pub enum IsupError {
    #[error("no parameter table for message {0} in this protocol variant")]
    NoMessageTable(&'static str),

    #[error("truncated message")]
    Truncated,

    #[error("undecodable mandatory fixed parameter {0}")]
    MandatoryFixed(&'static str),

    #[error("invalid point code: {0}")]
    InvalidPointCode(String),

    #[error("remote user part unavailable")]
    UserPartUnavailable,

    #[error("message {msg} not allowed in state {state}")]
    WrongState { msg: &'static str, state: &'static str },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("circuit error: {0}")]
    Circuit(#[from] CircuitError),
}

/// Circuit management errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CircuitError {
    #[error("no circuit available")]
    NoCircuit,

    #[error("circuit {0} not found")]
    NotFound(u32),

    #[error("circuit {0} is busy locking or resetting")]
    Busy(u32),

    #[error("circuit {0} already in the requested state")]
    AlreadyInState(u32),
}

/// IAX2 layer errors
#[derive(Debug, Error)]
pub enum IaxError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid IE list")]
    InvalidIeList,

    #[error("no local call number available")]
    NoCallNumber,

    #[error("transaction {0} not found")]
    TransactionNotFound(u16),

    #[error("operation not allowed in state {0}")]
    WrongState(&'static str),

    #[error("authentication failed: {0}")]
    AuthFailed(&'static str),

    #[error("no common media format")]
    NoCommonFormat,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
