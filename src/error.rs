use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the transaction protocol and its stores.
#[derive(Debug, Error)]
pub enum Error {
    /// The register is reserved by another prepared transaction.
    #[error("register is locked by another transaction")]
    Busy,

    /// At least one peer voted no or failed during the prepare phase.
    #[error("consensus failed: a peer rejected or did not respond")]
    ConsensusFailed,

    /// A call did not complete within its deadline.
    #[error("rpc call timed out")]
    Timeout,

    #[error("transaction already committed")]
    AlreadyCommitted,

    #[error("commit does not match the prepared transaction")]
    InvalidCommit,

    #[error("cannot abort a committed transaction")]
    CannotAbortCommitted,

    /// The remote side closed the connection before replying.
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("node {0} is not in the membership map")]
    UnknownMember(u32),

    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("encoding failure: {0}")]
    Encoding(#[from] bincode::Error),
}
