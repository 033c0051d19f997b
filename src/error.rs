use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty payload")]
    Empty,

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("truncated payload: needed {needed} more bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("member address is not valid UTF-8")]
    InvalidAddress,

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("member address of {0} bytes does not fit the wire format")]
    AddressTooLong(usize),

    #[error("snapshot of {0} members does not fit the wire format")]
    TooManyMembers(usize),

    #[error("encoded snapshot of {0} bytes exceeds one datagram")]
    TooLarge(usize),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("address {0} did not resolve")]
    Unresolvable(String),

    #[error("no endpoint bound at {0}")]
    UnknownTarget(String),

    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("could not find {0} in startup member list")]
    SelfNotFound(String),

    #[error("invalid member address {0}, expected host:port")]
    InvalidAddress(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Why a protocol loop stopped.
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("malformed gossip payload: {0}")]
    Decode(#[from] CodecError),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
}
