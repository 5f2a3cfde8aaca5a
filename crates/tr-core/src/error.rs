//! Error types shared across the trafficrouter crates

use thiserror::Error;

/// Control-plane configuration errors. These are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A `--require` option that does not match the grammar
    #[error("require option parse error: [{0}]. Format rhost:rport[@lhost[:lspec]]")]
    BadRequire(String),

    /// Port outside 1..=65535
    #[error("port number out of range: {0}")]
    PortOutOfRange(u32),

    /// Address that does not parse as an IP
    #[error("cannot parse IP address {0:?}")]
    BadAddress(String),

    /// Two `--require` options deriving the same logical service
    #[error("duplicate service {0}")]
    DuplicateService(String),

    /// Two services bound to the same account uid
    #[error("uid {0} already bound to a service")]
    DuplicateUid(u32),
}

/// Faults on the rendezvous path. These are isolated to one helper:
/// the router logs them and keeps serving.
#[derive(Error, Debug)]
pub enum RendezvousError {
    /// Payload that does not decode as a Host Record
    #[error("malformed host record: {0}")]
    MalformedRecord(#[from] serde_json::Error),

    /// Delivery closed before any payload arrived
    #[error("short read on rendezvous socket")]
    ShortRead,

    /// Host Record whose uid matches no configured service
    #[error("no service registered for uid {0}")]
    UnknownUid(i32),

    /// I/O error while reading a delivery
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
