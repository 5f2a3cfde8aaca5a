//! Wire types exchanged between the per-tunnel helper and the router
//!
//! The JSON field names are the wire contract; `Host` is written as a
//! single JSON value per rendezvous connection and must round-trip
//! losslessly.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Client-supplied configuration, passed through `$SSH_ORIGINAL_COMMAND`
/// as the helper's trailing argument. Opaque to the router; surfaced to
/// hook scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Logical service port the remote side is publishing
    pub port: u32,
    /// Remote instance number
    pub instance: u32,
    /// Free-form label
    pub label: String,
}

/// One reverse tunnel's coordinates as reported by the helper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Local port on which sshd accepted the reverse forward
    #[serde(rename = "lisport")]
    pub listen_port: u32,

    /// Remote client address on the SSH control connection
    #[serde(rename = "raddr")]
    pub remote_ip: String,

    /// Remote client source port on the SSH control connection
    #[serde(rename = "rport")]
    pub remote_port: u32,

    /// Client configuration attached to this tunnel
    pub config: ClientConfig,

    /// Owning uid on the helper side; the rendezvous demultiplex key
    pub uid: i32,

    /// Logical service name, filled in by the router
    pub uname: String,

    /// Helper's parent pid; the stable registry key and the lock-file key
    pub pid: i32,
}

/// Logical service identity: `<rhost>` for a wildcard remote port,
/// `<rhost>.<rport>` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceName(String);

impl ServiceName {
    /// Derive the name from the remote-host label and optional remote port.
    pub fn derive(rhost: &str, rport: Option<u32>) -> Self {
        match rport {
            Some(port) => Self(format!("{rhost}.{port}")),
            None => Self(rhost.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
