//! Runtime filesystem layout
//!
//! Everything the router and the helpers share on disk lives under
//! [`RUN_PATH`]: the rendezvous socket, and one advisory lock file per
//! live tunnel.

use std::path::PathBuf;

/// Directory holding rendezvous sockets and tunnel lock files.
pub const RUN_PATH: &str = "/tmp";

/// sshd configuration file the provisioner appends `Match User` blocks to.
pub const SSHD_CONFIG: &str = "/etc/ssh/sshd_config";

/// Script run when an endpoint attaches, if present.
pub const ON_CONNECT_HOOK: &str = "/var/lib/dupper/onconnect";

/// Script run when an endpoint detaches, if present.
pub const ON_DISCONNECT_HOOK: &str = "/var/lib/dupper/ondisconnect";

/// Rendezvous socket of the router process with the given pid.
pub fn rendezvous_socket(pid: u32) -> PathBuf {
    PathBuf::from(RUN_PATH).join(format!("{pid}.sock"))
}

/// Advisory lock file paired with a live tunnel, keyed by the helper's
/// parent pid.
pub fn tunnel_lock(pid: i32) -> PathBuf {
    PathBuf::from(RUN_PATH).join(format!("{pid}.lock"))
}
