//! Tunnel introspection via /proc
//!
//! sshd invokes the helper underneath the process servicing the reverse
//! tunnel, so everything worth reporting can be read from the process
//! tree: the direct parent supplies the rendezvous key, and the
//! grandparent (the sshd child) owns both the reverse-forward listener
//! and the SSH control connection.

use std::collections::HashSet;

use procfs::net::TcpState;
use procfs::process::{FDTarget, Process};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("process table: {0}")]
    Proc(#[from] procfs::ProcError),

    /// The sshd child owns no IPv4 listening socket
    #[error("no listening socket found for pid {0}")]
    NoListener(i32),

    /// The sshd child owns no established IPv4 connection
    #[error("no established connection found for pid {0}")]
    NoControlChannel(i32),
}

/// The helper's two relevant ancestors.
#[derive(Debug, Clone, Copy)]
pub struct Ancestry {
    /// Direct parent; its pid keys the registry and the tunnel lock
    pub parent: i32,
    /// Grandparent, the sshd child owning the tunnel sockets
    pub sshd: i32,
}

/// Resolve the helper's parent and grandparent pids.
pub fn ancestry() -> Result<Ancestry, ProbeError> {
    let me = Process::myself()?;
    let parent = me.stat()?.ppid;
    let sshd = Process::new(parent)?.stat()?.ppid;
    Ok(Ancestry { parent, sshd })
}

/// Coordinates of one reverse tunnel as seen from the sshd child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSockets {
    /// Local port of the reverse-forward listener
    pub listen_port: u32,
    /// Remote peer of the SSH control connection
    pub remote_ip: String,
    pub remote_port: u32,
}

/// Find the reverse-forward listener and the SSH control channel among
/// the IPv4 TCP sockets owned by `pid`.
///
/// The sockets are located by matching the process's fd inodes against
/// the system TCP table; the IPv6 twin of the listener never appears
/// there.
pub fn scan_sockets(pid: i32) -> Result<TunnelSockets, ProbeError> {
    let proc = Process::new(pid)?;
    let inodes: HashSet<u64> = proc
        .fd()?
        .flatten()
        .filter_map(|fd| match fd.target {
            FDTarget::Socket(inode) => Some(inode),
            _ => None,
        })
        .collect();

    let mut listen_port = None;
    let mut peer = None;
    for entry in procfs::net::tcp()? {
        if !inodes.contains(&entry.inode) {
            continue;
        }
        match entry.state {
            TcpState::Listen => listen_port = Some(entry.local_address.port() as u32),
            TcpState::Established => {
                peer = Some((
                    entry.remote_address.ip().to_string(),
                    entry.remote_address.port() as u32,
                ));
            }
            _ => {}
        }
    }

    let listen_port = listen_port.ok_or(ProbeError::NoListener(pid))?;
    let (remote_ip, remote_port) = peer.ok_or(ProbeError::NoControlChannel(pid))?;
    Ok(TunnelSockets {
        listen_port,
        remote_ip,
        remote_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestry_resolves_parents() {
        let anc = ancestry().unwrap();
        assert!(anc.parent > 0);
        // pid 1's parent reads as 0
        assert!(anc.sshd >= 0);
    }

    #[test]
    fn test_scan_finds_own_sockets() {
        // stand in for the sshd child: one listener, one established pair
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let sockets = scan_sockets(std::process::id() as i32).unwrap();
        assert_eq!(sockets.listen_port, port as u32);
        assert_eq!(sockets.remote_ip, "127.0.0.1");
        assert!(sockets.remote_port > 0);
    }

    #[test]
    fn test_scan_of_missing_process_errors() {
        assert!(scan_sockets(i32::MAX - 1).is_err());
    }
}
