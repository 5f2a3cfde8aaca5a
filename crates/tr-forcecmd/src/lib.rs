//! tr-forcecmd: the per-tunnel ForceCommand helper
//!
//! sshd runs `trafficrouter -f <json>` for every reverse tunnel a
//! client opens. The helper introspects its own process tree to recover
//! the tunnel's coordinates, takes the advisory lock that stands for
//! the tunnel's liveness, hands a Host Record to every router serving
//! its uid, and then blocks until sshd tears the session down.

pub mod discover;
pub mod probe;

use std::future;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use tr_core::lockfile::LockFile;
use tr_core::paths;
use tr_core::types::{ClientConfig, Host};

/// Assemble this tunnel's Host Record from /proc and the trailing JSON
/// config argument.
pub fn collect_host(config_arg: &str) -> Result<Host> {
    let ancestry = probe::ancestry().context("resolving process ancestry")?;
    let sockets = probe::scan_sockets(ancestry.sshd)
        .with_context(|| format!("scanning sockets of pid {}", ancestry.sshd))?;
    let config: ClientConfig =
        serde_json::from_str(config_arg).context("parsing client config")?;

    Ok(Host {
        listen_port: sockets.listen_port,
        remote_ip: sockets.remote_ip,
        remote_port: sockets.remote_port,
        config,
        uid: unsafe { libc::getuid() } as i32,
        uname: String::new(),
        pid: ancestry.parent,
    })
}

/// Write one Host Record to a router's rendezvous socket and close.
pub async fn deliver(socket: &Path, payload: &[u8]) -> Result<()> {
    let mut stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connecting to {:?}", socket))?;
    stream.write_all(payload).await.context("writing host record")?;
    stream.shutdown().await.context("closing delivery")?;
    Ok(())
}

/// Helper entry point: report this tunnel and hold it open.
///
/// Never returns on the happy path; the process is killed together with
/// the SSH session, which releases the advisory lock the router watches.
pub async fn run(config_arg: &str) -> Result<()> {
    let host = collect_host(config_arg)?;
    tracing::info!(
        pid = host.pid,
        lisport = host.listen_port,
        raddr = %host.remote_ip,
        "reverse tunnel attached"
    );

    // Taken before delivery: the router starts watching the lock as soon
    // as the record arrives.
    let _lock = LockFile::lock_exclusive(&paths::tunnel_lock(host.pid))
        .context("acquiring tunnel lock")?;

    let routers = discover::find_routers(host.uid as u32)?;
    if routers.is_empty() {
        tracing::warn!(uid = host.uid, "no router found; holding the tunnel open anyway");
    }

    let payload = serde_json::to_vec(&host)?;
    for pid in routers {
        let socket = paths::rendezvous_socket(pid as u32);
        match deliver(&socket, &payload).await {
            Ok(()) => tracing::info!(router = pid, "host record delivered"),
            Err(e) => tracing::warn!(router = pid, "delivery failed: {:#}", e),
        }
    }

    // Exiting would release the lock and detach the endpoint.
    future::pending::<()>().await;
    Ok(())
}
