//! Rendezvous monitor
//!
//! Owns the router's Unix rendezvous socket. Helpers connect, write one
//! Host Record as a single JSON value, and close. The monitor
//! demultiplexes records onto registered services by uid, emits add
//! events, and watches each tunnel's advisory lock to emit the matching
//! remove event when the lock is released.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tr_core::error::RendezvousError;
use tr_core::lockfile::LockFile;
use tr_core::paths;
use tr_core::types::Host;

use crate::service::Service;

/// Endpoint lifecycle events delivered to the router core.
pub enum ConnEvent {
    Add(Arc<Service>, Host),
    Remove(Arc<Service>, Host),
}

pub struct Monitor {
    socket_path: PathBuf,
    services: DashMap<u32, Arc<Service>>,
    event_tx: mpsc::Sender<ConnEvent>,
    cancel: CancellationToken,
}

impl Monitor {
    pub fn new(
        socket_path: PathBuf,
        event_tx: mpsc::Sender<ConnEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            socket_path,
            services: DashMap::new(),
            event_tx,
            cancel,
        }
    }

    /// Register a service under its account uid, the demultiplex key.
    pub fn register(&self, service: Arc<Service>) {
        self.services.insert(service.uid(), service);
    }

    pub fn is_registered(&self, uid: u32) -> bool {
        self.services.contains_key(&uid)
    }

    /// Bind the rendezvous socket. Failure here is fatal to the router.
    pub fn bind(&self) -> Result<UnixListener> {
        // a socket file may survive from an earlier process with this pid
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("binding rendezvous socket {:?}", self.socket_path))?;
        tracing::info!("rendezvous socket at {:?}", self.socket_path);
        Ok(listener)
    }

    /// Accept loop: one Host Record per connection.
    pub async fn run(self: Arc<Self>, listener: UnixListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, _)) => {
                        let monitor = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = monitor.handle_delivery(stream).await {
                                tracing::warn!("rendezvous delivery dropped: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("rendezvous accept failed: {}", e);
                        break;
                    }
                }
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }

    async fn handle_delivery(&self, mut stream: UnixStream) -> Result<(), RendezvousError> {
        let mut payload = Vec::new();
        stream.read_to_end(&mut payload).await?;
        if payload.is_empty() {
            return Err(RendezvousError::ShortRead);
        }

        let mut host: Host = serde_json::from_slice(&payload)?;
        let service = self
            .services
            .get(&(host.uid as u32))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RendezvousError::UnknownUid(host.uid))?;

        host.uname = service.name().to_string();
        tracing::info!(
            service = %host.uname,
            pid = host.pid,
            lisport = host.listen_port,
            raddr = %host.remote_ip,
            "endpoint attached"
        );

        let watcher_service = Arc::clone(&service);
        let watcher_host = host.clone();
        let event_tx = self.event_tx.clone();

        if self.event_tx.send(ConnEvent::Add(service, host)).await.is_err() {
            return Ok(());
        }
        tokio::spawn(watch_lock(watcher_service, watcher_host, event_tx));
        Ok(())
    }
}

/// Block until the tunnel's advisory lock is released, then emit the
/// matching remove event. The lock is held by the helper for as long as
/// its SSH session lives.
async fn watch_lock(service: Arc<Service>, host: Host, event_tx: mpsc::Sender<ConnEvent>) {
    let path = paths::tunnel_lock(host.pid);
    let lock = tokio::task::spawn_blocking(move || LockFile::lock_exclusive(&path)).await;
    match lock {
        Ok(Ok(lock)) => {
            tracing::info!(service = %host.uname, pid = host.pid, "tunnel lock released");
            if let Err(e) = lock.unlock_and_remove() {
                tracing::debug!("removing tunnel lock failed: {}", e);
            }
            let _ = event_tx.send(ConnEvent::Remove(service, host)).await;
        }
        Ok(Err(e)) => tracing::warn!(pid = host.pid, "tunnel lock watch failed: {}", e),
        Err(e) => tracing::warn!(pid = host.pid, "lock watcher task failed: {}", e),
    }
}
