//! Router core
//!
//! Owns the configured services, the readiness barrier, and the
//! per-service state machine: the first endpoint of a service with a
//! declared front-end binds the listener, the last removal tears it
//! down. Events arrive from the rendezvous monitor over a single
//! channel, so add and remove handling is serialized.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tr_core::error::ConfigError;
use tr_core::types::Host;

use crate::barrier::{ReadyBarrier, ReadyCallback};
use crate::hooks;
use crate::monitor::{ConnEvent, Monitor};
use crate::relay;
use crate::service::{FrontendPort, Service, ServiceSpec};

/// Capacity of the monitor-to-router event channel. Endpoint churn is
/// bounded by tunnel arrival rate, so a small buffer suffices.
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct Router {
    services: DashMap<String, Arc<Service>>,
    monitor: Arc<Monitor>,
    barrier: Arc<ReadyBarrier>,
    event_rx: mpsc::Receiver<ConnEvent>,
    cancel: CancellationToken,
}

impl Router {
    /// Create a router whose rendezvous socket lives at `socket_path`.
    /// `on_ready` fires once every configured service has an endpoint.
    pub fn new(socket_path: PathBuf, on_ready: Option<ReadyCallback>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        Self {
            services: DashMap::new(),
            monitor: Arc::new(Monitor::new(socket_path, event_tx, cancel.child_token())),
            barrier: Arc::new(ReadyBarrier::new(on_ready)),
            event_rx,
            cancel,
        }
    }

    /// Register one parsed service under its account uid.
    pub fn add_service(&self, spec: ServiceSpec, uid: u32) -> Result<Arc<Service>, ConfigError> {
        let name = spec.name().to_string();
        if self.services.contains_key(&name) {
            return Err(ConfigError::DuplicateService(name));
        }
        if self.monitor.is_registered(uid) {
            return Err(ConfigError::DuplicateUid(uid));
        }

        let service = Arc::new(Service::new(spec, uid));
        self.barrier.register();
        self.monitor.register(Arc::clone(&service));
        self.services.insert(name, Arc::clone(&service));
        Ok(service)
    }

    /// Finish configuration. With no services the readiness callback
    /// fires here, synchronously.
    pub fn seal(&self) {
        self.barrier.seal();
    }

    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Token that stops the event loop and the monitor when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bind the rendezvous socket and serve events until cancelled.
    pub async fn run(mut self) -> Result<()> {
        let listener = self.monitor.bind()?;
        tokio::spawn(Arc::clone(&self.monitor).run(listener));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.event_rx.recv() => match event {
                    Some(ConnEvent::Add(service, host)) => {
                        self.endpoint_added(&service, host).await?;
                    }
                    Some(ConnEvent::Remove(service, host)) => {
                        self.endpoint_removed(&service, &host);
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    async fn endpoint_added(&self, service: &Arc<Service>, host: Host) -> Result<()> {
        let host = Arc::new(host);
        let prior = service.registry().add(host.pid, Arc::clone(&host));

        if prior == 0 {
            if let Some((lhost, lport)) = service.spec().frontend() {
                if !service.frontend_attached() {
                    let port = match lport {
                        FrontendPort::Fixed(port) => port,
                        FrontendPort::Dynamic => u16::try_from(host.listen_port).unwrap_or(0),
                    };
                    // losing the front-end is fatal; data-plane faults are not
                    let handle = relay::spawn_frontend(
                        Arc::clone(service.registry()),
                        lhost,
                        port,
                        service.name().as_str(),
                    )
                    .await?;
                    service.attach_frontend(handle);
                }
            }
        }

        hooks::on_connect(&host);

        if prior == 0 && service.mark_counted() {
            self.barrier.arrive();
        }
        Ok(())
    }

    fn endpoint_removed(&self, service: &Arc<Service>, host: &Host) {
        service.registry().remove(host.pid);
        tracing::info!(service = %host.uname, pid = host.pid, "endpoint detached");

        if service.registry().is_empty() {
            if let Some(handle) = service.take_frontend() {
                tracing::info!(service = %host.uname, "front-end on {} closed", handle.addr());
                handle.shutdown();
            }
        }

        hooks::on_disconnect(host);
    }
}
