//! Front-end relay: accept loop and TCP splice
//!
//! Each accepted connection is routed to the next endpoint in the
//! service's registry. The outbound side dials the endpoint's loopback
//! listener with the source bound to the primary interface; backends
//! that connect back must reach the router at a routable address, not
//! loopback.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

use tr_core::net;

use crate::registry::EndpointRegistry;

/// Handle to a bound front-end listener. Shutting it down unblocks the
/// accept loop and releases the bind.
pub struct FrontendHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl FrontendHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Bind the front-end listener for a service and spawn its accept loop.
pub async fn spawn_frontend(
    registry: Arc<EndpointRegistry>,
    lhost: &str,
    port: u16,
    uname: &str,
) -> Result<FrontendHandle> {
    let addr = SocketAddr::new(net::get_ip(lhost), port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding front-end listener on {addr}"))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(service = uname, "listening on {}", local_addr);

    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let uname = uname.to_string();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = loop_cancel.cancelled() => {
                    tracing::debug!(service = %uname, "front-end listener closed");
                    break;
                }
                result = listener.accept() => match result {
                    Ok((inbound, peer)) => {
                        tokio::spawn(handle_request(Arc::clone(&registry), inbound, peer));
                    }
                    Err(e) => {
                        // the service stops serving until reconfigured
                        tracing::error!(service = %uname, "front-end accept failed: {}", e);
                        break;
                    }
                }
            }
        }
    });

    Ok(FrontendHandle {
        addr: local_addr,
        cancel,
    })
}

/// Route one inbound connection to the next live endpoint, evicting
/// endpoints whose dial fails, until the ring is exhausted.
async fn handle_request(registry: Arc<EndpointRegistry>, mut inbound: TcpStream, peer: SocketAddr) {
    let mut tried = HashSet::new();
    loop {
        let Some((handle, host)) = registry.next() else {
            tracing::debug!("no live endpoint for {}", peer);
            return;
        };
        if !tried.insert(handle.pid()) {
            // a full rotation produced no reachable endpoint
            return;
        }

        match dial_backend(host.listen_port).await {
            Ok(mut outbound) => {
                tracing::debug!(
                    service = %host.uname,
                    "routing {} to 127.0.0.1:{}",
                    peer,
                    host.listen_port
                );
                let _ = copy_bidirectional(&mut inbound, &mut outbound).await;
                return;
            }
            Err(e) => {
                tracing::warn!(
                    service = %host.uname,
                    pid = handle.pid(),
                    "dial 127.0.0.1:{} failed: {}; evicting endpoint",
                    host.listen_port,
                    e
                );
                registry.remove_el(handle);
            }
        }
    }
}

async fn dial_backend(listen_port: u32) -> io::Result<TcpStream> {
    let addr = net::parse_tcp_addr("127.0.0.1", listen_port)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let socket = TcpSocket::new_v4()?;
    socket.bind(SocketAddr::new(net::get_ip("eth0"), 0))?;
    socket.connect(addr).await
}
