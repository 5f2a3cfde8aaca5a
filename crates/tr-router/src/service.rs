//! Service requests parsed from `--require` options
//!
//! Grammar:
//!
//! ```text
//! REQ  := RHOST ":" RPORT ( "@" LHOST ( ":" LSPEC )? )?
//! RPORT:= DIGITS | "*"
//! LSPEC:= "?" | ">" DIGITS | ">?"
//! ```
//!
//! `*` wildcards the remote port in service-name derivation. `?` and
//! `>?` both request a front-end port taken from the first backend's
//! listen port; `>N` fixes it. An option without an LSPEC declares no
//! front-end and is discovery-only.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;

use tr_core::error::ConfigError;
use tr_core::types::ServiceName;

use crate::registry::EndpointRegistry;
use crate::relay::FrontendHandle;

/// Remote-port component of a require option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePort {
    /// `*`: pool every port the remote publishes under one service
    Any,
    Port(u16),
}

/// Front-end port selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendPort {
    /// `>N`
    Fixed(u16),
    /// `?` or `>?`: the first registered backend's listen port
    Dynamic,
}

/// One parsed `--require` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    rhost: String,
    rport: RemotePort,
    lhost: Option<String>,
    lport: Option<FrontendPort>,
}

fn req_regex() -> &'static Regex {
    static REQ_RE: OnceLock<Regex> = OnceLock::new();
    REQ_RE.get_or_init(|| {
        Regex::new(r"^([^:@\s]+):([0-9]+|\*)(?:@(\*|[A-Za-z][A-Za-z0-9]*)(?::(\?|>\?|>[0-9]+))?)?$")
            .expect("require grammar regex")
    })
}

impl ServiceSpec {
    /// Parse one `--require` option.
    pub fn parse(opt: &str) -> Result<Self, ConfigError> {
        let caps = req_regex()
            .captures(opt)
            .ok_or_else(|| ConfigError::BadRequire(opt.to_string()))?;

        let rhost = caps[1].to_string();
        let rport = match &caps[2] {
            "*" => RemotePort::Any,
            digits => RemotePort::Port(parse_port(digits)?),
        };
        let lhost = caps.get(3).map(|m| m.as_str().to_string());
        let lport = match caps.get(4).map(|m| m.as_str()) {
            None => None,
            Some("?") | Some(">?") => Some(FrontendPort::Dynamic),
            Some(fixed) => Some(FrontendPort::Fixed(parse_port(&fixed[1..])?)),
        };

        Ok(Self {
            rhost,
            rport,
            lhost,
            lport,
        })
    }

    /// Logical service name this request pools endpoints under.
    pub fn name(&self) -> ServiceName {
        match self.rport {
            RemotePort::Any => ServiceName::derive(&self.rhost, None),
            RemotePort::Port(port) => ServiceName::derive(&self.rhost, Some(port as u32)),
        }
    }

    pub fn rhost(&self) -> &str {
        &self.rhost
    }

    pub fn rport(&self) -> RemotePort {
        self.rport
    }

    /// Front-end declaration; present only when the option carried a
    /// port spec.
    pub fn frontend(&self) -> Option<(&str, FrontendPort)> {
        match (&self.lhost, self.lport) {
            (Some(lhost), Some(lport)) => Some((lhost.as_str(), lport)),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.rhost)?;
        match self.rport {
            RemotePort::Any => write!(f, "*")?,
            RemotePort::Port(port) => write!(f, "{port}")?,
        }
        if let Some(lhost) = &self.lhost {
            write!(f, "@{lhost}")?;
            match self.lport {
                Some(FrontendPort::Fixed(port)) => write!(f, ":>{port}")?,
                Some(FrontendPort::Dynamic) => write!(f, ":>?")?,
                None => {}
            }
        }
        Ok(())
    }
}

fn parse_port(digits: &str) -> Result<u16, ConfigError> {
    digits
        .parse::<u16>()
        .map_err(|_| ConfigError::PortOutOfRange(digits.parse::<u32>().unwrap_or(u32::MAX)))
}

/// Runtime state of one configured service: the parsed request, its
/// endpoint pool, and the lazily bound front-end listener.
pub struct Service {
    spec: ServiceSpec,
    uid: u32,
    registry: Arc<EndpointRegistry>,
    frontend: Mutex<Option<FrontendHandle>>,
    counted: AtomicBool,
}

impl Service {
    pub fn new(spec: ServiceSpec, uid: u32) -> Self {
        Self {
            spec,
            uid,
            registry: Arc::new(EndpointRegistry::new()),
            frontend: Mutex::new(None),
            counted: AtomicBool::new(false),
        }
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn name(&self) -> ServiceName {
        self.spec.name()
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Address of the bound front-end listener, if any.
    pub fn frontend_addr(&self) -> Option<SocketAddr> {
        self.frontend.lock().unwrap().as_ref().map(|h| h.addr())
    }

    pub(crate) fn frontend_attached(&self) -> bool {
        self.frontend.lock().unwrap().is_some()
    }

    pub(crate) fn attach_frontend(&self, handle: FrontendHandle) {
        *self.frontend.lock().unwrap() = Some(handle);
    }

    pub(crate) fn take_frontend(&self) -> Option<FrontendHandle> {
        self.frontend.lock().unwrap().take()
    }

    /// First-arrival latch for the readiness barrier; true exactly once.
    pub(crate) fn mark_counted(&self) -> bool {
        !self.counted.swap(true, Ordering::SeqCst)
    }
}
