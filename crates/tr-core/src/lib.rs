//! tr-core: shared types and OS plumbing for trafficrouter
//!
//! This crate provides the wire types exchanged between the per-tunnel
//! helper and the router, the error taxonomy, the runtime filesystem
//! layout, and the small OS helpers (interface addresses, advisory
//! locks, account provisioning) both sides rely on.

pub mod error;
pub mod lockfile;
pub mod net;
pub mod paths;
pub mod provision;
pub mod types;

pub use error::{ConfigError, RendezvousError};
pub use types::{ClientConfig, Host, ServiceName};
