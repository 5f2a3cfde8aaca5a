//! tr-router: service lifecycle, rendezvous monitoring, and the relay
//! path for trafficrouter
//!
//! The router keeps one ordered endpoint registry per configured
//! service, learns about tunnels from the rendezvous monitor, and
//! splices front-end TCP traffic across the live endpoints round-robin.

pub mod barrier;
pub mod hooks;
pub mod monitor;
pub mod registry;
pub mod relay;
pub mod router;
pub mod service;

pub use router::Router;
pub use service::ServiceSpec;
