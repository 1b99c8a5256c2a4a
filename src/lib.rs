//! Lifecycle host for Kubernetes-resident adapters
//!
//! Gates startup on the API server version, applies the logging and
//! observability ConfigMaps at runtime, and supervises a pluggable
//! `Service` next to the diagnostics listener until SIGTERM/SIGINT.

pub mod adapter;
pub mod config;
pub mod error;
pub mod hello;
pub mod logging;
pub mod server;

pub use adapter::{main_with_client, Bootstrap, Service, ServiceContext};
pub use error::AdapterError;
