//! Transport registry and factory
//!
//! This module provides:
//! - The `MessagingTransport` / `TransportSession` seam
//! - A factory resolving the configured transport by name
//!
//! All protocol-specific logic must live in dedicated transport
//! modules. The pool and the collector interact exclusively through
//! the traits in `adapter`.

pub mod adapter;
pub mod gateway;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

use std::sync::Arc;

use adapter::MessagingTransport;

use crate::config::TransportConfig;

/// Returns a transport instance for the configured `kind`.
///
/// RETURNS:
/// - `Some(Arc<dyn MessagingTransport>)` if the kind is supported
/// - `None` if the kind is unknown
///
/// NOTE:
/// The in-memory transport is not registered here. It has no
/// platform behind it, only exists for tests (or with the
/// `test-utils` feature) and is built directly by them.
///
pub fn get_transport(cfg: &TransportConfig, debug_raw: bool) -> Option<Arc<dyn MessagingTransport>> {
    match cfg.kind.as_str() {
        "gateway" => Some(Arc::new(gateway::GatewayTransport::new(cfg.clone(), debug_raw))),
        _ => None,
    }
}
