//! Host-visible server events.

use std::net::SocketAddr;

use crate::error::DispatchError;

/// Addresses the server bound when it became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyInfo {
    pub addr: SocketAddr,
    pub discovery_addr: Option<SocketAddr>,
}

/// Callbacks the host application receives from the server.
///
/// Both methods default to no-ops. They run on the dispatching task, so
/// implementations should hand heavy work off rather than block.
pub trait HostEvents: Send + Sync + 'static {
    /// Server sockets are bound and accepting.
    fn on_ipc_ready(&self, _info: &ReadyInfo) {}

    /// An endpoint handler failed or returned an unencodable value.
    fn on_ipc_error(&self, _endpoint: &str, _error: &DispatchError) {}
}

/// Host that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl HostEvents for NoopHost {}

/// Host that forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHost;

impl HostEvents for LoggingHost {
    fn on_ipc_ready(&self, info: &ReadyInfo) {
        match info.discovery_addr {
            Some(discovery) => {
                tracing::info!(addr = %info.addr, %discovery, "IPC server ready")
            }
            None => tracing::info!(addr = %info.addr, "IPC server ready"),
        }
    }

    fn on_ipc_error(&self, endpoint: &str, error: &DispatchError) {
        tracing::error!(endpoint, category = error.category(), %error, "IPC route failed");
    }
}
