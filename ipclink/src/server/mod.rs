//! IPC server: endpoint registry, listener and discovery responder.
//!
//! Routes and components are collected before [`Server::start`]. Starting
//! merges the deferred component registrations, freezes the registry and
//! binds the sockets. Routes added while running take effect on the next
//! start.

mod discovery;
mod dispatch;
pub mod registry;
pub mod request;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::bridge::protocol::Secret;
use crate::error::HandlerError;
use crate::events::{HostEvents, ReadyInfo};

use dispatch::DispatchContext;
pub use registry::{Component, ComponentRoutes, EndpointRegistry, Handler, Registration};
pub use request::Request;

pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_DISCOVERY_PORT: u16 = 20000;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port for the main listener; 0 picks an ephemeral port.
    pub port: u16,
    pub secret: Secret,
    pub enable_discovery: bool,
    pub discovery_port: u16,
    /// Largest frame body accepted or sent. A result that would exceed it
    /// is answered with a 500 `EncodeError` instead.
    pub max_frame_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            secret: Secret::new(""),
            enable_discovery: true,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ServerConfig {
    pub fn new(secret: impl Into<Secret>) -> Self {
        Self {
            secret: secret.into(),
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.enable_discovery = enabled;
        self
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server is already running")]
    AlreadyStarted,
}

struct Running {
    info: ReadyInfo,
    registry: Arc<EndpointRegistry>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

pub struct Server {
    host: Arc<dyn HostEvents>,
    config: ServerConfig,
    registry: EndpointRegistry,
    /// Component registrations merged on the next `update_endpoints`.
    deferred: Vec<EndpointRegistry>,
    running: Option<Running>,
}

impl Server {
    pub fn new(host: Arc<dyn HostEvents>, config: ServerConfig) -> Self {
        Self {
            host,
            config,
            registry: EndpointRegistry::new(),
            deferred: Vec::new(),
            running: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register a plain async handler under `name`. Last write wins.
    ///
    /// The endpoint name is always explicit: closures and fn items carry no
    /// usable runtime name, so there is nothing to default it from.
    pub fn route<F, Fut, T>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
        T: Serialize + 'static,
    {
        self.register(name, Handler::plain(f))
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Handler) -> &mut Self {
        let name = name.into();
        if self.running.is_some() {
            tracing::warn!(endpoint = %name, "Route added while running; visible after restart");
        }
        self.registry.register(name, handler);
        self
    }

    /// Stage a component's routes. They are merged by `update_endpoints`,
    /// which `start` calls.
    pub fn add_component<C: Component>(&mut self, component: Arc<C>) -> &mut Self {
        let mut staged = EndpointRegistry::new();
        staged.register_component(component);
        self.deferred.push(staged);
        self
    }

    /// Merge staged component routes into the registry. Idempotent.
    pub fn update_endpoints(&mut self) {
        for staged in self.deferred.drain(..) {
            self.registry.merge(staged);
        }
    }

    /// Endpoint names known so far, including staged component routes.
    pub fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .deferred
            .iter()
            .flat_map(EndpointRegistry::names)
            .chain(self.registry.names())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Endpoints the running server dispatches to.
    pub fn serving(&self) -> Option<Vec<String>> {
        self.running.as_ref().map(|r| r.registry.names())
    }

    /// Bind the listener (and the discovery responder when enabled), then
    /// notify the host.
    pub async fn start(&mut self) -> Result<ReadyInfo, ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        self.update_endpoints();

        let listener = bind(&self.config.host, self.config.port).await?;
        let addr = local_addr(&listener, &self.config.host)?;

        let registry = Arc::new(self.registry.clone());
        let ctx = Arc::new(DispatchContext {
            registry: Arc::clone(&registry),
            secret: self.config.secret.clone(),
            host: Arc::clone(&self.host),
            port: addr.port(),
            max_frame_length: self.config.max_frame_length,
        });

        let discovery_listener = if self.config.enable_discovery {
            Some(bind(&self.config.host, self.config.discovery_port).await?)
        } else {
            None
        };
        let discovery_addr = match &discovery_listener {
            Some(l) => Some(local_addr(l, &self.config.host)?),
            None => None,
        };

        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        tasks.spawn(dispatch::accept_loop(
            listener,
            Arc::clone(&ctx),
            shutdown.child_token(),
        ));
        if let Some(l) = discovery_listener {
            tasks.spawn(discovery::run(l, ctx, shutdown.child_token()));
        }

        let info = ReadyInfo {
            addr,
            discovery_addr,
        };
        tracing::info!(
            %addr,
            discovery = ?discovery_addr,
            endpoints = registry.len(),
            "IPC server listening"
        );

        self.running = Some(Running {
            info,
            registry,
            shutdown,
            tasks,
        });
        self.host.on_ipc_ready(&info);
        Ok(info)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.info.addr)
    }

    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().and_then(|r| r.info.discovery_addr)
    }

    /// Close both listeners and every open connection. In-flight handlers
    /// are cancelled; their callers see the connection drop.
    pub async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        running.shutdown.cancel();
        while running.tasks.join_next().await.is_some() {}
        tracing::info!(addr = %running.info.addr, "IPC server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.shutdown.cancel();
        }
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, ServerError> {
    TcpListener::bind((host, port))
        .await
        .map_err(|source| ServerError::Bind {
            addr: format!("{host}:{port}"),
            source,
        })
}

fn local_addr(listener: &TcpListener, host: &str) -> Result<SocketAddr, ServerError> {
    listener.local_addr().map_err(|source| ServerError::Bind {
        addr: host.to_string(),
        source,
    })
}
