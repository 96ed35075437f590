//! IPC client: multiplexes named requests over one persistent connection.
//!
//! Connection lifecycle:
//! ```text
//! Disconnected --init--> Handshaking --ok--> Connected
//!      ^                     |                   |
//!      |                   fail             peer closed
//!      |                     v                   v
//!      +----- give up --- Reconnecting <---------+
//! ```
//!
//! The connection slot is guarded by an async mutex, so handshakes are
//! serialized and concurrent callers share one connection. A request issued
//! with no live connection performs its own handshake and fails fast if it
//! cannot connect.

mod backoff;
mod connection;
mod discovery;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, EnvelopeCodec, check_frame_len};
use crate::bridge::protocol::{Envelope, Secret, Token};
use crate::error::IpcError;
use crate::node::Node;
use crate::pending::PendingTable;
use crate::server::DEFAULT_DISCOVERY_PORT;

pub use backoff::{DEFAULT_RECONNECT_INTERVAL, FixedBackoff, NoReconnect, ReconnectPolicy};
use connection::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Connected,
    Reconnecting,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    /// Main server port. When unset, the port is discovered on every
    /// handshake through `discovery_port`.
    pub port: Option<u16>,
    pub discovery_port: u16,
    pub secret: Secret,
    /// Default deadline for `request`; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    pub discovery_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: Arc<dyn ReconnectPolicy>,
    /// Interval between keep-alive pings; disabled when `None`.
    pub keepalive: Option<Duration>,
    /// Outbound queue capacity.
    pub send_queue: usize,
    /// Largest frame body sent or accepted. Larger requests are rejected
    /// locally with `InvalidArguments`.
    pub max_frame_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            secret: Secret::new(""),
            request_timeout: None,
            discovery_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            reconnect: Arc::new(FixedBackoff::default()),
            keepalive: None,
            send_queue: 256,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ClientConfig {
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
        self.port = Some(port);
        self
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: impl ReconnectPolicy) -> Self {
        self.reconnect = Arc::new(policy);
        self
    }

    pub fn with_keepalive(mut self, every: Duration) -> Self {
        self.keepalive = Some(every);
        self
    }

    pub fn with_send_queue(mut self, capacity: usize) -> Self {
        self.send_queue = capacity;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub(crate) fn codec(&self) -> EnvelopeCodec {
        EnvelopeCodec::with_max_frame_length(self.max_frame_length)
    }
}

/// Handle to the IPC client. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    pending: Arc<PendingTable>,
    slot: Mutex<Option<Connection>>,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    closed: CancellationToken,
}

impl Client {
    /// Create a client. No connection is made until `init_socket` or the
    /// first request.
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                pending: Arc::new(PendingTable::new()),
                slot: Mutex::new(None),
                state,
                generation: AtomicU64::new(0),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Connect eagerly to a known port, skipping discovery.
    pub async fn connect(
        host: impl Into<String>,
        port: u16,
        secret: impl Into<Secret>,
    ) -> Result<Self, IpcError> {
        let client = Self::new(ClientConfig::new(secret).with_host(host).with_port(port));
        client.init_socket().await?;
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Probe the discovery port. Does not touch the main connection.
    pub async fn discover(&self) -> Result<Node, IpcError> {
        discovery::probe(&self.inner.config).await
    }

    /// Establish the main connection now instead of on the first request.
    pub async fn init_socket(&self) -> Result<(), IpcError> {
        self.inner.connected_sender().await.map(|_| ())
    }

    /// Call `endpoint` with `args` using the configured request timeout.
    ///
    /// `args` must serialize to a JSON object (or unit/`None` for no
    /// arguments).
    pub async fn request<A: Serialize>(&self, endpoint: &str, args: A) -> Result<Value, IpcError> {
        self.send_request(endpoint, args, self.inner.config.request_timeout)
            .await
    }

    /// Call `endpoint` with an explicit deadline. Expiry only abandons the
    /// local wait; the server still runs the handler.
    pub async fn request_with_timeout<A: Serialize>(
        &self,
        endpoint: &str,
        args: A,
        timeout: Duration,
    ) -> Result<Value, IpcError> {
        self.send_request(endpoint, args, Some(timeout)).await
    }

    /// Call `endpoint` on a discovered node. Endpoints the node did not
    /// advertise fail locally with `UnknownEndpoint` and nothing is sent.
    pub async fn request_on<A: Serialize>(
        &self,
        node: &Node,
        endpoint: &str,
        args: A,
    ) -> Result<Value, IpcError> {
        if !node.serves(endpoint) {
            tracing::debug!(%node, endpoint, "Endpoint not advertised by node");
            return Err(IpcError::UnknownEndpoint(endpoint.to_string()));
        }
        self.request(endpoint, args).await
    }

    async fn send_request<A: Serialize>(
        &self,
        endpoint: &str,
        args: A,
        timeout: Option<Duration>,
    ) -> Result<Value, IpcError> {
        let data = to_arguments(args)?;
        let token = Token::generate();
        let envelope = Envelope::request(endpoint, data, token.clone(), &self.inner.config.secret);
        check_frame_len(&envelope, self.inner.config.max_frame_length)
            .map_err(|e| IpcError::InvalidArguments(e.to_string()))?;

        let (generation, outbound) = self.inner.connected_sender().await?;

        let pending = &self.inner.pending;
        let waiter = pending.register(token.clone(), endpoint)?;
        let _expire = ExpireOnDrop {
            pending,
            token: &token,
        };

        tracing::debug!(%token, endpoint, generation, "Sending request");
        if outbound.send(envelope).await.is_err() {
            return Err(IpcError::unreachable(
                "connection closed before the request was sent",
            ));
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, waiter).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::debug!(%token, endpoint, ?limit, "Request timed out");
                    return Err(IpcError::Timeout(limit));
                }
            },
            None => waiter.await,
        };
        outcome.unwrap_or_else(|_| Err(IpcError::unreachable("request abandoned")))
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Outstanding requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Stop the connection and reconnection. Pending requests fail with
    /// `Closed`, as do later calls.
    pub async fn close(&self) {
        self.inner.closed.cancel();
        let connection = self.inner.slot.lock().await.take();
        if let Some(connection) = connection {
            connection.shutdown().await;
        }
        let failed = self.inner.pending.resolve_all(&IpcError::Closed);
        self.inner.set_state(ConnectionState::Disconnected);
        tracing::info!(failed, "IPC client closed");
    }
}

/// Removes a pending entry when the request future finishes or is dropped.
/// A no-op once the entry was resolved.
struct ExpireOnDrop<'a> {
    pending: &'a PendingTable,
    token: &'a Token,
}

impl Drop for ExpireOnDrop<'_> {
    fn drop(&mut self) {
        self.pending.expire(self.token);
    }
}

fn to_arguments<A: Serialize>(args: A) -> Result<Map<String, Value>, IpcError> {
    match serde_json::to_value(args) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(other) => Err(IpcError::InvalidArguments(format!(
            "arguments must serialize to an object, got {other}"
        ))),
        Err(e) => Err(IpcError::InvalidArguments(e.to_string())),
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }

    /// Sender for the live connection, connecting first if needed.
    async fn connected_sender(self: &Arc<Self>) -> Result<(u64, mpsc::Sender<Envelope>), IpcError> {
        let mut slot = self.slot.lock().await;
        if self.closed.is_cancelled() {
            return Err(IpcError::Closed);
        }
        self.ensure_connected(&mut slot).await
    }

    /// Caller holds the slot lock.
    async fn ensure_connected(
        self: &Arc<Self>,
        slot: &mut Option<Connection>,
    ) -> Result<(u64, mpsc::Sender<Envelope>), IpcError> {
        if let Some(connection) = slot.as_ref().filter(|c| c.is_alive()) {
            return Ok((connection.generation(), connection.sender()));
        }
        if let Some(dead) = slot.take() {
            self.teardown(dead).await;
        }

        self.set_state(ConnectionState::Handshaking);
        match self.handshake().await {
            Ok(connection) => {
                spawn_supervisor(
                    Arc::downgrade(self),
                    connection.generation(),
                    connection.lifetime(),
                );
                let handle = (connection.generation(), connection.sender());
                *slot = Some(connection);
                self.set_state(ConnectionState::Connected);
                Ok(handle)
            }
            Err(e) => {
                tracing::warn!(error = %e, "IPC handshake failed");
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<Connection, IpcError> {
        let port = match self.config.port {
            Some(port) => port,
            None => discovery::probe(&self.config).await?.port,
        };
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        Connection::open(&self.config, port, Arc::clone(&self.pending), generation).await
    }

    /// Stop the pumps first so nothing else reaches the socket, then fail
    /// whatever was still waiting.
    async fn teardown(&self, connection: Connection) {
        let generation = connection.generation();
        connection.shutdown().await;
        let failed = self
            .pending
            .resolve_all(&IpcError::unreachable("connection to the IPC server was lost"));
        if failed > 0 {
            tracing::warn!(generation, failed, "Failed pending requests after disconnect");
        }
    }
}

// Boxed so the supervisor's future type does not appear inside
// `ensure_connected`, which the supervisor itself awaits.
fn spawn_supervisor(inner: Weak<Inner>, generation: u64, lifetime: CancellationToken) {
    let task: BoxFuture<'static, ()> = supervise(inner, generation, lifetime).boxed();
    tokio::spawn(task);
}

/// Waits for a connection to end, tears it down and starts reconnecting.
async fn supervise(inner: Weak<Inner>, generation: u64, lifetime: CancellationToken) {
    lifetime.cancelled().await;

    let Some(strong) = inner.upgrade() else { return };
    let mut slot = strong.slot.lock().await;
    if let Some(connection) = slot.take_if(|c| c.generation() == generation) {
        strong.teardown(connection).await;
    }
    let reconnect = slot.is_none() && !strong.closed.is_cancelled();
    drop(slot);
    drop(strong);

    if reconnect {
        reconnect_loop(inner).await;
    }
}

async fn reconnect_loop(inner: Weak<Inner>) {
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);

        let (delay, closed) = {
            let Some(strong) = inner.upgrade() else { return };
            if strong.closed.is_cancelled() {
                return;
            }
            match strong.config.reconnect.next_delay(attempt) {
                Some(delay) => {
                    strong.set_state(ConnectionState::Reconnecting);
                    (delay, strong.closed.clone())
                }
                None => {
                    tracing::warn!(attempts = attempt - 1, "Giving up on reconnecting");
                    strong.set_state(ConnectionState::Disconnected);
                    return;
                }
            }
        };

        tracing::info!(attempt, ?delay, "Reconnecting to IPC server");
        tokio::select! {
            _ = closed.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(strong) = inner.upgrade() else { return };
        let mut slot = strong.slot.lock().await;
        if strong.closed.is_cancelled() {
            return;
        }
        if slot.as_ref().is_some_and(|c| c.is_alive()) {
            return;
        }
        match strong.ensure_connected(&mut slot).await {
            Ok(_) => {
                tracing::info!(attempt, "Reconnected to IPC server");
                return;
            }
            Err(e) => tracing::warn!(attempt, error = %e, "Reconnect attempt failed"),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ProbeReply;
    use crate::server::DEFAULT_PORT;
    use serde_json::json;

    #[test]
    fn config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, None);
        assert_eq!(config.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
        assert_eq!(
            config.reconnect.next_delay(1),
            Some(DEFAULT_RECONNECT_INTERVAL)
        );
        assert_eq!(DEFAULT_PORT, 8765);
    }

    #[test]
    fn arguments_must_be_objects() {
        assert_eq!(to_arguments(json!({"a": 1})).unwrap().len(), 1);
        assert!(to_arguments(()).unwrap().is_empty());
        assert!(to_arguments(None::<u8>).unwrap().is_empty());
        assert!(matches!(
            to_arguments(json!([1, 2])),
            Err(IpcError::InvalidArguments(_))
        ));
    }

    #[tokio::test]
    async fn request_without_server_fails_fast() {
        let config = ClientConfig::new("k")
            .with_host("127.0.0.1")
            .with_discovery_port(1)
            .with_discovery_timeout(Duration::from_millis(200))
            .with_reconnect(NoReconnect);
        let client = Client::new(config);

        let err = client.request("echo", ()).await.unwrap_err();
        assert!(matches!(err, IpcError::DiscoveryFailed(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn closed_client_rejects_requests() {
        let client = Client::new(ClientConfig::new("k").with_port(1));
        client.close().await;
        assert!(matches!(
            client.request("echo", ()).await,
            Err(IpcError::Closed)
        ));
    }

    #[tokio::test]
    async fn oversized_request_is_rejected_before_connecting() {
        let config = ClientConfig::new("k")
            .with_host("127.0.0.1")
            .with_port(1)
            .with_max_frame_length(1024)
            .with_reconnect(NoReconnect);
        let client = Client::new(config);

        let err = client
            .request("echo", json!({ "blob": "x".repeat(2048) }))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::InvalidArguments(ref m) if m.contains("frame limit")));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn request_on_unadvertised_endpoint_fails_locally() {
        let client = Client::new(ClientConfig::new("k").with_host("127.0.0.1").with_port(1));
        let node = Node::from_probe("127.0.0.1", ProbeReply::new(1, vec!["echo".to_string()]));

        let err = client.request_on(&node, "missing", ()).await.unwrap_err();
        assert!(matches!(err, IpcError::UnknownEndpoint(ref name) if name == "missing"));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
