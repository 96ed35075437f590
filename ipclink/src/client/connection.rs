//! One live client connection and its pump tasks.
//!
//! - outbound pump: drains the send queue in FIFO order onto the socket
//! - inbound pump: answers pings, resolves pending requests by token
//! - keep-alive (optional): enqueues pings on a fixed interval
//!
//! Either pump ending cancels the connection token; the owner then tears the
//! connection down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::ClientConfig;
use crate::bridge::codec::EnvelopeCodec;
use crate::bridge::protocol::{ControlAction, Envelope, ErrorBody, ErrorKind, Kind};
use crate::error::{IpcError, RemoteError};
use crate::pending::PendingTable;

pub(crate) struct Connection {
    generation: u64,
    peer: SocketAddr,
    outbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl Connection {
    pub async fn open(
        config: &ClientConfig,
        port: u16,
        pending: Arc<PendingTable>,
        generation: u64,
    ) -> Result<Self, IpcError> {
        let host = config.host.as_str();
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| IpcError::unreachable(format!("connect to {host}:{port} timed out")))?
            .map_err(|e| IpcError::unreachable(format!("{host}:{port}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let peer = stream
            .peer_addr()
            .map_err(|e| IpcError::unreachable(format!("{host}:{port}: {e}")))?;

        let (read_half, write_half) = stream.into_split();
        let (outbound, rx) = mpsc::channel(config.send_queue.max(1));
        let cancel = CancellationToken::new();

        let mut tasks = JoinSet::new();
        tasks.spawn(outbound_pump(
            FramedWrite::new(write_half, config.codec()),
            rx,
            cancel.clone(),
        ));
        tasks.spawn(inbound_pump(
            FramedRead::new(read_half, config.codec()),
            pending,
            outbound.clone(),
            cancel.clone(),
        ));
        if let Some(every) = config.keepalive {
            tasks.spawn(keepalive(outbound.clone(), every, cancel.clone()));
        }

        tracing::info!(%peer, generation, "Connected to IPC server");
        Ok(Self {
            generation,
            peer,
            outbound,
            cancel,
            tasks,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Token cancelled when either pump stops.
    pub fn lifetime(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn sender(&self) -> mpsc::Sender<Envelope> {
        self.outbound.clone()
    }

    /// Stop every pump and wait for them. Once this returns the send queue
    /// is closed, so later sends on a cloned sender fail.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        tracing::debug!(peer = %self.peer, generation = self.generation, "Connection torn down");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn outbound_pump(
    mut writer: FramedWrite<OwnedWriteHalf, EnvelopeCodec>,
    mut rx: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => next,
        };
        let Some(envelope) = next else { break };

        if let Err(e) = writer.send(envelope).await {
            tracing::error!(error = %e, "Failed to write to IPC server");
            break;
        }
    }
    cancel.cancel();
}

async fn inbound_pump(
    mut reader: FramedRead<OwnedReadHalf, EnvelopeCodec>,
    pending: Arc<PendingTable>,
    outbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(Ok(envelope))) => handle_inbound(envelope, &pending, &outbound).await,
            Some(Ok(Err(e))) => {
                tracing::warn!(error = %e, "Undecodable frame from IPC server");
                if let Some(token) = e.token() {
                    pending.resolve(token, Err(RemoteError::from(e.to_error_body()).into()));
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "IPC connection read failed");
                break;
            }
            None => {
                tracing::info!("IPC server closed the connection");
                break;
            }
        }
    }
    cancel.cancel();
}

async fn handle_inbound(envelope: Envelope, pending: &PendingTable, outbound: &mpsc::Sender<Envelope>) {
    match envelope.kind {
        Kind::Response => match envelope.token.clone() {
            Some(token) => {
                pending.resolve(&token, Ok(envelope.into_result()));
            }
            None => tracing::warn!("Response without token (protocol anomaly)"),
        },
        Kind::Error => {
            let body = envelope.error_body().unwrap_or_else(|| {
                ErrorBody::new(ErrorKind::HandlerError, "unreadable error envelope")
            });
            match envelope.token {
                Some(token) => {
                    pending.resolve(&token, Err(RemoteError::from(body).into()));
                }
                None => tracing::warn!(
                    code = body.code,
                    error = %body.error,
                    "Error reply without token (protocol anomaly)"
                ),
            }
        }
        Kind::Control => match envelope.control_action() {
            Some(ControlAction::Ping) => {
                tracing::trace!("Answering ping");
                let _ = outbound.send(Envelope::control(ControlAction::Pong, None)).await;
            }
            Some(ControlAction::Pong) => tracing::trace!("Received pong"),
            _ => tracing::debug!("Ignoring control envelope"),
        },
        Kind::Request => tracing::warn!(
            endpoint = ?envelope.endpoint,
            "Server sent a request envelope (protocol anomaly)"
        ),
    }
}

async fn keepalive(outbound: mpsc::Sender<Envelope>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if outbound.send(Envelope::control(ControlAction::Ping, None)).await.is_err() {
                    break;
                }
            }
        }
    }
}
