//! Per-connection dispatch loop.
//!
//! Flow for each inbound frame:
//! 1. Decode (malformed → 400, loop continues)
//! 2. Answer transport pings
//! 3. Authenticate (bad/missing secret → 403, loop continues)
//! 4. Answer discovery probes
//! 5. Resolve the endpoint (unknown → 400)
//! 6. Spawn the handler; its result or failure is written back with the
//!    request's token
//!
//! Only transport failures and server shutdown end a connection.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::registry::{EndpointRegistry, Handler};
use super::request::Request;
use crate::bridge::codec::{EnvelopeCodec, check_frame_len};
use crate::bridge::protocol::{
    ControlAction, DecodeError, Envelope, ErrorBody, ErrorKind, Kind, ProbeReply, Secret, Token,
};
use crate::error::{DispatchError, HandlerError};
use crate::events::HostEvents;

/// Responses queued per connection before handlers wait on the writer.
const OUTBOUND_QUEUE: usize = 256;

/// Pause after a failed `accept`, so a persistent error such as fd
/// exhaustion does not spin the loop.
pub(crate) const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// State shared by every connection of one running server.
pub(crate) struct DispatchContext {
    pub registry: Arc<EndpointRegistry>,
    pub secret: Secret,
    pub host: Arc<dyn HostEvents>,
    /// Port the main listener actually bound.
    pub port: u16,
    pub max_frame_length: usize,
}

impl DispatchContext {
    pub fn probe_reply(&self) -> ProbeReply {
        ProbeReply::new(self.port, self.registry.names())
    }

    pub fn codec(&self) -> EnvelopeCodec {
        EnvelopeCodec::with_max_frame_length(self.max_frame_length)
    }
}

/// What to do with one decoded envelope.
enum Action {
    Reply(Envelope),
    Invoke {
        handler: Handler,
        request: Request,
    },
    Ignore,
}

fn route(envelope: Envelope, ctx: &DispatchContext) -> Action {
    let token = envelope.token.clone();

    match envelope.control_action() {
        Some(ControlAction::Ping) => {
            return Action::Reply(Envelope::control(ControlAction::Pong, None));
        }
        Some(ControlAction::Pong) => return Action::Ignore,
        _ => {}
    }

    if !ctx.secret.matches(envelope.authorization()) {
        tracing::warn!(endpoint = ?envelope.endpoint, "Rejected request with invalid or missing secret");
        return Action::Reply(Envelope::error(token, ErrorBody::unauthorized()));
    }

    match envelope.kind {
        Kind::Control => match envelope.control_action() {
            Some(ControlAction::Connect) => {
                Action::Reply(Envelope::probe_reply(&ctx.probe_reply()))
            }
            _ => Action::Reply(Envelope::error(
                token,
                ErrorBody::new(ErrorKind::MalformedRequest, "unsupported control action"),
            )),
        },
        Kind::Request => {
            let endpoint = envelope.endpoint.unwrap_or_default();
            match ctx.registry.resolve(&endpoint) {
                Some(registration) => Action::Invoke {
                    handler: registration.handler.clone(),
                    request: Request::new(endpoint, envelope.data).with_token(token),
                },
                None => {
                    tracing::debug!(%endpoint, "Request for unknown endpoint");
                    Action::Reply(Envelope::error(token, ErrorBody::unknown_endpoint(&endpoint)))
                }
            }
        }
        Kind::Response | Kind::Error => Action::Reply(Envelope::error(
            token,
            ErrorBody::new(
                ErrorKind::MalformedRequest,
                "server only accepts request and control envelopes",
            ),
        )),
    }
}

fn malformed_reply(error: &DecodeError) -> Envelope {
    Envelope::error(error.token().cloned(), error.to_error_body())
}

pub(crate) async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<DispatchContext>,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "Accepted IPC connection");
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&ctx),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept IPC connection");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },

            Some(_) = connections.join_next() => {}
        }
    }

    while connections.join_next().await.is_some() {}
    tracing::debug!("Accept loop exiting");
}

pub(crate) async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<DispatchContext>,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, ctx.codec());
    let writer = FramedWrite::new(write_half, ctx.codec());

    let (out_tx, out_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);
    let writer_task = tokio::spawn(write_loop(writer, out_rx, shutdown.clone()));

    let mut inflight = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(%peer, "Server stopping, closing connection");
                break;
            }

            frame = reader.next() => match frame {
                Some(Ok(Ok(envelope))) => match route(envelope, &ctx) {
                    Action::Reply(reply) => {
                        if out_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Action::Invoke { handler, request } => {
                        inflight.spawn(run_handler(
                            handler,
                            request,
                            Arc::clone(&ctx.host),
                            ctx.max_frame_length,
                            out_tx.clone(),
                        ));
                    }
                    Action::Ignore => {}
                },
                Some(Ok(Err(decode_error))) => {
                    tracing::warn!(%peer, error = %decode_error, "Malformed envelope");
                    if out_tx.send(malformed_reply(&decode_error)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(%peer, error = %e, "Connection read error");
                    break;
                }
                None => {
                    tracing::debug!(%peer, "Peer closed connection");
                    break;
                }
            },

            Some(joined) = inflight.join_next() => {
                if let Err(e) = joined {
                    tracing::error!(%peer, error = %e, "Handler task failed");
                }
            }
        }
    }

    inflight.abort_all();
    while inflight.join_next().await.is_some() {}
    drop(out_tx);
    let _ = writer_task.await;
    tracing::trace!(%peer, "Connection task exiting");
}

async fn write_loop(
    mut writer: FramedWrite<OwnedWriteHalf, EnvelopeCodec>,
    mut rx: mpsc::Receiver<Envelope>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(envelope) => {
                    if let Err(e) = writer.send(envelope).await {
                        tracing::error!(error = %e, "Failed to write response");
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

async fn run_handler(
    handler: Handler,
    request: Request,
    host: Arc<dyn HostEvents>,
    max_frame_length: usize,
    out_tx: mpsc::Sender<Envelope>,
) {
    let endpoint = request.endpoint().to_string();
    let token: Option<Token> = request.token().cloned();
    tracing::trace!(%endpoint, token = ?token, "Invoking handler");

    let outcome = AssertUnwindSafe(async move { handler.invoke(request).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(DispatchError::Handler(HandlerError::panic(panic_message(
                panic.as_ref(),
            ))))
        });

    let outcome = outcome.and_then(|value| {
        let response = Envelope::response(token.clone(), value);
        check_frame_len(&response, max_frame_length).map_err(DispatchError::Encode)?;
        Ok(response)
    });

    let reply = match outcome {
        Ok(response) => response,
        Err(error) => {
            tracing::warn!(%endpoint, category = error.category(), %error, "IPC route failed");
            host.on_ipc_error(&endpoint, &error);
            Envelope::error(token, error.to_error_body())
        }
    };

    if out_tx.send(reply).await.is_err() {
        tracing::debug!(%endpoint, "Connection closed before response could be sent");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
