//! Discovery responder: tells authenticated probes which port the main
//! listener is on and which endpoints it serves.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::dispatch::{ACCEPT_RETRY_DELAY, DispatchContext};
use crate::bridge::protocol::{ControlAction, Envelope, ErrorBody, ErrorKind};

pub(crate) async fn run(listener: TcpListener, ctx: Arc<DispatchContext>, shutdown: CancellationToken) {
    let mut probes = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    probes.spawn(answer_probes(stream, peer, Arc::clone(&ctx), shutdown.child_token()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept discovery connection");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },

            Some(_) = probes.join_next() => {}
        }
    }

    while probes.join_next().await.is_some() {}
    tracing::debug!("Discovery responder exiting");
}

fn reply_to(envelope: Envelope, ctx: &DispatchContext) -> Envelope {
    if !ctx.secret.matches(envelope.authorization()) {
        tracing::warn!("Rejected discovery probe with invalid or missing secret");
        return Envelope::error(envelope.token, ErrorBody::unauthorized());
    }

    match envelope.control_action() {
        Some(ControlAction::Connect) => Envelope::probe_reply(&ctx.probe_reply()),
        Some(ControlAction::Ping) => Envelope::control(ControlAction::Pong, None),
        _ => Envelope::error(
            envelope.token,
            ErrorBody::new(
                ErrorKind::MalformedRequest,
                "discovery port only answers connect probes",
            ),
        ),
    }
}

async fn answer_probes(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<DispatchContext>,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(stream, ctx.codec());

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = framed.next() => frame,
        };

        let reply = match frame {
            Some(Ok(Ok(envelope))) => reply_to(envelope, &ctx),
            Some(Ok(Err(decode_error))) => {
                tracing::warn!(%peer, error = %decode_error, "Malformed discovery probe");
                Envelope::error(decode_error.token().cloned(), decode_error.to_error_body())
            }
            Some(Err(e)) => {
                tracing::debug!(%peer, error = %e, "Discovery connection read error");
                break;
            }
            None => break,
        };

        if let Err(e) = framed.send(reply).await {
            tracing::debug!(%peer, error = %e, "Failed to answer discovery probe");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Secret;
    use crate::events::NoopHost;
    use crate::server::registry::EndpointRegistry;

    fn context() -> DispatchContext {
        let mut registry = EndpointRegistry::new();
        registry.route("b", |_req| async { Ok::<_, crate::error::HandlerError>(()) });
        registry.route("a", |_req| async { Ok::<_, crate::error::HandlerError>(()) });
        DispatchContext {
            registry: Arc::new(registry),
            secret: Secret::new("k"),
            host: Arc::new(NoopHost),
            port: 9000,
            max_frame_length: crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    #[test]
    fn probe_with_secret_gets_port() {
        let probe = Envelope::control(ControlAction::Connect, Some(&Secret::new("k")));
        let reply = reply_to(probe, &context()).probe().unwrap();
        assert_eq!(reply.code, 200);
        assert_eq!(reply.port, 9000);
        assert_eq!(reply.endpoints, vec!["a", "b"]);
    }

    #[test]
    fn probe_without_secret_is_403() {
        let probe = Envelope::control(ControlAction::Connect, None);
        let body = reply_to(probe, &context()).error_body().unwrap();
        assert_eq!(body.code, 403);
    }

    #[test]
    fn requests_are_rejected() {
        let request = Envelope::request(
            "a",
            serde_json::Map::new(),
            crate::bridge::protocol::Token::from("t"),
            &Secret::new("k"),
        );
        let reply = reply_to(request, &context());
        let body = reply.error_body().unwrap();
        assert_eq!(body.code, 400);
        assert_eq!(reply.token.unwrap().as_str(), "t");
    }
}
