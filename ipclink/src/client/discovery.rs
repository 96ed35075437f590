//! Discovery handshake: ask the discovery port where the main server is.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::ClientConfig;
use crate::bridge::protocol::{ControlAction, Envelope};
use crate::error::{IpcError, RemoteError};
use crate::node::Node;

/// Send one authenticated `connect` probe and wait for exactly one reply.
pub(crate) async fn probe(config: &ClientConfig) -> Result<Node, IpcError> {
    let host = config.host.as_str();
    let port = config.discovery_port;

    let exchange = async {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| IpcError::discovery(format!("cannot reach {host}:{port}: {e}")))?;
        let mut framed = Framed::new(stream, config.codec());

        framed
            .send(Envelope::control(ControlAction::Connect, Some(&config.secret)))
            .await
            .map_err(IpcError::discovery)?;

        match framed.next().await {
            Some(Ok(Ok(reply))) => interpret(host, reply),
            Some(Ok(Err(e))) => Err(IpcError::discovery(e)),
            Some(Err(e)) => Err(IpcError::discovery(e)),
            None => Err(IpcError::discovery(
                "discovery server closed the connection without replying",
            )),
        }
    };

    let node = tokio::time::timeout(config.discovery_timeout, exchange)
        .await
        .map_err(|_| {
            IpcError::discovery(format!(
                "no reply from {host}:{port} within {:?}",
                config.discovery_timeout
            ))
        })??;

    tracing::debug!(%node, "Discovered IPC server");
    Ok(node)
}

fn interpret(host: &str, reply: Envelope) -> Result<Node, IpcError> {
    if let Some(body) = reply.error_body() {
        return Err(IpcError::discovery(RemoteError::from(body)));
    }
    match reply.probe() {
        Some(probe) if probe.code == 200 => Ok(Node::from_probe(host, probe)),
        _ => Err(IpcError::discovery("unexpected discovery reply")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ErrorBody, ProbeReply};

    #[test]
    fn probe_reply_becomes_node() {
        let reply = Envelope::probe_reply(&ProbeReply::new(8765, vec!["echo".into()]));
        let node = interpret("localhost", reply).unwrap();
        assert_eq!(node.port, 8765);
        assert!(node.serves("echo"));
    }

    #[test]
    fn error_reply_is_discovery_failure() {
        let reply = Envelope::error(None, ErrorBody::unauthorized());
        let err = interpret("localhost", reply).unwrap_err();
        assert!(matches!(err, IpcError::DiscoveryFailed(ref m) if m.contains("403")));
    }

    #[test]
    fn unrelated_reply_is_discovery_failure() {
        let reply = Envelope::control(ControlAction::Pong, None);
        assert!(matches!(
            interpret("localhost", reply),
            Err(IpcError::DiscoveryFailed(_))
        ));
    }
}
