//! Pending-request table: correlation token → caller awaiting a result.
//!
//! Every entry is completed at most once. Whichever of `resolve`, `expire`
//! or `resolve_all` removes the entry first wins; later calls for the same
//! token are no-ops.

use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::protocol::Token;
use crate::error::IpcError;

pub type RequestResult = Result<Value, IpcError>;

struct PendingRequest {
    endpoint: String,
    created_at: Instant,
    slot: oneshot::Sender<RequestResult>,
}

#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<Token, PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `token`. Fails if the token is already live.
    pub fn register(
        &self,
        token: Token,
        endpoint: &str,
    ) -> Result<oneshot::Receiver<RequestResult>, IpcError> {
        match self.entries.entry(token) {
            Entry::Occupied(occupied) => {
                Err(IpcError::TokenCollision(occupied.key().to_string()))
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                tracing::trace!(token = %vacant.key(), endpoint, "Registered pending request");
                vacant.insert(PendingRequest {
                    endpoint: endpoint.to_string(),
                    created_at: Instant::now(),
                    slot: tx,
                });
                Ok(rx)
            }
        }
    }

    /// Complete the waiter for `token`. Returns false for unknown tokens.
    pub fn resolve(&self, token: &Token, result: RequestResult) -> bool {
        match self.entries.remove(token) {
            Some((_, pending)) => {
                tracing::trace!(
                    %token,
                    endpoint = %pending.endpoint,
                    elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "Resolving pending request"
                );
                if pending.slot.send(result).is_err() {
                    tracing::debug!(%token, "Caller dropped before response arrived");
                }
                true
            }
            None => {
                tracing::warn!(%token, "Response for unknown or expired token (protocol anomaly)");
                false
            }
        }
    }

    /// Drop the waiter for `token` without completing it.
    pub fn expire(&self, token: &Token) -> bool {
        self.entries.remove(token).is_some()
    }

    /// Fail every outstanding request. Returns how many were failed.
    pub fn resolve_all(&self, error: &IpcError) -> usize {
        let tokens: Vec<Token> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for token in tokens {
            if let Some((_, pending)) = self.entries.remove(&token) {
                tracing::debug!(%token, endpoint = %pending.endpoint, "Failing pending request");
                let _ = pending.slot.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
