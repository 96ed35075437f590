//! Discovery result.

use std::collections::BTreeSet;
use std::fmt;

use crate::bridge::protocol::ProbeReply;

/// Snapshot of a discovered server. Not refreshed automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub address: String,
    pub port: u16,
    pub endpoints: BTreeSet<String>,
}

impl Node {
    pub fn from_probe(address: impl Into<String>, reply: ProbeReply) -> Self {
        Self {
            address: address.into(),
            port: reply.port,
            endpoints: reply.endpoints.into_iter().collect(),
        }
    }

    /// Whether the server advertised `endpoint` at discovery time.
    pub fn serves(&self, endpoint: &str) -> bool {
        self.endpoints.contains(endpoint)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({} endpoints)", self.address, self.port, self.endpoints.len())
    }
}
