//! ipclink: token-correlated request/response bridge between a host process
//! and external clients.
//!
//! The host runs a [`Server`] exposing named endpoints; other processes use a
//! [`Client`] to call them over TCP, authenticated by a shared secret. The
//! client can locate the server through a separate discovery port.

pub mod bridge;
pub mod client;
mod error;
mod events;
pub mod logging;
mod node;
mod pending;
pub mod server;

pub use bridge::protocol::{ErrorKind, Secret, Token};
pub use client::{Client, ClientConfig, ConnectionState, FixedBackoff, NoReconnect, ReconnectPolicy};
pub use error::{DispatchError, HandlerError, IpcError, RemoteError};
pub use events::{HostEvents, LoggingHost, NoopHost, ReadyInfo};
pub use node::Node;
pub use server::{Component, ComponentRoutes, Request, Server, ServerConfig, ServerError};
