//! IPC bridge wire format shared by client and server.
//!
//! # Architecture
//!
//! - **protocol**: Envelope, token, error and control payload types
//! - **codec**: length-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
