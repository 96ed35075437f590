//! Wire protocol types shared by client and server.
//!
//! Every message is an [`Envelope`]: a flat JSON object carrying the target
//! endpoint, a payload mapping, string headers, a correlation token and the
//! message kind. Payload shapes per kind:
//! - **request**: `data` holds the call arguments
//! - **response**: `data.result` holds the handler's return value
//! - **error**: `data` is an [`ErrorBody`]
//! - **control**: `data.action` is a [`ControlAction`] (discovery, keep-alive)

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::bytes::Bytes;

/// Header carrying the shared secret.
pub const AUTHORIZATION: &str = "Authorization";

/// Correlation token linking a request to its response.
///
/// 16 random bytes from a UUID v4, hex-encoded without dashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared bearer secret. Compared by value; never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// True when the presented header value equals this secret.
    pub fn matches(&self, presented: Option<&str>) -> bool {
        presented == Some(self.0.as_str())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// Peers that predate `kind` only send requests, so it is the default.
    #[default]
    Request,
    Response,
    Error,
    Control,
}

/// Control actions carried in `data.action` of control envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    /// Discovery probe: "which port is the real server on?"
    Connect,
    Ping,
    Pong,
}

/// Error categories carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedRequest,
    Unauthorized,
    UnknownEndpoint,
    HandlerError,
    EncodeError,
}

impl ErrorKind {
    /// HTTP-like class code: 400 client-caused, 403 auth, 500 server-side.
    pub fn code(self) -> u16 {
        match self {
            Self::MalformedRequest | Self::UnknownEndpoint => 400,
            Self::Unauthorized => 403,
            Self::HandlerError | Self::EncodeError => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedRequest => "malformed_request",
            Self::Unauthorized => "unauthorized",
            Self::UnknownEndpoint => "unknown_endpoint",
            Self::HandlerError => "handler_error",
            Self::EncodeError => "encode_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub kind: ErrorKind,
    pub error: String,
    /// Category name of the failure that raised inside a handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            kind,
            error: error.into(),
            error_type: None,
        }
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorKind::Unauthorized, "Invalid or no token provided.")
    }

    pub fn unknown_endpoint(endpoint: &str) -> Self {
        Self::new(
            ErrorKind::UnknownEndpoint,
            format!("Invalid or no endpoint given: \"{endpoint}\""),
        )
    }
}

/// Reply to a discovery probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReply {
    pub action: ControlAction,
    pub code: u16,
    pub message: String,
    pub port: u16,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl ProbeReply {
    pub fn new(port: u16, endpoints: Vec<String>) -> Self {
        Self {
            action: ControlAction::Connect,
            code: 200,
            message: "Connection success".to_string(),
            port,
            endpoints,
        }
    }
}

/// One wire-level message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub kind: Kind,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
}

impl Envelope {
    pub fn request(
        endpoint: impl Into<String>,
        data: Map<String, Value>,
        token: Token,
        secret: &Secret,
    ) -> Self {
        Self {
            kind: Kind::Request,
            endpoint: Some(endpoint.into()),
            data,
            headers: auth_headers(secret),
            token: Some(token),
        }
    }

    pub fn response(token: Option<Token>, result: Value) -> Self {
        let mut data = Map::new();
        data.insert("result".to_string(), result);
        Self {
            kind: Kind::Response,
            endpoint: None,
            data,
            headers: BTreeMap::new(),
            token,
        }
    }

    pub fn error(token: Option<Token>, body: ErrorBody) -> Self {
        Self {
            kind: Kind::Error,
            endpoint: None,
            data: object_of(&body),
            headers: BTreeMap::new(),
            token,
        }
    }

    /// Control envelope; the secret is attached when given.
    pub fn control(action: ControlAction, secret: Option<&Secret>) -> Self {
        let mut data = Map::new();
        data.insert("action".to_string(), object_value(&action));
        Self {
            kind: Kind::Control,
            endpoint: None,
            data,
            headers: secret.map(auth_headers).unwrap_or_default(),
            token: None,
        }
    }

    pub fn probe_reply(reply: &ProbeReply) -> Self {
        Self {
            kind: Kind::Control,
            endpoint: None,
            data: object_of(reply),
            headers: BTreeMap::new(),
            token: None,
        }
    }

    pub fn authorization(&self) -> Option<&str> {
        self.headers.get(AUTHORIZATION).map(String::as_str)
    }

    /// Action of a control envelope; `None` for other kinds or unknown actions.
    pub fn control_action(&self) -> Option<ControlAction> {
        if self.kind != Kind::Control {
            return None;
        }
        self.data
            .get("action")
            .and_then(|a| ControlAction::deserialize(a).ok())
    }

    /// Error payload of an error envelope.
    pub fn error_body(&self) -> Option<ErrorBody> {
        if self.kind != Kind::Error {
            return None;
        }
        serde_json::from_value(Value::Object(self.data.clone())).ok()
    }

    /// Discovery reply carried by a control envelope.
    pub fn probe(&self) -> Option<ProbeReply> {
        if self.kind != Kind::Control {
            return None;
        }
        serde_json::from_value(Value::Object(self.data.clone())).ok()
    }

    /// Consume a response envelope, yielding its result (null when absent).
    pub fn into_result(mut self) -> Value {
        self.data.remove("result").unwrap_or(Value::Null)
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| EncodeError(e.to_string()))
    }

    /// Decode one envelope, validating request shape.
    ///
    /// Request envelopes (explicit or defaulted `kind`) must carry a non-null
    /// `endpoint` and an object `data`. When the token can be read despite a
    /// malformed body, it is returned in the error so the peer can still be
    /// answered.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| DecodeError::malformed(format!("invalid JSON: {e}"), None))?;

        let Value::Object(object) = value else {
            return Err(DecodeError::malformed(
                "top-level value must be an object",
                None,
            ));
        };

        let token = object.get("token").and_then(Value::as_str).map(Token::from);

        let is_request = object
            .get("kind")
            .is_none_or(|k| k.as_str() == Some("request"));
        if is_request {
            if object.get("endpoint").is_none_or(Value::is_null) {
                return Err(DecodeError::malformed("missing endpoint", token));
            }
            if !matches!(object.get("data"), Some(Value::Object(_))) {
                return Err(DecodeError::malformed("missing or non-object data", token));
            }
        }

        serde_json::from_value(Value::Object(object))
            .map_err(|e| DecodeError::malformed(e.to_string(), token))
    }
}

fn auth_headers(secret: &Secret) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(AUTHORIZATION.to_string(), secret.expose().to_string());
    headers
}

fn object_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// Only used with protocol structs, which always serialize to objects.
fn object_of<T: Serialize>(value: &T) -> Map<String, Value> {
    match object_value(value) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// An inbound frame could not be turned into an envelope.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed request: {reason}")]
    MalformedRequest {
        reason: String,
        /// Token recovered from the frame, if any.
        token: Option<Token>,
    },
}

impl DecodeError {
    fn malformed(reason: impl Into<String>, token: Option<Token>) -> Self {
        Self::MalformedRequest {
            reason: reason.into(),
            token,
        }
    }

    pub fn token(&self) -> Option<&Token> {
        match self {
            Self::MalformedRequest { token, .. } => token.as_ref(),
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody::new(ErrorKind::MalformedRequest, self.to_string())
    }
}

/// A value could not be represented on the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("value is not representable on the wire: {0}")]
pub struct EncodeError(pub String);

impl From<serde_json::Error> for EncodeError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}
