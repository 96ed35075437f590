//! Typed view over a request's arguments.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::bridge::protocol::Token;
use crate::error::HandlerError;

/// Arguments of one endpoint call, handed to the handler as a single object.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    endpoint: String,
    token: Option<Token>,
    data: Map<String, Value>,
}

impl Request {
    pub fn new(endpoint: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
            data,
        }
    }

    pub(crate) fn with_token(mut self, token: Option<Token>) -> Self {
        self.token = token;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_data(self) -> Map<String, Value> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Typed lookup; `Ok(None)` when the key is absent or null.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, HandlerError> {
        match self.data.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| HandlerError::new("InvalidArgument", format!("{key}: {e}"))),
        }
    }

    /// Typed lookup of a required argument.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, HandlerError> {
        self.get_as(key)?
            .ok_or_else(|| HandlerError::new("MissingArgument", format!("missing argument '{key}'")))
    }

    /// Deserialize the whole argument object into `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(Value::Object(self.data.clone()))
            .map_err(|e| HandlerError::new("InvalidArgument", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn request(value: Value) -> Request {
        let Value::Object(map) = value else {
            panic!("not an object")
        };
        Request::new("test", map)
    }

    #[test]
    fn typed_accessors() {
        let req = request(json!({"guild_id": 42, "name": "x", "none": null}));

        assert_eq!(req.get("name"), Some(&json!("x")));
        assert_eq!(req.get_as::<u64>("guild_id").unwrap(), Some(42));
        assert_eq!(req.get_as::<u64>("none").unwrap(), None);
        assert_eq!(req.get_as::<u64>("absent").unwrap(), None);
        assert_eq!(req.require::<String>("name").unwrap(), "x");
        assert_eq!(req.len(), 3);
    }

    #[test]
    fn require_reports_missing_and_invalid() {
        let req = request(json!({"guild_id": "not a number"}));

        let missing = req.require::<u64>("member").unwrap_err();
        assert_eq!(missing.category(), "MissingArgument");

        let invalid = req.require::<u64>("guild_id").unwrap_err();
        assert_eq!(invalid.category(), "InvalidArgument");
        assert!(invalid.message().starts_with("guild_id:"));
    }

    #[test]
    fn parse_whole_object() {
        #[derive(Deserialize)]
        struct Args {
            a: i32,
            #[serde(default)]
            b: Option<String>,
        }

        let args: Args = request(json!({"a": 1})).parse().unwrap();
        assert_eq!(args.a, 1);
        assert!(args.b.is_none());

        assert!(request(json!({"b": "x"})).parse::<Args>().is_err());
    }
}
