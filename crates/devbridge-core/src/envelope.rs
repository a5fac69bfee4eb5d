//! The JSON frame exchanged over the socket.
//!
//! An [`Envelope`] keeps the complete decoded object, `type` included, so that
//! the bridge can forward it to the browser byte-for-byte equivalent to what
//! the agent sent. Typed views over the body are obtained with
//! [`Envelope::decode`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::BridgeError;

/// Which side of the bridge a connection belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The page running the toolbar. At most one is authoritative.
    Browser,
    /// A CLI or AI agent issuing commands.
    Agent,
}

impl Role {
    /// Wire name of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Agent => "agent",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field names shared by every response.
pub mod fields {
    /// Discriminant.
    pub const TYPE: &str = "type";
    /// Correlation key.
    pub const REQUEST_ID: &str = "requestId";
    /// Outcome flag.
    pub const SUCCESS: &str = "success";
    /// Success payload.
    pub const DATA: &str = "data";
    /// Failure message.
    pub const ERROR: &str = "error";
    /// Milliseconds since the Unix epoch.
    pub const TIMESTAMP: &str = "timestamp";
}

/// One protocol message.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    kind: String,
    body: Map<String, Value>,
}

impl Envelope {
    /// Empty envelope of the given type.
    pub fn new(kind: impl Into<String>) -> Self {
        let kind = kind.into();
        let mut body = Map::new();
        let _ = body.insert(fields::TYPE.into(), Value::String(kind.clone()));
        Self { kind, body }
    }

    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| BridgeError::malformed(format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Wrap an already-decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, BridgeError> {
        let Value::Object(body) = value else {
            return Err(BridgeError::malformed("frame is not a JSON object"));
        };
        let kind = match body.get(fields::TYPE) {
            Some(Value::String(kind)) if !kind.is_empty() => kind.clone(),
            Some(_) => return Err(BridgeError::malformed("`type` must be a non-empty string")),
            None => return Err(BridgeError::malformed("missing field `type`")),
        };
        Ok(Self { kind, body })
    }

    /// Successful response of type `kind`.
    pub fn success(kind: impl Into<String>, request_id: Option<&str>, data: Value) -> Self {
        let mut env = Self::new(kind)
            .with(fields::SUCCESS, Value::Bool(true))
            .with(fields::DATA, data)
            .stamped();
        if let Some(id) = request_id {
            env.set_request_id(id);
        }
        env
    }

    /// Failed response of type `kind`.
    pub fn failure(
        kind: impl Into<String>,
        request_id: Option<&str>,
        error: impl Into<String>,
    ) -> Self {
        let mut env = Self::new(kind)
            .with(fields::SUCCESS, Value::Bool(false))
            .with(fields::ERROR, Value::String(error.into()))
            .stamped();
        if let Some(id) = request_id {
            env.set_request_id(id);
        }
        env
    }

    /// Response built from a `Result`.
    pub fn response(
        kind: impl Into<String>,
        request_id: Option<&str>,
        result: Result<Value, String>,
    ) -> Self {
        match result {
            Ok(data) => Self::success(kind, request_id, data),
            Err(error) => Self::failure(kind, request_id, error),
        }
    }

    /// The `type` discriminant.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The `requestId`, when present and a string.
    pub fn request_id(&self) -> Option<&str> {
        self.str_field(fields::REQUEST_ID)
    }

    /// Set (or overwrite) the `requestId`.
    pub fn set_request_id(&mut self, request_id: &str) {
        let _ = self
            .body
            .insert(fields::REQUEST_ID.into(), Value::String(request_id.to_owned()));
    }

    /// The `success` flag; absent counts as `false`.
    pub fn is_success(&self) -> bool {
        self.body
            .get(fields::SUCCESS)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The `error` string, if any.
    pub fn error(&self) -> Option<&str> {
        self.str_field(fields::ERROR)
    }

    /// The `data` payload, if any.
    pub fn data(&self) -> Option<&Value> {
        self.body.get(fields::DATA)
    }

    /// Raw field access.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// String field access.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Builder-style field setter. Setting `type` is ignored.
    #[must_use]
    pub fn with(mut self, key: &str, value: Value) -> Self {
        if key != fields::TYPE {
            let _ = self.body.insert(key.to_owned(), value);
        }
        self
    }

    /// Add the current time as `timestamp`.
    #[must_use]
    pub fn stamped(self) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        self.with(fields::TIMESTAMP, Value::from(now))
    }

    /// Whether the type names a reply to a forwarded request.
    pub fn is_reply(&self) -> bool {
        is_reply_type(&self.kind)
    }

    /// Deserialize the body into a typed payload.
    ///
    /// Missing required fields surface as [`BridgeError::Malformed`].
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BridgeError> {
        serde_json::from_value(Value::Object(self.body.clone()))
            .map_err(|e| BridgeError::malformed(format!("{}: {e}", self.kind)))
    }

    /// Borrow the whole object.
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> String {
        // A map of `Value`s always serializes.
        serde_json::to_string(&self.body).unwrap_or_default()
    }

    /// Consume into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

impl Serialize for Envelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.body.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Whether `kind` names a reply: `*-response`, `*-saved` or `*-error`.
pub fn is_reply_type(kind: &str) -> bool {
    kind.ends_with("-response") || kind.ends_with("-saved") || kind.ends_with("-error")
}
