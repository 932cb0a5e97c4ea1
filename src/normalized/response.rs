use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::http::Response;

/// Body of the response synthesized when handler logic fails.
pub const HANDLER_FAILURE_BODY: &str = r#"{"error":"Handler threw"}"#;

/// Body of the response synthesized when handler logic exceeds its deadline.
pub const HANDLER_TIMEOUT_BODY: &str = r#"{"error":"Handler timed out"}"#;

/// Body of the response returned when no route matches.
pub const NOT_FOUND_BODY: &str = r#"{"error":"Not found"}"#;

/// The response value produced by handler logic.
///
/// `body` is already serialized text. Use [`NormalizedResponse::json`] to
/// pre-serialize structured payloads before they cross the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizedResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl Default for NormalizedResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }
}

impl NormalizedResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// A text response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            ..Self::default()
        }
    }

    /// A response whose body is `value` serialized as JSON, with a
    /// `content-type: application/json` header.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if `value` cannot be represented as JSON.
    ///
    /// ```
    /// use cavebridge::normalized::NormalizedResponse;
    ///
    /// let res = NormalizedResponse::json(200, &serde_json::json!({ "ok": true })).unwrap();
    /// assert_eq!(res.body, r#"{"ok":true}"#);
    /// assert_eq!(res.headers["content-type"], "application/json");
    /// ```
    pub fn json<T: Serialize + ?Sized>(status: u16, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_string(value)?;
        Ok(Self::text(status, body).with_header("content-type", "application/json"))
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The fixed fallback for a failed handler: 500, no headers.
    pub fn handler_failure() -> Self {
        Self::text(500, HANDLER_FAILURE_BODY)
    }

    /// The fixed fallback for a handler that missed its deadline: 504, no headers.
    pub fn handler_timeout() -> Self {
        Self::text(504, HANDLER_TIMEOUT_BODY)
    }

    pub fn not_found() -> Self {
        Self::text(404, NOT_FOUND_BODY)
    }

    /// Renders this response for the wire.
    pub fn into_wire(self) -> Response {
        let mut response = Response::from_code(self.status);
        for (name, value) in self.headers {
            response = response.header(name, value);
        }
        response.body(self.body)
    }
}
