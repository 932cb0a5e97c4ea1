//! Result unwrapping: turn whatever handler logic returned into exactly one
//! [`NormalizedResponse`].
//!
//! Handler logic answers a dispatch with an [`Outcome`]:
//!
//! - [`Outcome::Immediate`]: a realized value, converted right away.
//! - [`Outcome::Deferred`]: a value that settles later. A success value is
//!   converted exactly like an immediate one; a rejection, whatever its
//!   payload, becomes the fixed `500 {"error":"Handler threw"}` fallback.
//!
//! Realized values are `serde_json::Value`s and go through [`convert`]:
//!
//! | Field     | Taken when                          | Otherwise        |
//! |-----------|-------------------------------------|------------------|
//! | `status`  | integer                             | `200`            |
//! | `headers` | object (values rendered as text)    | empty            |
//! | `body`    | string                              | empty, warned    |
//!
//! A realized value that is not an object at all, or whose integer status
//! does not fit `0..=65535`, is a [`ConversionError`], kept distinct from
//! handler failures so callers can tell a programming error in handler logic
//! from a runtime rejection.

mod deferred;

pub use deferred::{Deferred, Settle, Settlement};

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::normalized::NormalizedResponse;

/// What a dispatcher hands back for one request.
#[derive(Debug)]
pub enum Outcome {
    Immediate(Value),
    Deferred(Deferred),
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Self::Immediate(value)
    }
}

impl From<Deferred> for Outcome {
    fn from(deferred: Deferred) -> Self {
        Self::Deferred(deferred)
    }
}

/// A realized handler value could not be read as a response.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("handler returned {found} where a response object was expected")]
    NotAnObject { found: &'static str },

    #[error("handler returned status {status}, which is outside 0..=65535")]
    StatusOutOfRange { status: String },
}

/// Resolves an outcome to a response.
///
/// # Errors
///
/// [`ConversionError`] when the realized value (immediate or the success
/// value of a deferred one) is not an object.
pub async fn resolve(outcome: Outcome) -> Result<NormalizedResponse, ConversionError> {
    match outcome {
        Outcome::Immediate(value) => convert(value),
        Outcome::Deferred(deferred) => match deferred.await {
            Ok(value) => convert(value),
            Err(reason) => {
                debug!(reason_kind = kind_of(&reason), "deferred handler result rejected");
                Ok(NormalizedResponse::handler_failure())
            }
        },
    }
}

/// Reads a realized value as a response.
///
/// # Errors
///
/// [`ConversionError::NotAnObject`] if `value` is not a JSON object,
/// [`ConversionError::StatusOutOfRange`] if `status` is an integer that is
/// not a valid `u16`.
///
/// # Examples
///
/// ```
/// use cavebridge::resolve::convert;
/// use serde_json::json;
///
/// let res = convert(json!({ "status": 404, "body": { "error": "nope" } })).unwrap();
/// assert_eq!(res.status, 404);
/// assert_eq!(res.body, "");
///
/// assert!(convert(json!("ok")).is_err());
/// ```
pub fn convert(value: Value) -> Result<NormalizedResponse, ConversionError> {
    let mut fields = match value {
        Value::Object(fields) => fields,
        other => {
            return Err(ConversionError::NotAnObject {
                found: kind_of(&other),
            });
        }
    };

    let status = match fields.get("status") {
        Some(Value::Number(n)) if !n.is_f64() => {
            match n.as_u64().and_then(|s| u16::try_from(s).ok()) {
                Some(status) => status,
                None => {
                    return Err(ConversionError::StatusOutOfRange {
                        status: n.to_string(),
                    });
                }
            }
        }
        _ => 200,
    };

    let headers = match fields.remove("headers") {
        Some(Value::Object(map)) => text_map(map),
        _ => BTreeMap::new(),
    };

    let body = match fields.remove("body") {
        Some(Value::String(text)) => text,
        None | Some(Value::Null) => String::new(),
        Some(other) => {
            warn!(
                body_kind = kind_of(&other),
                "dropping non-string response body; serialize it before returning"
            );
            String::new()
        }
    };

    Ok(NormalizedResponse {
        status,
        headers,
        body,
    })
}

fn text_map(map: Map<String, Value>) -> BTreeMap<String, String> {
    map.into_iter()
        .map(|(name, value)| {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (name, text)
        })
        .collect()
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
