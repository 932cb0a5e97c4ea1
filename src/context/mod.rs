//! Per-request context handed through the middleware chain to a handler.
//!
//! Wraps the [`NormalizedRequest`] together with a type-keyed extension map
//! that middleware uses to pass what it learned (credentials, for example)
//! down to the handler.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use crate::normalized::NormalizedRequest;

/// Type-erased request extensions, one value per type.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// One request on its way through the handler layer.
pub struct Context {
    request: NormalizedRequest,
    extensions: Extensions,
}

impl Context {
    pub fn new(request: NormalizedRequest) -> Self {
        Self {
            request,
            extensions: Extensions::new(),
        }
    }

    pub fn request(&self) -> &NormalizedRequest {
        &self.request
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Deserializes the body as JSON. A missing body reads as `{}`.
    ///
    /// # Errors
    ///
    /// The `serde_json` error when the body does not match `T`.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_str(self.request.body().unwrap_or("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq)]
    struct Principal(&'static str);

    #[test]
    fn extensions_are_keyed_by_type() {
        let mut ext = Extensions::new();
        assert!(ext.insert(Principal("alice")).is_none());
        assert_eq!(ext.insert(Principal("bob")), Some(Principal("alice")));
        assert_eq!(ext.insert(7u32), None);
        assert_eq!(ext.len(), 2);
        assert_eq!(ext.get::<Principal>(), Some(&Principal("bob")));
        assert_eq!(ext.remove::<u32>(), Some(7));
        assert!(ext.get::<u32>().is_none());
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Event {
        event: Option<String>,
    }

    #[test]
    fn json_body() {
        let ctx = Context::new(NormalizedRequest::new("POST", "/").body_text(r#"{"event":"go"}"#));
        assert_eq!(ctx.json::<Event>().unwrap().event.as_deref(), Some("go"));
    }

    #[test]
    fn missing_body_reads_as_empty_object() {
        let ctx = Context::new(NormalizedRequest::new("POST", "/"));
        assert_eq!(ctx.json::<Event>().unwrap(), Event { event: None });
    }

    #[test]
    fn malformed_body_is_error() {
        let ctx = Context::new(NormalizedRequest::new("POST", "/").body_text("{"));
        assert!(ctx.json::<Event>().is_err());
    }
}
