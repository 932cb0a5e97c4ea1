use std::collections::BTreeMap;

use serde::Serialize;

use crate::http::request::{Request, split_target};

/// An immutable, transport-agnostic view of one inbound request.
///
/// `path` and `query` are derived from `url` at construction and cannot be
/// set on their own.
///
/// # Examples
///
/// ```
/// use cavebridge::normalized::NormalizedRequest;
///
/// let req = NormalizedRequest::new("get", "/search?q=rust&q=go&page=2")
///     .header("X-Api-Key", "secret");
///
/// assert_eq!(req.method(), "GET");
/// assert_eq!(req.path(), "/search");
/// assert_eq!(req.query_param("q"), Some("go"));
/// assert_eq!(req.header_value("x-api-key"), Some("secret"));
/// assert_eq!(req.body(), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedRequest {
    url: String,
    path: String,
    method: String,
    query: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

impl NormalizedRequest {
    /// Builds a request for `method` and the full request target `url`.
    ///
    /// The method is uppercased. Query parameters are parsed out of `url`
    /// with last-value-wins on duplicate keys.
    pub fn new(method: impl AsRef<str>, url: impl Into<String>) -> Self {
        let url = url.into();
        let (path, query) = split_target(&url);
        let path = path.to_owned();
        let query = query.map(parse_query_string).unwrap_or_default();
        Self {
            url,
            path,
            method: method.as_ref().to_ascii_uppercase(),
            query,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Normalizes a parsed wire request.
    ///
    /// Header names are lowercased and repeated headers collapse to the last
    /// value. The body is decoded as UTF-8 (lossily); an empty body is absent.
    pub fn from_wire(request: &Request) -> Self {
        let mut normalized = Self::new(request.method().as_str(), request.target());
        normalized.headers = request.headers().to_single_valued();
        if !request.body().is_empty() {
            normalized.body = Some(String::from_utf8_lossy(request.body()).into_owned());
        }
        normalized
    }

    /// Sets a header, replacing any previous value. The name is lowercased.
    #[must_use]
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Sets the body. An empty string leaves the body absent.
    #[must_use]
    pub fn body_text(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        self.body = (!body.is_empty()).then_some(body);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Looks up a header by name, case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }
}

/// Parses `key=value&key2=value2` into a map.
///
/// `+` decodes to a space; percent-decoding is left to handler logic.
fn parse_query_string(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.replace('+', " "), value.replace('+', " "))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn wire(raw: &[u8]) -> Request {
        let (req, offset) = Request::parse(raw).unwrap();
        req.with_body(Bytes::copy_from_slice(&raw[offset..]))
    }

    #[test]
    fn path_and_query_come_from_url() {
        let req = NormalizedRequest::new("POST", "/users?id=7&name=a+b");
        assert_eq!(req.url(), "/users?id=7&name=a+b");
        assert_eq!(req.path(), "/users");
        assert_eq!(req.query_param("id"), Some("7"));
        assert_eq!(req.query_param("name"), Some("a b"));
    }

    #[test]
    fn duplicate_query_keys_keep_last() {
        let req = NormalizedRequest::new("GET", "/?a=1&a=2&a=3");
        assert_eq!(req.query().len(), 1);
        assert_eq!(req.query_param("a"), Some("3"));
    }

    #[test]
    fn bare_query_key_maps_to_empty() {
        let req = NormalizedRequest::new("GET", "/?flag&&x=");
        assert_eq!(req.query_param("flag"), Some(""));
        assert_eq!(req.query_param("x"), Some(""));
        assert_eq!(req.query().len(), 2);
    }

    #[test]
    fn method_is_uppercased() {
        assert_eq!(NormalizedRequest::new("patch", "/").method(), "PATCH");
    }

    #[test]
    fn empty_body_is_absent() {
        let req = NormalizedRequest::new("POST", "/").body_text("");
        assert_eq!(req.body(), None);
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("body").is_none());
    }

    #[test]
    fn from_wire_collapses_headers() {
        let req = wire(
            b"POST /items?x=1 HTTP/1.1\r\nX-Tag: a\r\nx-tag: b\r\nContent-Length: 2\r\n\r\nhi",
        );
        let normalized = NormalizedRequest::from_wire(&req);
        assert_eq!(normalized.method(), "POST");
        assert_eq!(normalized.url(), "/items?x=1");
        assert_eq!(normalized.path(), "/items");
        assert_eq!(normalized.header_value("X-Tag"), Some("b"));
        assert_eq!(normalized.body(), Some("hi"));
    }

    #[test]
    fn from_wire_without_body() {
        let req = wire(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let normalized = NormalizedRequest::from_wire(&req);
        assert_eq!(normalized.body(), None);
        assert_eq!(normalized.header_value("host"), Some("localhost"));
    }

    #[test]
    fn serializes_field_set() {
        let req = NormalizedRequest::new("GET", "/a?b=c").header("Host", "h");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["url"], "/a?b=c");
        assert_eq!(json["path"], "/a");
        assert_eq!(json["method"], "GET");
        assert_eq!(json["query"]["b"], "c");
        assert_eq!(json["headers"]["host"], "h");
    }
}
