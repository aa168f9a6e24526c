//! Captured request data and forwarding.
//!
//! A [`RequestRecord`] is the immutable value stored in a basket's ring. It
//! is captured once from the inbound request and can later be searched or
//! forwarded to the basket's configured upstream.

use super::types::{BasketConfig, Headers, SearchScope};
use crate::metrics;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{HeaderMap, Request};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

/// Requests carrying this header are never forwarded; the forwarder sets it
/// to `1` on every outbound request to break forwarding loops.
pub const DO_NOT_FORWARD_HEADER: &str = "X-Do-Not-Forward";

/// Hop-by-hop headers that must not survive forwarding.
const HOP_BY_HOP_HEADERS: &[&str] = &["connection", "upgrade", "te"];

// ============================================================================
// RequestRecord
// ============================================================================

/// Collected request data, immutable once appended to a basket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Capture time, milliseconds since the Unix epoch
    pub date: i64,
    pub headers: Headers,
    /// Declared length; preserved even when the client lied about it
    pub content_length: i64,
    pub body: String,
    pub method: String,
    pub path: String,
    /// Raw query string, verbatim
    pub query: String,
    /// Set when the body was cut off at the capture size limit
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl RequestRecord {
    /// Build a record from already-collected request components.
    ///
    /// `declared_length` is taken from the `Content-Length` header when
    /// present, falling back to the received byte count. Bodies larger than
    /// `max_body_bytes` are cut off and flagged as truncated.
    pub fn from_parts(
        method: &hyper::Method,
        uri: &hyper::Uri,
        headers: &HeaderMap,
        body: &[u8],
        max_body_bytes: usize,
    ) -> Self {
        let declared_length = headers
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(body.len() as i64);

        let truncated = body.len() > max_body_bytes;
        let kept = if truncated {
            &body[..max_body_bytes]
        } else {
            body
        };

        Self {
            date: chrono::Utc::now().timestamp_millis(),
            headers: headers_to_multimap(headers),
            content_length: declared_length,
            body: String::from_utf8_lossy(kept).into_owned(),
            method: method.to_string(),
            path: uri.path().to_string(),
            query: uri.query().unwrap_or("").to_string(),
            truncated,
        }
    }

    /// Capture an inbound hyper request, reading the whole body into memory.
    ///
    /// Body read errors never fail the capture: whatever frames arrived
    /// before the error are kept.
    pub async fn capture(req: Request<Incoming>, max_body_bytes: usize) -> Self {
        let (parts, mut body) = req.into_parts();

        let mut collected: Vec<u8> = Vec::new();
        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    if let Some(chunk) = frame.data_ref() {
                        collected.extend_from_slice(chunk);
                    }
                }
                Err(e) => {
                    debug!("Request body read aborted: {e}");
                    break;
                }
            }
        }

        metrics::record_capture(parts.method.as_str());
        Self::from_parts(
            &parts.method,
            &parts.uri,
            &parts.headers,
            &collected,
            max_body_bytes,
        )
    }

    /// Check whether the record matches the search criteria.
    ///
    /// The match is a case-sensitive substring check over the fields selected
    /// by `scope`.
    pub fn matches(&self, query: &str, scope: SearchScope) -> bool {
        let in_body = matches!(scope, SearchScope::Body | SearchScope::All);
        let in_query = matches!(scope, SearchScope::Query | SearchScope::All);
        let in_headers = matches!(scope, SearchScope::Headers | SearchScope::All);

        if in_body && self.body.contains(query) {
            return true;
        }
        if in_query && self.query.contains(query) {
            return true;
        }
        if in_headers {
            for values in self.headers.values() {
                if values.iter().any(|v| v.contains(query)) {
                    return true;
                }
            }
        }
        false
    }

    /// True when the inbound request carried the do-not-forward marker.
    pub fn has_do_not_forward_marker(&self) -> bool {
        self.headers
            .keys()
            .any(|name| name.eq_ignore_ascii_case(DO_NOT_FORWARD_HEADER))
    }

    /// Resolve the target URL for forwarding, applying path expansion and
    /// query merging.
    fn forward_target(&self, config: &BasketConfig, basket: &str) -> Result<Url, ForwardError> {
        let mut target = match Url::parse(&config.forward_url) {
            Ok(url) if url.has_host() => url,
            _ => return Err(ForwardError::InvalidUrl(config.forward_url.clone())),
        };

        // expand path beyond /<basket>
        if config.expand_path && self.path.len() > basket.len() + 1 {
            let prefix = format!("/{basket}");
            let tail = self.path.strip_prefix(&prefix).unwrap_or(&self.path);
            let expanded = format!("{}{}", target.path().trim_end_matches('/'), tail);
            target.set_path(&expanded);
        }

        // merge query strings
        if !self.query.is_empty() {
            let merged = match target.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{}", self.query),
                _ => self.query.clone(),
            };
            target.set_query(Some(&merged));
        }

        Ok(target)
    }

    /// Forward the captured request to the basket's configured upstream.
    ///
    /// Transport failures are swallowed: the caller receives a synthesized
    /// `502 Bad Gateway` response instead of an error, so ingest never fails
    /// because the upstream is down. Only an unparsable `forward_url`
    /// produces an error.
    pub async fn forward(
        &self,
        client: &ForwardClient,
        config: &BasketConfig,
        basket: &str,
    ) -> Result<ForwardedResponse, ForwardError> {
        let target = self.forward_target(config, basket)?;
        debug!("Forwarding request for basket '{basket}' to {target}");

        let http = client.client_for(config.insecure_tls);
        let mut request = match self.method.to_uppercase().as_str() {
            "GET" => http.get(target.clone()),
            "POST" => http.post(target.clone()),
            "PUT" => http.put(target.clone()),
            "DELETE" => http.delete(target.clone()),
            "PATCH" => http.patch(target.clone()),
            "HEAD" => http.head(target.clone()),
            _ => http.get(target.clone()),
        };

        // copy captured headers, skipping what reqwest derives itself
        for (name, values) in &self.headers {
            let lower = name.to_lowercase();
            if lower == "host" || lower == "content-length" {
                continue;
            }
            if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            for value in values {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        request = request.header(DO_NOT_FORWARD_HEADER, "1");
        request = request.body(self.body.clone());

        let start = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to forward request for basket '{basket}': {e}");
                metrics::record_forward("error");
                return Ok(ForwardedResponse::bad_gateway(basket, &e.to_string()));
            }
        };

        let status = response.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.to_string())
                .or_default()
                .push(value.to_str().unwrap_or("").to_string());
        }
        let body = match response.bytes().await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!("Failed to read upstream response for basket '{basket}': {e}");
                metrics::record_forward("error");
                return Ok(ForwardedResponse::bad_gateway(basket, &e.to_string()));
            }
        };

        metrics::record_forward("ok");
        metrics::observe_upstream_duration(
            &self.method,
            status,
            start.elapsed().as_millis() as f64,
        );

        Ok(ForwardedResponse {
            status,
            headers,
            body,
        })
    }
}

/// Convert a hyper header map into the stored multimap form.
pub fn headers_to_multimap(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        out.entry(name.to_string())
            .or_default()
            .push(value.to_str().unwrap_or("").to_string());
    }
    out
}

// ============================================================================
// Forwarding client and response
// ============================================================================

/// Forwarding error: only raised for configuration problems, never for
/// transport failures.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("invalid forward URL: {0}")]
    InvalidUrl(String),
}

/// Upstream response carried back to the ingest pipeline.
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: String,
}

impl ForwardedResponse {
    /// Synthesized reply used when the upstream cannot be reached.
    fn bad_gateway(basket: &str, error: &str) -> Self {
        let mut headers = Headers::new();
        headers.insert(
            "Content-Type".to_string(),
            vec!["text/plain".to_string()],
        );
        Self {
            status: 502,
            headers,
            body: format!("Failed to forward request for basket '{basket}': {error}"),
        }
    }
}

/// Shared forwarding client pair.
///
/// A single client cannot honor per-basket `insecure_tls`, so two are kept:
/// one validating certificates, one not. Selection happens per request.
pub struct ForwardClient {
    strict: reqwest::Client,
    insecure: reqwest::Client,
}

impl ForwardClient {
    /// Build the client pair with the given request timeout.
    pub fn new(timeout: Duration) -> Self {
        let strict = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        let insecure = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default();
        Self { strict, insecure }
    }

    fn client_for(&self, insecure_tls: bool) -> &reqwest::Client {
        if insecure_tls {
            &self.insecure
        } else {
            &self.strict
        }
    }
}

impl Default for ForwardClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderName, HeaderValue};
    use hyper::{Method, Uri};

    fn record(method: &str, path_and_query: &str, headers: &[(&str, &str)], body: &str) -> RequestRecord {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            map.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        let uri: Uri = path_and_query.parse().unwrap();
        RequestRecord::from_parts(
            &Method::from_bytes(method.as_bytes()).unwrap(),
            &uri,
            &map,
            body.as_bytes(),
            1024 * 1024,
        )
    }

    #[test]
    fn test_from_parts_captures_fields() {
        let r = record(
            "POST",
            "/b1/extra?k=1&k=2",
            &[("content-type", "text/plain"), ("x-tag", "a"), ("x-tag", "b")],
            "hello",
        );
        assert_eq!(r.method, "POST");
        assert_eq!(r.path, "/b1/extra");
        assert_eq!(r.query, "k=1&k=2");
        assert_eq!(r.body, "hello");
        assert_eq!(r.content_length, 5);
        assert_eq!(r.headers.get("x-tag").unwrap(), &vec!["a", "b"]);
        assert!(r.date > 0);
        assert!(!r.truncated);
    }

    #[test]
    fn test_declared_length_preserved_when_client_lies() {
        let r = record("POST", "/b1", &[("content-length", "999")], "hi");
        assert_eq!(r.content_length, 999);
        assert_eq!(r.body.len(), 2);
    }

    #[test]
    fn test_body_truncation() {
        let mut map = HeaderMap::new();
        map.insert(
            hyper::header::CONTENT_LENGTH,
            HeaderValue::from_static("10"),
        );
        let uri: Uri = "/b1".parse().unwrap();
        let r = RequestRecord::from_parts(&Method::POST, &uri, &map, b"0123456789", 4);
        assert!(r.truncated);
        assert_eq!(r.body, "0123");
        assert_eq!(r.content_length, 10);
    }

    #[test]
    fn test_matches_scopes() {
        let r1 = record("GET", "/b1", &[], "alpha");
        let r2 = record("GET", "/b1?tag=alpha", &[], "");
        let r3 = record("GET", "/b1", &[("x-custom", "alpha")], "");

        assert!(r1.matches("alpha", SearchScope::Body));
        assert!(!r2.matches("alpha", SearchScope::Body));
        assert!(!r3.matches("alpha", SearchScope::Body));

        assert!(r2.matches("alpha", SearchScope::Query));
        assert!(!r1.matches("alpha", SearchScope::Query));

        assert!(r3.matches("alpha", SearchScope::Headers));
        assert!(!r1.matches("alpha", SearchScope::Headers));

        assert!(r1.matches("alpha", SearchScope::All));
        assert!(r2.matches("alpha", SearchScope::All));
        assert!(r3.matches("alpha", SearchScope::All));
        assert!(!r1.matches("beta", SearchScope::All));
    }

    #[test]
    fn test_matches_is_case_sensitive() {
        let r = record("GET", "/b1", &[], "Alpha");
        assert!(!r.matches("alpha", SearchScope::Body));
        assert!(r.matches("Alpha", SearchScope::Body));
    }

    #[test]
    fn test_do_not_forward_marker() {
        let plain = record("GET", "/b1", &[], "");
        assert!(!plain.has_do_not_forward_marker());

        let marked = record("GET", "/b1", &[("x-do-not-forward", "1")], "");
        assert!(marked.has_do_not_forward_marker());

        // any value counts
        let marked = record("GET", "/b1", &[("X-Do-Not-Forward", "whatever")], "");
        assert!(marked.has_do_not_forward_marker());
    }

    #[test]
    fn test_forward_target_plain() {
        let r = record("GET", "/b1", &[], "");
        let config = BasketConfig {
            forward_url: "http://up.example.com/sink".to_string(),
            ..Default::default()
        };
        let url = r.forward_target(&config, "b1").unwrap();
        assert_eq!(url.as_str(), "http://up.example.com/sink");
    }

    #[test]
    fn test_forward_target_expands_path() {
        let r = record("GET", "/b1/y/z?k=1", &[], "");
        let config = BasketConfig {
            forward_url: "http://up.example.com/x/".to_string(),
            expand_path: true,
            ..Default::default()
        };
        let url = r.forward_target(&config, "b1").unwrap();
        assert_eq!(url.as_str(), "http://up.example.com/x/y/z?k=1");
    }

    #[test]
    fn test_forward_target_no_expansion_without_tail() {
        let r = record("GET", "/b1", &[], "");
        let config = BasketConfig {
            forward_url: "http://up.example.com/x/".to_string(),
            expand_path: true,
            ..Default::default()
        };
        let url = r.forward_target(&config, "b1").unwrap();
        assert_eq!(url.path(), "/x/");
    }

    #[test]
    fn test_forward_target_merges_queries() {
        let r = record("GET", "/b1?b=2", &[], "");
        let config = BasketConfig {
            forward_url: "http://up.example.com/sink?a=1".to_string(),
            ..Default::default()
        };
        let url = r.forward_target(&config, "b1").unwrap();
        assert_eq!(url.query(), Some("a=1&b=2"));
    }

    #[test]
    fn test_forward_target_rejects_invalid_url() {
        let r = record("GET", "/b1", &[], "");
        let config = BasketConfig {
            forward_url: "not-a-url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            r.forward_target(&config, "b1"),
            Err(ForwardError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_unreachable_upstream_synthesizes_502() {
        let r = record("POST", "/b1", &[], "hi");
        let config = BasketConfig {
            // nothing listens on port 1
            forward_url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let client = ForwardClient::new(Duration::from_secs(2));
        let response = r.forward(&client, &config, "b1").await.unwrap();
        assert_eq!(response.status, 502);
        assert_eq!(
            response.headers.get("Content-Type").unwrap(),
            &vec!["text/plain"]
        );
        assert!(response.body.contains("b1"));
    }

    #[tokio::test]
    async fn test_forward_sets_marker_and_strips_hop_headers() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Minimal upstream: accept one connection, capture the request text,
        // answer with a fixed response.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = vec![0u8; 4096];
            // headers and body may arrive in separate segments
            while !seen.ends_with(b"ping") {
                let n = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
                    .await
                    .expect("request not fully received")
                    .unwrap();
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\nx-up: 1\r\n\r\npong")
                .await
                .unwrap();
            String::from_utf8_lossy(&seen).into_owned()
        });

        let r = record(
            "POST",
            "/b1/y?k=1",
            &[("connection", "keep-alive"), ("x-keep", "yes"), ("te", "trailers")],
            "ping",
        );
        let config = BasketConfig {
            forward_url: format!("http://{addr}/x"),
            expand_path: true,
            ..Default::default()
        };
        let client = ForwardClient::new(Duration::from_secs(5));
        let response = r.forward(&client, &config, "b1").await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "pong");
        assert_eq!(response.headers.get("x-up").unwrap(), &vec!["1"]);

        let seen = server.await.unwrap();
        let first_line = seen.lines().next().unwrap();
        assert_eq!(first_line, "POST /x/y?k=1 HTTP/1.1");
        let lower = seen.to_lowercase();
        assert!(lower.contains("x-do-not-forward: 1"));
        assert!(lower.contains("x-keep: yes"));
        assert!(!lower.contains("\r\nte:"));
        // reqwest may inject its own connection header handling; the captured
        // hop-by-hop value must not pass through
        assert!(!lower.contains("connection: keep-alive"));
        assert!(seen.ends_with("ping"));
    }
}
