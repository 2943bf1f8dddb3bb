//! In-memory request bins.
//!
//! Requests sent to a bin are captured and can be listed afterwards, which
//! makes out-of-band fetches visible:
//! - Newest request first, bounded per bin
//! - A bin expires a fixed time after its last captured request
//! - Expired bins are dropped by a periodic cleanup

use crate::protocol::HttpRequest;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, trace};

/// Requests returned by a bin listing
pub const LISTED_REQUESTS: usize = 11;

/// Requests kept per bin; older ones are dropped on insert
const MAX_REQUESTS_PER_BIN: usize = 100;

/// Multi-valued name/value pairs (headers, form fields)
pub type Values = BTreeMap<String, Vec<String>>;

/// A request as recorded in a bin
#[derive(Debug, Clone, Serialize)]
pub struct CapturedRequest {
    /// Request path
    pub url: String,
    /// Path and query as an absolute `http://` URL on the request's host
    pub full_url: String,
    pub method: String,
    /// RFC 3339 capture time
    pub time: String,
    pub headers: Values,
    /// Body as text; invalid UTF-8 is replaced
    pub body: String,
    pub host: String,
    pub remote_addr: String,
    /// Fields of a form-encoded body
    pub post_form: Values,
    /// Query fields followed by body form fields
    pub form: Values,
    /// Body parsed as JSON, when it is JSON
    pub json: Option<serde_json::Value>,
    pub bin_id: String,
}

impl CapturedRequest {
    pub fn new(request: &HttpRequest, bin_id: &str, peer: SocketAddr) -> Self {
        let head = &request.head;
        let host = head.header("host").unwrap_or("").to_string();

        let mut headers = Values::new();
        for (name, value) in &head.headers {
            headers
                .entry(name.clone())
                .or_default()
                .push(value.trim().to_string());
        }

        let is_form = head
            .header("content-type")
            .map(|value| {
                value
                    .trim()
                    .to_ascii_lowercase()
                    .starts_with("application/x-www-form-urlencoded")
            })
            .unwrap_or(false);
        let post_form = if is_form {
            form_values(&request.body)
        } else {
            Values::new()
        };

        let mut form = form_values(head.query.as_bytes());
        for (name, values) in &post_form {
            form.entry(name.clone())
                .or_default()
                .extend(values.iter().cloned());
        }

        let full_url = if head.query.is_empty() {
            format!("http://{}{}", host, head.path)
        } else {
            format!("http://{}{}?{}", host, head.path, head.query)
        };

        CapturedRequest {
            url: head.path.clone(),
            full_url,
            method: head.method.clone(),
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            headers,
            body: String::from_utf8_lossy(&request.body).into_owned(),
            host,
            remote_addr: peer.to_string(),
            post_form,
            form,
            json: serde_json::from_slice(&request.body).ok(),
            bin_id: bin_id.to_string(),
        }
    }
}

fn form_values(input: &[u8]) -> Values {
    let mut values = Values::new();
    for (name, value) in url::form_urlencoded::parse(input) {
        values
            .entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    values
}

#[derive(Debug)]
struct Bin {
    /// Newest first
    requests: VecDeque<CapturedRequest>,
    expires_at: Instant,
}

impl Bin {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Thread-safe store of request bins
#[derive(Debug)]
pub struct BinStore {
    bins: RwLock<HashMap<String, Bin>>,
    ttl: Duration,
}

impl BinStore {
    pub fn new(ttl: Duration) -> Arc<Self> {
        info!(ttl_secs = ttl.as_secs(), "Initializing request bins");
        Arc::new(BinStore {
            bins: RwLock::new(HashMap::new()),
            ttl,
        })
    }

    /// Capture a request at the front of its bin and push the bin's expiry out
    pub fn record(&self, request: CapturedRequest) {
        let mut bins = self.bins.write().unwrap_or_else(PoisonError::into_inner);
        let expires_at = Instant::now() + self.ttl;
        let bin = bins
            .entry(request.bin_id.clone())
            .or_insert_with(|| Bin {
                requests: VecDeque::new(),
                expires_at,
            });
        // An expired bin that was not cleaned up yet starts over
        if bin.is_expired() {
            bin.requests.clear();
        }

        trace!(bin = %request.bin_id, method = %request.method, "Request captured");
        bin.requests.push_front(request);
        bin.requests.truncate(MAX_REQUESTS_PER_BIN);
        bin.expires_at = expires_at;
    }

    /// Ids of live bins, sorted
    pub fn bins(&self) -> Vec<String> {
        let bins = self.bins.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = bins
            .iter()
            .filter(|(_, bin)| !bin.is_expired())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Most recent requests of a bin, newest first. Unknown and expired
    /// bins are empty.
    pub fn requests(&self, bin_id: &str) -> Vec<CapturedRequest> {
        let bins = self.bins.read().unwrap_or_else(PoisonError::into_inner);
        match bins.get(bin_id) {
            Some(bin) if !bin.is_expired() => {
                bin.requests.iter().take(LISTED_REQUESTS).cloned().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Drop expired bins, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let mut bins = self.bins.write().unwrap_or_else(PoisonError::into_inner);
        let before = bins.len();
        bins.retain(|_, bin| !bin.is_expired());
        let count = before - bins.len();

        if count > 0 {
            info!(count, "Cleaned up expired bins");
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ParseResult, Parser};
    use bytes::Bytes;

    fn request(raw_head: &str, body: &str) -> HttpRequest {
        match Parser::parse_head(raw_head.as_bytes()) {
            ParseResult::Complete(head, _) => HttpRequest::new(head, Bytes::from(body.to_string())),
            other => panic!("unexpected: {:?}", other),
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.7:40000".parse().unwrap()
    }

    fn captured(bin: &str, n: usize) -> CapturedRequest {
        let raw = format!("GET /_/{}/{} HTTP/1.1\r\nHost: bins\r\n\r\n", bin, n);
        CapturedRequest::new(&request(&raw, ""), bin, peer())
    }

    #[test]
    fn test_captured_request_fields() {
        let request = request(
            "POST /_/abc/hook?a=1&a=2 HTTP/1.1\r\nHost: example.test:8080\r\nContent-Type: application/x-www-form-urlencoded\r\nX-Seen: one\r\nX-Seen: two\r\n\r\n",
            "a=3&b=x+y",
        );
        let captured = CapturedRequest::new(&request, "abc", peer());

        assert_eq!(captured.url, "/_/abc/hook");
        assert_eq!(captured.full_url, "http://example.test:8080/_/abc/hook?a=1&a=2");
        assert_eq!(captured.method, "POST");
        assert_eq!(captured.host, "example.test:8080");
        assert_eq!(captured.remote_addr, "10.0.0.7:40000");
        assert_eq!(captured.bin_id, "abc");
        assert_eq!(captured.headers["X-Seen"], vec!["one", "two"]);
        assert_eq!(captured.post_form["b"], vec!["x y"]);
        assert_eq!(captured.form["a"], vec!["1", "2", "3"]);
        assert!(captured.json.is_none());
        assert!(captured.time.ends_with('Z'));
    }

    #[test]
    fn test_json_body_is_parsed() {
        let request = request(
            "POST /_/abc HTTP/1.1\r\nHost: h\r\n\r\n",
            r#"{"user": "admin", "ids": [1, 2]}"#,
        );
        let captured = CapturedRequest::new(&request, "abc", peer());
        let json = captured.json.unwrap();
        assert_eq!(json["user"], "admin");
        assert_eq!(json["ids"][1], 2);
        assert!(captured.post_form.is_empty());
    }

    #[test]
    fn test_requests_listed_newest_first() {
        let store = BinStore::new(Duration::from_secs(60));
        for n in 0..20 {
            store.record(captured("abc", n));
        }
        store.record(captured("other", 0));

        let listed = store.requests("abc");
        assert_eq!(listed.len(), LISTED_REQUESTS);
        assert_eq!(listed[0].url, "/_/abc/19");
        assert_eq!(listed[10].url, "/_/abc/9");

        assert_eq!(store.bins(), vec!["abc", "other"]);
        assert!(store.requests("missing").is_empty());
    }

    #[test]
    fn test_expired_bins_are_hidden_and_cleaned() {
        let store = BinStore::new(Duration::ZERO);
        store.record(captured("gone", 0));

        assert!(store.bins().is_empty());
        assert!(store.requests("gone").is_empty());
        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.cleanup_expired(), 0);
    }
}
