//! Header filtering and streaming of backend responses back to the caller.
//!
//! The backend body is never buffered: each chunk is handed to the inbound
//! connection as soon as it arrives. Dropping the relayed body (because the
//! stream ended or the caller went away) drops the backend response and
//! releases its connection.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_core::Stream;
use http::header::{HeaderMap, HeaderName, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};

use super::correlation::CORRELATION_HEADER;

/// Hop-by-hop headers, meaningful only for a single connection.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Response headers the inbound connection manages itself. Proxy auth
/// challenges from a backend are relayed untouched.
const RESPONSE_CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Header names listed in `Connection` are hop-by-hop as well.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Headers to send to the backend: everything from the inbound request
/// except hop-by-hop headers, `host` (derived from the target by the
/// transport) and any inbound correlation header.
pub fn outbound_headers(inbound: &HeaderMap) -> HeaderMap {
    let named = connection_tokens(inbound);
    let mut headers = HeaderMap::with_capacity(inbound.len());

    for (name, value) in inbound.iter() {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str)
            || name_str == "host"
            || name_str == CORRELATION_HEADER
            || named.iter().any(|n| n == name_str)
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    headers
}

/// Whether the inbound request announces a body. Requests without either
/// framing header are forwarded with no body at all, so a GET never turns
/// into a chunked upload.
pub fn carries_body(inbound: &HeaderMap) -> bool {
    let has_length = inbound
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() != "0");
    has_length || inbound.contains_key(TRANSFER_ENCODING)
}

/// Copy of the backend's response headers, every value of every name kept,
/// minus connection-level headers.
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let named = connection_tokens(upstream);
    let mut headers = upstream.clone();
    for name in RESPONSE_CONNECTION_HEADERS {
        headers.remove(*name);
    }
    for name in named {
        if let Ok(name) = HeaderName::try_from(name) {
            headers.remove(name);
        }
    }
    headers
}

/// Turn a backend response into the caller's response: same status, same
/// headers, body streamed through a [`RelayBody`].
pub fn relay_response(
    upstream: reqwest::Response,
    span: tracing::Span,
    start: Instant,
) -> Response {
    let status = upstream.status();
    let headers = response_headers(upstream.headers());
    let body = RelayBody::new(upstream.bytes_stream(), span, start);

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Pass-through stream over the backend body that records relay totals on
/// the forward span once the stream finishes.
///
/// If it is dropped before the backend finished (the caller disconnected),
/// the backend stream is dropped with it and the early end is logged.
pub struct RelayBody {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    span: tracing::Span,
    start: Instant,
    bytes_relayed: u64,
    finished: bool,
}

impl RelayBody {
    pub fn new<S>(inner: S, span: tracing::Span, start: Instant) -> Self
    where
        S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    {
        Self {
            inner: Box::pin(inner),
            span,
            start,
            bytes_relayed: 0,
            finished: false,
        }
    }

    fn record_totals(&self) {
        self.span.record("bytes_relayed", self.bytes_relayed);
        self.span
            .record("total_duration_ms", self.start.elapsed().as_millis() as u64);
    }
}

impl Stream for RelayBody {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.bytes_relayed += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                self.record_totals();
                self.span.in_scope(|| {
                    tracing::warn!(
                        error = %e,
                        bytes_relayed = self.bytes_relayed,
                        "Backend body failed mid-stream"
                    );
                });
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                self.record_totals();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        if !self.finished {
            self.record_totals();
            self.span.in_scope(|| {
                tracing::info!(
                    bytes_relayed = self.bytes_relayed,
                    "Caller went away before the backend body ended, closing backend stream"
                );
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_outbound_headers_drop_hop_by_hop_and_host() {
        let inbound = header_map(&[
            ("host", "proxy.example.com"),
            ("connection", "keep-alive, x-session-hint"),
            ("keep-alive", "timeout=5"),
            ("x-session-hint", "abc"),
            ("x-user-id", "alice"),
            ("accept", "text/html"),
            ("accept", "application/json"),
            (CORRELATION_HEADER, "spoofed"),
        ]);

        let outbound = outbound_headers(&inbound);

        assert!(outbound.get("host").is_none());
        assert!(outbound.get("connection").is_none());
        assert!(outbound.get("keep-alive").is_none());
        assert!(outbound.get("x-session-hint").is_none());
        assert!(outbound.get(CORRELATION_HEADER).is_none());
        assert_eq!(outbound.get("x-user-id").unwrap(), "alice");
        let accepts: Vec<_> = outbound.get_all("accept").iter().collect();
        assert_eq!(accepts, ["text/html", "application/json"]);
    }

    #[test]
    fn test_carries_body() {
        assert!(!carries_body(&header_map(&[])));
        assert!(!carries_body(&header_map(&[("content-length", "0")])));
        assert!(carries_body(&header_map(&[("content-length", "12")])));
        assert!(carries_body(&header_map(&[("transfer-encoding", "chunked")])));
    }

    #[test]
    fn test_response_headers_keep_repeated_values() {
        let upstream = header_map(&[
            ("set-cookie", "a=1"),
            ("set-cookie", "b=2"),
            ("x-test", "abc"),
            ("content-length", "7"),
            ("transfer-encoding", "chunked"),
            ("connection", "close"),
        ]);

        let relayed = response_headers(&upstream);

        let cookies: Vec<_> = relayed.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, ["a=1", "b=2"]);
        assert_eq!(relayed.get("x-test").unwrap(), "abc");
        assert_eq!(relayed.get("content-length").unwrap(), "7");
        assert!(relayed.get("transfer-encoding").is_none());
        assert!(relayed.get("connection").is_none());
    }
}
