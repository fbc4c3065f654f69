//! Round-robin target selection and request forwarding.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::response::Response;
use tracing::Instrument;

use super::correlation::CORRELATION_HEADER;
use super::relay;
use super::target::{BackendTarget, TargetList};
use crate::error::ForwardError;

/// Owns the target list and the rotation cursor. Cheap to clone (Arc).
#[derive(Clone)]
pub struct Dispatcher {
    targets: TargetList,
    /// Index of the next target to hand out, always in `[0, targets.len())`.
    cursor: Arc<AtomicUsize>,
    client: reqwest::Client,
}

impl Dispatcher {
    /// `client` is shared by every forwarded request so backend connections
    /// are reused.
    pub fn new(targets: TargetList, client: reqwest::Client) -> Self {
        Self {
            targets,
            cursor: Arc::new(AtomicUsize::new(0)),
            client,
        }
    }

    pub fn targets(&self) -> &TargetList {
        &self.targets
    }

    /// Return the target under the cursor and advance the cursor by one,
    /// wrapping at the end of the list. Read and advance are one atomic
    /// step, so concurrent callers never share a slot or see an index out
    /// of range.
    pub fn select_target(&self) -> &BackendTarget {
        let len = self.targets.len();
        let index = match self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some((current + 1) % len)
            }) {
            Ok(previous) | Err(previous) => previous,
        };
        &self.targets.as_slice()[index]
    }

    /// Forward `request` to `target` and return the backend's response with
    /// its body still streaming.
    ///
    /// Scheme and authority are replaced by the target's; path, query,
    /// method, body and end-to-end headers are kept. Transport failures are
    /// returned to the caller and never retried on another target.
    pub async fn forward(
        &self,
        request: Request,
        target: &BackendTarget,
        request_id: &str,
    ) -> Result<Response, ForwardError> {
        let span = gatehouse_tracing::backend_forward_span!(request_id, target);
        let start = Instant::now();

        async {
            let (parts, body) = request.into_parts();
            let path_and_query = parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            let url = target.url_for(path_and_query);

            let mut req_builder = self
                .client
                .request(parts.method.clone(), &url)
                .headers(relay::outbound_headers(&parts.headers))
                .header(CORRELATION_HEADER, request_id);

            if relay::carries_body(&parts.headers) {
                req_builder = req_builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
            }

            let upstream = req_builder.send().await.map_err(|source| {
                let latency = start.elapsed().as_millis() as u64;
                tracing::Span::current().record("latency_ms", latency);
                ForwardError::Transport {
                    target: target.clone(),
                    source,
                }
            })?;

            let status = upstream.status();
            let latency = start.elapsed().as_millis() as u64;
            tracing::Span::current().record("status", status.as_u16());
            tracing::Span::current().record("latency_ms", latency);

            tracing::info!(
                status = status.as_u16(),
                latency_ms = latency,
                "Backend responded"
            );

            Ok(relay::relay_response(upstream, tracing::Span::current(), start))
        }
        .instrument(span)
        .await
    }
}
