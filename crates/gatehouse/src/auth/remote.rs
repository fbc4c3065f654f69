//! Authorizer backed by an external authorization service.
//!
//! One `POST` per request, no body; the caller identity, original path and
//! original method travel as headers. Only a `200 OK` allows.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use reqwest::Url;
use tracing::Instrument;

use super::{AuthorizationRequest, Authorizer, DenialReason, Verdict};
use crate::config::{header_name, header_value, AuthConfig};
use crate::error::{display_chain, ConfigError};
use crate::proxy::correlation::CORRELATION_HEADER;

/// Longest response-body excerpt kept in a denial diagnostic.
const MAX_DIAGNOSTIC_BODY: usize = 1024;

/// Header names used on the authorization call.
#[derive(Debug, Clone)]
pub struct AuthHeaders {
    pub user: HeaderName,
    pub path: HeaderName,
    pub method: HeaderName,
}

pub struct HttpAuthorizer {
    client: reqwest::Client,
    endpoint: Url,
    headers: AuthHeaders,
    extra_headers: HeaderMap,
    timeout: Duration,
}

impl HttpAuthorizer {
    /// `client` should carry no total timeout of its own; `timeout` bounds
    /// each authorization exchange, body included.
    pub fn new(
        client: reqwest::Client,
        endpoint: Url,
        headers: AuthHeaders,
        extra_headers: HeaderMap,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint,
            headers,
            extra_headers,
            timeout,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        let raw_url = config.url.as_deref().ok_or(ConfigError::MissingAuthUrl)?;
        let endpoint = Url::parse(raw_url).map_err(|e| ConfigError::InvalidAuthUrl {
            url: raw_url.to_string(),
            reason: e.to_string(),
        })?;

        let headers = AuthHeaders {
            user: header_name(&config.headers.user)?,
            path: header_name(&config.headers.path)?,
            method: header_name(&config.headers.method)?,
        };

        let mut extra_headers = HeaderMap::new();
        for (name, value) in &config.extra_headers {
            extra_headers.insert(header_name(name)?, header_value(name, value)?);
        }

        // Redirects are not followed: anything but a direct 200 is a denial.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self::new(
            client,
            endpoint,
            headers,
            extra_headers,
            Duration::from_secs(config.timeout_secs),
        ))
    }

    /// Headers for the authorization call. Context headers replace a
    /// same-named static header and keep every inbound value; the mandatory
    /// three and the correlation id overwrite anything of the same name.
    fn outbound_headers(&self, request: &AuthorizationRequest) -> Result<HeaderMap, DenialReason> {
        let invalid = |what: &str| {
            DenialReason::Unreachable(format!("cannot encode {what} as a header value"))
        };

        let mut headers = self.extra_headers.clone();
        for name in request.context.keys() {
            headers.remove(name);
        }
        for (name, value) in request.context.iter() {
            headers.append(name.clone(), value.clone());
        }
        headers.insert(
            self.headers.user.clone(),
            HeaderValue::from_str(&request.identity).map_err(|_| invalid("identity"))?,
        );
        headers.insert(
            self.headers.path.clone(),
            HeaderValue::from_str(&request.path).map_err(|_| invalid("path"))?,
        );
        headers.insert(
            self.headers.method.clone(),
            HeaderValue::from_str(request.method.as_str()).map_err(|_| invalid("method"))?,
        );
        headers.insert(
            CORRELATION_HEADER,
            HeaderValue::from_str(&request.request_id).map_err(|_| invalid("request id"))?,
        );
        Ok(headers)
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize(&self, request: &AuthorizationRequest) -> Verdict {
        let span = gatehouse_tracing::auth_check_span!(&request.request_id, &self.endpoint);
        let start = Instant::now();

        async {
            let headers = match self.outbound_headers(request) {
                Ok(headers) => headers,
                Err(reason) => return Verdict::Denied(reason),
            };

            let result = self
                .client
                .post(self.endpoint.clone())
                .headers(headers)
                .timeout(self.timeout)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    let latency = start.elapsed().as_millis() as u64;
                    tracing::Span::current().record("latency_ms", latency);
                    if e.is_timeout() {
                        return Verdict::Denied(DenialReason::Timeout(self.timeout));
                    }
                    return Verdict::Denied(DenialReason::Unreachable(display_chain(&e)));
                }
            };

            let status = response.status();
            // Read the whole body on every outcome so the connection goes
            // back to the pool.
            let body = response.bytes().await;

            let latency = start.elapsed().as_millis() as u64;
            tracing::Span::current().record("status", status.as_u16());
            tracing::Span::current().record("latency_ms", latency);

            if status == StatusCode::OK {
                if let Err(e) = body {
                    tracing::debug!(error = %e, "Failed to drain auth service response body");
                }
                tracing::debug!(latency_ms = latency, "Auth service allowed request");
                return Verdict::Allowed;
            }

            let body = match body {
                Ok(bytes) => excerpt(&String::from_utf8_lossy(&bytes)),
                Err(e) => format!("<unreadable body: {}>", display_chain(&e)),
            };
            Verdict::Denied(DenialReason::Rejected { status, body })
        }
        .instrument(span)
        .await
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

fn excerpt(body: &str) -> String {
    let body = body.trim();
    if body.len() <= MAX_DIAGNOSTIC_BODY {
        return body.to_string();
    }
    let mut end = MAX_DIAGNOSTIC_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes total)", &body[..end], body.len())
}
