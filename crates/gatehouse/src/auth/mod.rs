//! Authorization gate: decides allow/deny for each inbound request before
//! any backend is contacted.
//!
//! The gate is fail-closed. A request without a caller identity is denied
//! without consulting anyone, and every authorizer reports failures to
//! decide as denials.

pub mod policy;
pub mod remote;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName};
use http::request::Parts;
use http::{Method, StatusCode};
use thiserror::Error;

use crate::config::{header_name, AuthConfig, AuthMode};
use crate::error::ConfigError;

pub use policy::PolicyAuthorizer;
pub use remote::HttpAuthorizer;

/// What an authorizer gets to see about one inbound request.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub request_id: String,
    pub identity: String,
    pub path: String,
    pub method: Method,
    /// Inbound headers selected by `auth.forward_request_headers`.
    pub context: HeaderMap,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied(DenialReason),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// Why a request was denied. Only ever logged; the caller always sees the
/// same 403.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DenialReason {
    #[error("missing identity header `{0}`")]
    MissingIdentity(HeaderName),

    #[error("auth service denied the request with status code: {status}, response: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("error contacting auth service: {0}")]
    Unreachable(String),

    #[error("auth service did not answer within {0:?}")]
    Timeout(Duration),

    #[error("no policy rule grants {method} {path} to `{identity}`")]
    NoMatchingRule {
        identity: String,
        path: String,
        method: String,
    },
}

/// Makes the allow/deny decision for a request that carries an identity.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, request: &AuthorizationRequest) -> Verdict;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Identity extraction in front of an [`Authorizer`]. Cheap to clone (Arc).
#[derive(Clone)]
pub struct Gate {
    identity_header: HeaderName,
    context_headers: Arc<[HeaderName]>,
    authorizer: Arc<dyn Authorizer>,
}

impl Gate {
    pub fn new(
        identity_header: HeaderName,
        context_headers: Vec<HeaderName>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            identity_header,
            context_headers: context_headers.into(),
            authorizer,
        }
    }

    /// Build the gate described by `config`, or `None` when authorization is
    /// disabled.
    pub fn from_config(config: &AuthConfig) -> Result<Option<Self>, ConfigError> {
        let authorizer: Arc<dyn Authorizer> = match config.mode {
            AuthMode::Disabled => {
                tracing::warn!("Authorization is disabled, every request will be forwarded");
                return Ok(None);
            }
            AuthMode::Http => Arc::new(HttpAuthorizer::from_config(config)?),
            AuthMode::Policy => Arc::new(PolicyAuthorizer::from_config(config)?),
        };

        let context_headers = config
            .forward_request_headers
            .iter()
            .map(|name| header_name(name))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            authorizer = authorizer.name(),
            identity_header = %config.identity_header,
            "Authorization gate enabled"
        );

        Ok(Some(Self::new(
            header_name(&config.identity_header)?,
            context_headers,
            authorizer,
        )))
    }

    /// Decide whether the request described by `parts` may be forwarded.
    ///
    /// A missing, empty or non-text identity header is denied here without
    /// calling the authorizer.
    pub async fn check(&self, parts: &Parts, request_id: &str) -> Verdict {
        let Some(request) = self.extract(parts, request_id) else {
            return Verdict::Denied(DenialReason::MissingIdentity(self.identity_header.clone()));
        };
        self.authorizer.authorize(&request).await
    }

    fn extract(&self, parts: &Parts, request_id: &str) -> Option<AuthorizationRequest> {
        let identity = parts
            .headers
            .get(&self.identity_header)?
            .to_str()
            .ok()?
            .trim();
        if identity.is_empty() {
            return None;
        }

        let mut context = HeaderMap::new();
        for name in self.context_headers.iter() {
            for value in parts.headers.get_all(name) {
                context.append(name.clone(), value.clone());
            }
        }

        Some(AuthorizationRequest {
            request_id: request_id.to_string(),
            identity: identity.to_string(),
            path: parts.uri.path().to_string(),
            method: parts.method.clone(),
            context,
        })
    }
}
