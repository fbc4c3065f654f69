//! Error types for configuration and backend forwarding.

use std::error::Error as StdError;
use std::path::PathBuf;

use http::StatusCode;
use thiserror::Error;

use crate::auth::policy::PolicyError;
use crate::proxy::target::BackendTarget;

/// Fatal problems detected while loading configuration or building the
/// pipeline. None of these can occur once the proxy is serving.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("no backend targets configured (backends.targets is empty)")]
    NoBackends,

    #[error("invalid backend target `{target}`: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("server.admin_prefix `{0}` must start with `/` and name a path")]
    InvalidAdminPrefix(String),

    #[error("auth.mode = \"http\" requires auth.url")]
    MissingAuthUrl,

    #[error("invalid auth.url `{url}`: {reason}")]
    InvalidAuthUrl { url: String, reason: String },

    #[error("auth.mode = \"policy\" requires auth.policy_file")]
    MissingPolicyFile,

    #[error("failed to load policy file {}: {source}", .path.display())]
    Policy {
        path: PathBuf,
        #[source]
        source: PolicyError,
    },

    #[error("invalid header `{name}`: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// A backend could not be reached or failed before sending a response.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("backend {target} unreachable: {}", display_chain(.source))]
    Transport {
        target: BackendTarget,
        #[source]
        source: reqwest::Error,
    },
}

impl ForwardError {
    /// Status returned to the caller: 504 for timeouts, 502 otherwise.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ForwardError::Transport { source, .. } if source.is_timeout() => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ForwardError::Transport { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn target(&self) -> &BackendTarget {
        match self {
            ForwardError::Transport { target, .. } => target,
        }
    }
}

/// Render an error with its whole source chain, e.g.
/// `error sending request: client error (Connect): Connection refused`.
///
/// reqwest keeps the interesting cause (DNS, refused, reset) in the chain
/// rather than in its own `Display`.
pub fn display_chain(error: &(dyn StdError + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !rendered.contains(&cause_text) {
            rendered.push_str(": ");
            rendered.push_str(&cause_text);
        }
        source = cause.source();
    }
    rendered
}
