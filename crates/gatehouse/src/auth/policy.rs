//! Rule-based authorizer evaluated in-process from a policy file.
//!
//! One rule per line, comma separated; `#` starts a comment:
//!
//! ```text
//! p, alice, /reports/*, GET
//! p, admin, *, *
//! g, bob, admin
//! ```
//!
//! `p, subject, path, method` grants `method` on `path` to `subject`.
//! `subject` and `method` accept `*`; a `path` ending in `*` is a prefix.
//! `g, member, role` makes `member` inherit every grant of `role`,
//! transitively.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use super::{AuthorizationRequest, Authorizer, DenialReason, Verdict};
use crate::config::AuthConfig;
use crate::error::ConfigError;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathPattern {
    Exact(String),
    Prefix(String),
}

impl PathPattern {
    fn parse(raw: &str) -> Self {
        match raw.strip_suffix('*') {
            Some(prefix) => PathPattern::Prefix(prefix.to_string()),
            None => PathPattern::Exact(raw.to_string()),
        }
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(exact) => exact == path,
            PathPattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
struct Grant {
    subject: String,
    path: PathPattern,
    method: String,
}

impl Grant {
    fn matches(&self, subjects: &HashSet<&str>, path: &str, method: &str) -> bool {
        (self.subject == "*" || subjects.contains(self.subject.as_str()))
            && (self.method == "*" || self.method.eq_ignore_ascii_case(method))
            && self.path.matches(path)
    }
}

/// Parsed policy: grants plus role memberships.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    grants: Vec<Grant>,
    roles: HashMap<String, Vec<String>>,
}

impl Policy {
    pub fn parse(source: &str) -> Result<Self, PolicyError> {
        let mut policy = Policy::default();

        for (index, raw_line) in source.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let malformed = |reason: &str| PolicyError::Malformed {
                line: index + 1,
                reason: reason.to_string(),
            };

            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.iter().any(|f| f.is_empty()) {
                return Err(malformed("empty field"));
            }
            match fields.as_slice() {
                ["p", subject, path, method] => policy.grants.push(Grant {
                    subject: subject.to_string(),
                    path: PathPattern::parse(path),
                    method: method.to_string(),
                }),
                ["g", member, role] => policy
                    .roles
                    .entry(member.to_string())
                    .or_default()
                    .push(role.to_string()),
                ["p", ..] => return Err(malformed("expected `p, subject, path, method`")),
                ["g", ..] => return Err(malformed("expected `g, member, role`")),
                _ => return Err(malformed("rule must start with `p` or `g`")),
            }
        }

        Ok(policy)
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// `identity` plus every role it reaches through `g` rules.
    fn subjects<'a>(&'a self, identity: &'a str) -> HashSet<&'a str> {
        let mut seen = HashSet::from([identity]);
        let mut pending = vec![identity];
        while let Some(subject) = pending.pop() {
            for role in self.roles.get(subject).into_iter().flatten() {
                if seen.insert(role.as_str()) {
                    pending.push(role.as_str());
                }
            }
        }
        seen
    }

    pub fn permits(&self, identity: &str, path: &str, method: &str) -> bool {
        let subjects = self.subjects(identity);
        self.grants
            .iter()
            .any(|grant| grant.matches(&subjects, path, method))
    }

    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }
}

pub struct PolicyAuthorizer {
    policy: Policy,
}

impl PolicyAuthorizer {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        let path = config
            .policy_file
            .as_deref()
            .ok_or(ConfigError::MissingPolicyFile)?;
        let policy = Policy::load(path).map_err(|source| ConfigError::Policy {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!(
            path = %path.display(),
            grants = policy.grant_count(),
            "Loaded authorization policy"
        );
        Ok(Self::new(policy))
    }
}

#[async_trait]
impl Authorizer for PolicyAuthorizer {
    async fn authorize(&self, request: &AuthorizationRequest) -> Verdict {
        let method = request.method.as_str();
        if self.policy.permits(&request.identity, &request.path, method) {
            return Verdict::Allowed;
        }
        Verdict::Denied(DenialReason::NoMatchingRule {
            identity: request.identity.clone(),
            path: request.path.clone(),
            method: method.to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "policy"
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, Method};

    use super::*;

    const POLICY: &str = "
        # reporting
        p, alice, /reports/*, GET
        p, alice, /reports/summary, POST
        p, admin, *, *
        p, *, /public/*, get

        g, bob, ops
        g, ops, admin
    ";

    #[test]
    fn test_exact_and_prefix_paths() {
        let policy = Policy::parse(POLICY).unwrap();
        assert!(policy.permits("alice", "/reports/2024/q1", "GET"));
        assert!(policy.permits("alice", "/reports/summary", "POST"));
        assert!(!policy.permits("alice", "/reports/other", "POST"));
        assert!(!policy.permits("alice", "/admin", "GET"));
    }

    #[test]
    fn test_wildcards_and_case_insensitive_methods() {
        let policy = Policy::parse(POLICY).unwrap();
        assert!(policy.permits("anyone", "/public/logo.png", "GET"));
        assert!(!policy.permits("anyone", "/public/logo.png", "DELETE"));
        assert!(policy.permits("admin", "/anything/at/all", "DELETE"));
    }

    #[test]
    fn test_roles_are_transitive() {
        let policy = Policy::parse(POLICY).unwrap();
        assert!(policy.permits("bob", "/admin/users", "PUT"));
        assert!(!policy.permits("carol", "/admin/users", "PUT"));
    }

    #[test]
    fn test_role_cycles_terminate() {
        let policy = Policy::parse("g, a, b\ng, b, a\np, b, /x, GET").unwrap();
        assert!(policy.permits("a", "/x", "GET"));
    }

    #[test]
    fn test_malformed_lines_report_line_number() {
        let err = Policy::parse("p, alice, /x, GET\np, bob, /y").unwrap_err();
        assert!(matches!(err, PolicyError::Malformed { line: 2, .. }), "{err}");

        let err = Policy::parse("x, alice, /x, GET").unwrap_err();
        assert!(matches!(err, PolicyError::Malformed { line: 1, .. }));

        let err = Policy::parse("p, alice, , GET").unwrap_err();
        assert!(matches!(err, PolicyError::Malformed { line: 1, .. }));
    }

    #[test]
    fn test_empty_policy_denies_everything() {
        let policy = Policy::parse("# nothing yet\n\n").unwrap();
        assert!(!policy.permits("alice", "/", "GET"));
    }

    #[tokio::test]
    async fn test_authorizer_verdicts() {
        let authorizer = PolicyAuthorizer::new(Policy::parse(POLICY).unwrap());
        let request = |identity: &str, path: &str, method: Method| AuthorizationRequest {
            request_id: "req-1".to_string(),
            identity: identity.to_string(),
            path: path.to_string(),
            method,
            context: HeaderMap::new(),
        };

        assert_eq!(
            authorizer
                .authorize(&request("alice", "/reports/x", Method::GET))
                .await,
            Verdict::Allowed
        );
        assert_eq!(
            authorizer
                .authorize(&request("alice", "/reports/x", Method::DELETE))
                .await,
            Verdict::Denied(DenialReason::NoMatchingRule {
                identity: "alice".to_string(),
                path: "/reports/x".to_string(),
                method: "DELETE".to_string(),
            })
        );
    }

    #[test]
    fn test_from_config_missing_file() {
        let config = AuthConfig {
            policy_file: Some("/nonexistent/gatehouse/policy.csv".into()),
            ..AuthConfig::default()
        };
        assert!(matches!(
            PolicyAuthorizer::from_config(&config),
            Err(ConfigError::Policy { .. })
        ));
    }
}
