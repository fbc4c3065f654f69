//! Backend targets and the fixed target list the dispatcher rotates over.

use std::fmt;
use std::sync::Arc;

use http::Uri;
use reqwest::Url;

use crate::error::ConfigError;

/// One upstream server: a scheme plus an authority (`host[:port]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    scheme: String,
    authority: String,
}

impl BackendTarget {
    /// Parse `http://host[:port]` or `https://host[:port]`.
    ///
    /// Targets carry no path: the inbound path and query are kept verbatim
    /// when a request is rewritten onto a target.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidTarget {
            target: raw.to_string(),
            reason,
        };

        let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(invalid(format!("unsupported scheme `{other}`"))),
        }
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host".to_string()))?;
        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(invalid(
                "targets are scheme and host only, without path or query".to_string(),
            ));
        }

        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        Ok(Self {
            scheme: url.scheme().to_string(),
            authority,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Absolute URL for `path_and_query` on this target.
    pub fn url_for(&self, path_and_query: &str) -> String {
        format!("{}://{}{}", self.scheme, self.authority, path_and_query)
    }
}

/// Resolve `path_and_query` the way the outbound URL parser will: `.` and
/// `..` segments (plain or percent-encoded) are removed and backslashes
/// become slashes. Authorization and forwarding both use the result, so the
/// path that is checked is the path the backend receives.
///
/// `None` when the input is not an origin-form path.
pub fn normalize_path_and_query(path_and_query: &str) -> Option<Uri> {
    if !path_and_query.starts_with('/') {
        return None;
    }
    let url = Url::parse(&format!("http://gatehouse.invalid{path_and_query}")).ok()?;

    let mut normalized = url.path().to_string();
    if let Some(query) = url.query() {
        normalized.push('?');
        normalized.push_str(query);
    }
    normalized.parse().ok()
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

/// Ordered, non-empty, immutable list of backend targets.
#[derive(Debug, Clone)]
pub struct TargetList {
    targets: Arc<[BackendTarget]>,
}

#[allow(clippy::len_without_is_empty)]
impl TargetList {
    pub fn new(targets: Vec<BackendTarget>) -> Result<Self, ConfigError> {
        if targets.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        Ok(Self {
            targets: targets.into(),
        })
    }

    /// Parse every configured target, failing on the first invalid one.
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Result<Self, ConfigError> {
        let targets = raw
            .iter()
            .map(|t| BackendTarget::parse(t.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(targets)
    }

    /// Always at least 1.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn as_slice(&self) -> &[BackendTarget] {
        &self.targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_and_port() {
        let target = BackendTarget::parse("http://127.0.0.1:8081").unwrap();
        assert_eq!(target.scheme(), "http");
        assert_eq!(target.authority(), "127.0.0.1:8081");
        assert_eq!(target.to_string(), "http://127.0.0.1:8081");
    }

    #[test]
    fn test_parse_accepts_trailing_slash_and_default_port() {
        let target = BackendTarget::parse("https://api.internal/").unwrap();
        assert_eq!(target.scheme(), "https");
        assert_eq!(target.authority(), "api.internal");

        // The default port is elided by the URL parser.
        let target = BackendTarget::parse("http://app:80").unwrap();
        assert_eq!(target.authority(), "app");
    }

    #[test]
    fn test_parse_ipv6_keeps_brackets() {
        let target = BackendTarget::parse("http://[::1]:9000").unwrap();
        assert_eq!(target.url_for("/x"), "http://[::1]:9000/x");
    }

    #[test]
    fn test_parse_rejects_bad_targets() {
        for raw in [
            "127.0.0.1:8081",
            "ftp://files.internal",
            "http://app/base",
            "http://app/?q=1",
            "not a url",
        ] {
            let err = BackendTarget::parse(raw).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidTarget { ref target, .. } if target == raw),
                "{raw}: {err}"
            );
        }
    }

    #[test]
    fn test_url_for_keeps_path_and_query() {
        let target = BackendTarget::parse("http://backend:3000").unwrap();
        assert_eq!(
            target.url_for("/users/7?expand=true"),
            "http://backend:3000/users/7?expand=true"
        );
    }

    #[test]
    fn test_empty_target_list_is_rejected() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            TargetList::parse(&empty),
            Err(ConfigError::NoBackends)
        ));
    }

    #[test]
    fn test_target_list_preserves_order() {
        let list = TargetList::parse(&["http://a:1", "http://b:2", "http://c:3"]).unwrap();
        assert_eq!(list.len(), 3);
        let rendered: Vec<String> = list.as_slice().iter().map(|t| t.to_string()).collect();
        assert_eq!(rendered, ["http://a:1", "http://b:2", "http://c:3"]);
    }

    fn normalized(raw: &str) -> String {
        normalize_path_and_query(raw).unwrap().to_string()
    }

    #[test]
    fn test_normalize_resolves_dot_segments() {
        assert_eq!(normalized("/public/../admin/users"), "/admin/users");
        assert_eq!(normalized("/public/%2e%2e/admin/users"), "/admin/users");
        assert_eq!(normalized("/public/%2E%2E/admin"), "/admin");
        assert_eq!(normalized("/public/./a/.%2e/b"), "/public/b");
        assert_eq!(normalized("/../../etc/passwd"), "/etc/passwd");
    }

    #[test]
    fn test_normalize_keeps_ordinary_paths_and_query() {
        assert_eq!(normalized("/"), "/");
        assert_eq!(normalized("/users/7?expand=true"), "/users/7?expand=true");
        assert_eq!(normalized("/a%2Fb/c"), "/a%2Fb/c");
        assert_eq!(normalized("/search?q=../x"), "/search?q=../x");
    }

    #[test]
    fn test_normalize_matches_forwarded_url() {
        let target = BackendTarget::parse("http://backend:3000").unwrap();
        for raw in ["/public/../admin", "/public/%2e%2e/admin?x=1", "/a/./b"] {
            let forwarded = Url::parse(&target.url_for(raw)).unwrap();
            let checked = normalize_path_and_query(raw).unwrap();
            assert_eq!(forwarded.path(), checked.path(), "{raw}");
            assert_eq!(forwarded.query(), checked.query(), "{raw}");
        }
    }

    #[test]
    fn test_normalize_rejects_non_origin_form() {
        assert!(normalize_path_and_query("*").is_none());
        assert!(normalize_path_and_query("").is_none());
    }
}
