//! Cache key derivation from target URLs
//!
//! A cache key is a relative path of the form `<hostkey>/<cleaned-path>`:
//!
//! - `hostkey` is the last two DNS labels of the target host, port removed
//!   (`a.b.example.com:8080` → `example.com`). IP literals are kept whole.
//! - `cleaned-path` is the URL path with every `/<session>/<token>` pair
//!   removed, so URLs that differ only in an ephemeral session id share a key.
//!
//! The query string and fragment never take part in the key. Segments that
//! would collide with the store's own file names (`_index`, `*.temp~`) get
//! one character percent-encoded, which names the same resource under
//! RFC 3986.

use crate::cache_store::{INDEX_FILE, STAGING_SUFFIX};
use crate::error::{ProxyError, Result};
use reqwest::Url;
use std::borrow::Cow;
use std::fmt;
use std::net::Ipv4Addr;

/// Filesystem-relative cache key
///
/// Never absolute, never empty, and never contains `.` or `..` segments,
/// so joining it onto a cache root cannot escape that root. No segment is
/// an index file name or a staging file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from an already-derived relative path, rejecting anything
    /// that could escape the cache root.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() || key.starts_with('/') || key.contains('\\') || key.contains('\0') {
            return Err(ProxyError::InvalidUrl(format!("unusable cache key '{}'", key)));
        }
        if key.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(ProxyError::InvalidUrl(format!(
                "cache key '{}' contains a relative segment",
                key
            )));
        }
        if key.split('/').any(is_reserved) {
            return Err(ProxyError::InvalidUrl(format!(
                "cache key '{}' names a cache bookkeeping file",
                key
            )));
        }
        Ok(CacheKey(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the key names a directory-like resource (host root or trailing slash)
    pub fn is_directory_like(&self) -> bool {
        self.0.ends_with('/') || !self.0.contains('/')
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn is_reserved(segment: &str) -> bool {
    segment == INDEX_FILE || segment.ends_with(STAGING_SUFFIX)
}

/// Percent-encode the leading `_` of an index name or the trailing `~` of a staging name.
fn escape_reserved(segment: &str) -> Cow<'_, str> {
    if segment == INDEX_FILE {
        return Cow::Owned(format!("%5F{}", &segment[1..]));
    }
    if segment.ends_with(STAGING_SUFFIX) {
        if let Some(stem) = segment.strip_suffix('~') {
            return Cow::Owned(format!("{}%7E", stem));
        }
    }
    Cow::Borrowed(segment)
}

/// Strategy for turning a target URL into a cache key
pub trait KeyTransformer: Send + Sync {
    fn transform(&self, url: &Url) -> Result<CacheKey>;
}

/// Parse a raw target string into an absolute http(s) URL.
pub fn parse_target(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| ProxyError::InvalidUrl(format!("'{}': {}", raw, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ProxyError::InvalidUrl(format!(
                "'{}': unsupported scheme '{}'",
                raw, other
            )))
        }
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(ProxyError::InvalidUrl(format!("'{}': missing host", raw))),
    }
}

/// Default key transformer: two-label host key plus session-free path
#[derive(Debug, Clone)]
pub struct PathKeyTransformer {
    session_segment: String,
}

impl PathKeyTransformer {
    pub fn new(session_segment: impl Into<String>) -> Self {
        PathKeyTransformer {
            session_segment: session_segment.into(),
        }
    }

    /// Reduce a host to its cache directory name.
    pub fn host_key(host: &str) -> String {
        // IPv6 literals arrive bracketed; colons are swapped so the name stays portable.
        if let Some(v6) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            return v6.replace(':', "_");
        }
        if host.parse::<Ipv4Addr>().is_ok() {
            return host.to_string();
        }

        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let labels: Vec<&str> = host.split('.').collect();
        let start = labels.len().saturating_sub(2);
        labels[start..].join(".")
    }

    /// Drop session pairs and unusable segments from a percent-encoded path.
    fn clean_path(&self, path: &str) -> String {
        let segments: Vec<&str> = path.split('/').skip(1).collect();
        let mut trailing_slash = segments.len() > 1 && segments.last() == Some(&"");

        let mut kept: Vec<Cow<'_, str>> = Vec::with_capacity(segments.len());
        let mut iter = segments.iter().peekable();
        while let Some(segment) = iter.next() {
            if *segment == self.session_segment && iter.peek().is_some() {
                iter.next();
                if iter.peek().is_none() {
                    // the token was the final segment, so there is no trailing slash left
                    trailing_slash = false;
                }
                continue;
            }
            if segment.is_empty() || *segment == "." || *segment == ".." {
                continue;
            }
            kept.push(escape_reserved(segment));
        }

        let mut cleaned = kept.join("/");
        if trailing_slash && !cleaned.is_empty() {
            cleaned.push('/');
        }
        cleaned
    }
}

impl Default for PathKeyTransformer {
    fn default() -> Self {
        Self::new("session")
    }
}

impl KeyTransformer for PathKeyTransformer {
    fn transform(&self, url: &Url) -> Result<CacheKey> {
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::InvalidUrl(format!("'{}': missing host", url)))?;

        let host_key = Self::host_key(host);
        if host_key.is_empty() {
            return Err(ProxyError::InvalidUrl(format!("'{}': empty host", url)));
        }

        let cleaned = self.clean_path(url.path());
        if cleaned.is_empty() {
            CacheKey::new(host_key)
        } else {
            CacheKey::new(format!("{}/{}", host_key, cleaned))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> String {
        let url = parse_target(raw).unwrap();
        PathKeyTransformer::default().transform(&url).unwrap().to_string()
    }

    #[test]
    fn test_host_reduced_to_two_labels() {
        assert_eq!(key("http://a.b.example.com/x"), "example.com/x");
        assert_eq!(key("https://files.pythonhosted.org:443/p/f.whl"), "pythonhosted.org/p/f.whl");
        assert_eq!(key("http://example.com:8080/x"), "example.com/x");
        assert_eq!(key("http://localhost:8080/x"), "localhost/x");
    }

    #[test]
    fn test_ip_hosts_kept_whole() {
        assert_eq!(key("http://127.0.0.1:9000/x"), "127.0.0.1/x");
        assert_eq!(key("http://[::1]:9000/x"), "__1/x");
    }

    #[test]
    fn test_session_segments_removed() {
        assert_eq!(
            key("http://example.com/session/abc123/pkg/1.0/foo.json"),
            "example.com/pkg/1.0/foo.json"
        );
        assert_eq!(
            key("http://example.com/a/session/one/b/session/two/c"),
            "example.com/a/b/c"
        );
    }

    #[test]
    fn test_session_as_final_segment_kept() {
        assert_eq!(key("http://example.com/a/session"), "example.com/a/session");
    }

    #[test]
    fn test_session_with_empty_token() {
        assert_eq!(key("http://example.com/a/session/"), "example.com/a");
    }

    #[test]
    fn test_segment_containing_session_kept() {
        assert_eq!(key("http://example.com/mysession/x"), "example.com/mysession/x");
    }

    #[test]
    fn test_empty_path_is_host_key() {
        assert_eq!(key("http://www.example.com"), "example.com");
        assert_eq!(key("http://www.example.com/"), "example.com");
    }

    #[test]
    fn test_trailing_slash_preserved() {
        assert_eq!(key("https://pypi.org/simple/requests/"), "pypi.org/simple/requests/");
    }

    #[test]
    fn test_query_ignored() {
        assert_eq!(key("http://example.com/a?x=1"), key("http://example.com/a?x=2"));
    }

    #[test]
    fn test_traversal_cannot_escape() {
        let k = key("http://example.com/a/%2e%2e/%2e%2e/etc/passwd");
        assert!(!k.split('/').any(|s| s == ".."));
        assert!(k.starts_with("example.com/"));
    }

    #[test]
    fn test_invalid_targets() {
        assert!(matches!(parse_target("not a url"), Err(ProxyError::InvalidUrl(_))));
        assert!(matches!(parse_target("ftp://example.com/x"), Err(ProxyError::InvalidUrl(_))));
        assert!(matches!(parse_target("mailto:me@example.com"), Err(ProxyError::InvalidUrl(_))));
    }

    #[test]
    fn test_cache_key_rejects_escapes() {
        assert!(CacheKey::new("../etc").is_err());
        assert!(CacheKey::new("/abs").is_err());
        assert!(CacheKey::new("").is_err());
        assert!(CacheKey::new("example.com/a/../b").is_err());
        assert!(CacheKey::new("example.com/a/b").is_ok());
    }

    #[test]
    fn test_directory_like_keys() {
        assert!(CacheKey::new("example.com").unwrap().is_directory_like());
        assert!(CacheKey::new("example.com/simple/").unwrap().is_directory_like());
        assert!(!CacheKey::new("example.com/a.json").unwrap().is_directory_like());
    }

    #[test]
    fn test_reserved_segments_escaped() {
        assert_eq!(key("http://example.com/_index"), "example.com/%5Findex");
        assert_eq!(key("http://example.com/a/_index/b"), "example.com/a/%5Findex/b");
        assert_eq!(
            key("http://example.com/x.json.va0uD9.temp~"),
            "example.com/x.json.va0uD9.temp%7E"
        );
        assert_eq!(key("http://example.com/_indexes"), "example.com/_indexes");
        assert_eq!(key("http://example.com/notes.temp"), "example.com/notes.temp");
    }

    #[test]
    fn test_cache_key_rejects_reserved_segments() {
        assert!(CacheKey::new("example.com/_index").is_err());
        assert!(CacheKey::new("example.com/x.json.abc123.temp~").is_err());
        assert!(CacheKey::new("example.com/x.temp~/y").is_err());
        assert!(CacheKey::new("example.com/x.temp%7E").is_ok());
    }

    #[test]
    fn test_custom_session_segment() {
        let url = parse_target("http://example.com/sid/xyz/file").unwrap();
        let key = PathKeyTransformer::new("sid").transform(&url).unwrap();
        assert_eq!(key.as_str(), "example.com/file");
    }
}
