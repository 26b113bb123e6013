//! Five-part URL model used for every remote target.
//!
//! Remote URLs arrive as the wildcard tail of a proxy path, so they are frequently partial:
//! `/https://example.com/a`, `/example.com/a`, or even `/https:/example.com` after an
//! intermediary collapsed a double slash. [`SplitUrl`] keeps the pieces exactly as written so
//! the route can compare the canonical form against what the browser asked for and redirect
//! when they differ.

use url::Url;

/// Schemes whose URLs always carry an authority when reassembled.
const USES_NETLOC: &[&str] = &[
    "http", "https", "ws", "wss", "ftp", "ftps", "file", "git", "svn", "sftp", "telnet",
];

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SplitUrl {
    pub scheme: String,
    pub netloc: String,
    pub path: String,
    pub query: String,
    pub fragment: String,
}

impl SplitUrl {
    pub fn new(
        scheme: impl Into<String>,
        netloc: impl Into<String>,
        path: impl Into<String>,
        query: impl Into<String>,
        fragment: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            netloc: netloc.into(),
            path: path.into(),
            query: query.into(),
            fragment: fragment.into(),
        }
    }

    /// Splits `input` without validating or normalizing any component.
    pub fn parse(input: &str) -> Self {
        let mut rest = input;
        let mut scheme = String::new();

        if let Some(idx) = rest.find(':') {
            let candidate = &rest[..idx];
            if is_scheme(candidate) && !looks_like_port(&rest[idx + 1..]) {
                scheme = candidate.to_ascii_lowercase();
                rest = &rest[idx + 1..];
            }
        }

        let mut netloc = String::new();
        if let Some(after) = rest.strip_prefix("//") {
            let end = after.find(['/', '?', '#']).unwrap_or(after.len());
            netloc = after[..end].to_string();
            rest = &after[end..];
        }

        let (rest, fragment) = match rest.split_once('#') {
            Some((before, fragment)) => (before, fragment),
            None => (rest, ""),
        };
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, query),
            None => (rest, ""),
        };

        Self {
            scheme,
            netloc,
            path: path.to_string(),
            query: query.to_string(),
            fragment: fragment.to_string(),
        }
    }

    /// Reassembles the URL. Inverse of [`SplitUrl::parse`] for every URL with a scheme and
    /// an authority.
    pub fn geturl(&self) -> String {
        let mut url = self.path.clone();
        let wants_netloc = !self.scheme.is_empty()
            && USES_NETLOC.contains(&self.scheme.as_str())
            && !url.starts_with("//");
        if !self.netloc.is_empty() || wants_netloc {
            if !url.is_empty() && !url.starts_with('/') {
                url.insert(0, '/');
            }
            url = format!("//{}{}", self.netloc, url);
        }
        if !self.scheme.is_empty() {
            url = format!("{}:{}", self.scheme, url);
        }
        if !self.query.is_empty() {
            url.push('?');
            url.push_str(&self.query);
        }
        if !self.fragment.is_empty() {
            url.push('#');
            url.push_str(&self.fragment);
        }
        url
    }

    /// `/example.com` and `/example.com/` address the same document.
    pub fn with_default_path(mut self) -> Self {
        if self.path.is_empty() {
            self.path.push('/');
        }
        self
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = query.to_string();
        self
    }

    /// Host portion of the authority, without userinfo or port.
    pub fn hostname(&self) -> &str {
        let authority = self
            .netloc
            .rsplit_once('@')
            .map(|(_, host)| host)
            .unwrap_or(&self.netloc);
        if let Some(stripped) = authority.strip_prefix('[') {
            return stripped.split(']').next().unwrap_or(stripped);
        }
        match authority.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => authority,
        }
    }

    /// `scheme://netloc`, the origin string browsers compare.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.netloc)
    }

    pub fn to_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.geturl())
    }
}

/// Turns the percent-decoded route tail into a [`SplitUrl`].
///
/// When the tail has no authority the first path segment is taken as the host, so
/// `example.com/a/b` and `https:/example.com/a/b` both yield host `example.com` and path
/// `a/b`. The scheme is left empty when absent; the origin guard decides what to do with it.
pub fn normalize(raw: &str) -> SplitUrl {
    let mut parts = SplitUrl::parse(raw);
    if parts.netloc.is_empty() {
        let trimmed = parts.path.trim_start_matches('/');
        let (domain, path) = trimmed.split_once('/').unwrap_or((trimmed, ""));
        let (domain, path) = (domain.to_string(), path.to_string());
        parts.netloc = domain;
        parts.path = path;
    }
    parts
}

/// Like [`normalize`], but a URL with neither scheme nor authority is taken as a path on
/// `origin` instead of having its first segment promoted to a host.
pub fn normalize_against(raw: &str, origin: Option<&str>) -> SplitUrl {
    let parts = SplitUrl::parse(raw);
    let base = origin
        .map(SplitUrl::parse)
        .filter(|base| !base.scheme.is_empty() && !base.netloc.is_empty());
    match base {
        Some(base) if parts.scheme.is_empty() && parts.netloc.is_empty() => SplitUrl {
            scheme: base.scheme,
            netloc: base.netloc,
            path: format!("/{}", parts.path.trim_start_matches('/')),
            query: parts.query,
            fragment: parts.fragment,
        },
        _ => normalize(raw),
    }
}

/// Origin (`scheme://host[:port]`) of an absolute URL string, if it has one.
pub fn origin_of(url: &str) -> Option<String> {
    let parts = SplitUrl::parse(url);
    if parts.scheme.is_empty() || parts.netloc.is_empty() {
        return None;
    }
    Some(parts.origin())
}

/// Authority of an absolute URL string, if it has one.
pub fn netloc_of(url: &str) -> Option<String> {
    let parts = SplitUrl::parse(url);
    if parts.netloc.is_empty() {
        None
    } else {
        Some(parts.netloc)
    }
}

fn is_scheme(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

// `localhost:8080/x` names a port, not a scheme.
fn looks_like_port(after_colon: &str) -> bool {
    let end = after_colon
        .find(['/', '?', '#'])
        .unwrap_or(after_colon.len());
    let candidate = &after_colon[..end];
    !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_absolute_urls() {
        let parts = SplitUrl::parse("https://example.com:8443/a/b?x=1#top");
        assert_eq!(parts.scheme, "https");
        assert_eq!(parts.netloc, "example.com:8443");
        assert_eq!(parts.path, "/a/b");
        assert_eq!(parts.query, "x=1");
        assert_eq!(parts.fragment, "top");
        assert_eq!(parts.geturl(), "https://example.com:8443/a/b?x=1#top");
    }

    #[test]
    fn path_embedded_host_becomes_authority() {
        let a = normalize("/example.com/a/b");
        let b = normalize("/example.com/a/b/");
        assert_eq!(a, SplitUrl::new("", "example.com", "a/b", "", ""));
        assert_eq!(b.path, "a/b/");
        assert_eq!(a.scheme, "");
        assert_eq!(b.scheme, "");
    }

    #[test]
    fn collapsed_double_slash_is_recovered() {
        let parts = normalize("https:/example.com/page").with_default_path();
        assert_eq!(parts.netloc, "example.com");
        assert_eq!(parts.geturl(), "https://example.com/page");
    }

    #[test]
    fn bare_host_and_trailing_slash_are_equal_after_defaulting() {
        assert_eq!(
            normalize("/example.com").with_default_path(),
            normalize("/example.com/").with_default_path()
        );
    }

    #[test]
    fn host_with_port_is_not_a_scheme() {
        let parts = normalize("localhost:8080/status");
        assert_eq!(parts.scheme, "");
        assert_eq!(parts.netloc, "localhost:8080");
        assert_eq!(parts.path, "status");
    }

    #[test]
    fn canonical_form_is_a_fixpoint() {
        for raw in [
            "https://example.com",
            "https://example.com/",
            "http://example.com/a/b/",
            "https:/example.com/a",
            "https://example.com/search?q=rust#results",
            "http://user@example.com:81/x",
        ] {
            let canonical = normalize(raw).with_default_path();
            let again = normalize(&canonical.geturl()).with_default_path();
            assert_eq!(normalize(&again.geturl()).with_default_path(), again, "{raw}");
            assert_eq!(again.geturl(), canonical.geturl(), "{raw}");
        }
    }

    #[test]
    fn origin_override_claims_pathlike_requests() {
        let parts = normalize_against("static/app.js", Some("https://a.test"));
        assert_eq!(parts.geturl(), "https://a.test/static/app.js");
        let parts = normalize_against("/static/app.js?v=2", Some("https://a.test:8443/page"));
        assert_eq!(parts.geturl(), "https://a.test:8443/static/app.js?v=2");

        // Absolute or collapsed URLs, and unusable origins, keep the usual rules.
        assert_eq!(
            normalize_against("https://b.test/x", Some("https://a.test")),
            normalize("https://b.test/x")
        );
        assert_eq!(
            normalize_against("https:/b.test/x", Some("https://a.test")),
            normalize("https:/b.test/x")
        );
        assert_eq!(normalize_against("b.test/x", Some("a.test")), normalize("b.test/x"));
        assert_eq!(normalize_against("b.test/x", None), normalize("b.test/x"));
    }

    #[test]
    fn hostname_strips_port_and_userinfo() {
        assert_eq!(SplitUrl::parse("http://u:p@host.test:81/").hostname(), "host.test");
        assert_eq!(SplitUrl::parse("http://[::1]:8080/").hostname(), "::1");
        assert_eq!(SplitUrl::parse("http://plain.test/").hostname(), "plain.test");
    }

    #[test]
    fn origin_helpers_require_absolute_urls() {
        assert_eq!(
            origin_of("https://a.test/x?y").as_deref(),
            Some("https://a.test")
        );
        assert_eq!(origin_of("/relative"), None);
        assert_eq!(netloc_of("https://a.test:1/x").as_deref(), Some("a.test:1"));
    }
}
