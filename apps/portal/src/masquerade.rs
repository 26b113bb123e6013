//! Response rewriting: make a remote response look like it came from the proxy's origin.

use std::collections::BTreeMap;

use cookie::Cookie;
use http::{HeaderMap, HeaderValue, Response, header};
use hyper::Body;
use url::Url;

use crate::{
    csp,
    error::PortalError,
    features::{
        BASIC_SET_COOKIES, BASIC_SET_HEADERS, SECURITY_BREAK_CSP,
        SECURITY_CLEAR_COOKIES_ON_NAVIGATE, SECURITY_ENFORCE_CORS, SECURITY_REMOVE_HTTPONLY_FLAG,
    },
    pipeline::RemoteResponse,
    prefs::Preferences,
    urlsplit,
};

const SKIPPED_HEADERS: &[&str] = &[
    "set-cookie",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-connection",
    "trailer",
    "upgrade",
];

/// Where the proxy lives and who is asking.
#[derive(Clone, Copy, Debug)]
pub struct Vantage<'a> {
    /// `scheme://host[:port]` of the proxy as the browser sees it.
    pub server_origin: &'a str,
    /// Proxy host without port.
    pub server_host: &'a str,
    /// Mount prefix, `""` or `/segment`.
    pub prefix: &'a str,
    /// Origin of the page that issued the request, when known.
    pub requester_origin: Option<&'a str>,
    pub mode: Option<&'a str>,
}

impl Vantage<'_> {
    /// Absolute proxy URL for a remote URL.
    pub fn proxied(&self, remote: &str) -> String {
        format!("{}{}/{}", self.server_origin, self.prefix, remote)
    }
}

/// Which rewriting steps run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Toggles {
    pub set_headers: bool,
    pub set_cookies: bool,
    pub enforce_cors: bool,
    pub break_csp: bool,
    pub clear_site_data: bool,
    pub remove_httponly: bool,
}

impl Toggles {
    pub fn from_prefs(prefs: &Preferences) -> Self {
        Self {
            set_headers: prefs.enabled(BASIC_SET_HEADERS),
            set_cookies: prefs.enabled(BASIC_SET_COOKIES),
            enforce_cors: prefs.enabled(SECURITY_ENFORCE_CORS),
            break_csp: prefs.enabled(SECURITY_BREAK_CSP),
            clear_site_data: prefs.enabled(SECURITY_CLEAR_COOKIES_ON_NAVIGATE),
            remove_httponly: prefs.enabled(SECURITY_REMOVE_HTTPONLY_FLAG),
        }
    }

    /// The rewriting proxy always forwards headers and cookies.
    pub fn rewriting() -> Self {
        Self {
            set_headers: true,
            set_cookies: true,
            enforce_cors: false,
            break_csp: false,
            clear_site_data: false,
            remove_httponly: false,
        }
    }
}

/// A masqueraded response plus the rewritten CSP, for callers that inspect it.
pub struct Masqueraded {
    pub response: Response<Body>,
    pub csp: Option<BTreeMap<String, Vec<String>>>,
}

pub fn masquerade(
    remote: RemoteResponse,
    toggles: Toggles,
    vantage: &Vantage<'_>,
) -> Result<Masqueraded, PortalError> {
    let mut headers = HeaderMap::new();
    if toggles.set_headers {
        copy_headers(&remote, &mut headers, vantage);
    } else if let Some(encoding) = remote.headers.get(header::CONTENT_ENCODING) {
        // The body bytes are forwarded untouched, so their encoding must be too.
        headers.insert(header::CONTENT_ENCODING, encoding.clone());
    }

    if toggles.set_cookies {
        for cookie in &remote.cookies {
            let rewritten = rewrite_cookie(cookie, &remote.url, vantage, toggles.remove_httponly);
            if let Ok(value) = HeaderValue::from_str(&rewritten.to_string()) {
                headers.append(header::SET_COOKIE, value);
            }
        }
    }

    if toggles.enforce_cors {
        enforce_cors(&remote.headers, &mut headers, &remote.url, vantage)?;
    }

    if toggles.clear_site_data {
        clear_site_data(&mut headers, &remote.url, vantage);
    }

    let csp = toggles
        .break_csp
        .then(|| csp::break_csp(&mut headers, vantage.server_origin, vantage.requester_origin));

    let mut response = Response::new(remote.body);
    *response.status_mut() = remote.status;
    *response.headers_mut() = headers;
    Ok(Masqueraded { response, csp })
}

/// Copies remote headers, with `Location` pointed back through the proxy.
pub fn copy_headers(remote: &RemoteResponse, out: &mut HeaderMap, vantage: &Vantage<'_>) {
    for (name, value) in remote.headers.iter() {
        if SKIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if let Some(location) = remote
        .headers
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
    {
        // Concealment only touches outbound values, so the remote's host is taken as is.
        let joined = remote
            .url
            .join(location)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| location.to_string());
        if let Ok(value) = HeaderValue::from_str(&vantage.proxied(&joined)) {
            out.insert(header::LOCATION, value);
        }
    }
}

/// Rescopes a remote cookie to the proxy. Attributes the remote left unset stay unset.
pub fn rewrite_cookie(
    cookie: &Cookie<'_>,
    remote_url: &Url,
    vantage: &Vantage<'_>,
    remove_httponly: bool,
) -> Cookie<'static> {
    let mut rewritten = cookie.clone().into_owned();

    if cookie.domain().is_some() && !is_loopback_host(vantage.server_host) {
        rewritten.set_domain(vantage.server_host.to_string());
    } else {
        rewritten.unset_domain();
    }

    match cookie.path() {
        Some(path) => {
            let scoped = format!(
                "{}/{}://{}{}",
                vantage.prefix,
                remote_url.scheme(),
                netloc(remote_url),
                path
            );
            rewritten.set_path(scoped.trim_end_matches('/').to_string());
        }
        None => rewritten.unset_path(),
    }

    if remove_httponly {
        rewritten.set_http_only(None::<bool>);
    }
    rewritten
}

/// Emulates the browser's `Access-Control-Allow-Origin` check against the page that really
/// made the request.
pub fn enforce_cors(
    remote: &HeaderMap,
    out: &mut HeaderMap,
    remote_url: &Url,
    vantage: &Vantage<'_>,
) -> Result<(), PortalError> {
    let allowed = remote
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    let remote_origin = remote_url.origin().ascii_serialization();

    match allowed {
        Some("*") => {}
        Some(origin) => {
            out.remove(header::ACCESS_CONTROL_ALLOW_ORIGIN);
            if vantage.requester_origin == Some(origin)
                && let Ok(value) = HeaderValue::from_str(vantage.server_origin)
            {
                out.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            }
        }
        None => {
            let cross_origin = vantage
                .requester_origin
                .is_some_and(|origin| origin != remote_origin);
            if vantage.mode == Some("cors") && cross_origin {
                return Err(PortalError::CrossOriginBlocked {
                    url: remote_url.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// On a cross-site top-level navigation, ask the browser to drop cookies.
pub fn clear_site_data(out: &mut HeaderMap, remote_url: &Url, vantage: &Vantage<'_>) {
    if vantage.mode != Some("navigate") {
        return;
    }
    let remote_origin = remote_url.origin().ascii_serialization();
    if let Some(requester) = vantage.requester_origin
        && urlsplit::origin_of(requester).as_deref() != Some(remote_origin.as_str())
    {
        out.insert("clear-site-data", HeaderValue::from_static("\"cookies\""));
    }
}

fn netloc(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]")
}
