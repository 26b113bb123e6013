//! Inbound request decomposition.
//!
//! The proxy never forwards the browser's request as-is: identifying headers are removed, the
//! proxy's own cookies are held back, and the referrer/origin the browser would have sent to
//! the remote site (had it not been talking to the proxy) are put back from the worker's
//! declaration.

use std::collections::BTreeMap;

use cookie::Cookie;
use http::{HeaderMap, HeaderValue, Method, Request, header};
use hyper::Body;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use url::form_urlencoded;

use crate::{bitmask::Mask, features::FeatureCatalog, urlsplit::SplitUrl};

/// Query parameters the worker appends for the proxy's benefit.
const PROXY_PARAMS: &[&str] = &["_portal5origin", "_p5origin"];

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
    "x-forwarded-host",
    "x-forwarded-proto",
];

/// What the browser-side worker says about the request it is relaying.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientDeclaration {
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient_version")]
    pub version: Option<u32>,
    pub prefs: Option<DeclaredPrefs>,
    pub mode: Option<String>,
    pub referrer: Option<String>,
    pub origin: Option<String>,
    pub signals: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DeclaredPrefs {
    Mask(Mask),
    Names(Vec<String>),
}

impl DeclaredPrefs {
    pub fn to_mask(&self, catalog: &FeatureCatalog) -> Mask {
        match self {
            Self::Mask(mask) => *mask,
            Self::Names(names) => catalog.prefs_to_bitmask(names.iter().map(String::as_str)),
        }
    }
}

fn lenient_version<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

impl ClientDeclaration {
    /// Reads `X-{appname}` (a JSON object), or the older one-header-per-field form when it is
    /// absent. Malformed JSON yields an empty declaration.
    pub fn from_headers(headers: &HeaderMap, appname: &str) -> Self {
        let header_name = format!("x-{appname}");
        if let Some(raw) = headers.get(header_name.as_str()) {
            return raw
                .to_str()
                .ok()
                .and_then(|text| serde_json::from_str(text).ok())
                .unwrap_or_default();
        }

        let legacy = |suffix: &str| {
            headers
                .get(format!("{header_name}-{suffix}").as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .filter(|v| !v.is_empty())
        };
        Self {
            version: legacy("worker-version").and_then(|v| v.trim().parse().ok()),
            referrer: legacy("referrer"),
            origin: legacy("origin"),
            mode: legacy("mode"),
            ..Self::default()
        }
    }

    /// A worker is installed and has not asked to be revalidated.
    pub fn is_valid(&self) -> bool {
        self.version.is_some() && !self.signals.contains_key("revalidate")
    }

    pub fn is_current(&self, version: u32) -> bool {
        self.version == Some(version)
    }

    /// Host of the page that issued the request, as the browser saw it.
    pub fn origin_domain(&self) -> Option<String> {
        [&self.origin, &self.referrer]
            .into_iter()
            .flatten()
            .map(|url| SplitUrl::parse(url).netloc)
            .find(|netloc| !netloc.is_empty())
    }

    pub fn mode(&self) -> Option<&str> {
        self.mode.as_deref()
    }
}

/// The inbound request, split into the parts that get forwarded.
pub struct RequestContext {
    pub method: Method,
    /// Outbound headers, already stripped of everything identifying the proxy.
    pub headers: HeaderMap,
    /// Cookies that belong to the remote site. Last occurrence wins.
    pub cookies: BTreeMap<String, String>,
    /// Cookies in the proxy's own namespace, held back from the remote.
    pub own_cookies: BTreeMap<String, String>,
    /// Raw query string minus the proxy's own parameters.
    pub query: String,
    pub body: Option<Body>,
    pub declaration: ClientDeclaration,
    /// Query string exactly as received.
    pub inbound_query: Option<String>,
    pub inbound_path: String,
}

impl RequestContext {
    pub fn build(req: Request<Body>, appname: &str) -> Self {
        let (parts, body) = req.into_parts();
        let declaration = ClientDeclaration::from_headers(&parts.headers, appname);

        let mut cookies = BTreeMap::new();
        let mut own_cookies = BTreeMap::new();
        for value in parts.headers.get_all(header::COOKIE) {
            let Ok(text) = value.to_str() else { continue };
            for cookie in Cookie::split_parse(text).flatten() {
                let target = if cookie.name().starts_with(appname) {
                    &mut own_cookies
                } else {
                    &mut cookies
                };
                target.insert(cookie.name().to_string(), cookie.value().to_string());
            }
        }

        let has_body = declares_body(&parts.headers, &parts.method);
        let headers = outbound_headers(&parts.headers, appname, &declaration, &parts.method);
        let inbound_query = parts.uri.query().map(str::to_string);
        let query = inbound_query
            .as_deref()
            .map(strip_proxy_params)
            .unwrap_or_default();

        Self {
            method: parts.method,
            headers,
            cookies,
            own_cookies,
            query,
            body: has_body.then_some(body),
            declaration,
            inbound_query,
            inbound_path: parts.uri.path().to_string(),
        }
    }

    /// Decoded query parameters, in order, duplicates kept.
    pub fn params(&self) -> Vec<(String, String)> {
        form_urlencoded::parse(self.query.as_bytes())
            .into_owned()
            .collect()
    }

    /// Origin the worker says a netloc-less request belongs to (`_portal5origin`).
    pub fn origin_override(&self) -> Option<String> {
        let query = self.inbound_query.as_deref()?;
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| PROXY_PARAMS.contains(&key.as_ref()))
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
    }

    pub fn own_cookie(&self, name: &str) -> Option<&str> {
        self.own_cookies.get(name).map(String::as_str)
    }

    /// Remote cookies rendered as a single `Cookie` header value.
    pub fn cookie_header(&self) -> Option<HeaderValue> {
        if self.cookies.is_empty() {
            return None;
        }
        let joined = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }

    /// Replaces the proxy's host inside everything headed for the remote. See
    /// [`OriginConcealment`].
    pub fn conceal(&mut self, concealment: &OriginConcealment, target: &mut SplitUrl) {
        target.path = concealment.conceal(&target.path);
        target.query = concealment.conceal(&target.query);
        self.query = concealment.conceal(&self.query);

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in self.headers.iter() {
            let replaced = value
                .to_str()
                .ok()
                .map(|text| concealment.conceal(text))
                .and_then(|text| HeaderValue::from_str(&text).ok())
                .unwrap_or_else(|| value.clone());
            headers.append(name.clone(), replaced);
        }
        self.headers = headers;

        for value in self.cookies.values_mut() {
            *value = concealment.conceal(value);
        }
    }
}

fn declares_body(headers: &HeaderMap, method: &Method) -> bool {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0);
    content_length > 0
        || headers.contains_key(header::TRANSFER_ENCODING)
        || matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

fn outbound_headers(
    inbound: &HeaderMap,
    appname: &str,
    declaration: &ClientDeclaration,
    method: &Method,
) -> HeaderMap {
    let own_prefix = format!("x-{appname}");
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound.iter() {
        let lower = name.as_str();
        if lower.starts_with(&own_prefix)
            || HOP_BY_HOP.contains(&lower)
            || *name == header::HOST
            || *name == header::REFERER
            || *name == header::ORIGIN
            || *name == header::COOKIE
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(referrer) = declaration.referrer.as_deref()
        && let Ok(value) = HeaderValue::from_str(referrer)
    {
        headers.insert(header::REFERER, value);
    }
    let wants_origin =
        declaration.mode() == Some("cors") || !matches!(*method, Method::GET | Method::HEAD);
    if wants_origin
        && let Some(origin) = declaration.origin.as_deref()
        && let Ok(value) = HeaderValue::from_str(origin)
    {
        headers.insert(header::ORIGIN, value);
    }
    headers
}

fn strip_proxy_params(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or_default();
            !pair.is_empty() && !PROXY_PARAMS.contains(&key)
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Textual substitution of the proxy's host with the declaring page's host.
///
/// This is a plain find/replace: an unrelated substring that happens to spell the proxy's
/// hostname is rewritten too. Responses are never un-concealed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginConcealment {
    pub proxy_host: String,
    pub origin_host: String,
}

impl OriginConcealment {
    /// `None` when there is nothing to hide.
    pub fn new(proxy_host: &str, origin_host: &str) -> Option<Self> {
        if proxy_host.is_empty() || origin_host.is_empty() || proxy_host == origin_host {
            return None;
        }
        Some(Self {
            proxy_host: proxy_host.to_string(),
            origin_host: origin_host.to_string(),
        })
    }

    pub fn conceal(&self, text: &str) -> String {
        text.replace(&self.proxy_host, &self.origin_host)
    }
}
