//! Outbound request execution.
//!
//! A request goes through three stages: a [`PreparedRequest`] is built, checked against the
//! self-protect filter, then sent. The remote body is never buffered; it is handed back as
//! the [`hyper::Body`] stream and dropping it closes the upstream connection.

use std::{error::Error as StdError, time::Duration};

use cookie::Cookie;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version, header};
use hyper::{Body, Client, client::HttpConnector};
use hyper_rustls::HttpsConnectorBuilder;
use tracing::{debug, warn};
use url::Url;

use crate::{
    context::RequestContext, error::PortalError, filters::RequestFilter, urlsplit::SplitUrl,
};

pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

pub fn build_client(connect_timeout: Duration) -> HttpClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(connect_timeout));
    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);
    Client::builder().build(https)
}

#[derive(Debug)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Body>,
}

impl PreparedRequest {
    pub fn new(method: Method, url: Url, mut headers: HeaderMap, body: Option<Body>) -> Self {
        // Content-Length and Transfer-Encoding are mutually exclusive on HTTP/1.1.
        if headers.contains_key(header::CONTENT_LENGTH) {
            headers.remove(header::TRANSFER_ENCODING);
        }
        Self {
            method,
            url,
            headers,
            body,
        }
    }

    /// Outbound request for `target`, carrying the context's headers, remote cookies,
    /// query string and body. The body moves out of the context.
    pub fn from_context(ctx: &mut RequestContext, target: &SplitUrl) -> Result<Self, PortalError> {
        let mut target = target.clone();
        if !ctx.query.is_empty() {
            target.query = if target.query.is_empty() {
                ctx.query.clone()
            } else {
                format!("{}&{}", target.query, ctx.query)
            };
        }
        // Fragments are never sent to servers.
        target.fragment.clear();

        let url = target
            .to_url()
            .map_err(|err| PortalError::BadRequest(format!("invalid URL {}: {err}", target.geturl())))?;

        let mut headers = ctx.headers.clone();
        if let Some(cookies) = ctx.cookie_header() {
            headers.insert(header::COOKIE, cookies);
        }
        Ok(Self::new(ctx.method.clone(), url, headers, ctx.body.take()))
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Copy of a body-less request, for probes and redirect hops.
    pub fn try_clone(&self) -> Option<Self> {
        if self.body.is_some() {
            return None;
        }
        Some(Self {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: None,
        })
    }

    fn into_hyper(self) -> Result<Request<Body>, PortalError> {
        let uri: Uri = self
            .url
            .as_str()
            .parse()
            .map_err(|_| PortalError::BadRequest(format!("cannot request {}", self.url)))?;
        let mut request = Request::new(self.body.unwrap_or_else(Body::empty));
        *request.method_mut() = self.method;
        *request.uri_mut() = uri;
        *request.headers_mut() = self.headers;
        Ok(request)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedirectPolicy {
    /// Hand 3xx responses back to the caller.
    Manual,
    /// Follow up to this many hops, for requests without a body.
    Follow(usize),
}

/// A remote response with its headers still in remote terms.
#[derive(Debug)]
pub struct RemoteResponse {
    /// The URL that produced this response, after any followed redirects.
    pub url: Url,
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub cookies: Vec<Cookie<'static>>,
    pub body: Body,
}

impl RemoteResponse {
    fn new(url: Url, response: Response<Body>) -> Self {
        let (parts, body) = response.into_parts();
        let cookies = parts
            .headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|raw| Cookie::parse(raw.to_string()).ok())
            .collect();
        Self {
            url,
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            cookies,
            body,
        }
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn is_html(&self) -> bool {
        self.content_type().contains("text/html")
    }

    pub fn error_for_status(self) -> Result<Self, PortalError> {
        if self.status.is_client_error() || self.status.is_server_error() {
            return Err(PortalError::UpstreamStatus {
                url: self.url.to_string(),
                status: self.status,
            });
        }
        Ok(self)
    }
}

pub struct Pipeline<'a> {
    client: &'a HttpClient,
    filter: &'a RequestFilter,
    response_timeout: Duration,
}

impl<'a> Pipeline<'a> {
    pub fn new(client: &'a HttpClient, filter: &'a RequestFilter, response_timeout: Duration) -> Self {
        Self {
            client,
            filter,
            response_timeout,
        }
    }

    pub async fn send(
        &self,
        mut request: PreparedRequest,
        redirects: RedirectPolicy,
    ) -> Result<RemoteResponse, PortalError> {
        let mut hops = 0usize;
        loop {
            self.filter.test(&request)?;

            let url = request.url.clone();
            let replay = request.try_clone();
            debug!(method = %request.method, url = %url, "sending upstream request");
            let response = self.dispatch(&url, request.into_hyper()?).await?;

            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|loc| url.join(loc).ok());
            if let RedirectPolicy::Follow(limit) = redirects
                && response.status().is_redirection()
                && let Some(next_url) = location
                && let Some(mut next) = replay
            {
                hops += 1;
                if hops > limit {
                    return Err(PortalError::TooManyRedirects {
                        url: url.to_string(),
                    });
                }
                if response.status() == StatusCode::SEE_OTHER {
                    next.method = Method::GET;
                }
                next.url = next_url;
                request = next;
                continue;
            }

            return Ok(RemoteResponse::new(url, response));
        }
    }

    async fn dispatch(&self, url: &Url, request: Request<Body>) -> Result<Response<Body>, PortalError> {
        match tokio::time::timeout(self.response_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                let classified = classify(&err, url);
                warn!(%err, url = %url, "upstream request failed");
                Err(classified)
            }
            Err(_) => {
                warn!(url = %url, "upstream response timed out");
                Err(PortalError::Timeout {
                    url: url.to_string(),
                })
            }
        }
    }
}

fn classify(err: &hyper::Error, url: &Url) -> PortalError {
    let url = url.to_string();
    if err.is_connect() {
        if chain_contains::<rustls::Error>(err) {
            return PortalError::Tls { url };
        }
        if chain_has_io_kind(err, std::io::ErrorKind::TimedOut) {
            return PortalError::Timeout { url };
        }
        return PortalError::Connect { url };
    }
    if chain_contains::<rustls::Error>(err) {
        return PortalError::Tls { url };
    }
    let kind = if err.is_incomplete_message() {
        "incomplete-message"
    } else if err.is_parse() {
        "parse"
    } else if err.is_canceled() {
        "canceled"
    } else if err.is_closed() {
        "closed"
    } else if err.is_timeout() {
        "timeout"
    } else if err.is_user() {
        "user"
    } else {
        "transport"
    };
    PortalError::Unspecified {
        url,
        kind: kind.to_string(),
    }
}

/// Walks the source chain, looking inside `io::Error` wrappers, which hide their payload
/// from `source()`.
fn walk_chain(err: &(dyn StdError + 'static), visit: &mut dyn FnMut(&(dyn StdError + 'static)) -> bool) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if visit(e) {
            return true;
        }
        let inner = e
            .downcast_ref::<std::io::Error>()
            .and_then(|io| io.get_ref())
            .map(|inner| inner as &(dyn StdError + 'static));
        current = inner.or_else(|| e.source());
    }
    false
}

fn chain_contains<T: StdError + 'static>(err: &hyper::Error) -> bool {
    walk_chain(err, &mut |e| e.downcast_ref::<T>().is_some())
}

fn chain_has_io_kind(err: &hyper::Error, kind: std::io::ErrorKind) -> bool {
    walk_chain(err, &mut |e| {
        e.downcast_ref::<std::io::Error>()
            .map(|io| io.kind() == kind)
            .unwrap_or(false)
    })
}

pub(crate) fn header_str<'h>(headers: &'h HeaderMap, name: impl http::header::AsHeaderName) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub(crate) fn set_header(headers: &mut HeaderMap, name: http::header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
