//! Server-side rewriting proxy.
//!
//! Pages are not rewritten, so a document loaded from `{prefix}/https://a.test/dir/page`
//! requests its relative resources as `{prefix}/dir/style.css` or `/static/x.js`. The proxy
//! remembers the last remote it served in `{appname}-remote-*` cookies and resolves such
//! schemeless requests against it.

use cookie::{Cookie, time::Duration};
use http::{HeaderValue, Request, Response, header};
use hyper::Body;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use tracing::{debug, warn};
use url::Url;

use crate::{
    AppState, ServerOrigin,
    context::RequestContext,
    error::PortalError,
    guard::guard,
    masquerade::{Toggles, Vantage, masquerade},
    namespace::Namespace,
    pipeline::{PreparedRequest, RedirectPolicy},
    redirect_response,
    urlsplit::{self, SplitUrl},
};

const REMOTE_COOKIE_TTL: Duration = Duration::seconds(1800);
const REDIRECT_MARKER_TTL: Duration = Duration::seconds(30);

/// Characters a cookie value cannot carry verbatim.
const COOKIE_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b',')
    .add(b';')
    .add(b'\\')
    .add(b'%');

/// The remote a client was last shown, read back from its cookies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LastRemote {
    pub scheme: Option<String>,
    pub domain: Option<String>,
    pub referrer: Option<SplitUrl>,
    /// Set right after a resolution redirect; the next request is taken literally.
    pub redirected: bool,
}

impl LastRemote {
    pub fn from_context(ctx: &RequestContext, names: &Namespace) -> Self {
        let read = |kind: &str| {
            ctx.own_cookie(&names.remote_cookie(kind))
                .map(|raw| percent_decode_str(raw).decode_utf8_lossy().into_owned())
                .filter(|value| !value.is_empty())
        };
        Self {
            scheme: read("scheme"),
            domain: read("domain"),
            referrer: read("referrer").map(|raw| SplitUrl::parse(&raw)),
            redirected: read("redirect").is_some(),
        }
    }
}

/// Resolves a schemeless request against the page that referred to it.
///
/// Only subresource fetches are resolved: navigations are taken as typed. `requested`
/// must not already name the last remote's domain.
pub fn resolve_relative(
    requested: &SplitUrl,
    fetch_mode: Option<&str>,
    referred_by: Option<&SplitUrl>,
    base_domain: Option<&str>,
) -> Option<SplitUrl> {
    if !requested.scheme.is_empty() {
        return None;
    }
    if matches!(fetch_mode, Some("navigate" | "nested-navigate")) {
        return None;
    }
    let referred_by = referred_by.filter(|r| !r.scheme.is_empty() && !r.netloc.is_empty())?;
    if base_domain == Some(requested.netloc.as_str()) {
        return None;
    }

    let base = Url::parse(&referred_by.geturl()).ok()?.join(".").ok()?;
    let subpath = format!("{}/{}", requested.netloc, requested.path);
    let mut subpath = subpath.trim_matches('/').to_string();
    if !requested.query.is_empty() {
        subpath.push('?');
        subpath.push_str(&requested.query);
    }
    let resolved = base.join(&subpath).ok()?;
    Some(SplitUrl::parse(resolved.as_str()))
}

pub async fn handle(state: &AppState, server: &ServerOrigin, req: Request<Body>) -> Response<Body> {
    let prefix = state.config.prefix.clone();
    let referer = req
        .headers()
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let fetch_mode = req
        .headers()
        .get("sec-fetch-mode")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut ctx = RequestContext::build(req, &state.names.appname);
    let path = ctx.inbound_path.clone();
    let mut forward = Forward {
        state,
        server,
        prefix: &prefix,
        mount: prefix.clone(),
        referer: referer.as_deref(),
        fetch_mode: fetch_mode.as_deref(),
    };

    let under_prefix = path
        .strip_prefix(prefix.as_str())
        .filter(|rest| rest.is_empty() || rest.starts_with('/'));
    let Some(tail) = under_prefix else {
        // A root-relative request from a page mounted under the prefix.
        let last = LastRemote::from_context(&ctx, &state.names);
        let tail = path.trim_start_matches('/');
        return match (&last.scheme, &last.domain) {
            (Some(scheme), Some(domain)) if !tail.is_empty() => {
                forward.redirect_to_last_remote(&ctx, scheme, domain, tail)
            }
            _ => crate::text_response(http::StatusCode::NOT_FOUND, "Not found"),
        };
    };
    let Some(tail) = tail.strip_prefix('/').filter(|rest| !rest.is_empty()) else {
        return crate::text_response(http::StatusCode::NOT_FOUND, "Not found");
    };
    let (tail, direct) = match tail.strip_prefix("direct/") {
        Some(rest) => (rest, true),
        None => (tail, false),
    };
    if direct {
        forward.mount = format!("{prefix}/direct");
    }

    match forward.run(&mut ctx, tail, direct).await {
        Ok(response) => response,
        Err(err) => {
            if err.status().is_server_error() {
                warn!(%err, path = %path, "request failed");
            } else {
                debug!(%err, path = %path, "request refused");
            }
            err.to_response(&prefix)
        }
    }
}

struct Forward<'a> {
    state: &'a AppState,
    server: &'a ServerOrigin,
    prefix: &'a str,
    /// Where rewritten headers point back to: the prefix, or `{prefix}/direct`.
    mount: String,
    referer: Option<&'a str>,
    fetch_mode: Option<&'a str>,
}

impl Forward<'_> {
    fn names(&self) -> &Namespace {
        &self.state.names
    }

    /// `{origin}{prefix}/`, the part of a proxied URL before the remote.
    fn proxied_base(&self) -> String {
        format!("{}{}/", self.server.origin(), self.prefix)
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        tail: &str,
        direct: bool,
    ) -> Result<Response<Body>, PortalError> {
        let raw = percent_decode_str(tail).decode_utf8_lossy().into_owned();
        let requested = urlsplit::normalize(&raw).with_default_path();
        let mut last = LastRemote::from_context(ctx, self.names());
        let direct = direct || last.redirected;

        if last.scheme.is_some() && last.referrer.is_none() {
            last.referrer = self
                .referer
                .and_then(|referer| referer.strip_prefix(&self.proxied_base()))
                .map(SplitUrl::parse);
        }

        let mut target = requested.clone();
        if !direct
            && let Some(resolved) = resolve_relative(
                &requested,
                self.fetch_mode,
                last.referrer.as_ref(),
                last.domain.as_deref(),
            )
        {
            target = resolved.with_default_path();
        }

        if target.scheme.is_empty()
            && let (Some(scheme), Some(domain)) = (&last.scheme, &last.domain)
        {
            return Ok(self.redirect_to_last_remote(ctx, scheme, domain, tail));
        }

        guard(&target, ctx.inbound_query.as_deref())?;

        if target != requested {
            let mut location = format!("{}{}", self.proxied_base(), target.geturl());
            if let Some(query) = ctx.inbound_query.as_deref().filter(|q| !q.is_empty()) {
                location = format!("{}{}", self.proxied_base(), target.with_query(query).geturl());
            }
            debug!(requested = %requested.geturl(), location = %location, "resolved against referrer");
            return Ok(redirect_response(&location));
        }

        let prepared = PreparedRequest::from_context(ctx, &target)?;
        let remote_url = prepared.url.clone();
        let remote = self
            .state
            .pipeline()
            .send(prepared, RedirectPolicy::Manual)
            .await?;

        let server_origin = self.server.origin();
        let vantage = Vantage {
            server_origin: &server_origin,
            server_host: &self.server.hostname,
            prefix: &self.mount,
            requester_origin: None,
            mode: None,
        };
        let mut response = masquerade(remote, Toggles::rewriting(), &vantage)?.response;

        if !direct {
            self.remember(&mut response, &target, &remote_url);
        }
        Ok(response)
    }

    /// A relative request with no referrer to resolve against: assume the last remote.
    fn redirect_to_last_remote(
        &self,
        ctx: &RequestContext,
        scheme: &str,
        domain: &str,
        tail: &str,
    ) -> Response<Body> {
        let mut path = format!("{}/{scheme}://{domain}/{tail}", self.prefix);
        let cookie_path = path.clone();
        if let Some(query) = ctx.inbound_query.as_deref().filter(|q| !q.is_empty()) {
            path.push('?');
            path.push_str(query);
        }
        debug!(location = %path, "redirecting to last remote");
        let mut response = redirect_response(&path);
        self.set_cookie(&mut response, "redirect", "true", &cookie_path, REDIRECT_MARKER_TTL);
        response
    }

    fn remember(&self, response: &mut Response<Body>, target: &SplitUrl, remote_url: &Url) {
        let root = if self.prefix.is_empty() {
            "/".to_string()
        } else {
            self.prefix.to_string()
        };
        self.set_cookie(response, "scheme", &target.scheme, &root, REMOTE_COOKIE_TTL);
        self.set_cookie(response, "domain", &target.netloc, &root, REMOTE_COOKIE_TTL);

        let directory = remote_url
            .join(".")
            .map(|u| u.to_string())
            .unwrap_or_else(|_| remote_url.to_string());
        let path = format!("{}/{directory}", self.prefix);
        self.set_cookie(response, "referrer", &target.geturl(), &path, REMOTE_COOKIE_TTL);
    }

    fn set_cookie(
        &self,
        response: &mut Response<Body>,
        kind: &str,
        value: &str,
        path: &str,
        max_age: Duration,
    ) {
        let cookie = Cookie::build((
            self.names().remote_cookie(kind),
            utf8_percent_encode(value, COOKIE_VALUE).to_string(),
        ))
        .path(path.to_string())
        .max_age(max_age)
        .build();
        if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
}
