//! Worker-assisted proxy.
//!
//! An installed service worker relays every fetch to `{prefix}/{remote}` and declares what it
//! knows (page origin, referrer, fetch mode, preferences) in the `X-{appname}` header. The
//! server forwards bytes untouched and only adjusts headers and cookies, gated by the
//! client's feature mask.

use std::{collections::BTreeMap, net::SocketAddr};

use chrono::Duration;
use cookie::Cookie;
use http::{HeaderValue, Method, Request, Response, StatusCode, header};
use hyper::Body;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::{
    AppState, ServerOrigin,
    context::{ClientDeclaration, OriginConcealment, RequestContext},
    empty_response,
    error::{PortalError, html_response},
    features::{FeatureCatalog, INJECTION_DOM_HIJACK},
    guard::guard,
    masquerade::{Toggles, Vantage, masquerade},
    namespace::Namespace,
    negotiator::{Negotiation, WorkerState, negotiate},
    pages,
    pipeline::{PreparedRequest, RedirectPolicy},
    prefs::{COOKIE_MAX_AGE, Preferences},
    redirect_response,
    signals::{self, Signals},
    tokens::{Claims, TOKEN_SEPARATOR, TokenService},
    urlsplit,
};

const TOKEN_TTL_HOURS: i64 = 12;
const MAX_FORM_BYTES: u64 = 64 * 1024;

/// Path characters `continue=` keeps readable.
const CONTINUE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Proxy routes the worker relays to the proxy itself, by client-side handler.
///
/// `restricted` routes only accept top-level navigations typed by the user; `disambiguate`
/// is a virtual route the worker answers with the multiple-choices page.
const CLIENT_HANDLERS: &[(&str, &str)] = &[
    ("/init", "passthrough"),
    ("/settings", "restricted"),
    ("/~multiple-choices", "passthrough"),
    ("/~deflect", "passthrough"),
    ("/~reset", "passthrough"),
    ("/~uninstall", "passthrough"),
    ("/~disambiguate", "disambiguate"),
];

fn client_handlers() -> Value {
    CLIENT_HANDLERS
        .iter()
        .map(|(path, handler)| {
            let rule = json!({
                "handler": handler,
                "test": {
                    "mode": { "navigate": 1 },
                    "method": { "GET": 1, "POST": 1 },
                    "referrer": { "": 1 },
                },
            });
            (path.to_string(), rule)
        })
        .collect::<Map<String, Value>>()
        .into()
}

/// Per-request worker state: what the client declared plus what goes back to it.
pub struct WorkerSession<'a> {
    names: &'a Namespace,
    pub declaration: ClientDeclaration,
    pub prefs: Preferences,
    pub signals: Signals,
    tokens: Vec<String>,
    write_tokens: bool,
}

impl<'a> WorkerSession<'a> {
    pub fn new(
        names: &'a Namespace,
        catalog: &'static FeatureCatalog,
        declaration: ClientDeclaration,
        own_cookies: &BTreeMap<String, String>,
    ) -> Self {
        let prefs = Preferences::resolve(catalog, &declaration, own_cookies, names);
        let mut signals = Signals::new(declaration.signals.clone());
        if prefs.nopref() {
            signals.incoming.insert(signals::NOPREF.to_string(), json!(1));
        }
        Self {
            names,
            declaration,
            prefs,
            signals,
            tokens: Vec::new(),
            // A client without an auth cookie gets an empty one.
            write_tokens: !own_cookies.contains_key(&names.auth_cookie()),
        }
    }

    pub fn issue_token(&mut self, service: &TokenService, claims: &Claims) -> String {
        let token = service.issue(claims);
        self.tokens.push(token.clone());
        self.write_tokens = true;
        token
    }

    /// Carries previously issued tokens over into the next auth cookie.
    pub fn keep_tokens(&mut self, tokens: impl IntoIterator<Item = String>) {
        self.tokens.extend(tokens);
    }

    pub fn clear_tokens(&mut self) {
        self.tokens.clear();
        self.write_tokens = true;
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Writes the cookies and signal header every worker response carries.
    pub fn finish(&self, response: &mut Response<Body>) {
        let mut cookies = vec![self.prefs.prefs_cookie(self.names)];
        if self.write_tokens {
            let joined = self
                .tokens
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(&TOKEN_SEPARATOR.to_string());
            cookies.push(
                Cookie::build((self.names.auth_cookie(), joined))
                    .path("/")
                    .secure(true)
                    .http_only(true)
                    .max_age(COOKIE_MAX_AGE)
                    .build(),
            );
        }
        if self.declaration.mode() == Some("navigate") {
            cookies.push(self.prefs.prefs2_cookie(self.names));
        }

        let headers = response.headers_mut();
        for cookie in cookies {
            if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
                headers.append(header::SET_COOKIE, value);
            }
        }
        if let Some(value) = self.signals.header_value()
            && let Ok(name) = header::HeaderName::from_bytes(self.names.signal_header().as_bytes())
        {
            headers.insert(name, value);
        }
    }
}

pub async fn handle(
    state: &AppState,
    server: &ServerOrigin,
    client_addr: SocketAddr,
    req: Request<Body>,
) -> Response<Body> {
    let names = &state.names;
    let catalog =
        FeatureCatalog::for_protocol(state.config.worker_version).unwrap_or(FeatureCatalog::current());
    let service_worker_script = req
        .headers()
        .get("service-worker")
        .is_some_and(|v| v.as_bytes() == b"script");
    let accepts_html = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/html"));

    let mut ctx = RequestContext::build(req, &names.appname);
    let declaration = ctx.declaration.clone();
    let mut session = WorkerSession::new(names, catalog, declaration, &ctx.own_cookies);
    let route = Route {
        state,
        server,
        client_ip: client_addr.ip().to_string(),
        accepts_html,
    };
    let path = ctx.inbound_path.clone();
    let prefix = state.config.prefix.as_str();

    let result = match path.as_str() {
        "/service-worker.js" => route.service_worker(&session, service_worker_script),
        "/init" => Ok(route.init(&ctx)),
        "/settings" => match ctx.method {
            Method::OPTIONS => Ok(route.settings_options()),
            Method::GET | Method::HEAD => route.settings(&ctx, &mut session),
            Method::POST => route.save_settings(&mut ctx, &mut session).await,
            _ => Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED)),
        },
        "/~uninstall" => Ok(html_response(StatusCode::OK, pages::uninstall_page())),
        "/~reset" => Ok(reset_response()),
        "/~deflect" => route.deflect(&ctx),
        "/~multiple-choices" => route.multiple_choices(&mut ctx, &session).await,
        _ => match strip_mount(&path, prefix) {
            Some(tail) if !tail.is_empty() => match tail.strip_prefix("direct/") {
                Some(remote) => {
                    let mount = format!("{prefix}/direct");
                    route
                        .forward(&mut ctx, &mut session, remote, &mount, false)
                        .await
                }
                None => route.forward(&mut ctx, &mut session, tail, prefix, true).await,
            },
            _ => Ok(crate::text_response(StatusCode::NOT_FOUND, "Not found")),
        },
    };

    let mut response = result.unwrap_or_else(|err| {
        if err.status().is_server_error() {
            warn!(%err, path = %path, "request failed");
        } else {
            debug!(%err, path = %path, "request refused");
        }
        err.to_response(prefix)
    });
    session.finish(&mut response);
    response
}

/// `/proxy/https://a.test/` with mount `/proxy` yields `https://a.test/`.
fn strip_mount<'p>(path: &'p str, prefix: &str) -> Option<&'p str> {
    path.strip_prefix(prefix)?.strip_prefix('/')
}

fn reset_response() -> Response<Body> {
    let mut response = empty_response(StatusCode::NO_CONTENT);
    response.headers_mut().insert(
        "clear-site-data",
        HeaderValue::from_static("\"cache\", \"cookies\", \"storage\""),
    );
    response
}

fn no_referrer(mut response: Response<Body>) -> Response<Body> {
    response
        .headers_mut()
        .insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    response
}

fn ttl() -> Duration {
    Duration::hours(TOKEN_TTL_HOURS)
}

struct Route<'a> {
    state: &'a AppState,
    server: &'a ServerOrigin,
    client_ip: String,
    accepts_html: bool,
}

impl Route<'_> {
    fn version(&self) -> u32 {
        self.state.config.worker_version
    }

    fn service_worker(
        &self,
        session: &WorkerSession<'_>,
        requested_as_script: bool,
    ) -> Result<Response<Body>, PortalError> {
        if !requested_as_script {
            return Err(PortalError::Forbidden);
        }
        let passthrough = &self.state.config.passthrough;
        let flags = |items: &std::collections::BTreeSet<String>| -> Map<String, Value> {
            items.iter().map(|item| (item.clone(), json!(1))).collect()
        };
        let catalog = session.prefs.catalog();
        let settings = json!({
            "prefs": catalog.client_prefs(session.prefs.mask()),
            "id": session
                .declaration
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            "version": self.version(),
            "signals": session.signals.incoming,
            "origin": self.server.origin(),
            "prefix": self.state.config.prefix,
            "appname": self.state.names.appname,
            "passthrough": {
                "domains": flags(&passthrough.domains),
                "urls": flags(&passthrough.urls),
            },
            "endpoints": client_handlers(),
            "vendor": catalog.requires_bundle(session.prefs.mask()),
        });

        let mut response = Response::new(Body::from(pages::service_worker_script(&settings)));
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/javascript"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert("service-worker-allowed", HeaderValue::from_static("/"));
        Ok(response)
    }

    fn init(&self, ctx: &RequestContext) -> Response<Body> {
        let continue_to = ctx
            .params()
            .into_iter()
            .find(|(key, _)| key == "continue")
            .map(|(_, value)| value)
            .filter(|value| value.starts_with('/') && !value.starts_with("//"));
        no_referrer(html_response(
            StatusCode::OK,
            pages::init_page(continue_to.as_deref()),
        ))
    }

    fn settings_options(&self) -> Response<Body> {
        let mut response = empty_response(StatusCode::NO_CONTENT);
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, HEAD, OPTIONS"),
        );
        let allowed = format!("X-{}, Cookie", capitalize(&self.state.names.appname));
        if let Ok(value) = HeaderValue::from_str(&allowed) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
        }
        response
    }

    /// Settings pages need an installed worker that has told us who it is.
    fn check_worker(
        &self,
        ctx: &RequestContext,
        session: &mut WorkerSession<'_>,
    ) -> Result<Option<Response<Body>>, PortalError> {
        if !session.declaration.is_valid() && self.accepts_html {
            let full = match ctx.inbound_query.as_deref().filter(|q| !q.is_empty()) {
                Some(query) => format!("{}?{query}", ctx.inbound_path),
                None => ctx.inbound_path.clone(),
            };
            let location = format!("/init?continue={}", utf8_percent_encode(&full, CONTINUE_SET));
            return Ok(Some(no_referrer(redirect_response(&location))));
        }
        if session.declaration.id.as_deref().is_none_or(str::is_empty) {
            return Err(PortalError::Forbidden);
        }
        if !session.declaration.is_current(self.version()) {
            session.signals.raise(signals::REVALIDATE_ON_NEXT_REQUEST);
        }
        Ok(None)
    }

    fn settings(
        &self,
        ctx: &RequestContext,
        session: &mut WorkerSession<'_>,
    ) -> Result<Response<Body>, PortalError> {
        if let Some(redirect) = self.check_worker(ctx, session)? {
            return Ok(redirect);
        }
        let id = session.declaration.id.clone().unwrap_or_default();
        let tokens = &self.state.tokens;
        let mask = session.prefs.mask();
        let csrf = tokens.issue(&tokens.claims(id, "csrf", self.version(), mask, ttl()));

        let catalog = session.prefs.catalog();
        let page = pages::settings_page(
            &catalog.sections(mask, &self.server.origin()),
            &csrf,
            &catalog.dependency_dicts(),
        );
        let nochange = tokens.claims(&self.client_ip, "nochange", self.version(), mask, ttl());
        session.issue_token(tokens, &nochange);
        Ok(html_response(StatusCode::OK, page))
    }

    async fn save_settings(
        &self,
        ctx: &mut RequestContext,
        session: &mut WorkerSession<'_>,
    ) -> Result<Response<Body>, PortalError> {
        if let Some(redirect) = self.check_worker(ctx, session)? {
            return Ok(redirect);
        }
        let tokens = &self.state.tokens;
        let existing = ctx
            .own_cookie(&self.state.names.auth_cookie())
            .unwrap_or_default()
            .to_string();
        let authorized = tokens.verify_all(&existing).into_iter().any(|claims| {
            claims.sub == self.client_ip
                && claims.privilege == "nochange"
                && claims.version == self.version()
        });
        if !authorized {
            return Err(PortalError::SettingsNotSaved);
        }

        let mut form = read_form(ctx).await?;
        let csrf = take_field(&mut form, "csrf_token");
        let id = session.declaration.id.clone().unwrap_or_default();
        let csrf_ok = csrf
            .and_then(|token| tokens.verify(&token).ok())
            .is_some_and(|claims| claims.privilege == "csrf" && claims.sub == id);
        if !csrf_ok {
            session.clear_tokens();
            return Err(PortalError::Forbidden);
        }

        let mut extra = Map::new();
        if take_field(&mut form, "action").as_deref() == Some("reset") {
            session.prefs.reset();
            let mut reset = Map::new();
            reset.insert(signals::NOPREF.to_string(), json!(1));
            extra.insert("signals".to_string(), Value::Object(reset));
        } else {
            let catalog = session.prefs.catalog();
            let enabled = form
                .iter()
                .filter(|(_, value)| value.trim().parse::<u64>().is_ok_and(|v| v != 0))
                .map(|(name, _)| name.as_str());
            session.prefs.set_mask(catalog.prefs_to_bitmask(enabled));
        }
        debug!(id = %id, mask = session.prefs.mask(), "settings saved");

        let mut update = tokens.claims(
            &self.client_ip,
            "update",
            self.version(),
            session.prefs.mask(),
            ttl(),
        );
        update.extra = extra;
        session.issue_token(tokens, &update);
        session.keep_tokens(
            existing
                .split(TOKEN_SEPARATOR)
                .filter(|token| tokens.verify(token).is_ok())
                .map(str::to_string),
        );
        Ok(html_response(StatusCode::OK, pages::update_page()))
    }

    fn deflect(&self, ctx: &RequestContext) -> Result<Response<Body>, PortalError> {
        let to = ctx
            .params()
            .into_iter()
            .find(|(key, _)| key == "to")
            .map(|(_, value)| value)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| PortalError::BadRequest("missing `to` parameter".into()))?;
        Ok(no_referrer(redirect_response(&to)))
    }

    async fn multiple_choices(
        &self,
        ctx: &mut RequestContext,
        session: &WorkerSession<'_>,
    ) -> Result<Response<Body>, PortalError> {
        let info = match ctx.body.take() {
            Some(body) => {
                let bytes = hyper::body::to_bytes(body)
                    .await
                    .map_err(|err| PortalError::BadRequest(format!("unreadable body: {err}")))?;
                serde_json::from_slice::<Value>(&bytes).unwrap_or(Value::Null)
            }
            None => session
                .signals
                .incoming
                .get("disambiguate")
                .cloned()
                .unwrap_or(Value::Null),
        };
        let requested = info
            .get("requested")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut candidates = BTreeMap::new();
        for candidate in info
            .get("candidates")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let dest = candidate
                .get("dest")
                .and_then(Value::as_str)
                .ok_or_else(|| PortalError::BadRequest("candidate without `dest`".into()))?;
            let href = format!("{}/{dest}", self.state.config.prefix);
            candidates.insert(dest.to_string(), href);
        }
        let candidates: Vec<(String, String)> = candidates.into_iter().collect();
        let page = pages::multiple_choices_page(&requested, &candidates);
        Ok(no_referrer(html_response(StatusCode::MULTIPLE_CHOICES, page)))
    }

    /// `{mount}/{remote}`: canonicalise, negotiate when `negotiated`, then deliver.
    async fn forward(
        &self,
        ctx: &mut RequestContext,
        session: &mut WorkerSession<'_>,
        tail: &str,
        mount: &str,
        negotiated: bool,
    ) -> Result<Response<Body>, PortalError> {
        let requested = percent_decode_str(tail).decode_utf8_lossy().into_owned();
        let origin_override = ctx.origin_override();
        let mut target =
            urlsplit::normalize_against(&requested, origin_override.as_deref()).with_default_path();
        guard(&target, ctx.inbound_query.as_deref())?;

        let canonical = target.geturl();
        if canonical != requested {
            let location = match Some(ctx.query.as_str()).filter(|q| !q.is_empty()) {
                Some(query) => target.clone().with_query(query).geturl(),
                None => canonical,
            };
            let location = format!("{}{mount}/{location}", self.server.origin());
            debug!(requested = %requested, location = %location, "redirecting to canonical URL");
            return Ok(redirect_response(&location));
        }

        let remote_url = target.geturl();
        let concealment = session
            .declaration
            .origin_domain()
            .and_then(|domain| OriginConcealment::new(&self.server.authority, &domain));
        if let Some(concealment) = &concealment {
            ctx.conceal(concealment, &mut target);
        }
        let prepared = PreparedRequest::from_context(ctx, &target)?;

        if negotiated {
            let worker = WorkerState::of(&session.declaration, self.version());
            if matches!(worker, WorkerState::Outdated { .. }) {
                session.signals.raise(signals::REVALIDATE_ON_NEXT_REQUEST);
            }
            let probe = (worker == WorkerState::NoWorkerDeclared && prepared.method == Method::GET)
                .then(|| prepared.try_clone())
                .flatten();
            let pipeline = self.state.pipeline();
            if negotiate(worker, &pipeline, probe).await? == Negotiation::Bootstrap {
                let proxied = format!("{}{mount}/{remote_url}", self.server.origin());
                return Ok(html_response(
                    StatusCode::OK,
                    pages::install_page(&remote_url, &proxied),
                ));
            }
        }

        self.deliver(prepared, session).await
    }

    async fn deliver(
        &self,
        prepared: PreparedRequest,
        session: &mut WorkerSession<'_>,
    ) -> Result<Response<Body>, PortalError> {
        let remote = self
            .state
            .pipeline()
            .send(prepared, RedirectPolicy::Manual)
            .await?;

        let server_origin = self.server.origin();
        let requester_origin = requester_origin(&session.declaration);
        let vantage = Vantage {
            server_origin: &server_origin,
            server_host: &self.server.hostname,
            prefix: &self.state.config.prefix,
            requester_origin: requester_origin.as_deref(),
            mode: session.declaration.mode(),
        };
        let toggles = Toggles::from_prefs(&session.prefs);
        let masqueraded = masquerade(remote, toggles, &vantage)?;

        if let Some(policies) = &masqueraded.csp
            && session.prefs.enabled(INJECTION_DOM_HIJACK)
            && !uses_strict_dynamic(policies)
        {
            session.signals.raise(signals::HIJACK);
        }
        Ok(masqueraded.response)
    }
}

fn requester_origin(declaration: &ClientDeclaration) -> Option<String> {
    declaration
        .origin
        .as_deref()
        .filter(|origin| !origin.is_empty())
        .and_then(urlsplit::origin_of)
        .or_else(|| declaration.referrer.as_deref().and_then(urlsplit::origin_of))
}

fn uses_strict_dynamic(policies: &BTreeMap<String, Vec<String>>) -> bool {
    ["script-src", "script-src-elem"].iter().any(|name| {
        policies
            .get(*name)
            .is_some_and(|tokens| tokens.iter().any(|t| t.eq_ignore_ascii_case("'strict-dynamic'")))
    })
}

async fn read_form(ctx: &mut RequestContext) -> Result<Vec<(String, String)>, PortalError> {
    let declared = ctx
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    if declared > MAX_FORM_BYTES {
        return Err(PortalError::BadRequest("settings form is too large".into()));
    }
    let Some(body) = ctx.body.take() else {
        return Ok(Vec::new());
    };
    let bytes = hyper::body::to_bytes(body)
        .await
        .map_err(|err| PortalError::BadRequest(format!("unreadable form: {err}")))?;
    if bytes.len() as u64 > MAX_FORM_BYTES {
        return Err(PortalError::BadRequest("settings form is too large".into()));
    }
    Ok(form_urlencoded::parse(&bytes).into_owned().collect())
}

fn take_field(form: &mut Vec<(String, String)>, name: &str) -> Option<String> {
    let idx = form.iter().position(|(key, _)| key == name)?;
    Some(form.remove(idx).1)
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeclaredPrefs;

    fn cookies(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn set_cookies(response: &Response<Body>) -> Vec<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn fresh_clients_get_defaults_and_an_empty_auth_cookie() {
        let names = Namespace::default();
        let session = WorkerSession::new(
            &names,
            FeatureCatalog::current(),
            ClientDeclaration::default(),
            &BTreeMap::new(),
        );
        assert!(session.signals.incoming.contains_key(signals::NOPREF));

        let mut response = empty_response(StatusCode::OK);
        session.finish(&mut response);
        let written = set_cookies(&response);
        assert!(written.iter().any(|c| c.starts_with("portal5prefs=;")));
        assert!(written.iter().any(|c| c.starts_with("portal5auth=;")));
        assert!(!written.iter().any(|c| c.starts_with("portal5prefs2=")));
        assert_eq!(response.headers()["x-portal5-signal"], "{}");
    }

    #[test]
    fn navigations_rewrite_prefs2_and_signals_are_reported() {
        let names = Namespace::default();
        let declaration = ClientDeclaration {
            mode: Some("navigate".into()),
            prefs: Some(DeclaredPrefs::Mask(0b110)),
            ..Default::default()
        };
        let mut session = WorkerSession::new(
            &names,
            FeatureCatalog::current(),
            declaration,
            &cookies(&[("portal5auth", "")]),
        );
        session.signals.raise(signals::HIJACK);

        let mut response = empty_response(StatusCode::OK);
        session.finish(&mut response);
        let written = set_cookies(&response);
        assert!(written.iter().any(|c| c.starts_with("portal5prefs=6;")));
        assert!(written.iter().any(|c| c.starts_with("portal5prefs2=")));
        assert!(!written.iter().any(|c| c.starts_with("portal5auth=")));
        assert_eq!(response.headers()["x-portal5-signal"], r#"{"hijack":1}"#);
    }

    #[test]
    fn issued_tokens_are_joined_into_one_cookie() {
        let names = Namespace::default();
        let service = TokenService::new("k").unwrap();
        let mut session = WorkerSession::new(
            &names,
            FeatureCatalog::current(),
            ClientDeclaration::default(),
            &cookies(&[("portal5auth", "")]),
        );
        let claims = service.claims("127.0.0.1", "nochange", 2, 0, ttl());
        let first = session.issue_token(&service, &claims);
        session.keep_tokens(["older".to_string()]);
        assert_eq!(session.tokens(), [first.clone(), "older".to_string()]);

        let mut response = empty_response(StatusCode::OK);
        session.finish(&mut response);
        let auth = set_cookies(&response)
            .into_iter()
            .find(|c| c.starts_with("portal5auth="))
            .unwrap();
        assert!(auth.starts_with(&format!("portal5auth={first}|older;")));
        assert!(auth.contains("HttpOnly"));
    }

    #[test]
    fn settings_are_restricted_to_typed_navigations() {
        let handlers = client_handlers();
        assert_eq!(handlers["/settings"]["handler"], "restricted");
        assert_eq!(handlers["/init"]["handler"], "passthrough");
        assert_eq!(handlers["/~disambiguate"]["handler"], "disambiguate");
        let test = &handlers["/settings"]["test"];
        assert_eq!(test["mode"], json!({ "navigate": 1 }));
        assert_eq!(test["method"], json!({ "GET": 1, "POST": 1 }));
        assert_eq!(test["referrer"], json!({ "": 1 }));
    }

    #[test]
    fn mounts_are_stripped_exactly() {
        assert_eq!(strip_mount("/https://a.test/", ""), Some("https://a.test/"));
        assert_eq!(strip_mount("/proxy/a.test", "/proxy"), Some("a.test"));
        assert_eq!(strip_mount("/proxyx/a.test", "/proxy"), None);
        assert_eq!(strip_mount("/proxy", "/proxy"), None);
    }

    #[test]
    fn strict_dynamic_suppresses_hijacking() {
        let mut policies = BTreeMap::new();
        policies.insert("script-src".to_string(), vec!["'strict-dynamic'".to_string()]);
        assert!(uses_strict_dynamic(&policies));
        assert!(!uses_strict_dynamic(&BTreeMap::new()));
    }

    #[test]
    fn requester_origin_prefers_the_declared_origin() {
        let declaration = ClientDeclaration {
            origin: Some("https://a.test".into()),
            referrer: Some("https://b.test/page".into()),
            ..Default::default()
        };
        assert_eq!(requester_origin(&declaration).as_deref(), Some("https://a.test"));
        let declaration = ClientDeclaration {
            origin: Some(String::new()),
            referrer: Some("https://b.test/page".into()),
            ..Default::default()
        };
        assert_eq!(requester_origin(&declaration).as_deref(), Some("https://b.test"));
    }
}
