pub mod bitmask;
pub mod config;
pub mod context;
pub mod csp;
pub mod error;
pub mod features;
pub mod filters;
pub mod guard;
pub mod masquerade;
pub mod namespace;
pub mod negotiator;
pub mod pages;
pub mod pipeline;
pub mod portal3;
pub mod portal5;
pub mod prefs;
pub mod signals;
pub mod tokens;
pub mod urlsplit;

use std::{net::SocketAddr, sync::Arc};

use chrono::Utc;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use http::{HeaderValue, Request, Response, StatusCode, header};
use hyper::{
    Body,
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
};
use serde_json::{Value, json};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{error, info};

pub use config::{PassthroughConfig, ProxyConfig, ProxyMode};
pub use error::{PortalError, ProxyError};
pub use filters::{RequestFilter, SelfProtectRule};

use namespace::Namespace;
use pipeline::{HttpClient, Pipeline, build_client};
use tokens::TokenService;

/// Bytes a `Location` value cannot carry verbatim.
const LOCATION_UNSAFE: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'`');

pub struct ProxyHandle {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

/// Everything a request handler reads. Built once, never mutated while serving.
pub struct AppState {
    pub(crate) config: ProxyConfig,
    pub(crate) client: HttpClient,
    pub(crate) filter: RequestFilter,
    pub(crate) tokens: TokenService,
    pub(crate) names: Namespace,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        config.validate()?;
        let filter = RequestFilter::from_specs(&config.filters)?;
        let tokens = match &config.secret_key {
            Some(key) => TokenService::new(key),
            None => TokenService::ephemeral(),
        }
        .map_err(|err| ProxyError::Config(err.to_string()))?;
        Ok(Self {
            client: build_client(config.connect_timeout()),
            names: Namespace::new(config.appname.clone()),
            filter,
            tokens,
            config,
        })
    }

    /// Registers a programmatic self-protect rule next to the configured ones.
    pub fn with_rule(mut self, rule: SelfProtectRule) -> Self {
        self.filter.add(rule);
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub(crate) fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(&self.client, &self.filter, self.config.response_timeout())
    }
}

/// The proxy's own origin as the browser addressed it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerOrigin {
    pub scheme: String,
    /// `host[:port]`.
    pub authority: String,
    pub hostname: String,
}

impl ServerOrigin {
    pub fn from_request(req: &Request<Body>, default_scheme: &str) -> Option<Self> {
        let authority = extract_authority(req)?;
        let scheme = req
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_ascii_lowercase())
            .filter(|v| v == "http" || v == "https")
            .unwrap_or_else(|| default_scheme.to_string());
        Some(Self {
            scheme,
            hostname: normalize_host(&authority),
            authority,
        })
    }

    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.authority)
    }
}

pub async fn spawn_proxy(config: ProxyConfig) -> Result<ProxyHandle, ProxyError> {
    serve(AppState::new(config)?).await
}

pub async fn serve(state: AppState) -> Result<ProxyHandle, ProxyError> {
    let listener = std::net::TcpListener::bind(state.config.bind_addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        mode = ?state.config.mode,
        prefix = %state.config.prefix,
        rules = state.filter.len(),
        "portal listening"
    );

    let state = Arc::new(state);
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = state.clone();
        let client_addr = conn.remote_addr();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, hyper::Error>(handle_request(state, client_addr, req).await) }
            }))
        }
    });

    let server = hyper::Server::from_tcp(listener)?.serve(make_svc);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let graceful = server.with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    let task = tokio::spawn(async move {
        if let Err(err) = graceful.await {
            error!(%err, "proxy server error");
        }
    });

    Ok(ProxyHandle {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn handle_request(
    state: Arc<AppState>,
    client_addr: SocketAddr,
    req: Request<Body>,
) -> Response<Body> {
    if req.uri().path() == "/health" {
        return json_response(
            StatusCode::OK,
            json!({
                "status": "healthy",
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
    }

    let Some(server) = ServerOrigin::from_request(&req, &state.config.public_scheme) else {
        return text_response(StatusCode::BAD_REQUEST, "Missing host header for proxied request");
    };

    match state.config.mode {
        ProxyMode::Worker => portal5::handle(&state, &server, client_addr, req).await,
        ProxyMode::Rewrite => portal3::handle(&state, &server, req).await,
    }
}

pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub(crate) fn json_response(status: StatusCode, value: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub(crate) fn empty_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// 307 so the method and body survive the redirect. Non-ASCII and control characters are
/// percent-encoded; existing escapes are kept.
pub(crate) fn redirect_response(location: &str) -> Response<Body> {
    let encoded = utf8_percent_encode(location, LOCATION_UNSAFE).to_string();
    match HeaderValue::from_str(&encoded) {
        Ok(value) => {
            let mut response = empty_response(StatusCode::TEMPORARY_REDIRECT);
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => PortalError::BadRequest(format!("cannot redirect to {location}")).into_response(),
    }
}

fn extract_authority(req: &Request<Body>) -> Option<String> {
    let headers = req.headers();
    if let Some(forwarded) = headers
        .get("x-forwarded-host")
        .and_then(|value| value.to_str().ok())
    {
        return Some(forwarded.split(',').next().unwrap_or(forwarded).trim().to_ascii_lowercase());
    }

    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| host.trim().to_ascii_lowercase())
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_ascii_lowercase()))
        .filter(|host| !host.is_empty())
}

fn normalize_host(value: &str) -> String {
    let mut host = value.to_ascii_lowercase();
    if host.starts_with('[') {
        if let Some(end) = host.find(']') {
            host.truncate(end + 1);
        }
        return host;
    }
    if let Some(idx) = host.rfind(':')
        && host[idx + 1..].chars().all(|c| c.is_ascii_digit())
    {
        host.truncate(idx);
    }
    host
}
