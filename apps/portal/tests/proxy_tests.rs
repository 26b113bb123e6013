use std::{
    io::{Read, Write},
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use hyper::{
    Body, HeaderMap, Method as HyperMethod, Request, Response, Server, StatusCode,
    header::HeaderValue,
    service::{make_service_fn, service_fn},
};
use portal::{AppState, ProxyConfig, ProxyHandle, ProxyMode, SelfProtectRule, serve};
use reqwest::Method;
use tokio::{sync::oneshot, task::JoinHandle};

const CURRENT_WORKER: &str = r#"{"version":2,"id":"client-1"}"#;

struct TestProxy {
    addr: SocketAddr,
    handle: Option<ProxyHandle>,
    client: reqwest::Client,
}

impl TestProxy {
    async fn spawn(configure: impl FnOnce(&mut ProxyConfig)) -> Self {
        Self::spawn_with_rules(configure, Vec::new()).await
    }

    async fn spawn_with_rules(
        configure: impl FnOnce(&mut ProxyConfig),
        rules: Vec<SelfProtectRule>,
    ) -> Self {
        let mut config = ProxyConfig {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            ..Default::default()
        };
        configure(&mut config);

        let mut state = AppState::new(config).expect("valid config");
        for rule in rules {
            state = state.with_rule(rule);
        }
        let handle = serve(state).await.expect("failed to start proxy");

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(5))
            .build()
            .expect("client");

        Self {
            addr: handle.addr,
            handle: Some(handle),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn origin(&self) -> String {
        format!("http://{}", self.addr)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
    ) -> reqwest::Response {
        let mut request = self.client.request(method, self.url(path));
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        request.send().await.expect("request")
    }

    async fn get(&self, path: &str, headers: &[(&str, &str)]) -> reqwest::Response {
        self.request(Method::GET, path, headers).await
    }

    async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
    }
}

type Handler = Arc<dyn Fn(Request<Body>) -> Response<Body> + Send + Sync + 'static>;

struct TestHttpBackend {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestHttpBackend {
    async fn serve(handler: Handler) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .expect("bind backend");
        listener.set_nonblocking(true).expect("set nonblocking");
        let addr = listener.local_addr().expect("local addr");

        let make_svc = make_service_fn(move |_conn| {
            let handler = handler.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                    let handler = handler.clone();
                    async move { Ok::<_, hyper::Error>((handler)(req)) }
                }))
            }
        });

        let server = Server::from_tcp(listener)
            .expect("server from tcp")
            .serve(make_svc);
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let server = server.with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(err) = server.await {
                eprintln!("backend server error: {err}");
            }
        });

        Self {
            addr,
            shutdown: Some(tx),
            task,
        }
    }

    /// `http://127.0.0.1:port` followed by `path`.
    fn remote(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(body.into())
        .unwrap()
}

/// Serves `/page` as HTML and `/image.png` as PNG, recording every method it sees.
fn site(seen: Arc<Mutex<Vec<(HyperMethod, String)>>>) -> Handler {
    Arc::new(move |req: Request<Body>| {
        seen.lock()
            .unwrap()
            .push((req.method().clone(), req.uri().path().to_string()));
        match req.uri().path() {
            "/page" => respond(StatusCode::OK, "text/html; charset=utf-8", "<h1>remote page</h1>"),
            "/image.png" => respond(StatusCode::OK, "image/png", &b"\x89PNG fake"[..]),
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "missing"),
        }
    })
}

fn set_cookies(response: &reqwest::Response) -> Vec<String> {
    response
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .expect("bind");
    listener.local_addr().expect("addr").port()
}

#[tokio::test]
async fn health_reports_status() {
    let proxy = TestProxy::spawn(|_| {}).await;
    let response = proxy.get("/health", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());
    proxy.shutdown().await;
}

#[tokio::test]
async fn self_protect_rule_refuses_plain_http() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let backend = TestHttpBackend::serve(site(seen.clone())).await;
    let proxy = TestProxy::spawn_with_rules(
        |_| {},
        vec![SelfProtectRule::new("no-plaintext-http", |r| Ok(r.scheme() == "http"))],
    )
    .await;

    let response = proxy
        .get(
            &format!("/{}", backend.remote("/image.png")),
            &[("x-portal5", CURRENT_WORKER)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(response.text().await.unwrap().contains("no-plaintext-http"));
    assert!(seen.lock().unwrap().is_empty());

    // https passes the rule and fails later, at connect time.
    let response = proxy
        .get(
            &format!("/https://127.0.0.1:{}/", closed_port()),
            &[("x-portal5", CURRENT_WORKER)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn configured_rules_are_loaded() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let backend = TestHttpBackend::serve(site(seen.clone())).await;
    let proxy = TestProxy::spawn(|config| {
        let file = ProxyConfig::from_toml_str(
            r#"
            [[filters]]
            name = "no-intranet"
            description = "private addresses are off limits"
            private_network = true
            "#,
        )
        .unwrap();
        config.filters = file.filters;
    })
    .await;

    let response = proxy
        .get(
            &format!("/{}", backend.remote("/image.png")),
            &[("x-portal5", CURRENT_WORKER)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = response.text().await.unwrap();
    assert!(body.contains("no-intranet"));
    assert!(body.contains("private addresses are off limits"));

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn html_without_worker_gets_the_install_page() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let backend = TestHttpBackend::serve(site(seen.clone())).await;
    let proxy = TestProxy::spawn(|config| config.prefix = "/proxy".into()).await;

    let response = proxy
        .get(&format!("/proxy/{}", backend.remote("/page")), &[])
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.text().await.unwrap();
    assert!(body.contains("/service-worker.js"));
    assert!(!body.contains("remote page"));
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        [(HyperMethod::HEAD, "/page".to_string())]
    );

    let response = proxy
        .get(&format!("/proxy/{}", backend.remote("/image.png")), &[])
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "image/png");
    assert_eq!(&response.bytes().await.unwrap()[..], b"\x89PNG fake");

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn rejected_head_probe_falls_back_to_get() {
    let backend = TestHttpBackend::serve(Arc::new(|req: Request<Body>| {
        if req.method() == HyperMethod::HEAD {
            return respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "");
        }
        respond(StatusCode::OK, "text/html", "<p>document</p>")
    }))
    .await;
    let proxy = TestProxy::spawn(|_| {}).await;

    let response = proxy.get(&format!("/{}", backend.remote("/doc")), &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.text().await.unwrap().contains("/service-worker.js"));

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn failed_probe_proxies_the_real_response() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let backend = TestHttpBackend::serve(site(seen.clone())).await;
    let proxy = TestProxy::spawn(|_| {}).await;

    let response = proxy
        .get(&format!("/{}", backend.remote("/gone")), &[])
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.text().await.unwrap(), "missing");

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn outdated_worker_is_sent_to_the_install_page_without_contacting_the_remote() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let backend = TestHttpBackend::serve(site(seen.clone())).await;
    let proxy = TestProxy::spawn(|_| {}).await;

    let response = proxy
        .get(
            &format!("/{}", backend.remote("/image.png")),
            &[("x-portal5", r#"{"version":1}"#)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let signal = response.headers()["x-portal5-signal"].to_str().unwrap().to_string();
    assert!(signal.contains("revalidate-on-next-request"));
    assert!(response.text().await.unwrap().contains("/service-worker.js"));
    assert!(seen.lock().unwrap().is_empty());

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn missing_protocol_offers_https() {
    let proxy = TestProxy::spawn(|config| config.prefix = "/proxy".into()).await;

    let response = proxy.get("/proxy/example.com/a/b?q=1", &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response.text().await.unwrap();
    assert!(body.contains(r#"href="/proxy/https://example.com/a/b?q=1""#), "{body}");

    let response = proxy.get("/proxy/ftp://example.com/", &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.text().await.unwrap().contains("ftp"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn non_canonical_targets_are_redirected() {
    let proxy = TestProxy::spawn(|_| {}).await;

    let response = proxy.get("/http://127.0.0.1:9", &[]).await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()["location"],
        format!("{}/http://127.0.0.1:9/", proxy.origin()).as_str()
    );

    let response = proxy.get("/http:/127.0.0.1:9/x?a=1", &[]).await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()["location"],
        format!("{}/http://127.0.0.1:9/x?a=1", proxy.origin()).as_str()
    );

    proxy.shutdown().await;
}

#[tokio::test]
async fn cookies_are_rescoped_and_mismatched_cors_is_stripped() {
    let backend = TestHttpBackend::serve(Arc::new(|_req: Request<Body>| {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .header("set-cookie", "sid=1; Domain=127.0.0.1; Path=/account; HttpOnly")
            .header("set-cookie", "theme=dark")
            .header("access-control-allow-origin", "https://foo.com")
            .body(Body::from("{}"))
            .unwrap()
    }))
    .await;
    let proxy = TestProxy::spawn(|_| {}).await;

    let declaration = r#"{"version":2,"id":"client-1","mode":"cors","origin":"https://bar.com"}"#;
    let response = proxy
        .get(
            &format!("/{}", backend.remote("/account/me")),
            &[("host", "portal.example"), ("x-portal5", declaration)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("access-control-allow-origin").is_none());

    let cookies = set_cookies(&response);
    let sid = cookies.iter().find(|c| c.starts_with("sid=1")).expect("sid cookie");
    assert!(sid.contains("Domain=portal.example"), "{sid}");
    assert!(
        sid.contains(&format!("Path=/{}", backend.remote("/account"))),
        "{sid}"
    );
    assert!(sid.contains("HttpOnly"));
    let theme = cookies.iter().find(|c| c.starts_with("theme=dark")).expect("theme cookie");
    assert!(!theme.contains("Domain="));
    assert!(!theme.contains("Path="));

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn encoded_bodies_are_forwarded_untouched() {
    let plain = "compressible ".repeat(64);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(plain.as_bytes()).unwrap();
    let gzipped = encoder.finish().unwrap();

    let payload = gzipped.clone();
    let backend = TestHttpBackend::serve(Arc::new(move |_req: Request<Body>| {
        let mut response = respond(StatusCode::OK, "text/plain", payload.clone());
        response
            .headers_mut()
            .insert("content-encoding", HeaderValue::from_static("gzip"));
        response
    }))
    .await;
    let proxy = TestProxy::spawn(|_| {}).await;

    let response = proxy
        .get(
            &format!("/{}", backend.remote("/text")),
            &[("x-portal5", CURRENT_WORKER), ("accept-encoding", "gzip")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-encoding"], "gzip");
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], &gzipped[..]);

    let mut decoded = String::new();
    GzDecoder::new(&body[..]).read_to_string(&mut decoded).unwrap();
    assert_eq!(decoded, plain);

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn redirects_are_handed_back_through_the_proxy() {
    let backend = TestHttpBackend::serve(Arc::new(|_req: Request<Body>| {
        Response::builder()
            .status(StatusCode::FOUND)
            .header("location", "/next?x=1")
            .body(Body::empty())
            .unwrap()
    }))
    .await;
    let proxy = TestProxy::spawn(|_| {}).await;

    let response = proxy
        .get(
            &format!("/{}", backend.remote("/start")),
            &[("x-portal5", CURRENT_WORKER)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()["location"],
        format!("{}/{}", proxy.origin(), backend.remote("/next?x=1")).as_str()
    );

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn service_worker_script_requires_the_worker_header() {
    let proxy = TestProxy::spawn(|_| {}).await;

    let response = proxy.get("/service-worker.js", &[]).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = proxy
        .get("/service-worker.js", &[("service-worker", "script")])
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["service-worker-allowed"], "/");
    assert_eq!(response.headers()["content-type"], "application/javascript");
    let script = response.text().await.unwrap();
    assert!(script.contains(r#""version":2"#));
    assert!(script.contains(&format!(r#""origin":"{}""#, proxy.origin())));

    proxy.shutdown().await;
}

#[tokio::test]
async fn reset_clears_site_data() {
    let proxy = TestProxy::spawn(|_| {}).await;
    let response = proxy.get("/~reset", &[]).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers()["clear-site-data"],
        r#""cache", "cookies", "storage""#
    );
    proxy.shutdown().await;
}

fn csrf_token(page: &str) -> String {
    let marker = r#"name="csrf_token" value=""#;
    let start = page.find(marker).expect("csrf field") + marker.len();
    let end = page[start..].find('"').expect("end of token") + start;
    page[start..end].to_string()
}

fn cookie_value(cookies: &[String], name: &str) -> Option<String> {
    cookies.iter().find_map(|c| {
        c.strip_prefix(&format!("{name}="))
            .map(|rest| rest.split(';').next().unwrap_or_default().to_string())
    })
}

#[tokio::test]
async fn settings_round_trip() {
    let proxy = TestProxy::spawn(|_| {}).await;

    let response = proxy
        .get(
            "/settings",
            &[("x-portal5", CURRENT_WORKER), ("accept", "text/html")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let auth = cookie_value(&set_cookies(&response), "portal5auth").expect("auth cookie");
    assert!(!auth.is_empty());
    let csrf = csrf_token(&response.text().await.unwrap());

    let form = |csrf: &str| {
        format!("csrf_token={csrf}&action=save&basic_set_headers=1&security_break_csp=1&security_enforce_cors=0")
    };
    let post = |cookie: String, body: String| {
        proxy
            .client
            .post(proxy.url("/settings"))
            .header("x-portal5", CURRENT_WORKER)
            .header("content-type", "application/x-www-form-urlencoded")
            .header("cookie", cookie)
            .body(body)
            .send()
    };

    let response = post(String::new(), form(&csrf)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = post(format!("portal5auth={auth}"), form("forged")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        cookie_value(&set_cookies(&response), "portal5auth").as_deref(),
        Some("")
    );

    let response = post(format!("portal5auth={auth}"), form(&csrf)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookies = set_cookies(&response);
    // basic_set_headers (1) and security_break_csp (5).
    assert_eq!(cookie_value(&cookies, "portal5prefs").as_deref(), Some("34"));
    assert!(cookie_value(&cookies, "portal5auth").unwrap().contains(&auth));

    proxy.shutdown().await;
}

#[tokio::test]
async fn settings_without_a_worker_redirect_to_init() {
    let proxy = TestProxy::spawn(|_| {}).await;

    let response = proxy.get("/settings?tab=1", &[("accept", "text/html")]).await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(response.headers()["location"], "/init?continue=/settings%3Ftab%3D1");

    let response = proxy.get("/settings", &[("x-portal5", r#"{"version":2}"#)]).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = proxy.request(Method::OPTIONS, "/settings", &[]).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers()["access-control-allow-methods"],
        "GET, POST, HEAD, OPTIONS"
    );

    proxy.shutdown().await;
}

#[tokio::test]
async fn rewrite_mode_resolves_relative_requests() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let backend = TestHttpBackend::serve(site(seen.clone())).await;
    let proxy = TestProxy::spawn(|config| {
        config.mode = ProxyMode::Rewrite;
        config.appname = "portal3".into();
    })
    .await;

    let page = backend.remote("/dir/page");
    let response = proxy.get(&format!("/{page}"), &[]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let cookies = set_cookies(&response);
    assert_eq!(cookie_value(&cookies, "portal3-remote-scheme").as_deref(), Some("http"));
    assert_eq!(
        cookie_value(&cookies, "portal3-remote-domain"),
        Some(backend.addr.to_string())
    );
    let referrer = cookies
        .iter()
        .find(|c| c.starts_with("portal3-remote-referrer="))
        .expect("referrer cookie");
    assert!(referrer.contains(&format!("Path=/{}", backend.remote("/dir/"))), "{referrer}");

    let remembered = format!(
        "portal3-remote-scheme=http; portal3-remote-domain={}",
        backend.addr
    );
    let referer = format!("{}/{page}", proxy.origin());
    let response = proxy
        .get(
            "/static/app.js",
            &[
                ("cookie", &remembered),
                ("referer", &referer),
                ("sec-fetch-mode", "no-cors"),
            ],
        )
        .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()["location"],
        format!("{}/{}", proxy.origin(), backend.remote("/dir/static/app.js")).as_str()
    );

    let response = proxy
        .get("/static/app.js", &[("cookie", &remembered)])
        .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = format!("/{}", backend.remote("/static/app.js"));
    assert_eq!(response.headers()["location"], location.as_str());
    assert_eq!(
        cookie_value(&set_cookies(&response), "portal3-remote-redirect").as_deref(),
        Some("true")
    );

    proxy.shutdown().await;
    backend.shutdown().await;
}

/// Answers every request with `response()`, keeping the headers of the last request.
fn recording(
    seen: Arc<Mutex<Option<HeaderMap>>>,
    response: impl Fn() -> Response<Body> + Send + Sync + 'static,
) -> Handler {
    Arc::new(move |req: Request<Body>| {
        *seen.lock().unwrap() = Some(req.headers().clone());
        response()
    })
}

fn redirect_to(location: &'static str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header("location", location)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn same_site_redirects_keep_the_remote_host() {
    let seen = Arc::new(Mutex::new(None));
    let backend = TestHttpBackend::serve(recording(seen, || redirect_to("/home"))).await;
    let proxy = TestProxy::spawn(|_| {}).await;

    let declaration = format!(
        r#"{{"version":2,"id":"client-1","origin":"{}"}}"#,
        backend.remote("")
    );
    let response = proxy
        .get(
            &format!("/{}", backend.remote("/login")),
            &[("x-portal5", &declaration)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()["location"],
        format!("{}/{}", proxy.origin(), backend.remote("/home")).as_str()
    );

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn proxy_host_is_concealed_outbound_only() {
    let seen = Arc::new(Mutex::new(None));
    let backend = TestHttpBackend::serve(recording(seen.clone(), || {
        let mut response = redirect_to("https://bar.com/account");
        response
            .headers_mut()
            .insert("access-control-allow-origin", HeaderValue::from_static("*"));
        response
    }))
    .await;
    let proxy = TestProxy::spawn(|_| {}).await;

    let declaration = r#"{"version":2,"id":"client-1","mode":"cors","origin":"https://bar.com","referrer":"https://bar.com/page"}"#;
    let response = proxy
        .get(
            &format!("/{}", backend.remote("/api")),
            &[
                ("host", "portal.example"),
                ("x-portal5", declaration),
                ("x-note", "sent from portal.example"),
            ],
        )
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()["location"],
        "http://portal.example/https://bar.com/account"
    );

    let outbound = seen.lock().unwrap().clone().expect("backend was called");
    assert_eq!(outbound["host"], backend.addr.to_string().as_str());
    assert_eq!(outbound["x-note"], "sent from bar.com");
    assert_eq!(outbound["referer"], "https://bar.com/page");
    assert_eq!(outbound["origin"], "https://bar.com");
    assert!(outbound.get("x-portal5").is_none());

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn csp_is_opened_to_the_proxy_when_enabled() {
    let backend = TestHttpBackend::serve(Arc::new(|_req: Request<Body>| {
        let mut response = respond(StatusCode::OK, "text/html", "<p>guarded</p>");
        response.headers_mut().insert(
            "content-security-policy",
            HeaderValue::from_static("default-src 'self'; img-src 'none'; report-uri /csp"),
        );
        response
    }))
    .await;
    let proxy = TestProxy::spawn(|_| {}).await;
    let path = format!("/{}", backend.remote("/page"));

    // Default features plus security_break_csp (bit 5).
    let response = proxy
        .get(&path, &[("x-portal5", r#"{"version":2,"id":"client-1","prefs":127}"#)])
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-security-policy"],
        format!("default-src 'self' {}; img-src 'none'", proxy.origin()).as_str()
    );

    let response = proxy.get(&path, &[("x-portal5", CURRENT_WORKER)]).await;
    assert_eq!(
        response.headers()["content-security-policy"],
        "default-src 'self'; img-src 'none'; report-uri /csp"
    );

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn cross_site_navigations_clear_cookies() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let backend = TestHttpBackend::serve(site(seen)).await;
    let proxy = TestProxy::spawn(|_| {}).await;
    let path = format!("/{}", backend.remote("/page"));

    let cross_site = r#"{"version":2,"id":"client-1","mode":"navigate","origin":"https://bar.com"}"#;
    let response = proxy.get(&path, &[("x-portal5", cross_site)]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["clear-site-data"], r#""cookies""#);

    let same_site = format!(
        r#"{{"version":2,"id":"client-1","mode":"navigate","origin":"{}"}}"#,
        backend.remote("")
    );
    let response = proxy.get(&path, &[("x-portal5", &same_site)]).await;
    assert!(response.headers().get("clear-site-data").is_none());

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn uninstall_page_removes_the_worker_then_resets() {
    let proxy = TestProxy::spawn(|_| {}).await;
    let response = proxy.get("/~uninstall", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let page = response.text().await.unwrap();
    assert!(page.contains("registration.unregister()"));
    assert!(page.contains(r#"fetch("/~reset""#));

    let response = proxy.get("/~reset", &[]).await;
    assert_eq!(response.headers()["clear-site-data"], r#""cache", "cookies", "storage""#);
    proxy.shutdown().await;
}

#[tokio::test]
async fn endless_redirects_while_sniffing_are_reported() {
    let hits = Arc::new(Mutex::new(0usize));
    let counter = hits.clone();
    let backend = TestHttpBackend::serve(Arc::new(move |_req: Request<Body>| {
        *counter.lock().unwrap() += 1;
        redirect_to("/loop")
    }))
    .await;
    let proxy = TestProxy::spawn(|_| {}).await;

    let response = proxy.get(&format!("/{}", backend.remote("/loop")), &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.text().await.unwrap().contains("redirected too many times"));
    // The first request plus five followed hops.
    assert_eq!(*hits.lock().unwrap(), 6);

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn canonical_redirects_percent_encode_the_location() {
    let proxy = TestProxy::spawn(|_| {}).await;
    let response = proxy.get("/http:/127.0.0.1:9/caf%C3%A9", &[]).await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()["location"],
        format!("{}/http://127.0.0.1:9/caf%C3%A9", proxy.origin()).as_str()
    );
    proxy.shutdown().await;
}

#[tokio::test]
async fn declared_origin_resolves_pathlike_requests() {
    let proxy = TestProxy::spawn(|_| {}).await;

    let response = proxy
        .get(
            "/static/app.js?_portal5origin=http%3A%2F%2F127.0.0.1%3A9&v=2",
            &[("x-portal5", CURRENT_WORKER)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()["location"],
        format!("{}/http://127.0.0.1:9/static/app.js?v=2", proxy.origin()).as_str()
    );

    let response = proxy
        .get("/service-worker.js", &[("service-worker", "script")])
        .await;
    let script = response.text().await.unwrap();
    assert!(script.contains(r#""/settings":{"handler":"restricted""#));
    assert!(script.contains("_portal5origin"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn rewrite_mode_under_a_prefix_recovers_root_relative_requests() {
    let proxy = TestProxy::spawn(|config| {
        config.mode = ProxyMode::Rewrite;
        config.appname = "portal3".into();
        config.prefix = "/proxy".into();
    })
    .await;

    let remembered = "portal3-remote-scheme=http; portal3-remote-domain=127.0.0.1:9";
    let response = proxy
        .get("/static/app.js?v=1", &[("cookie", remembered)])
        .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()["location"],
        "/proxy/http://127.0.0.1:9/static/app.js?v=1"
    );
    let marker = set_cookies(&response)
        .into_iter()
        .find(|c| c.starts_with("portal3-remote-redirect=true"))
        .expect("redirect marker");
    assert!(marker.contains("Path=/proxy/http://127.0.0.1:9/static/app.js"), "{marker}");

    let response = proxy.get("/static/app.js", &[]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    proxy.shutdown().await;
}

#[tokio::test]
async fn rewrite_mode_direct_responses_point_back_to_direct() {
    let backend = TestHttpBackend::serve(Arc::new(|_req: Request<Body>| {
        let mut response = redirect_to("/next");
        response
            .headers_mut()
            .insert("set-cookie", HeaderValue::from_static("sid=1; Path=/"));
        response
    }))
    .await;
    let proxy = TestProxy::spawn(|config| {
        config.mode = ProxyMode::Rewrite;
        config.appname = "portal3".into();
    })
    .await;

    let response = proxy
        .get(&format!("/direct/{}", backend.remote("/start")), &[])
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()["location"],
        format!("{}/direct/{}", proxy.origin(), backend.remote("/next")).as_str()
    );
    let cookies = set_cookies(&response);
    let sid = cookies.iter().find(|c| c.starts_with("sid=1")).expect("sid cookie");
    assert!(sid.contains(&format!("Path=/direct/{}", backend.remote(""))), "{sid}");
    assert!(!cookies.iter().any(|c| c.starts_with("portal3-remote-")));

    proxy.shutdown().await;
    backend.shutdown().await;
}
