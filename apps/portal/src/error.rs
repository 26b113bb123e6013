use http::{HeaderValue, Response, StatusCode, header};
use hyper::Body;

/// Every way a proxied request can end without a remote response being delivered.
#[derive(thiserror::Error, Debug)]
pub enum PortalError {
    #[error("{0}")]
    BadRequest(String),
    #[error("the `{0}` protocol is not supported; only http and https URLs can be visited")]
    UnsupportedScheme(String),
    #[error("no domain name in `{0}`")]
    MissingDomain(String),
    #[error("the address has no protocol; did you mean {candidate}?")]
    MissingProtocol { candidate: String },
    #[error("request to {url} was refused by self-protect rule `{rule}`{}", describe(.description))]
    SelfProtect {
        url: String,
        rule: String,
        description: Option<String>,
    },
    #[error("{url} does not allow cross-origin requests from this page")]
    CrossOriginBlocked { url: String },
    #[error("forbidden")]
    Forbidden,
    #[error("settings were not saved; reload the settings page and try again")]
    SettingsNotSaved,
    #[error("{url} responded with {status}")]
    UpstreamStatus { url: String, status: StatusCode },
    #[error("{url} redirected too many times")]
    TooManyRedirects { url: String },
    #[error("could not establish a secure connection to {url}")]
    Tls { url: String },
    #[error("could not connect to {url}")]
    Connect { url: String },
    #[error("{url} took too long to respond")]
    Timeout { url: String },
    #[error("request to {url} failed ({kind})")]
    Unspecified { url: String, kind: String },
}

fn describe(description: &Option<String>) -> String {
    match description {
        Some(text) if !text.is_empty() => format!(": {text}"),
        _ => String::new(),
    }
}

impl PortalError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_)
            | Self::UnsupportedScheme(_)
            | Self::MissingDomain(_)
            | Self::MissingProtocol { .. }
            | Self::TooManyRedirects { .. } => StatusCode::BAD_REQUEST,
            Self::SelfProtect { .. } | Self::CrossOriginBlocked { .. } | Self::Forbidden => {
                StatusCode::FORBIDDEN
            }
            Self::SettingsNotSaved => StatusCode::UNAUTHORIZED,
            Self::UpstreamStatus { status, .. } => *status,
            Self::Tls { .. } | Self::Connect { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Unspecified { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Renders the error page. `prefix` is the proxy mount point, used to turn the
    /// missing-protocol suggestion into a clickable proxied link.
    pub fn to_response(&self, prefix: &str) -> Response<Body> {
        let status = self.status();
        let mut page = format!(
            "<!doctype html><html><head><meta charset=\"utf-8\"><title>{code}</title></head>\
             <body><h1>{code}</h1><p>{message}</p>",
            code = status.as_u16(),
            message = escape_html(&self.to_string()),
        );
        if let Self::MissingProtocol { candidate } = self {
            page.push_str(&format!(
                "<p><a href=\"{prefix}/{href}\">{text}</a></p>",
                prefix = escape_html(prefix),
                href = escape_html(candidate),
                text = escape_html(candidate),
            ));
        }
        page.push_str("</body></html>");
        html_response(status, page)
    }

    pub fn into_response(self) -> Response<Body> {
        self.to_response("")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("config error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub(crate) fn html_response(status: StatusCode, page: String) -> Response<Body> {
    let mut response = Response::new(Body::from(page));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}
