use std::{collections::BTreeSet, net::SocketAddr, path::Path, str::FromStr, time::Duration};

use serde::Deserialize;

use crate::{error::ProxyError, filters::RuleSpec};

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Browser-side worker relays requests; the server only adjusts headers and cookies.
    #[default]
    Worker,
    /// Server-side rewriting with referrer-relative resolution.
    Rewrite,
}

impl FromStr for ProxyMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "worker" => Ok(Self::Worker),
            "rewrite" => Ok(Self::Rewrite),
            other => Err(format!("unknown mode `{other}`; expected `worker` or `rewrite`")),
        }
    }
}

/// Requests the worker lets through untouched.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PassthroughConfig {
    pub domains: BTreeSet<String>,
    pub urls: BTreeSet<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,
    pub mode: ProxyMode,
    /// Mount point of the proxy routes: `""` or `/segment`.
    pub prefix: String,
    pub appname: String,
    /// Scheme of the proxy's own origin when `X-Forwarded-Proto` is absent.
    pub public_scheme: String,
    pub worker_version: u32,
    /// HMAC key for settings tokens. A random key is used when unset.
    pub secret_key: Option<String>,
    pub connect_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub passthrough: PassthroughConfig,
    pub filters: Vec<RuleSpec>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            mode: ProxyMode::Worker,
            prefix: String::new(),
            appname: "portal5".to_string(),
            public_scheme: "http".to_string(),
            worker_version: 2,
            secret_key: None,
            connect_timeout_secs: 10,
            response_timeout_secs: 30,
            passthrough: PassthroughConfig::default(),
            filters: Vec::new(),
        }
    }
}

impl ProxyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ProxyError> {
        let mut config: Self = toml::from_str(raw)?;
        config.prefix = normalize_prefix(&config.prefix);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.appname.is_empty()
            || !self
                .appname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ProxyError::Config(format!(
                "appname `{}` must be a non-empty token",
                self.appname
            )));
        }
        if !matches!(self.public_scheme.as_str(), "http" | "https") {
            return Err(ProxyError::Config(format!(
                "public_scheme must be http or https, not `{}`",
                self.public_scheme
            )));
        }
        if !self.prefix.is_empty() && !self.prefix.starts_with('/') {
            return Err(ProxyError::Config(format!(
                "prefix `{}` must start with `/`",
                self.prefix
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// `"proxy/"` and `"/proxy"` both mount at `/proxy`; `"/"` mounts at the root.
pub fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}
