//! Self-protect rules: predicates over outbound requests that stop the proxy from acting as
//! a conduit for traffic the operator has ruled out.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use serde::Deserialize;
use tracing::{info, warn};
use url::Host;

use crate::{error::PortalError, error::ProxyError, pipeline::PreparedRequest};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Predicate = dyn Fn(&PreparedRequest) -> Result<bool, BoxError> + Send + Sync;

#[derive(Clone)]
pub struct SelfProtectRule {
    pub name: String,
    pub description: Option<String>,
    predicate: Arc<Predicate>,
}

impl fmt::Debug for SelfProtectRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfProtectRule")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl SelfProtectRule {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&PreparedRequest) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            predicate: Arc::new(predicate),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Errors and panics count as "did not fire".
    pub fn fires(&self, request: &PreparedRequest) -> bool {
        match catch_unwind(AssertUnwindSafe(|| (self.predicate)(request))) {
            Ok(Ok(fired)) => fired,
            Ok(Err(err)) => {
                warn!(rule = %self.name, %err, "self-protect rule failed; ignoring it");
                false
            }
            Err(_) => {
                warn!(rule = %self.name, "self-protect rule panicked; ignoring it");
                false
            }
        }
    }

    pub fn from_spec(spec: &RuleSpec) -> Result<Self, ProxyError> {
        let matcher = spec.matcher()?;
        let rule = Self::new(spec.name.clone(), move |req| Ok(matcher.matches(req)));
        Ok(match &spec.description {
            Some(description) => rule.with_description(description.clone()),
            None => rule,
        })
    }
}

/// The rule set, read-only once the server is running.
#[derive(Clone, Debug, Default)]
pub struct RequestFilter {
    rules: Vec<SelfProtectRule>,
}

impl RequestFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: &[RuleSpec]) -> Result<Self, ProxyError> {
        let mut filter = Self::new();
        for spec in specs {
            filter.add(SelfProtectRule::from_spec(spec)?);
        }
        Ok(filter)
    }

    /// Returns `false` when a rule with the same name is already registered.
    pub fn add(&mut self, rule: SelfProtectRule) -> bool {
        if self.rules.iter().any(|r| r.name == rule.name) {
            return false;
        }
        self.rules.push(rule);
        true
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn test(&self, request: &PreparedRequest) -> Result<(), PortalError> {
        match self.rules.iter().find(|rule| rule.fires(request)) {
            Some(rule) => {
                info!(rule = %rule.name, url = %request.url, "self-protect rule refused request");
                Err(PortalError::SelfProtect {
                    url: request.url.to_string(),
                    rule: rule.name.clone(),
                    description: rule.description.clone(),
                })
            }
            None => Ok(()),
        }
    }
}

/// A `[[filters]]` table. Exactly one matcher key must be present.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub hosts: Option<Vec<String>>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    #[serde(default)]
    pub private_network: Option<bool>,
    #[serde(default)]
    pub all: Option<bool>,
}

#[derive(Clone, Debug)]
enum Matcher {
    Scheme(String),
    Hosts(Vec<String>),
    PathPrefix(String),
    Methods(Vec<String>),
    PrivateNetwork,
    All,
}

impl RuleSpec {
    fn matcher(&self) -> Result<Matcher, ProxyError> {
        let mut found = Vec::new();
        if let Some(scheme) = &self.scheme {
            found.push(Matcher::Scheme(scheme.to_ascii_lowercase()));
        }
        if let Some(hosts) = &self.hosts {
            found.push(Matcher::Hosts(
                hosts.iter().map(|h| h.to_ascii_lowercase()).collect(),
            ));
        }
        if let Some(prefix) = &self.path_prefix {
            found.push(Matcher::PathPrefix(prefix.clone()));
        }
        if let Some(methods) = &self.methods {
            found.push(Matcher::Methods(
                methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
            ));
        }
        if self.private_network == Some(true) {
            found.push(Matcher::PrivateNetwork);
        }
        if self.all == Some(true) {
            found.push(Matcher::All);
        }
        match found.len() {
            1 => Ok(found.remove(0)),
            0 => Err(ProxyError::Config(format!("filter `{}` has no matcher", self.name))),
            _ => Err(ProxyError::Config(format!(
                "filter `{}` has more than one matcher",
                self.name
            ))),
        }
    }
}

impl Matcher {
    fn matches(&self, request: &PreparedRequest) -> bool {
        match self {
            Self::Scheme(scheme) => request.scheme() == scheme,
            Self::Hosts(hosts) => {
                let host = request.host().to_ascii_lowercase();
                hosts.iter().any(|pattern| match pattern.strip_prefix('.') {
                    Some(suffix) => host == suffix || host.ends_with(pattern.as_str()),
                    None => host == *pattern,
                })
            }
            Self::PathPrefix(prefix) => request.url.path().starts_with(prefix.as_str()),
            Self::Methods(methods) => methods.iter().any(|m| m == request.method.as_str()),
            Self::PrivateNetwork => match request.url.host() {
                Some(Host::Domain(domain)) => {
                    let domain = domain.to_ascii_lowercase();
                    domain == "localhost" || domain.ends_with(".localhost")
                }
                Some(Host::Ipv4(ip)) => is_private_v4(ip),
                Some(Host::Ipv6(ip)) => is_private_v6(ip),
                None => false,
            },
            Self::All => true,
        }
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_private_v4(mapped);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}
