use std::collections::BTreeMap;

use http::{HeaderMap, HeaderValue};

pub const CSP_HEADERS: [&str; 2] = [
    "content-security-policy",
    "content-security-policy-report-only",
];

/// Directives whose values are not source lists.
const NON_SOURCE_DIRECTIVES: &[&str] = &[
    "sandbox",
    "plugin-types",
    "referrer",
    "upgrade-insecure-requests",
    "block-all-mixed-content",
    "require-sri-for",
    "require-trusted-types-for",
    "trusted-types",
];

const REPORTING_DIRECTIVES: &[&str] = &["report-uri", "report-to"];

/// One policy, directives in their original order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Policy {
    pub directives: Vec<(String, Vec<String>)>,
}

impl Policy {
    pub fn parse(raw: &str) -> Self {
        let directives = raw
            .split(';')
            .filter_map(|directive| {
                let mut tokens = directive.split_ascii_whitespace();
                let name = tokens.next()?.to_ascii_lowercase();
                Some((name, tokens.map(str::to_string).collect()))
            })
            .collect();
        Self { directives }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.directives
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, tokens)| tokens.as_slice())
    }

    /// Lets the proxy origin (and the requesting page's origin, where `'self'` was allowed)
    /// satisfy every source list, except lists that forbid everything or rely on
    /// `'strict-dynamic'`. Reporting directives are removed.
    pub fn breach(&mut self, server_origin: &str, requester_origin: Option<&str>) {
        self.directives
            .retain(|(name, _)| !REPORTING_DIRECTIVES.contains(&name.as_str()));
        for (name, tokens) in &mut self.directives {
            if NON_SOURCE_DIRECTIVES.contains(&name.as_str()) {
                continue;
            }
            if tokens
                .iter()
                .any(|t| t.eq_ignore_ascii_case("'none'") || t.eq_ignore_ascii_case("'strict-dynamic'"))
            {
                continue;
            }
            let allows_self = tokens.iter().any(|t| t.eq_ignore_ascii_case("'self'"));
            push_unique(tokens, server_origin);
            if allows_self && let Some(origin) = requester_origin {
                push_unique(tokens, origin);
            }
        }
    }

    pub fn uses_strict_dynamic_for_scripts(&self) -> bool {
        ["script-src", "script-src-elem"].iter().any(|name| {
            self.get(name)
                .map(|tokens| tokens.iter().any(|t| t.eq_ignore_ascii_case("'strict-dynamic'")))
                .unwrap_or(false)
        })
    }

    pub fn serialize(&self) -> String {
        self.directives
            .iter()
            .map(|(name, tokens)| {
                if tokens.is_empty() {
                    name.clone()
                } else {
                    format!("{name} {}", tokens.join(" "))
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn push_unique(tokens: &mut Vec<String>, source: &str) {
    if !tokens.iter().any(|t| t == source) {
        tokens.push(source.to_string());
    }
}

/// Rewrites every CSP header in place. Returns the merged script-relevant view of all
/// rewritten policies, keyed by directive.
pub fn break_csp(
    headers: &mut HeaderMap,
    server_origin: &str,
    requester_origin: Option<&str>,
) -> BTreeMap<String, Vec<String>> {
    let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in CSP_HEADERS {
        let policies: Vec<String> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        if policies.is_empty() {
            continue;
        }
        headers.remove(name);
        for raw in policies {
            let mut policy = Policy::parse(&raw);
            policy.breach(server_origin, requester_origin);
            for (directive, tokens) in &policy.directives {
                merged
                    .entry(directive.clone())
                    .or_default()
                    .extend(tokens.iter().cloned());
            }
            if let Ok(value) = HeaderValue::from_str(&policy.serialize()) {
                headers.append(name, value);
            }
        }
    }
    merged
}
