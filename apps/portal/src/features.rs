//! Versioned catalogs of per-client rewriting features.
//!
//! A client's preferences travel as a single integer mask (cookie, token claim, or the
//! worker's declaration header). Each catalog fixes which bit means what for one worker
//! protocol version, and which bits drag others along with them.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::LazyLock,
};

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::bitmask::{Mask, bits_to_mask, constrain_ones, mask_to_bits};

pub const BASIC_REWRITE_CROSSSITE: &str = "basic_rewrite_crosssite";
pub const BASIC_SET_HEADERS: &str = "basic_set_headers";
pub const BASIC_SET_COOKIES: &str = "basic_set_cookies";
pub const DISAMBIGUATION_TEST_URL: &str = "disambiguation_test_url";
pub const SECURITY_ENFORCE_CORS: &str = "security_enforce_cors";
pub const SECURITY_BREAK_CSP: &str = "security_break_csp";
pub const SECURITY_CLEAR_COOKIES_ON_NAVIGATE: &str = "security_clear_cookies_on_navigate";
pub const SECURITY_REMOVE_HTTPONLY_FLAG: &str = "security_remove_httponly_flag";
pub const INJECTION_DOM_HIJACK: &str = "injection_dom_hijack";
pub const EXPERIMENTAL_CLIENT_SIDE_REWRITE: &str = "experimental_client_side_rewrite";

/// Static description of one feature, as written in a catalog table.
#[derive(Clone, Copy, Debug)]
pub struct FeatureSpec {
    pub bit: u32,
    pub name: &'static str,
    pub default: bool,
    pub label: &'static str,
    pub description: &'static [&'static str],
    pub color: Option<&'static str>,
}

#[derive(Debug)]
pub struct FeatureCatalog {
    pub protocol: u32,
    features: Vec<FeatureSpec>,
    /// bit -> every bit it requires, transitively closed.
    dependencies: BTreeMap<u32, BTreeSet<u32>>,
    /// bit -> every bit that requires it.
    requirements: BTreeMap<u32, BTreeSet<u32>>,
    client_specific: BTreeSet<u32>,
    bundle_requiring: BTreeSet<u32>,
}

/// One row of the settings form.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct FeatureOption {
    pub name: &'static str,
    pub label: &'static str,
    pub description: Vec<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<&'static str>,
}

/// Features grouped by the first `_`-separated word of their name.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Section {
    pub name: &'static str,
    pub options: Vec<FeatureOption>,
}

impl FeatureCatalog {
    pub fn new(
        protocol: u32,
        features: &[FeatureSpec],
        dependencies: &[(u32, &[u32])],
        client_specific: &[u32],
        bundle_requiring: &[u32],
    ) -> Self {
        let direct: BTreeMap<u32, BTreeSet<u32>> = dependencies
            .iter()
            .map(|(bit, deps)| (*bit, deps.iter().copied().collect()))
            .collect();

        let mut closed = BTreeMap::new();
        for &bit in direct.keys() {
            let mut seen = BTreeSet::new();
            let mut stack: Vec<u32> = direct[&bit].iter().copied().collect();
            while let Some(next) = stack.pop() {
                if next != bit && seen.insert(next) {
                    if let Some(more) = direct.get(&next) {
                        stack.extend(more.iter().copied());
                    }
                }
            }
            closed.insert(bit, seen);
        }

        let mut requirements: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
        for (bit, deps) in &closed {
            for dep in deps {
                requirements.entry(*dep).or_default().insert(*bit);
            }
        }

        Self {
            protocol,
            features: features.to_vec(),
            dependencies: closed,
            requirements,
            client_specific: client_specific.iter().copied().collect(),
            bundle_requiring: bundle_requiring.iter().copied().collect(),
        }
    }

    pub fn current() -> &'static FeatureCatalog {
        &CURRENT
    }

    pub fn legacy() -> &'static FeatureCatalog {
        &LEGACY
    }

    pub fn for_protocol(version: u32) -> Option<&'static FeatureCatalog> {
        match version {
            1 => Some(&LEGACY),
            2 => Some(&CURRENT),
            _ => None,
        }
    }

    pub fn features(&self) -> &[FeatureSpec] {
        &self.features
    }

    pub fn bit_of(&self, name: &str) -> Option<u32> {
        self.features.iter().find(|f| f.name == name).map(|f| f.bit)
    }

    pub fn name_of(&self, bit: u32) -> Option<&'static str> {
        self.features.iter().find(|f| f.bit == bit).map(|f| f.name)
    }

    pub fn dependencies_of(&self, bit: u32) -> Option<&BTreeSet<u32>> {
        self.dependencies.get(&bit)
    }

    /// Forces on everything each enabled feature depends on. One pass suffices because
    /// the dependency sets are already closed.
    pub fn resolve_dependencies(&self, mask: Mask) -> Mask {
        self.dependencies
            .iter()
            .fold(mask, |m, (bit, ones)| m | constrain_ones(m, *bit, ones))
    }

    pub fn bitmask_to_prefs(&self, mask: Mask) -> BTreeSet<&'static str> {
        mask_to_bits(mask)
            .into_iter()
            .filter_map(|bit| self.name_of(bit))
            .collect()
    }

    /// Unknown names are ignored.
    pub fn prefs_to_bitmask<'a>(&self, prefs: impl IntoIterator<Item = &'a str>) -> Mask {
        let bits: BTreeSet<u32> = prefs
            .into_iter()
            .filter_map(|name| self.bit_of(name))
            .collect();
        bits_to_mask(&bits)
    }

    pub fn default_mask(&self) -> Mask {
        let defaults: BTreeSet<u32> = self
            .features
            .iter()
            .filter(|f| f.default)
            .map(|f| f.bit)
            .collect();
        self.resolve_dependencies(bits_to_mask(&defaults))
    }

    pub fn is_enabled(&self, mask: Mask, name: &str) -> bool {
        self.bit_of(name)
            .map(|bit| mask & crate::bitmask::bit(bit) != 0)
            .unwrap_or(false)
    }

    /// Mask plus the client-specific features the worker acts on locally.
    pub fn client_prefs(&self, mask: Mask) -> Value {
        let mask = self.resolve_dependencies(mask);
        let local: Map<String, Value> = mask_to_bits(mask)
            .intersection(&self.client_specific)
            .filter_map(|bit| self.name_of(*bit))
            .map(|name| (name.to_string(), json!(1)))
            .collect();
        json!({ "value": mask, "local": local })
    }

    pub fn requires_bundle(&self, mask: Mask) -> bool {
        self.resolve_dependencies(mask) & bits_to_mask(&self.bundle_requiring) != 0
    }

    /// `dep`: feature -> features it needs; `req`: feature -> features needing it. Names use
    /// `-` separators to match form field ids.
    pub fn dependency_dicts(&self) -> Value {
        let render = |table: &BTreeMap<u32, BTreeSet<u32>>| -> Map<String, Value> {
            table
                .iter()
                .filter_map(|(bit, others)| {
                    let names: Vec<Value> = others
                        .iter()
                        .filter_map(|b| self.name_of(*b))
                        .map(|n| Value::String(n.replace('_', "-")))
                        .collect();
                    Some((self.name_of(*bit)?.replace('_', "-"), Value::Array(names)))
                })
                .collect()
        };
        json!({
            "dep": render(&self.dependencies),
            "req": render(&self.requirements),
        })
    }

    pub fn sections(&self, mask: Mask, server_origin: &str) -> Vec<Section> {
        let mut sections: Vec<Section> = Vec::new();
        for feature in &self.features {
            let section_name = feature.name.split('_').next().unwrap_or(feature.name);
            let option = FeatureOption {
                name: feature.name,
                label: feature.label,
                description: feature
                    .description
                    .iter()
                    .map(|line| line.replace("{server_origin}", server_origin))
                    .collect(),
                enabled: mask & crate::bitmask::bit(feature.bit) != 0,
                color: feature.color,
            };
            match sections.iter_mut().find(|s| s.name == section_name) {
                Some(section) => section.options.push(option),
                None => sections.push(Section {
                    name: section_name,
                    options: vec![option],
                }),
            }
        }
        sections
    }
}

static CURRENT: LazyLock<FeatureCatalog> = LazyLock::new(|| {
    FeatureCatalog::new(
        2,
        &CURRENT_FEATURES,
        &[(4, &[1]), (5, &[1]), (7, &[0, 5])],
        &[0, 3, 7],
        &[7],
    )
});

static LEGACY: LazyLock<FeatureCatalog> =
    LazyLock::new(|| FeatureCatalog::new(1, &LEGACY_FEATURES, &[], &[], &[]));

const CURRENT_FEATURES: [FeatureSpec; 8] = [
    FeatureSpec {
        bit: 0,
        name: BASIC_REWRITE_CROSSSITE,
        default: true,
        label: "Redirect cross-site requests",
        description: &[
            "Route requests to other domains through this proxy as well.",
            "When off, only requests to the page's own domain are redirected.",
        ],
        color: None,
    },
    FeatureSpec {
        bit: 1,
        name: BASIC_SET_HEADERS,
        default: true,
        label: "Forward HTTP headers",
        description: &[
            "Pass response headers from the remote server on to the browser.",
            "Most sites break without this.",
        ],
        color: None,
    },
    FeatureSpec {
        bit: 2,
        name: BASIC_SET_COOKIES,
        default: true,
        label: "Forward cookies",
        description: &[
            "Pass remote cookies on to the browser, rescoped to {server_origin}.",
            "Cookies written by page scripts are not rescoped.",
        ],
        color: None,
    },
    FeatureSpec {
        bit: 3,
        name: DISAMBIGUATION_TEST_URL,
        default: true,
        label: "Test URLs in case of ambiguities",
        description: &[
            "Probe candidate URLs with <code>HEAD</code> when the intended page is unclear.",
            "Probing reveals the candidate URLs to each of the sites tried.",
        ],
        color: None,
    },
    FeatureSpec {
        bit: 4,
        name: SECURITY_ENFORCE_CORS,
        default: true,
        label: "Emulate browser CORS behavior",
        description: &[
            "Keep <code>Access-Control-Allow-Origin</code> only when it names the requesting page, rewritten to {server_origin}.",
            "Other specific origins are dropped so the browser refuses the response.",
        ],
        color: None,
    },
    FeatureSpec {
        bit: 5,
        name: SECURITY_BREAK_CSP,
        default: false,
        label: "Bypass Content Security Policy (CSP) protection",
        description: &[
            "Add {server_origin} to every CSP source list that is not <code>'none'</code>.",
            "<strong>This defeats the protection CSP offers.</strong>",
        ],
        color: Some("yellow"),
    },
    FeatureSpec {
        bit: 6,
        name: SECURITY_CLEAR_COOKIES_ON_NAVIGATE,
        default: true,
        label: "Clear cookies between cross-site visits",
        description: &[
            "Delete cookies when a navigation moves to a different site.",
            "All proxied sites share {server_origin}, so their cookies are not otherwise separated.",
        ],
        color: None,
    },
    FeatureSpec {
        bit: 7,
        name: INJECTION_DOM_HIJACK,
        default: false,
        label: "Intercept dynamically created URLs",
        description: &[
            "Load a script that rewrites URLs the page creates at run time.",
            "Requires CSP bypass for pages that restrict scripts.",
        ],
        color: Some("blue"),
    },
];

const LEGACY_FEATURES: [FeatureSpec; 7] = [
    FeatureSpec {
        bit: 0,
        name: BASIC_REWRITE_CROSSSITE,
        default: true,
        label: "Redirect cross-site requests",
        description: &["Route requests to other domains through this proxy as well."],
        color: None,
    },
    FeatureSpec {
        bit: 1,
        name: BASIC_SET_HEADERS,
        default: true,
        label: "Forward HTTP headers",
        description: &["Pass response headers from the remote server on to the browser."],
        color: None,
    },
    FeatureSpec {
        bit: 2,
        name: BASIC_SET_COOKIES,
        default: true,
        label: "Forward cookies",
        description: &["Pass remote cookies on to the browser, rescoped to {server_origin}."],
        color: None,
    },
    FeatureSpec {
        bit: 3,
        name: SECURITY_ENFORCE_CORS,
        default: true,
        label: "Enforce CORS Access-Control-Allow-Origin",
        description: &["Drop specific allowed origins that do not match the requesting page."],
        color: None,
    },
    FeatureSpec {
        bit: 4,
        name: SECURITY_BREAK_CSP,
        default: false,
        label: "Bypass Content Security Policy (CSP) protection",
        description: &["Add {server_origin} to every CSP source list that is not 'none'."],
        color: Some("yellow"),
    },
    FeatureSpec {
        bit: 5,
        name: SECURITY_REMOVE_HTTPONLY_FLAG,
        default: false,
        label: "Remove the HttpOnly flag on cookies",
        description: &["Let the service worker see cookies the remote server marked HttpOnly."],
        color: Some("yellow"),
    },
    FeatureSpec {
        bit: 6,
        name: EXPERIMENTAL_CLIENT_SIDE_REWRITE,
        default: false,
        label: "Enable in-browser URL preprocessing",
        description: &["Let the service worker rewrite URLs in HTML documents before display."],
        color: Some("blue"),
    },
];
