use std::collections::BTreeMap;

use base64::{Engine, engine::general_purpose::STANDARD};
use cookie::{Cookie, time::Duration};
use serde_json::{Map, Value};

use crate::{
    bitmask::Mask, context::ClientDeclaration, features::FeatureCatalog, namespace::Namespace,
};

pub const COOKIE_MAX_AGE: Duration = Duration::days(365);

/// A client's enabled features, plus free-form extras such as the UI language.
#[derive(Clone, Debug)]
pub struct Preferences {
    catalog: &'static FeatureCatalog,
    mask: Mask,
    nopref: bool,
    pub extras: Map<String, Value>,
}

impl Preferences {
    /// Declared claim first, then the prefs cookie, then catalog defaults. Falling back to
    /// defaults marks the client as having no stored preference.
    pub fn resolve(
        catalog: &'static FeatureCatalog,
        declaration: &ClientDeclaration,
        own_cookies: &BTreeMap<String, String>,
        names: &Namespace,
    ) -> Self {
        let stored = own_cookies
            .get(&names.prefs_cookie())
            .and_then(|raw| raw.trim().parse::<Mask>().ok())
            .filter(|mask| *mask != 0);
        let declared = declaration.prefs.as_ref().map(|p| p.to_mask(catalog));

        let mut prefs = match declared.or(stored) {
            Some(mask) => Self::with_mask(catalog, mask),
            None => Self::defaults(catalog),
        };
        prefs.extras = own_cookies
            .get(&names.prefs2_cookie())
            .and_then(|raw| decode_extras(raw))
            .unwrap_or_default();
        prefs
    }

    pub fn with_mask(catalog: &'static FeatureCatalog, mask: Mask) -> Self {
        Self {
            catalog,
            mask: catalog.resolve_dependencies(mask),
            nopref: false,
            extras: Map::new(),
        }
    }

    pub fn defaults(catalog: &'static FeatureCatalog) -> Self {
        Self {
            nopref: true,
            ..Self::with_mask(catalog, catalog.default_mask())
        }
    }

    pub fn catalog(&self) -> &'static FeatureCatalog {
        self.catalog
    }

    pub fn mask(&self) -> Mask {
        self.mask
    }

    pub fn set_mask(&mut self, mask: Mask) {
        self.mask = self.catalog.resolve_dependencies(mask);
        self.nopref = false;
    }

    pub fn reset(&mut self) {
        self.mask = self.catalog.default_mask();
        self.nopref = true;
    }

    pub fn nopref(&self) -> bool {
        self.nopref
    }

    pub fn enabled(&self, feature: &str) -> bool {
        self.catalog.is_enabled(self.mask, feature)
    }

    pub fn lang(&self) -> Option<&str> {
        self.extras.get("lang").and_then(Value::as_str)
    }

    /// Empty while the client has no stored preference, so defaults keep tracking the
    /// catalog.
    pub fn prefs_cookie(&self, names: &Namespace) -> Cookie<'static> {
        let value = if self.nopref {
            String::new()
        } else {
            self.mask.to_string()
        };
        Cookie::build((names.prefs_cookie(), value))
            .path("/")
            .secure(true)
            .http_only(true)
            .max_age(COOKIE_MAX_AGE)
            .build()
    }

    pub fn prefs2_cookie(&self, names: &Namespace) -> Cookie<'static> {
        let encoded = STANDARD.encode(Value::Object(self.extras.clone()).to_string());
        Cookie::build((names.prefs2_cookie(), encoded))
            .path("/")
            .secure(true)
            .max_age(COOKIE_MAX_AGE)
            .build()
    }
}

fn decode_extras(raw: &str) -> Option<Map<String, Value>> {
    let bytes = STANDARD.decode(raw.trim()).ok()?;
    match serde_json::from_slice(&bytes).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
