use std::collections::BTreeSet;

use http::HeaderValue;
use serde_json::{Map, Value};

pub const NOPREF: &str = "nopref";
pub const REVALIDATE_ON_NEXT_REQUEST: &str = "revalidate-on-next-request";
pub const HIJACK: &str = "hijack";

/// Directives exchanged with the worker: what it told us, and what we tell it back.
#[derive(Clone, Debug, Default)]
pub struct Signals {
    pub incoming: Map<String, Value>,
    feedback: BTreeSet<String>,
}

impl Signals {
    pub fn new(incoming: Map<String, Value>) -> Self {
        Self {
            incoming,
            feedback: BTreeSet::new(),
        }
    }

    pub fn raise(&mut self, directive: &str) {
        self.feedback.insert(directive.to_string());
    }

    pub fn raised(&self, directive: &str) -> bool {
        self.feedback.contains(directive)
    }

    /// `{"directive": 1, ...}` for the response signal header.
    pub fn header_value(&self) -> Option<HeaderValue> {
        let body: Map<String, Value> = self
            .feedback
            .iter()
            .map(|directive| (directive.clone(), Value::from(1)))
            .collect();
        HeaderValue::from_str(&Value::Object(body).to_string()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_renders_as_json_flags() {
        let mut signals = Signals::default();
        assert_eq!(signals.header_value().unwrap(), "{}");
        signals.raise(HIJACK);
        signals.raise(REVALIDATE_ON_NEXT_REQUEST);
        signals.raise(HIJACK);
        assert!(signals.raised(HIJACK));
        assert_eq!(
            signals.header_value().unwrap(),
            r#"{"hijack":1,"revalidate-on-next-request":1}"#
        );
    }
}
