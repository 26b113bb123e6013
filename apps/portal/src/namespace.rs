/// Names of the headers and cookies the proxy owns, all derived from the app name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Namespace {
    pub appname: String,
}

impl Namespace {
    pub fn new(appname: impl Into<String>) -> Self {
        Self {
            appname: appname.into(),
        }
    }

    /// `X-Portal5`: the worker's JSON declaration.
    pub fn declaration_header(&self) -> String {
        format!("x-{}", self.appname)
    }

    pub fn signal_header(&self) -> String {
        format!("x-{}-signal", self.appname)
    }

    pub fn prefs_cookie(&self) -> String {
        format!("{}prefs", self.appname)
    }

    pub fn prefs2_cookie(&self) -> String {
        format!("{}prefs2", self.appname)
    }

    pub fn auth_cookie(&self) -> String {
        format!("{}auth", self.appname)
    }

    /// `portal3-remote-scheme` and friends, used by the rewriting proxy.
    pub fn remote_cookie(&self, kind: &str) -> String {
        format!("{}-remote-{kind}", self.appname)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new("portal5")
    }
}
