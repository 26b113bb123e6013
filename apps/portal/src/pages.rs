//! HTML pages and the worker script served by the worker variant.
//!
//! Every interpolated value goes through [`escape_html`]; values embedded in scripts are
//! serialized as JSON and additionally have `<` escaped so they cannot close the tag.

use serde_json::Value;

use crate::{error::escape_html, features::Section};

const STYLE: &str = "body{font-family:system-ui,sans-serif;max-width:42rem;margin:3rem auto;\
padding:0 1rem;line-height:1.5}fieldset{border:1px solid #ccc;margin:1rem 0}\
label{display:block;margin:.5rem 0}small{color:#555;display:block;margin-left:1.6rem}";

const REGISTER_WORKER: &str = r#"
(async () => {
  const status = document.getElementById("status");
  if (!("serviceWorker" in navigator)) {
    status.textContent = "This browser does not support service workers.";
    return;
  }
  try {
    await navigator.serviceWorker.register("/service-worker.js", { scope: "/" });
    await navigator.serviceWorker.ready;
    window.location.replace(CONTINUE_TO);
  } catch (err) {
    status.textContent = "Could not install the worker: " + err;
  }
})();
"#;

const UNREGISTER_WORKER: &str = r#"
(async () => {
  const status = document.getElementById("status");
  if ("serviceWorker" in navigator) {
    for (const registration of await navigator.serviceWorker.getRegistrations()) {
      await registration.unregister();
    }
  }
  await fetch("/~reset", { credentials: "include" });
  status.textContent = "The worker has been removed.";
})();
"#;

const SETTINGS_SCRIPT: &str = r#"
(() => {
  const byId = (name) => document.getElementById(name);
  const cascade = (name, checked) => {
    const table = checked ? DEPENDENCIES.dep : DEPENDENCIES.req;
    for (const other of table[name] || []) {
      const box = byId(other);
      if (box && box.checked !== checked) {
        box.checked = checked;
        cascade(other, checked);
      }
    }
  };
  for (const box of document.querySelectorAll("input[type=checkbox]")) {
    box.addEventListener("change", () => cascade(box.id, box.checked));
  }
  document.querySelector("form").addEventListener("formdata", (event) => {
    for (const box of document.querySelectorAll("input[type=checkbox]")) {
      event.formData.set(box.name, box.checked ? "1" : "0");
    }
  });
})();
"#;

const WORKER_TEMPLATE: &str = r#"const SETTINGS = __SETTINGS__;
const HEADER = "X-" + SETTINGS.appname;

self.addEventListener("install", () => self.skipWaiting());
self.addEventListener("activate", (event) => event.waitUntil(self.clients.claim()));

function isPassthrough(url) {
  return Boolean(SETTINGS.passthrough.domains[url.host] || SETTINGS.passthrough.urls[url.href]);
}

function remoteOf(href) {
  const proxied = SETTINGS.origin + SETTINGS.prefix + "/";
  return href.startsWith(proxied) ? href.slice(proxied.length) : null;
}

async function declared(request, clientId) {
  const client = clientId ? await self.clients.get(clientId) : null;
  const page = client ? remoteOf(client.url) : null;
  return {
    id: SETTINGS.id,
    version: SETTINGS.version,
    prefs: SETTINGS.prefs.value,
    mode: request.mode,
    referrer: page || "",
    origin: page ? new URL(page).origin : "",
  };
}

function endpointRule(url) {
  return url.origin === SETTINGS.origin ? SETTINGS.endpoints[url.pathname] || null : null;
}

function passesTest(rule, request) {
  const referrer = request.referrer && request.referrer !== "about:client" ? request.referrer : "";
  const seen = { mode: request.mode, method: request.method, referrer };
  return Object.entries(rule.test).every(([param, allowed]) => Boolean(allowed[seen[param]]));
}

async function relay(event, target) {
  const declaration = await declared(event.request, event.clientId);
  const url = new URL(target);
  const remote = remoteOf(url.href);
  if (remote !== null && !/^[a-z][a-z0-9+.-]*:/i.test(remote) && declaration.origin) {
    url.searchParams.set("_portal5origin", declaration.origin);
  }
  const headers = new Headers(event.request.headers);
  headers.set(HEADER, JSON.stringify(declaration));
  const init = {
    method: event.request.method,
    headers,
    credentials: "include",
    redirect: "manual",
  };
  if (!["GET", "HEAD"].includes(event.request.method)) {
    init.body = await event.request.arrayBuffer();
  }
  return fetch(url.href, init);
}

self.addEventListener("fetch", (event) => {
  const url = new URL(event.request.url);
  if (isPassthrough(url)) {
    return;
  }
  const rule = endpointRule(url);
  if (rule) {
    if (rule.handler === "restricted" && !passesTest(rule, event.request)) {
      event.respondWith(new Response("Forbidden", { status: 403 }));
      return;
    }
    const target = rule.handler === "disambiguate"
      ? SETTINGS.origin + "/~multiple-choices" + url.search
      : url.href;
    event.respondWith(relay(event, target));
    return;
  }
  let target = url.href;
  if (url.origin === SETTINGS.origin) {
    if (remoteOf(url.href) === null) {
      return;
    }
  } else {
    target = SETTINGS.origin + SETTINGS.prefix + "/" + url.href;
  }
  event.respondWith(relay(event, target));
});
"#;

fn layout(title: &str, body: &str, script: Option<&str>) -> String {
    let script = script
        .map(|js| format!("<script>{js}</script>"))
        .unwrap_or_default();
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>{title}</title><style>{STYLE}</style></head><body>{body}{script}</body></html>",
        title = escape_html(title),
    )
}

/// JSON that is safe inside a `<script>` element.
fn script_json(value: &Value) -> String {
    value.to_string().replace('<', "\\u003c")
}

fn registering(title: &str, heading: &str, continue_to: &str) -> String {
    let body = format!(
        "<h1>{heading}</h1><p id=\"status\">Installing the worker, this page will reload \
         when it is ready.</p><noscript><p>JavaScript is required.</p></noscript>",
        heading = escape_html(heading),
    );
    let script = format!(
        "const CONTINUE_TO = {};{REGISTER_WORKER}",
        script_json(&Value::String(continue_to.to_string()))
    );
    layout(title, &body, Some(&script))
}

/// Served in place of an HTML document when the worker is missing or outdated.
pub fn install_page(remote: &str, proxied: &str) -> String {
    registering("Loading", &format!("Loading {remote}"), proxied)
}

pub fn init_page(continue_to: Option<&str>) -> String {
    registering("Setting up", "Setting up", continue_to.unwrap_or("/"))
}

pub fn settings_page(sections: &[Section], csrf_token: &str, dependencies: &Value) -> String {
    let mut body = String::from("<h1>Settings</h1><form method=\"post\" action=\"/settings\">");
    for section in sections {
        body.push_str(&format!(
            "<fieldset><legend>{}</legend>",
            escape_html(section.name)
        ));
        for option in &section.options {
            let id = option.name.replace('_', "-");
            body.push_str(&format!(
                "<label><input type=\"checkbox\" id=\"{id}\" name=\"{name}\" value=\"1\"{checked}> \
                 {label}</label>",
                id = escape_html(&id),
                name = escape_html(option.name),
                checked = if option.enabled { " checked" } else { "" },
                label = escape_html(option.label),
            ));
            for line in &option.description {
                body.push_str(&format!("<small>{}</small>", escape_html(line)));
            }
        }
        body.push_str("</fieldset>");
    }
    body.push_str(&format!(
        "<input type=\"hidden\" name=\"csrf_token\" value=\"{}\">\
         <button type=\"submit\" name=\"action\" value=\"save\">Save</button> \
         <button type=\"submit\" name=\"action\" value=\"reset\">Restore defaults</button></form>",
        escape_html(csrf_token)
    ));
    let script = format!(
        "const DEPENDENCIES = {};{SETTINGS_SCRIPT}",
        script_json(dependencies)
    );
    layout("Settings", &body, Some(&script))
}

pub fn update_page() -> String {
    layout(
        "Settings saved",
        "<h1>Settings saved</h1><p>Your preferences take effect on the next page load.</p>\
         <p><a href=\"/settings\">Back to settings</a></p>",
        None,
    )
}

pub fn uninstall_page() -> String {
    layout(
        "Uninstall",
        "<h1>Uninstall</h1><p id=\"status\">Removing the worker and its data.</p>",
        Some(UNREGISTER_WORKER),
    )
}

/// The remote address matched more than one candidate; let the user pick.
pub fn multiple_choices_page(requested: &str, candidates: &[(String, String)]) -> String {
    let mut body = format!(
        "<h1>Which address did you mean?</h1><p>{} could refer to:</p><ul>",
        escape_html(requested)
    );
    for (label, href) in candidates {
        body.push_str(&format!(
            "<li><a href=\"{href}\">{label}</a></li>",
            href = escape_html(href),
            label = escape_html(label),
        ));
    }
    body.push_str("</ul>");
    layout("Multiple choices", &body, None)
}

pub fn service_worker_script(settings: &Value) -> String {
    WORKER_TEMPLATE.replace("__SETTINGS__", &script_json(settings))
}
