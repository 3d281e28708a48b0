//! Page extractors for the login flow and identity discovery.
//!
//! Each field has a ranked list of independent extractors tried in fixed
//! order. "Nothing matched" is a [`Discovery::NoMatch`] value, not an error.

use once_cell::sync::Lazy;
use pupilhub_core::{Identity, SchoolOption};
use regex::Regex;
use serde_json::Value as JsonValue;

/// Hidden ASP.NET form-state fields echoed back on every form post.
pub const FORM_STATE_FIELDS: &[&str] =
    &["__VIEWSTATE", "__VIEWSTATEGENERATOR", "__EVENTVALIDATION"];

/// Name of the username input on the legacy credential form.
pub const USERNAME_FIELD: &str = "login_ascx$txtNotandanafn";
pub const PASSWORD_FIELD: &str = "login_ascx$txtLykilord";
pub const LOGIN_EVENT_TARGET: &str = "login_ascx$btnLogin";
pub const DECLINE_PIN_EVENT_TARGET: &str = "aDontActivatePin";

static SCRIPT_REDIRECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"window\.location\.href\s*=\s*["']([^"']+)["']"#).unwrap());

static OAUTH_TOKEN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"oauth_token"\s+value="([\w+=/]+)""#).unwrap(),
        Regex::new(r#"value="([\w+=/]+)"\s+name="oauth_token""#).unwrap(),
    ]
});

static INPUT_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<input\b[^>]*>").unwrap());
static ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)([\w$:.-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());

static ANCHOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#).unwrap()
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

static SWITCH_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r#"(?is)<a\b[^>]*?href\s*=\s*["'][^"']*/Account/PupilSwitcher/SwitchPupil/(\d+)"#,
        r#"[^"']*["'][^>]*>(.*?)</a>"#,
    ))
    .unwrap()
});
static SWITCH_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/Account/PupilSwitcher/SwitchPupil/(\d+)").unwrap());
static PUPIL_ARRAY_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(?:"(?:pupils|children|students)"\s*:|\bpupils\s*=)\s*\["#).unwrap()
});
static DATA_PUPIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)data-pupil-id\s*=\s*["']([^"']+)["'][^>]*>([^<]*)<"#).unwrap());

static INVALID_NAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^\d+$",
        r"(?i)vänligen kontrollera",
        r"(?i)kontaktuppgifter",
        r"(?i)preschool.*today",
        r"(?i)fritids.*today",
        r"(?i)has.*school",
        r"(?i)firsttimeinfo",
        r"(?i)föräldrarna",
        r"(?i)vårdnadshavare",
        r"<[^>]+>",
        r"function\s*\(",
        r"var\s+\w+",
        r"(?i)\.js$",
        r"(?i)\.css$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Outcome of a ranked extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery<T> {
    /// An extractor produced a non-empty result.
    Found { extractor: &'static str, value: T },
    /// No extractor matched.
    NoMatch,
}

impl<T> Discovery<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Discovery::Found { value, .. } => Some(value),
            Discovery::NoMatch => None,
        }
    }
}

type IdentityExtractor = fn(&str) -> Vec<Identity>;

/// Identity extractors, most reliable first.
const IDENTITY_EXTRACTORS: &[(&str, IdentityExtractor)] = &[
    ("embedded_json", identities_from_json),
    ("switch_links", identities_from_switch_links),
    ("data_attributes", identities_from_data_attributes),
];

/// Redirect target from a `window.location.href = "..."` assignment.
pub fn script_redirect(html: &str) -> Option<String> {
    SCRIPT_REDIRECT
        .captures(html)
        .map(|c| decode_entities(&c[1]))
}

/// The opaque OAuth token embedded in a hidden form field.
pub fn oauth_token(html: &str) -> Discovery<String> {
    for (rank, pattern) in OAUTH_TOKEN_PATTERNS.iter().enumerate() {
        if let Some(captures) = pattern.captures(html) {
            return Discovery::Found {
                extractor: if rank == 0 { "name_then_value" } else { "value_then_name" },
                value: captures[1].to_string(),
            };
        }
    }
    Discovery::NoMatch
}

/// All `<input>` name/value pairs in document order.
pub fn input_fields(html: &str) -> Vec<(String, String)> {
    INPUT_TAG
        .find_iter(html)
        .filter_map(|tag| {
            let mut name = None;
            let mut value = String::new();
            for attr in ATTRIBUTE.captures_iter(tag.as_str()) {
                let attr_value = attr
                    .get(2)
                    .or_else(|| attr.get(3))
                    .map_or("", |m| m.as_str());
                match attr[1].to_ascii_lowercase().as_str() {
                    "name" => name = Some(attr_value.to_string()),
                    "value" => value = decode_entities(attr_value),
                    _ => {}
                }
            }
            name.map(|name| (name, value))
        })
        .collect()
}

/// Hidden form-state fields, each present (empty when absent from the page).
pub fn form_state(html: &str) -> Vec<(String, String)> {
    let inputs = input_fields(html);
    FORM_STATE_FIELDS
        .iter()
        .map(|field| {
            let value = inputs
                .iter()
                .find(|(name, _)| name == field)
                .map(|(_, value)| value.clone())
                .unwrap_or_default();
            (field.to_string(), value)
        })
        .collect()
}

/// Whether the page carries the legacy credential form.
pub fn has_credential_form(html: &str) -> bool {
    input_fields(html).iter().any(|(name, _)| name == USERNAME_FIELD)
}

/// Login targets offered on a tenant-picker page.
///
/// Only anchors pointing at a known SSO entry point count. Duplicate URLs
/// keep their first label.
pub fn school_options(html: &str) -> Vec<SchoolOption> {
    let mut options: Vec<SchoolOption> = Vec::new();
    for captures in ANCHOR.captures_iter(html) {
        let url = decode_entities(&captures[1]);
        if !is_sso_entry(&url) || options.iter().any(|o| o.login_url == url) {
            continue;
        }
        let label = clean_text(&captures[2]);
        if label.is_empty() {
            continue;
        }
        options.push(SchoolOption::new(label, url));
    }
    options
}

fn is_sso_entry(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.contains("login.ashx?idp=")
        || lower.contains("/login/initial")
        || lower.contains("communeid=")
}

/// Identities on the account landing page.
///
/// Extractors run in rank order; the first non-empty result wins.
pub fn discover_identities(html: &str) -> Discovery<Vec<Identity>> {
    for (name, extractor) in IDENTITY_EXTRACTORS {
        let identities = extractor(html);
        if !identities.is_empty() {
            return Discovery::Found {
                extractor: *name,
                value: identities,
            };
        }
    }
    Discovery::NoMatch
}

/// Every identity any extractor can see, merged in rank order.
///
/// Used by the targeted re-scan, where lower-ranked extractors may still
/// contribute a switch token the top-ranked one lacks.
pub fn scan_all_identities(html: &str) -> Vec<Identity> {
    let mut registry = pupilhub_core::IdentityRegistry::new();
    for (_, extractor) in IDENTITY_EXTRACTORS {
        registry.merge(extractor(html));
    }
    registry.iter().cloned().collect()
}

fn identities_from_json(html: &str) -> Vec<Identity> {
    let mut found = Vec::new();
    for key in PUPIL_ARRAY_KEY.find_iter(html) {
        // The match ends just past `[`; parse the array from there and
        // ignore whatever follows it.
        let start = key.end() - 1;
        let mut stream =
            serde_json::Deserializer::from_str(&html[start..]).into_iter::<JsonValue>();
        let Some(Ok(JsonValue::Array(items))) = stream.next() else {
            continue;
        };
        found.extend(items.iter().filter_map(identity_from_json));
        if !found.is_empty() {
            break;
        }
    }
    found
}

fn identity_from_json(item: &JsonValue) -> Option<Identity> {
    let id = ["id", "pupilId"]
        .iter()
        .find_map(|field| json_scalar(item.get(*field)?))
        .or_else(|| {
            let mapping = item.get("hybridMappingId")?.as_str()?;
            mapping.split('|').next().map(str::trim).filter(|s| !s.is_empty()).map(String::from)
        })?;

    let mut identity = Identity::new(id);
    if let Some(name) = item.get("name").and_then(JsonValue::as_str) {
        if is_plausible_name(name) {
            identity.display_name = Some(name.trim().to_string());
        }
    }
    if let Some(url) = item.get("switchPupilUrl").and_then(JsonValue::as_str) {
        identity.switch_token = SWITCH_PATH.captures(url).map(|c| c[1].to_string());
    }
    Some(identity)
}

fn json_scalar(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn identities_from_switch_links(html: &str) -> Vec<Identity> {
    let mut registry = pupilhub_core::IdentityRegistry::new();
    for captures in SWITCH_LINK.captures_iter(html) {
        let token = captures[1].to_string();
        let name = clean_text(&captures[2]);
        let mut identity = Identity::new(token.clone()).with_token(token);
        if is_plausible_name(&name) {
            identity.display_name = Some(name);
        }
        registry.upsert(identity);
    }
    // Bare switch paths (e.g. inside scripts) still identify pupils.
    for captures in SWITCH_PATH.captures_iter(html) {
        let token = captures[1].to_string();
        registry.upsert(Identity::new(token.clone()).with_token(token));
    }
    registry.iter().cloned().collect()
}

fn identities_from_data_attributes(html: &str) -> Vec<Identity> {
    let mut registry = pupilhub_core::IdentityRegistry::new();
    for captures in DATA_PUPIL.captures_iter(html) {
        let mut identity = Identity::new(captures[1].trim());
        let name = clean_text(&captures[2]);
        if is_plausible_name(&name) {
            identity.display_name = Some(name);
        }
        registry.upsert(identity);
    }
    registry.iter().cloned().collect()
}

/// Rejects markup, script fragments and portal boilerplate posing as names.
pub fn is_plausible_name(name: &str) -> bool {
    let name = name.trim();
    let length = name.chars().count();
    if !(2..=100).contains(&length) || !name.chars().any(char::is_alphabetic) {
        return false;
    }
    !INVALID_NAME_PATTERNS.iter().any(|pattern| pattern.is_match(name))
}

fn clean_text(fragment: &str) -> String {
    let text = TAG.replace_all(fragment, " ");
    decode_entities(&text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
}
