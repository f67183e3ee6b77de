use std::collections::BTreeMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ORIGIN, REFERER};
use url::Url;

/// Request headers that never travel from the UI frame to the upstream site.
const STRIPPED: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "origin",
    "referer",
    "cookie",
    "content-length",
    "accept-encoding",
];

/// Outbound header policy for the running task.
///
/// For every header the value comes from, in order: the task's user-configured
/// header, the default derived from the plugin's base URL (Origin and Referer
/// only), or nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderRules {
    user: BTreeMap<String, String>,
    derived: BTreeMap<String, String>,
}

impl HeaderRules {
    pub fn new(user_headers: &BTreeMap<String, String>, base_url: Option<&Url>) -> Self {
        let user = user_headers
            .iter()
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.clone()))
            .collect();

        let mut derived = BTreeMap::new();
        if let Some(base) = base_url {
            let origin = base.origin();
            if origin.is_tuple() {
                let origin = origin.ascii_serialization();
                derived.insert(REFERER.as_str().to_string(), format!("{origin}/"));
                derived.insert(ORIGIN.as_str().to_string(), origin);
            }
        }
        Self { user, derived }
    }

    /// Effective value of `name` (case-insensitive) after applying precedence.
    pub fn value(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.user
            .get(&name)
            .or_else(|| self.derived.get(&name))
            .map(String::as_str)
    }

    /// The rule headers alone, as sent on script-issued requests.
    pub fn header_map(&self) -> HeaderMap {
        self.outbound(&HeaderMap::new())
    }

    /// Headers for an upstream request forwarded on behalf of `incoming`.
    pub fn outbound(&self, incoming: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in incoming {
            if !STRIPPED.contains(&name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }
        for (name, value) in self.derived.iter().chain(self.user.iter()) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                // User headers come last so they replace derived ones.
                headers.insert(name, value);
            }
        }
        headers
    }
}
