use derive_more::{
    Deref,
    Display,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::collections::BTreeMap;
use strum::Display as StrumDisplay;
use url::Url;

/// Stable, filesystem-safe identity of a target: `<component>_<host>_<port>`. Anything outside
/// `[A-Za-z0-9.-]` is percent-escaped, so distinct hosts never share a key.
#[derive(Debug, Clone, Display, Deref, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetKey(String);

impl TargetKey {
    pub fn new(component: &str, host: &str, port: u16) -> Self {
        let mut key = String::with_capacity(component.len() + host.len() + 8);
        escape_into(&mut key, component);
        key.push('_');
        escape_into(&mut key, host);
        key.push_str(&format!("_{port}"));
        Self(key)
    }
}

fn escape_into(out: &mut String, raw: &str) {
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => out.push(byte as char),
            // A leading dot would hide the directory.
            b'.' if !out.is_empty() => out.push('.'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
}

/// Operating system family of a host, selects which remote command set applies.
#[derive(Debug, Clone, Copy, StrumDisplay, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    Linux,
    Darwin,
    Windows,
}

impl Platform {
    /// Maps an OS name as reported by the product (`Linux`, `Mac OS X`, `Windows Server 2019`).
    /// Anything unrecognised is treated as Linux.
    pub fn from_os_name(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.contains("windows") {
            Self::Windows
        } else if name.contains("darwin") || name.contains("mac") {
            Self::Darwin
        } else {
            if !name.contains("linux") {
                debug!(os = %name, "unrecognised operating system, assuming linux");
            }
            Self::Linux
        }
    }
}

/// One addressable node. Created during discovery, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub key: TargetKey,
    /// Node name reported by the cluster, or the host when unknown.
    pub name: String,
    pub component: String,
    pub base_url: Url,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Values read from the topology or bootstrap response, available as placeholders.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub facts: BTreeMap<String, String>,
}

impl Target {
    /// Returns `None` for URLs without a host.
    pub fn from_url(component: &str, base_url: Url, name: Option<String>) -> Option<Self> {
        let host = base_url.host_str()?.trim_matches(|c| c == '[' || c == ']').to_string();
        let port = base_url.port_or_known_default()?;
        Some(Self {
            key: TargetKey::new(component, &host, port),
            name: name.unwrap_or_else(|| host.clone()),
            component: component.to_string(),
            base_url,
            host,
            port,
            platform: None,
            facts: BTreeMap::new(),
        })
    }

    /// Resolves a request path against the base URL, keeping any path prefix of the base.
    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let prefixed = format!("{}/", base.path());
            base.set_path(&prefixed);
        }
        base.join(path.trim_start_matches('/'))
    }

    /// Built-in template values for this target, over its facts.
    pub fn variables(&self, version: Option<&str>) -> BTreeMap<String, String> {
        let mut vars = self.facts.clone();
        vars.extend([
            ("host".to_string(), self.host.clone()),
            ("port".to_string(), self.port.to_string()),
            ("node".to_string(), self.name.clone()),
            ("component".to_string(), self.component.clone()),
        ]);
        if let Some(version) = version {
            vars.insert("version".to_string(), version.to_string());
        }
        vars
    }
}
