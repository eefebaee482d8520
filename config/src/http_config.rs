use eyre::{
    eyre,
    Result,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::collections::BTreeMap;

/// Settings of the shared HTTP client used against the management API.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Name of the environment variable that holds the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl HttpConfig {
    /// Resolves the password reference. A reference to an unset variable is an error,
    /// no reference at all means no password.
    pub fn password(&self) -> Result<Option<String>> {
        resolve_secret(self.password_env.as_deref())
    }
}

pub(crate) fn resolve_secret(env_name: Option<&str>) -> Result<Option<String>> {
    match env_name {
        None => Ok(None),
        Some(name) => std::env::var(name)
            .map(Some)
            .map_err(|_| eyre!("credential variable {name} is not set")),
    }
}
