use crate::http_config::resolve_secret;
use eyre::Result;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    path::PathBuf,
    time::Duration,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_file: Option<PathBuf>,
    /// Accept unknown host keys instead of failing the session.
    #[serde(default)]
    pub trust_remote: bool,
    #[serde(default)]
    pub sudo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo_password_env: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user: None,
            port: default_port(),
            key_file: None,
            known_hosts_file: None,
            trust_remote: false,
            sudo: false,
            sudo_password_env: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn sudo_password(&self) -> Result<Option<String>> {
        resolve_secret(self.sudo_password_env.as_deref())
    }
}
