#[macro_use]
extern crate tracing;

mod app_config;
mod args;
mod http_config;
mod ssh_config;

pub use app_config::get_config_dir;
pub use args::Args;
use eyre::{
    bail,
    Result,
};
pub use http_config::HttpConfig;
use serde::{
    Deserialize,
    Serialize,
};
pub use ssh_config::SshConfig;
use std::{
    collections::BTreeMap,
    path::PathBuf,
    time::Duration,
};
use url::Url;

/// The mode that runs every query regardless of its tags.
pub const FULL_MODE: &str = "full";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub component: String,
    pub seeds: Vec<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub mode: String,
    pub concurrency: usize,
    pub call_timeout_secs: u64,
    pub retries: u32,
    pub retry_pause_millis: u64,
    pub run_timeout_secs: u64,
    pub cancel_grace_secs: u64,
    /// Template values that override the catalog's own `variables`.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub verbose: bool,
}

const DEFAULT_CONFIG: &str = include_str!("default-config.yaml");

impl Default for Config {
    fn default() -> Self {
        serde_yml::from_str(DEFAULT_CONFIG).expect("Failed to parse default config")
    }
}

impl Config {
    /// Layers the built-in defaults, the config file, `CLUSTER_DIAG__*` environment
    /// variables and the command-line arguments, in that order.
    pub fn new(args: Args) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Yaml));

        builder = match &args.config {
            Some(path) => builder.add_source(
                config::File::from(path.as_path())
                    .format(config::FileFormat::Yaml)
                    .required(true),
            ),
            None => builder.add_source(
                config::File::from(get_config_dir().join("config.yaml"))
                    .format(config::FileFormat::Yaml)
                    .required(false),
            ),
        };

        builder = builder.add_source(
            config::Environment::with_prefix("CLUSTER_DIAG")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("seeds")
                .try_parsing(true),
        );

        builder = builder.add_source(args);

        let cfg: Self = builder.build()?.try_deserialize()?;
        debug!(component = %cfg.component, seeds = cfg.seeds.len(), "configuration loaded");

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.component.trim().is_empty() {
            bail!("config.component must be non-empty");
        }
        if self.seeds.is_empty() {
            bail!("config.seeds must contain at least one address");
        }
        if self.concurrency == 0 {
            bail!("config.concurrency must be greater than zero");
        }
        if self.call_timeout_secs == 0 {
            bail!("config.call_timeout_secs must be greater than zero");
        }
        if self.run_timeout_secs == 0 {
            bail!("config.run_timeout_secs must be greater than zero");
        }
        if self.mode.trim().is_empty() {
            bail!("config.mode must be non-empty");
        }
        Ok(())
    }

    pub fn is_full_mode(&self) -> bool {
        self.mode == FULL_MODE
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_millis)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.component, "elasticsearch");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.retries, 1);
        assert_eq!(config.ssh.port, 22);
        assert!(!config.ssh.enabled);
        assert!(config.is_full_mode());
    }

    #[test]
    fn validation_rejects_missing_seeds() {
        let config = Config {
            seeds: Vec::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            concurrency: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_and_args_are_layered_over_defaults() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.child("diag.yaml");
        std::fs::write(
            &path,
            "component: kibana\nseeds: [\"https://kb.local:5601\"]\nconcurrency: 8\nssh:\n  enabled: true\n  port: 2222\n",
        )
        .unwrap();

        let args = Args {
            config: Some(path),
            concurrency: Some(2),
            ssh_user: Some("diag".to_string()),
            ..Args::default()
        };
        let config = Config::new(args).unwrap();

        assert_eq!(config.component, "kibana");
        assert_eq!(config.seeds, vec![Url::parse("https://kb.local:5601").unwrap()]);
        assert_eq!(config.concurrency, 2);
        assert!(config.ssh.enabled);
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.ssh.user.as_deref(), Some("diag"));
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn missing_password_variable_is_reported() {
        let http = HttpConfig {
            password_env: Some("CLUSTER_DIAG_TEST_PASSWORD_THAT_IS_NOT_SET".to_string()),
            ..HttpConfig::default()
        };
        assert!(http.password().is_err());
        assert_eq!(HttpConfig::default().password().unwrap(), None);
    }
}
