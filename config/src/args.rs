use clap::Parser;
use std::{
    collections::HashMap,
    path::PathBuf,
};

/// Capture a diagnostic bundle from a cluster.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to a YAML config file. Replaces the implicit `config.yaml` lookup.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Seed address of the cluster. May be given multiple times.
    #[arg(long = "seed", short = 's', value_name = "URL")]
    pub seeds: Vec<String>,

    /// Component type to diagnose (must exist in the query catalog).
    #[arg(long)]
    pub component: Option<String>,

    /// Query catalog file. The built-in catalog is used when omitted.
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Directory in which the run directory is created.
    #[arg(long, short = 'o')]
    pub output_dir: Option<PathBuf>,

    /// Collection mode: `full` runs everything, any other value only runs queries tagged with it.
    #[arg(long)]
    pub mode: Option<String>,

    /// Number of targets collected concurrently.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Per-attempt timeout of a single call, in seconds.
    #[arg(long)]
    pub call_timeout_secs: Option<u64>,

    /// Retries for idempotent calls that fail at the transport level.
    #[arg(long)]
    pub retries: Option<u32>,

    /// Timeout of the whole run, in seconds.
    #[arg(long)]
    pub run_timeout_secs: Option<u64>,

    /// HTTP basic auth user.
    #[arg(long, env = "CLUSTER_DIAG_USER")]
    pub user: Option<String>,

    /// Name of the environment variable holding the HTTP password.
    #[arg(long)]
    pub password_env: Option<String>,

    /// Skip TLS certificate verification.
    #[arg(long, action)]
    pub insecure: bool,

    /// Run the remote system commands over SSH.
    #[arg(long, action)]
    pub ssh: bool,

    /// Remote user for SSH sessions.
    #[arg(long)]
    pub ssh_user: Option<String>,

    /// Private key used for SSH sessions.
    #[arg(long)]
    pub ssh_key: Option<PathBuf>,

    /// Prefix remote commands with sudo.
    #[arg(long, action)]
    pub sudo: bool,

    /// Enable debug logging.
    #[arg(long, short = 'v', action)]
    pub verbose: bool,
}

impl config::Source for Args {
    fn clone_into_box(&self) -> Box<dyn config::Source + Send + Sync> {
        Box::new((*self).clone())
    }

    fn collect(&self) -> Result<config::Map<String, config::Value>, config::ConfigError> {
        let mut cache = HashMap::<String, config::Value>::new();
        if !self.seeds.is_empty() {
            cache.insert("seeds".to_string(), self.seeds.clone().into());
        }
        if let Some(component) = &self.component {
            cache.insert("component".to_string(), component.clone().into());
        }
        if let Some(catalog) = &self.catalog {
            cache.insert("catalog".to_string(), catalog.display().to_string().into());
        }
        if let Some(output_dir) = &self.output_dir {
            cache.insert("output_dir".to_string(), output_dir.display().to_string().into());
        }
        if let Some(mode) = &self.mode {
            cache.insert("mode".to_string(), mode.clone().into());
        }
        if let Some(value) = self.concurrency {
            cache.insert("concurrency".to_string(), (value as u64).into());
        }
        if let Some(value) = self.call_timeout_secs {
            cache.insert("call_timeout_secs".to_string(), value.into());
        }
        if let Some(value) = self.retries {
            cache.insert("retries".to_string(), (value as u64).into());
        }
        if let Some(value) = self.run_timeout_secs {
            cache.insert("run_timeout_secs".to_string(), value.into());
        }
        if let Some(user) = &self.user {
            cache.insert("http.user".to_string(), user.clone().into());
        }
        if let Some(password_env) = &self.password_env {
            cache.insert("http.password_env".to_string(), password_env.clone().into());
        }
        if self.insecure {
            cache.insert("http.insecure".to_string(), true.into());
        }
        if self.ssh {
            cache.insert("ssh.enabled".to_string(), true.into());
        }
        if let Some(user) = &self.ssh_user {
            cache.insert("ssh.user".to_string(), user.clone().into());
        }
        if let Some(key) = &self.ssh_key {
            cache.insert("ssh.key_file".to_string(), key.display().to_string().into());
        }
        if self.sudo {
            cache.insert("ssh.sudo".to_string(), true.into());
        }
        if self.verbose {
            cache.insert("verbose".to_string(), true.into());
        }
        Ok(cache)
    }
}
