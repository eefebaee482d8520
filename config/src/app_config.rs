use directories::ProjectDirs;
use std::{
    env,
    path::PathBuf,
};

lazy_static::lazy_static! {
    static ref PROJECT_NAME: String = env!("CARGO_PKG_NAME").to_uppercase().replace('-', "_");
    static ref CONFIG_FOLDER: Option<PathBuf> =
        env::var(format!("{}_DIR", PROJECT_NAME.clone()))
            .ok()
            .map(PathBuf::from);
}

fn project_directory() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "cluster-diag", "cluster-diag")
}

/// Directory searched for an implicit `config.yaml` when `--config` is not given.
/// `CLUSTER_DIAG_CONFIG_DIR` takes precedence over the platform default.
pub fn get_config_dir() -> PathBuf {
    if let Some(dir) = CONFIG_FOLDER.clone() {
        dir
    } else if let Some(proj_dirs) = project_directory() {
        proj_dirs.config_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".config")
    }
}
