use directories::ProjectDirs;
use serde::Deserialize;
use std::{
    env,
    path::PathBuf,
};

#[derive(Clone, Debug, Deserialize, Default)]
pub(crate) struct AppConfig {
    #[serde(default)]
    pub(crate) data_dir: PathBuf,
    #[serde(default)]
    pub(crate) config_dir: PathBuf,
}

/// Prefix of every environment variable read by the process.
pub(crate) const ENV_PREFIX: &str = "FLOOD";

lazy_static::lazy_static! {
    static ref DATA_FOLDER: Option<PathBuf> = env::var(format!("{ENV_PREFIX}_DATA")).ok().map(PathBuf::from);
    static ref CONFIG_FOLDER: Option<PathBuf> = env::var(format!("{ENV_PREFIX}_CONFIG")).ok().map(PathBuf::from);
}

pub fn get_data_dir() -> PathBuf {
    if let Some(s) = DATA_FOLDER.clone() {
        s
    } else if let Some(proj_dirs) = project_directory() {
        proj_dirs.data_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".data")
    }
}

pub fn get_config_dir() -> PathBuf {
    if let Some(s) = CONFIG_FOLDER.clone() {
        s
    } else if let Some(proj_dirs) = project_directory() {
        proj_dirs.config_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".config")
    }
}

fn project_directory() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "flood", "flood")
}
