use clap::Parser;
use std::path::PathBuf;

/// Flood bandwidth monitor
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version = version(), about, long_about = None)]
pub struct Args {
    /// Additional configuration file (yaml) layered over the stored configuration.
    #[clap(long, value_name = "FILE", env = "FLOOD_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Port the request listener binds to.
    #[clap(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Number of connections served concurrently.
    #[clap(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Delay between two bandwidth probes, e.g. `15m` or `1h`.
    #[clap(long, value_name = "DURATION")]
    pub interval: Option<String>,

    /// Maximum age of a stored measurement, e.g. `30days`.
    #[clap(long, value_name = "DURATION")]
    pub retention: Option<String>,

    /// File the measurements are written to.
    #[clap(long, value_name = "FILE")]
    pub store: Option<PathBuf>,

    /// Resource downloaded by the probe.
    #[clap(long, value_name = "URL")]
    pub url: Option<String>,

    /// Store the effective configuration in the config directory before starting.
    #[clap(long)]
    pub save_config: bool,
}

mod config_ext {
    use super::*;
    use config::{
        Map,
        Source,
        Value,
    };
    use std::collections::HashMap;

    impl Source for Args {
        fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
            Box::new((*self).clone())
        }

        fn collect(&self) -> Result<Map<String, Value>, config::ConfigError> {
            let mut cache = HashMap::<String, Value>::new();
            if let Some(port) = self.port {
                cache.insert("server.port".to_string(), (port as u64).into());
            }
            if let Some(workers) = self.workers {
                cache.insert("server.workers".to_string(), (workers as u64).into());
            }
            if let Some(interval) = &self.interval {
                cache.insert("probe.interval".to_string(), interval.clone().into());
            }
            if let Some(retention) = &self.retention {
                cache.insert("store.retention".to_string(), retention.clone().into());
            }
            if let Some(store) = &self.store {
                cache.insert("store.path".to_string(), store.display().to_string().into());
            }
            if let Some(url) = &self.url {
                cache.insert("probe.url".to_string(), url.clone().into());
            }
            Ok(cache)
        }
    }
}

pub fn version() -> String {
    let author = clap::crate_authors!();
    let config_dir_path = crate::get_config_dir().display().to_string();
    let data_dir_path = crate::get_data_dir().display().to_string();

    format!(
        "\
Authors: {author}

Config directory: {config_dir_path}
Data directory: {data_dir_path}"
    )
}
