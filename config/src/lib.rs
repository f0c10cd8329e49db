#[macro_use]
extern crate tracing;

mod app_config;
mod args;
pub mod duration;
mod proxy;

use app_config::AppConfig;
pub use app_config::{
    get_config_dir,
    get_data_dir,
};
pub use args::{
    version,
    Args,
};
use color_eyre::Result;
use eyre::Context as _;
pub use proxy::{
    ProxyConfig,
    ProxyProtocol,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    net::{
        IpAddr,
        SocketAddr,
    },
    path::PathBuf,
    time::Duration,
};

const DEFAULT_CONFIG: &str = include_str!("default-config.yaml");
const STORE_FILE_NAME: &str = "measurements.log";

/// Settings of the whole process. Built once at startup and handed to every component.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(flatten, skip_serializing)]
    app_config: AppConfig,
    pub probe: ProbeConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Resource downloaded on every probe.
    pub url: url::Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(with = "duration")]
    pub interval: Duration,
    #[serde(with = "duration")]
    pub connect_timeout: Duration,
    /// Upper bound for a whole download, connect included.
    #[serde(with = "duration")]
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(with = "duration")]
    pub retention: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub workers: usize,
    #[serde(with = "duration")]
    pub read_timeout: Duration,
    #[serde(with = "duration")]
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn listen_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("server.workers must be at least 1")]
    NoWorkers,
    #[error("probe.interval must be greater than zero")]
    ZeroInterval,
    #[error("store.retention must be greater than zero")]
    ZeroRetention,
    #[error("probe.proxy.port must be greater than zero")]
    ZeroProxyPort,
}

impl Default for Config {
    fn default() -> Self {
        serde_yml::from_str(DEFAULT_CONFIG).expect("Failed to parse default config")
    }
}

impl Config {
    pub fn new(args: Args) -> Result<Self, config::ConfigError> {
        let data_dir = get_data_dir();
        let config_dir = get_config_dir();
        let mut builder = config::Config::builder()
            .set_default("data_dir", data_dir.display().to_string())?
            .set_default("config_dir", config_dir.display().to_string())?
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Yaml));

        let config_files = [("config.yaml", config::FileFormat::Yaml)];

        for (file, format) in &config_files {
            let source = config::File::from(config_dir.join(file))
                .format(*format)
                .required(false);
            builder = builder.add_source(source);
        }

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()).format(config::FileFormat::Yaml));
        }

        builder = builder
            .add_source(
                config::Environment::with_prefix(app_config::ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .add_source(args);

        let cfg: Self = builder.build()?.try_deserialize()?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.server.workers == 0 {
            return Err(ValidationError::NoWorkers);
        }
        if self.probe.interval.is_zero() {
            return Err(ValidationError::ZeroInterval);
        }
        if self.store.retention.is_zero() {
            return Err(ValidationError::ZeroRetention);
        }
        if self.probe.proxy.as_ref().is_some_and(|proxy| proxy.port == 0) {
            return Err(ValidationError::ZeroProxyPort);
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        if self.app_config.data_dir.as_os_str().is_empty() {
            get_data_dir()
        } else {
            self.app_config.data_dir.clone()
        }
    }

    pub fn config_dir(&self) -> PathBuf {
        if self.app_config.config_dir.as_os_str().is_empty() {
            get_config_dir()
        } else {
            self.app_config.config_dir.clone()
        }
    }

    /// Location of the measurement log, falling back to a file in the data directory.
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir().join(STORE_FILE_NAME))
    }

    pub fn save(&self) -> Result<()> {
        let config_dir = self.config_dir();
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        let path = config_dir.join("config.yaml");
        let content = serde_yml::to_string(self).context("Failed to serialize config")?;
        std::fs::write(&path, content).wrap_err_with(|| format!("Failed to write config to {:?}", path))?;
        info!(?path, "Configuration saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_follow_the_classic_settings() {
        let config = Config::default();
        assert_eq!(config.server.port, 53333);
        assert_eq!(config.server.workers, 8);
        assert_eq!(config.probe.interval, Duration::from_secs(60 * 60));
        assert_eq!(config.probe.connect_timeout, Duration::from_secs(20));
        assert_eq!(config.store.retention, Duration::from_secs(30 * 24 * 60 * 60));
        assert_eq!(config.probe.proxy, None);
        assert_eq!(config.store.path, None);
        assert!(config.store_path().ends_with(STORE_FILE_NAME));
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn config_file_and_flags_are_layered() {
        let dir = temp_dir::TempDir::new().unwrap();
        let file = dir.child("override.yaml");
        std::fs::write(
            &file,
            "probe:\n  interval: 90s\n  proxy:\n    protocol: socks\n    host: 127.0.0.1\n    port: 1080\nserver:\n  port: 9000\n  workers: 2\n",
        )
        .unwrap();

        let args = Args {
            config: Some(file),
            port: Some(9100),
            store: Some(dir.child("log")),
            ..Args::default()
        };
        let config = Config::new(args).unwrap();

        assert_eq!(config.probe.interval, Duration::from_secs(90));
        assert_eq!(
            config.probe.proxy,
            Some(ProxyConfig::new(ProxyProtocol::Socks, "127.0.0.1", 1080))
        );
        assert_eq!(config.server.workers, 2);
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.store_path(), dir.child("log"));
        assert_eq!(config.server.read_timeout, Duration::from_secs(5));
    }

    #[test]
    fn saved_configuration_reads_back() {
        let dir = temp_dir::TempDir::new().unwrap();
        let mut config = Config::default();
        config.app_config.config_dir = dir.child("nested");
        config.server.port = 9999;
        config.probe.interval = Duration::from_secs(15 * 60);
        config.probe.proxy = Some(ProxyConfig::new(ProxyProtocol::Http, "proxy.local", 3128));
        config.store.path = Some(dir.child("measurements.log"));

        config.save().unwrap();

        let written = std::fs::read_to_string(dir.child("nested").join("config.yaml")).unwrap();
        let reloaded: Config = serde_yml::from_str(&written).unwrap();
        assert_eq!(reloaded.probe, config.probe);
        assert_eq!(reloaded.store, config.store);
        assert_eq!(reloaded.server, config.server);
        assert!(!written.contains("config_dir"));
    }

    #[test]
    fn rejects_unusable_settings() {
        let mut config = Config::default();
        config.server.workers = 0;
        assert_eq!(config.validate(), Err(ValidationError::NoWorkers));

        let mut config = Config::default();
        config.probe.interval = Duration::ZERO;
        assert_eq!(config.validate(), Err(ValidationError::ZeroInterval));

        let mut config = Config::default();
        config.store.retention = Duration::ZERO;
        assert_eq!(config.validate(), Err(ValidationError::ZeroRetention));

        let mut config = Config::default();
        config.probe.proxy = Some(ProxyConfig::new(ProxyProtocol::Http, "proxy", 0));
        assert_eq!(config.validate(), Err(ValidationError::ZeroProxyPort));
    }
}
