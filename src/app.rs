use color_eyre::Result;
use eyre::Context as _;
use flood_bandwidth::{
    HttpDownloadTest,
    MeasurementStore,
    ProbeScheduler,
};
use flood_config::{
    Args,
    Config,
};
use flood_server::RequestListener;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The whole service: a scheduled download probe feeding the measurement log and a
/// listener answering queries against it.
pub struct App {
    config: Config,
}

impl App {
    pub fn new(args: Args) -> Result<Self> {
        let config = Config::new(args).context("Failed to load configuration")?;
        Self::with_config(config)
    }

    pub fn with_config(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs until the process receives ctrl-c or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                wait_for_signal().await;
                info!("Shutdown requested");
                shutdown.cancel();
            }
        });
        self.run_until(shutdown).await
    }

    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        let store_path = self.config.store_path();
        if let Some(parent) = store_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("Failed to create store directory {}", parent.display()))?;
        }
        let store = Arc::new(MeasurementStore::open(store_path, self.config.store.retention));

        let probe =
            HttpDownloadTest::new(&self.config.probe, store.clone()).context("Failed to set up the download probe")?;
        let scheduler = ProbeScheduler::new(self.config.probe.interval, Arc::new(probe));

        let address = self.config.server.listen_address();
        let listener = RequestListener::new(&self.config.server, store)
            .start()
            .await
            .wrap_err_with(|| format!("Failed to listen on {address}"))?;
        scheduler.start().context("Failed to start the probe scheduler")?;

        info!(
            address = %listener.local_addr(),
            url = %self.config.probe.url,
            interval = ?self.config.probe.interval,
            "Flood is running"
        );

        shutdown.cancelled().await;

        listener.shutdown().await;
        scheduler.stop().await;
        info!("Flood stopped");
        Ok(())
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{
            signal,
            SignalKind,
        };
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(err) => warn!("Cannot listen for SIGTERM: {err}"),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use temp_dir::TempDir;

    #[test]
    fn rejects_invalid_configuration() {
        let mut config = Config::default();
        config.server.workers = 0;
        let err = App::with_config(config).err().unwrap();
        assert_eq!(err.to_string(), "Invalid configuration");
    }

    #[tokio::test]
    async fn runs_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.server.bind = [127, 0, 0, 1].into();
        config.server.port = 0;
        config.probe.url = "http://127.0.0.1:1/".parse().unwrap();
        config.probe.connect_timeout = Duration::from_millis(200);
        config.store.path = Some(dir.child("data").join("measurements.log"));

        let app = App::with_config(config).unwrap();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(app.run_until(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(dir.child("data").is_dir());
    }
}
