use crate::store::{
    MeasurementStore,
    StoreError,
};
use flood_config::ProbeConfig;
use reqwest::{
    redirect::Policy,
    Client,
    Proxy,
};
use std::{
    fmt::Debug,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        RwLock,
    },
    time::{
        Duration,
        Instant,
    },
};
use url::Url;

/// Note attached to every measurement produced by the download probe.
pub const DOWNLOAD_NOTE: &str = "download_speed";

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to build the http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("download of {url} failed: {source}")]
    Transport {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A single bandwidth measurement that can be triggered repeatedly.
///
/// A run never fails from the caller's point of view. The outcome of the latest
/// run is available through [`DownloadTest::last_error`].
pub trait DownloadTest: Send + Sync + Debug {
    fn run(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Error of the most recent run, `None` after a successful one.
    fn last_error(&self) -> Option<Arc<ProbeError>>;

    fn store(&self) -> Arc<MeasurementStore>;

    fn set_store(&self, store: Arc<MeasurementStore>);
}

/// Downloads a resource over HTTP and records the observed throughput.
#[derive(Debug)]
pub struct HttpDownloadTest {
    client: Client,
    url: RwLock<Url>,
    store: RwLock<Arc<MeasurementStore>>,
    last_error: Mutex<Option<Arc<ProbeError>>>,
}

impl HttpDownloadTest {
    pub fn new(config: &ProbeConfig, store: Arc<MeasurementStore>) -> Result<Self, ProbeError> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .redirect(Policy::limited(MAX_REDIRECTS));

        builder = match &config.proxy {
            Some(proxy) => {
                debug!(proxy = proxy.url(), "Routing probes through proxy");
                builder.proxy(Proxy::all(proxy.url()).map_err(ProbeError::Client)?)
            }
            None => builder.no_proxy(),
        };

        Ok(Self {
            client: builder.build().map_err(ProbeError::Client)?,
            url: RwLock::new(config.url.clone()),
            store: RwLock::new(store),
            last_error: Mutex::new(None),
        })
    }

    pub fn url(&self) -> Url {
        self.url.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_url(&self, url: Url) {
        info!(%url, "Switching probe resource");
        *self.url.write().unwrap_or_else(PoisonError::into_inner) = url;
    }

    #[instrument(level = "debug", skip(self))]
    async fn measure(&self) -> Result<(), ProbeError> {
        let url = self.url();
        let transport = |source| ProbeError::Transport {
            url: url.clone(),
            source,
        };

        let started = Instant::now();
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(transport)?;

        let mut bytes = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(transport)? {
            bytes += chunk.len() as u64;
        }
        let elapsed = started.elapsed();

        let throughput = throughput_bps(bytes, elapsed);
        let store = self.store();
        store.append(throughput, DOWNLOAD_NOTE).await?;

        info!(
            %url,
            bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            throughput,
            "Download probe finished"
        );
        Ok(())
    }
}

impl DownloadTest for HttpDownloadTest {
    fn run(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let outcome = self.measure().await.err().map(|err| {
                warn!("Download probe failed: {err}");
                Arc::new(err)
            });
            *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
        })
    }

    fn last_error(&self) -> Option<Arc<ProbeError>> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn store(&self) -> Arc<MeasurementStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_store(&self, store: Arc<MeasurementStore>) {
        *self.store.write().unwrap_or_else(PoisonError::into_inner) = store;
    }
}

/// Bits per second for `bytes` transferred in `elapsed`. Durations below one
/// millisecond count as one millisecond.
pub fn throughput_bps(bytes: u64, elapsed: Duration) -> u64 {
    let millis = elapsed.as_millis().max(1);
    let bps = u128::from(bytes) * 8 * 1000 / millis;
    u64::try_from(bps).unwrap_or(u64::MAX)
}
