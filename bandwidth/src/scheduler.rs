use crate::probe::DownloadTest;
use std::{
    sync::{
        Arc,
        Mutex,
        PoisonError,
        RwLock,
    },
    time::Duration,
};
use strum::Display;
use tokio::{
    sync::watch,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("the probe scheduler is already running")]
    AlreadyStarted,
    #[error("the probe scheduler has been stopped")]
    Stopped,
}

#[derive(Debug, Default, Clone, Copy, Display, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum SchedulerPhase {
    /// Not started yet, or between the end of a run and the next wait.
    #[default]
    Idle,
    /// Waiting for the delay to elapse.
    Scheduled,
    Running,
    Stopped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub phase: SchedulerPhase,
    /// Completed runs, successful or not.
    pub ticks: u64,
}

/// Runs a [`DownloadTest`] immediately and then every `delay` until stopped.
///
/// Runs never overlap: the delay is measured from the end of one run to the start of
/// the next one. Changing the delay or the test takes effect at the next tick.
#[derive(Debug)]
pub struct ProbeScheduler {
    shared: Arc<Shared>,
    status: watch::Receiver<SchedulerStatus>,
    cancellation: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct Shared {
    delay: RwLock<Duration>,
    test: RwLock<Arc<dyn DownloadTest>>,
    status: watch::Sender<SchedulerStatus>,
}

impl Shared {
    fn delay(&self) -> Duration {
        *self.delay.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn test(&self) -> Arc<dyn DownloadTest> {
        self.test.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        self.status.send_modify(|status| status.phase = phase);
    }
}

impl ProbeScheduler {
    pub fn new(delay: Duration, test: Arc<dyn DownloadTest>) -> Self {
        let (status_sender, status) = watch::channel(SchedulerStatus::default());
        Self {
            shared: Arc::new(Shared {
                delay: RwLock::new(delay),
                test: RwLock::new(test),
                status: status_sender,
            }),
            status,
            cancellation: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.cancellation.is_cancelled() {
            return Err(SchedulerError::Stopped);
        }
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        info!(delay = ?self.shared.delay(), "Starting probe scheduler");
        *task = Some(tokio::spawn(run_loop(self.shared.clone(), self.cancellation.clone())));
        Ok(())
    }

    /// Prevents further runs and waits for an in-flight one to finish.
    pub async fn stop(&self) {
        self.cancellation.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        match task {
            Some(task) => {
                if let Err(err) = task.await {
                    error!("Probe scheduler task failed: {err}");
                }
            }
            None => self.shared.set_phase(SchedulerPhase::Stopped),
        }
        debug!("Probe scheduler stopped");
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }

    pub fn status(&self) -> SchedulerStatus {
        *self.status.borrow()
    }

    pub fn delay(&self) -> Duration {
        self.shared.delay()
    }

    pub fn set_delay(&self, delay: Duration) {
        debug!(?delay, "Changing probe delay");
        *self.shared.delay.write().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn download_test(&self) -> Arc<dyn DownloadTest> {
        self.shared.test()
    }

    pub fn set_download_test(&self, test: Arc<dyn DownloadTest>) {
        debug!(?test, "Replacing download test");
        *self.shared.test.write().unwrap_or_else(PoisonError::into_inner) = test;
    }
}

impl Drop for ProbeScheduler {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

async fn run_loop(shared: Arc<Shared>, cancellation: CancellationToken) {
    loop {
        let test = shared.test();
        shared.set_phase(SchedulerPhase::Running);
        // A panicking probe takes down its own task only.
        let run = tokio::spawn({
            let test = test.clone();
            async move { test.run().await }
        });
        if let Err(err) = run.await {
            error!("Scheduled probe aborted: {err}");
        }
        shared.status.send_modify(|status| {
            status.phase = SchedulerPhase::Idle;
            status.ticks += 1;
        });
        if let Some(err) = test.last_error() {
            warn!("Scheduled probe did not produce a measurement: {err}");
        }

        if cancellation.is_cancelled() {
            break;
        }
        shared.set_phase(SchedulerPhase::Scheduled);
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            _ = tokio::time::sleep(shared.delay()) => {}
        }
    }
    shared.set_phase(SchedulerPhase::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        probe::ProbeError,
        store::{
            MeasurementStore,
            StoreError,
        },
    };
    use pretty_assertions::assert_eq;
    use std::{
        future::Future,
        pin::Pin,
        sync::atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
    };

    #[derive(Debug)]
    struct FakeTest {
        runs: AtomicUsize,
        busy: AtomicBool,
        overlapped: AtomicBool,
        duration: Duration,
        fail: bool,
        panics: bool,
        store: RwLock<Arc<MeasurementStore>>,
    }

    impl FakeTest {
        fn new(duration: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                busy: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
                duration,
                fail,
                panics: false,
                store: RwLock::new(Arc::new(MeasurementStore::open("unused", Duration::from_secs(1)))),
            })
        }

        fn panicking() -> Arc<Self> {
            let mut test = Arc::into_inner(Self::new(Duration::ZERO, false)).unwrap();
            test.panics = true;
            Arc::new(test)
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    impl DownloadTest for FakeTest {
        fn run(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                if self.busy.swap(true, Ordering::SeqCst) {
                    self.overlapped.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(self.duration).await;
                self.runs.fetch_add(1, Ordering::SeqCst);
                if self.panics {
                    self.busy.store(false, Ordering::SeqCst);
                    panic!("download test exploded");
                }
                self.busy.store(false, Ordering::SeqCst);
            })
        }

        fn last_error(&self) -> Option<Arc<ProbeError>> {
            self.fail.then(|| {
                Arc::new(ProbeError::Store(StoreError::Corrupt {
                    path: "unused".into(),
                    line: 1,
                    content: String::new(),
                }))
            })
        }

        fn store(&self) -> Arc<MeasurementStore> {
            self.store.read().unwrap().clone()
        }

        fn set_store(&self, store: Arc<MeasurementStore>) {
            *self.store.write().unwrap() = store;
        }
    }

    #[tokio::test]
    async fn first_run_is_immediate() {
        let test = FakeTest::new(Duration::ZERO, false);
        let scheduler = ProbeScheduler::new(Duration::from_secs(3600), test.clone());
        scheduler.start().unwrap();

        let mut status = scheduler.subscribe();
        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.ticks == 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(test.runs(), 1);

        scheduler.stop().await;
        assert_eq!(scheduler.status().phase, SchedulerPhase::Stopped);
        assert_eq!(test.runs(), 1);
    }

    #[tokio::test]
    async fn start_is_rejected_twice_and_after_stop() {
        let scheduler = ProbeScheduler::new(Duration::from_secs(3600), FakeTest::new(Duration::ZERO, false));
        assert_eq!(scheduler.start(), Ok(()));
        assert_eq!(scheduler.start(), Err(SchedulerError::AlreadyStarted));
        scheduler.stop().await;
        assert_eq!(scheduler.start(), Err(SchedulerError::Stopped));
    }

    #[tokio::test]
    async fn failing_probes_keep_the_schedule() {
        let test = FakeTest::new(Duration::ZERO, true);
        let scheduler = ProbeScheduler::new(Duration::from_millis(10), test.clone());
        scheduler.start().unwrap();

        let mut status = scheduler.subscribe();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.ticks >= 3))
            .await
            .unwrap()
            .unwrap();
        scheduler.stop().await;
        assert!(test.runs() >= 3);
    }

    #[tokio::test]
    async fn panicking_download_tests_keep_the_schedule() {
        let test = FakeTest::panicking();
        let scheduler = ProbeScheduler::new(Duration::from_millis(10), test.clone());
        scheduler.start().unwrap();

        let mut status = scheduler.subscribe();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.ticks >= 3))
            .await
            .unwrap()
            .unwrap();
        scheduler.stop().await;
        assert!(test.runs() >= 3);
        assert_eq!(scheduler.status().phase, SchedulerPhase::Stopped);
    }

    #[tokio::test]
    async fn runs_never_overlap() {
        let test = FakeTest::new(Duration::from_millis(30), false);
        let scheduler = ProbeScheduler::new(Duration::from_millis(1), test.clone());
        scheduler.start().unwrap();

        let mut status = scheduler.subscribe();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.ticks >= 4))
            .await
            .unwrap()
            .unwrap();
        scheduler.stop().await;
        assert!(!test.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_waits_for_the_run_in_progress() {
        let test = FakeTest::new(Duration::from_millis(200), false);
        let scheduler = ProbeScheduler::new(Duration::from_secs(3600), test.clone());
        scheduler.start().unwrap();

        let mut status = scheduler.subscribe();
        status.wait_for(|s| s.phase == SchedulerPhase::Running).await.unwrap();
        scheduler.stop().await;

        assert_eq!(test.runs(), 1);
        assert_eq!(scheduler.status(), SchedulerStatus {
            phase: SchedulerPhase::Stopped,
            ticks: 1,
        });
    }

    #[tokio::test]
    async fn replaced_test_runs_on_the_next_tick() {
        let first = FakeTest::new(Duration::ZERO, false);
        let second = FakeTest::new(Duration::ZERO, false);
        let scheduler = ProbeScheduler::new(Duration::from_millis(100), first.clone());
        scheduler.start().unwrap();

        let mut status = scheduler.subscribe();
        status.wait_for(|s| s.ticks >= 1).await.unwrap();
        scheduler.set_download_test(second.clone());
        scheduler.set_delay(Duration::from_millis(5));
        assert_eq!(scheduler.delay(), Duration::from_millis(5));

        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.ticks >= 3))
            .await
            .unwrap()
            .unwrap();
        scheduler.stop().await;

        assert_eq!(first.runs(), 1);
        assert!(second.runs() >= 2);
    }

    #[tokio::test]
    async fn stopping_an_unstarted_scheduler() {
        let scheduler = ProbeScheduler::new(Duration::from_secs(1), FakeTest::new(Duration::ZERO, false));
        scheduler.stop().await;
        assert_eq!(scheduler.status().phase, SchedulerPhase::Stopped);
        assert_eq!(scheduler.start(), Err(SchedulerError::Stopped));
    }
}
