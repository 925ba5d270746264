//! Background sampling loop and the check protocol.
//!
//! A single task owns the probe set and the bad flag. It waits on three
//! event sources:
//! 1. The ticker: run one probe pass, record it, flag it if over threshold.
//! 2. A check request: if flagged, render the history and hand it back, then
//!    clear the flag.
//! 3. Shutdown: stop and join every helper task.
//!
//! Only one event is handled at a time, so the flag never needs a lock. The
//! history has its own lock because `Monitor::samples` reads it from any task.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use log::{debug, info, warn};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::{
    history::History,
    probes::{ProbeSet, Sample},
    settings::{MonitorConfig, Thresholds},
    warner::Warner,
};

struct CheckRequest {
    /// The rendered table when a bad sample is pending, `None` otherwise.
    reply: oneshot::Sender<Option<String>>,
}

/// Handle to a running sampling loop.
///
/// Cheap to share behind an `Arc`; `check` and `samples` take `&self`.
pub struct Monitor {
    checks: mpsc::Sender<CheckRequest>,
    history: Arc<History>,
    shutdown: watch::Sender<bool>,
    sampler: JoinHandle<()>,
}

impl Monitor {
    /// Spawns the probe helpers and the sampling loop on the current tokio
    /// runtime. The first probe pass starts immediately.
    ///
    /// Fails without spawning anything if `config` does not validate.
    pub fn start(config: MonitorConfig) -> Result<Self> {
        config.validate()?;

        let history = Arc::new(History::new(config.history_size));
        let (checks, check_rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let sampling = SamplingLoop::new(&config, Arc::clone(&history));
        info!(
            "Scheduler latency monitor started (interval={:?}, chain_length={}, thresholds={:?})",
            config.sample_interval,
            sampling.probes.chain_length(),
            config.thresholds
        );
        let sampler = tokio::spawn(sampling.run(config.tick_period(), check_rx, shutdown_rx));

        Ok(Self {
            checks,
            history,
            shutdown,
            sampler,
        })
    }

    /// Logs one warning to `warner` if any sample since the previous check
    /// exceeded a threshold. Waits until the sampling loop takes the request,
    /// which can be as long as one probe pass.
    ///
    /// Dropping the returned future does not lose a pending warning: either
    /// the loop keeps it for the next check, or, if the reply already
    /// arrived, it is delivered to `warner` on drop.
    ///
    /// Returns whether a warning was delivered.
    pub async fn check<W>(&self, warner: &W) -> bool
    where
        W: Warner + ?Sized,
    {
        let (reply, report) = oneshot::channel();
        if self.checks.send(CheckRequest { reply }).await.is_err() {
            debug!("Sampling loop has stopped; check skipped");
            return false;
        }

        PendingCheck {
            report: Some(report),
            warner,
            capacity: self.history.capacity(),
        }
        .wait()
        .await
    }

    /// The full history table, newest first, without highlighting.
    pub fn samples(&self) -> String {
        self.history.render(|_| false)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Stops the loop and waits for it and every probe helper to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.sampler.await {
            warn!("Sampling loop ended abnormally: {}", e);
        }
        info!("Scheduler latency monitor stopped");
    }
}

/// Caller side of a queued check. Owns the reply until it has been handed
/// to the warner.
struct PendingCheck<'a, W: Warner + ?Sized> {
    report: Option<oneshot::Receiver<Option<String>>>,
    warner: &'a W,
    capacity: usize,
}

impl<W: Warner + ?Sized> PendingCheck<'_, W> {
    async fn wait(mut self) -> bool {
        let Some(report) = self.report.as_mut() else {
            return false;
        };
        let answer = report.await;
        self.report = None;

        match answer {
            Ok(Some(table)) => {
                self.deliver(&table);
                true
            }
            Ok(None) => false,
            Err(_) => {
                debug!("Sampling loop stopped before answering a check");
                false
            }
        }
    }

    fn deliver(&self, table: &str) {
        self.warner.warning(format_args!(
            "Recent sample exceeded threshold.\nLast {} samples:\n{}",
            self.capacity, table
        ));
    }
}

impl<W: Warner + ?Sized> Drop for PendingCheck<'_, W> {
    fn drop(&mut self) {
        if let Some(mut report) = self.report.take()
            && let Ok(Some(table)) = report.try_recv()
        {
            self.deliver(&table);
        }
    }
}

struct SamplingLoop {
    probes: ProbeSet,
    history: Arc<History>,
    thresholds: Thresholds,
    bad: bool,
}

impl SamplingLoop {
    fn new(config: &MonitorConfig, history: Arc<History>) -> Self {
        Self {
            probes: ProbeSet::spawn(config.sleep, config.chain_length),
            history,
            thresholds: config.thresholds,
            bad: false,
        }
    }

    async fn sample(&mut self) -> Result<Sample> {
        let sample = self.probes.sample().await?;
        self.history.record(sample);
        if self.thresholds.exceeded_by(&sample) {
            debug!("Sample over threshold: {:?}", sample);
            self.bad = true;
        }
        Ok(sample)
    }

    /// Renders the history with over-threshold rows marked, if a bad sample
    /// is pending, and clears the flag.
    fn take_report(&mut self) -> Option<String> {
        if !std::mem::take(&mut self.bad) {
            return None;
        }
        let thresholds = self.thresholds;
        Some(self.history.render(|s| thresholds.exceeded_by(s)))
    }

    /// Answers a check. A report the caller is no longer waiting for is
    /// kept pending for the next check.
    fn answer(&mut self, request: CheckRequest) {
        let report = self.take_report();
        debug!("Check handled (warning={})", report.is_some());
        if let Err(Some(_)) = request.reply.send(report) {
            debug!("Check caller went away; keeping the warning for the next check");
            self.bad = true;
        }
    }

    async fn run(
        mut self,
        period: Duration,
        mut checks: mpsc::Receiver<CheckRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sample().await {
                        warn!("Sampling stopped: {:#}", e);
                        break;
                    }
                }
                Some(request) = checks.recv() => self.answer(request),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.probes.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warner::testing::RecordingWarner;

    const MARKER: &str = " <---";

    fn config(thresholds: Thresholds) -> MonitorConfig {
        MonitorConfig {
            thresholds,
            // Only the immediate first tick fires during a test.
            sample_interval: Duration::from_secs(3_600),
            sleep: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn marked_rows(table: &str) -> usize {
        table.lines().filter(|l| l.ends_with(MARKER)).count()
    }

    async fn wait_for_samples(monitor: &Monitor, n: usize) {
        time::timeout(Duration::from_secs(10), async {
            while monitor.history_len() < n {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sampling loop produced no sample");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_one_pass_over_tiny_thresholds_warns_once() {
        let config = config(Thresholds::uniform(Duration::from_nanos(1)));
        let mut sampling = SamplingLoop::new(&config, Arc::new(History::new(100)));

        sampling.sample().await.expect("sample");

        let report = sampling.take_report().expect("bad sample pending");
        assert_eq!(report.lines().count(), 2);
        assert_eq!(marked_rows(&report), 1);
        assert!(sampling.take_report().is_none());

        sampling.probes.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_three_passes_render_newest_first() {
        let config = config(Thresholds::default());
        let history = Arc::new(History::new(100));
        let mut sampling = SamplingLoop::new(&config, Arc::clone(&history));

        for _ in 0..3 {
            sampling.sample().await.expect("sample");
        }

        let table = history.render(|_| false);
        let rows: Vec<&str> = table.lines().skip(1).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(marked_rows(&table), 0);
        for row in &rows {
            let age: f64 = row[2..7].trim().parse().expect("age column");
            assert!(age >= 0.0, "{row}");
        }

        let recent = history.recent();
        assert!(recent[0].start > recent[1].start);
        assert!(recent[1].start > recent[2].start);

        sampling.probes.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_every_sample_flagged_under_tiny_thresholds() {
        let config = config(Thresholds::uniform(Duration::from_nanos(1)));
        let mut sampling = SamplingLoop::new(&config, Arc::new(History::new(100)));

        for _ in 0..4 {
            sampling.sample().await.expect("sample");
        }

        let report = sampling.take_report().expect("bad sample pending");
        assert_eq!(marked_rows(&report), 4);

        sampling.probes.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unreachable_thresholds_never_warn() {
        let config = config(Thresholds::uniform(Duration::from_secs(1)));
        let mut sampling = SamplingLoop::new(&config, Arc::new(History::new(100)));

        for _ in 0..3 {
            sampling.sample().await.expect("sample");
            assert!(sampling.take_report().is_none());
        }

        sampling.probes.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_check_delivers_single_warning() {
        let monitor = Monitor::start(config(Thresholds::uniform(Duration::from_nanos(1))))
            .expect("valid config");
        wait_for_samples(&monitor, 1).await;

        let warner = RecordingWarner::default();
        assert!(monitor.check(&warner).await);
        assert!(!monitor.check(&warner).await);

        let messages = warner.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Recent sample exceeded threshold.\nLast 100 samples:\n"));
        assert_eq!(marked_rows(&messages[0]), 1);

        // The plain table never carries the marker.
        assert_eq!(marked_rows(&monitor.samples()), 0);
        assert_eq!(monitor.samples().lines().count(), 2);

        monitor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_warn_at_most_once() {
        let monitor = Arc::new(
            Monitor::start(config(Thresholds::uniform(Duration::from_nanos(1))))
                .expect("valid config"),
        );
        wait_for_samples(&monitor, 1).await;

        let warner = Arc::new(RecordingWarner::default());
        let callers: Vec<_> = (0..8)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                let warner = Arc::clone(&warner);
                tokio::spawn(async move { monitor.check(&warner).await })
            })
            .collect();

        let mut delivered = 0;
        for caller in callers {
            if caller.await.expect("caller task") {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
        assert_eq!(warner.messages().len(), 1);

        let monitor = Arc::into_inner(monitor).expect("callers are done");
        monitor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_quiet_monitor_never_warns() {
        let monitor = Monitor::start(config(Thresholds::uniform(Duration::from_secs(1))))
            .expect("valid config");
        wait_for_samples(&monitor, 1).await;

        let warner = RecordingWarner::default();
        assert!(!monitor.check(&warner).await);
        assert!(warner.messages().is_empty());

        monitor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_joins_loop_and_helpers() {
        let monitor = Monitor::start(config(Thresholds::default())).expect("valid config");
        wait_for_samples(&monitor, 1).await;

        time::timeout(Duration::from_secs(5), monitor.shutdown())
            .await
            .expect("shutdown finishes");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unanswered_report_stays_pending() {
        let config = config(Thresholds::uniform(Duration::from_nanos(1)));
        let mut sampling = SamplingLoop::new(&config, Arc::new(History::new(100)));
        sampling.sample().await.expect("sample");

        let (reply, report) = oneshot::channel();
        drop(report);
        sampling.answer(CheckRequest { reply });

        let kept = sampling.take_report().expect("warning kept for the next check");
        assert_eq!(marked_rows(&kept), 1);

        sampling.probes.shutdown().await;
    }

    #[test]
    fn test_dropped_check_delivers_arrived_reply() {
        let warner = RecordingWarner::default();
        let (reply, report) = oneshot::channel();
        reply
            .send(Some("| table |".to_string()))
            .expect("receiver alive");

        drop(PendingCheck {
            report: Some(report),
            warner: &warner,
            capacity: 100,
        });

        let messages = warner.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].ends_with("| table |"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_check_does_not_lose_warning() {
        let monitor = Monitor::start(config(Thresholds::uniform(Duration::from_nanos(1))))
            .expect("valid config");
        wait_for_samples(&monitor, 1).await;

        let warner = RecordingWarner::default();
        // Polled once, then dropped while waiting for the loop's reply.
        let _ = time::timeout(Duration::ZERO, monitor.check(&warner)).await;
        time::sleep(Duration::from_millis(50)).await;
        monitor.check(&warner).await;

        assert_eq!(warner.messages().len(), 1);
        assert_eq!(marked_rows(&warner.messages()[0]), 1);
        assert!(!monitor.check(&warner).await);

        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = MonitorConfig {
            sample_interval: Duration::from_millis(50),
            sleep: Duration::from_millis(50),
            ..Default::default()
        };
        assert!(Monitor::start(config).is_err());

        let config = MonitorConfig {
            chain_length: 0,
            ..Default::default()
        };
        assert!(Monitor::start(config).is_err());
    }
}
