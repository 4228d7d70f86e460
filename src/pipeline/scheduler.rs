use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use crate::config::SchedulerConfig;
use crate::pipeline::refresh::{RefreshOutcome, RefreshPipeline};

const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Drives the pipeline on two timers: full refresh and resolution checks.
pub struct RefreshScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RefreshScheduler {
    pub fn start(pipeline: Arc<RefreshPipeline>, config: &SchedulerConfig) -> Self {
        Self::start_with_periods(
            pipeline,
            config.refresh_interval().max(MIN_PERIOD),
            config.resolution_interval().max(MIN_PERIOD),
            config.run_on_start,
        )
    }

    pub fn start_with_periods(
        pipeline: Arc<RefreshPipeline>,
        refresh_every: Duration,
        resolve_every: Duration,
        run_on_start: bool,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        info!(
            "Scheduler started: refresh every {:?}, resolution check every {:?}",
            refresh_every, resolve_every
        );

        let handle = tokio::spawn(run(pipeline, refresh_every, resolve_every, run_on_start, shutdown_rx));
        Self { shutdown, handle }
    }

    /// Stop ticking. A cycle in progress is cancelled at its next await point.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
        info!("Scheduler stopped");
    }
}

async fn run(
    pipeline: Arc<RefreshPipeline>,
    refresh_every: Duration,
    resolve_every: Duration,
    run_on_start: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let now = Instant::now();
    let first_refresh = if run_on_start { now } else { now + refresh_every };

    let mut refresh = interval_at(first_refresh, refresh_every);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut resolve = interval_at(now + resolve_every, resolve_every);
    resolve.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,
            _ = refresh.tick() => {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        info!("Refresh cycle cancelled by shutdown");
                        break;
                    }
                    outcome = pipeline.trigger_refresh() => {
                        if let RefreshOutcome::AlreadyRunning = outcome {
                            debug!("Scheduled refresh skipped, manual cycle in progress");
                        }
                    }
                }
            }
            _ = resolve.tick() => {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => break,
                    report = pipeline.check_resolutions() => {
                        if report.is_none() {
                            debug!("Resolution check already in progress");
                        }
                    }
                }
            }
        }
    }
}
