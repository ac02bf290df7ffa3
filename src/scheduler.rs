use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::ConfigProvider;
use crate::ledger::MembershipLedger;
use crate::queue::AdmissionQueue;
use crate::tokens::TokenRegistry;

const FALLBACK_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const FALLBACK_CLEANUP_WAIT: Duration = Duration::from_secs(3600);

/// Drives the three periodic jobs: membership-expiry sweep, queue-ready
/// sweep, and the daily retention cleanup.
///
/// Each job is a sequential loop, so a sweep can never run concurrently
/// with itself; a tick that would land mid-sweep is skipped. Jobs fail
/// independently: sweep errors are logged at the scheduler boundary and the
/// job keeps ticking. Intervals and delays are re-read from the config
/// provider at every tick.
pub struct SweepScheduler {
    ledger: MembershipLedger,
    queue: AdmissionQueue,
    registry: TokenRegistry,
    config: Arc<dyn ConfigProvider>,
    clock: Arc<dyn Clock>,
    running: Option<Running>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl SweepScheduler {
    pub fn new(
        ledger: MembershipLedger,
        queue: AdmissionQueue,
        registry: TokenRegistry,
        config: Arc<dyn ConfigProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            queue,
            registry,
            config,
            clock,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawns the three jobs. A second `start` while running is a warning,
    /// not an error.
    pub fn start(&mut self) {
        if self.running.is_some() {
            warn!("sweep scheduler already running");
            return;
        }

        let (shutdown, _) = watch::channel(false);
        let handles = vec![
            tokio::spawn(membership_job(
                self.ledger.clone(),
                self.config.clone(),
                self.clock.clone(),
                shutdown.subscribe(),
            )),
            tokio::spawn(queue_job(
                self.queue.clone(),
                self.config.clone(),
                self.clock.clone(),
                shutdown.subscribe(),
            )),
            tokio::spawn(cleanup_job(
                self.queue.clone(),
                self.registry.clone(),
                self.config.clone(),
                self.clock.clone(),
                shutdown.subscribe(),
            )),
        ];

        info!("sweep scheduler started");
        self.running = Some(Running { shutdown, handles });
    }

    /// Signals shutdown and waits for every job to drain: an in-flight
    /// sweep finishes its batch before the job exits.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            debug!("sweep scheduler already stopped");
            return;
        };

        let _ = running.shutdown.send(true);
        for handle in running.handles {
            if let Err(err) = handle.await {
                error!("sweep job ended abnormally: {err}");
            }
        }
        info!("sweep scheduler stopped");
    }
}

async fn membership_job(
    ledger: MembershipLedger,
    config: Arc<dyn ConfigProvider>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let period = match config.current() {
            Ok(cfg) => cfg.membership_sweep_interval(),
            Err(err) => {
                warn!("config read failed, using fallback sweep interval: {err:#}");
                FALLBACK_SWEEP_INTERVAL
            }
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(period) => {
                let ledger = ledger.clone();
                let now = clock.now();
                match tokio::task::spawn_blocking(move || ledger.sweep_expired(now)).await {
                    Ok(Ok(report)) if report.candidates > 0 => {
                        info!(
                            candidates = report.candidates,
                            succeeded = report.succeeded,
                            failed = report.failed,
                            "membership sweep"
                        );
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => error!("membership sweep failed: {err:#}"),
                    Err(err) => error!("membership sweep panicked: {err}"),
                }
            }
        }
    }
    debug!("membership sweep job drained");
}

async fn queue_job(
    queue: AdmissionQueue,
    config: Arc<dyn ConfigProvider>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (period, delay) = match config.current() {
            Ok(cfg) => (cfg.queue_sweep_interval(), cfg.admission_delay()),
            Err(err) => {
                warn!("config read failed, using fallback sweep interval: {err:#}");
                (FALLBACK_SWEEP_INTERVAL, time::Duration::minutes(10))
            }
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(period) => {
                let queue = queue.clone();
                let now = clock.now();
                match tokio::task::spawn_blocking(move || queue.sweep_ready(now, delay)).await {
                    Ok(Ok(report)) if report.candidates > 0 => {
                        info!(
                            candidates = report.candidates,
                            succeeded = report.succeeded,
                            failed = report.failed,
                            "queue sweep"
                        );
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => error!("queue sweep failed: {err:#}"),
                    Err(err) => error!("queue sweep panicked: {err}"),
                }
            }
        }
    }
    debug!("queue sweep job drained");
}

async fn cleanup_job(
    queue: AdmissionQueue,
    registry: TokenRegistry,
    config: Arc<dyn ConfigProvider>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (wait, retention) = match config.current() {
            Ok(cfg) => {
                let wait = match duration_until_daily(clock.now(), &cfg.cleanup_time_utc) {
                    Ok(wait) => wait,
                    Err(err) => {
                        warn!("bad cleanup_time_utc, retrying in an hour: {err:#}");
                        FALLBACK_CLEANUP_WAIT
                    }
                };
                (wait, cfg.retention())
            }
            Err(err) => {
                warn!("config read failed, retrying cleanup in an hour: {err:#}");
                (FALLBACK_CLEANUP_WAIT, time::Duration::days(30))
            }
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(wait) => {
                let queue = queue.clone();
                let registry = registry.clone();
                let now = clock.now();
                let run = move || -> Result<(usize, usize)> {
                    let admissions = queue.cleanup_old(now, retention)?;
                    let tokens = registry.archive_stale(now, retention)?;
                    Ok((admissions, tokens))
                };
                match tokio::task::spawn_blocking(run).await {
                    Ok(Ok((admissions, tokens))) => {
                        info!(admissions, tokens, "retention cleanup done");
                    }
                    Ok(Err(err)) => error!("retention cleanup failed: {err:#}"),
                    Err(err) => error!("retention cleanup panicked: {err}"),
                }
            }
        }
    }
    debug!("cleanup job drained");
}

/// Time until the next occurrence of a "HH:MM" UTC time of day. An
/// occurrence at or before `now` schedules for tomorrow.
fn duration_until_daily(now: OffsetDateTime, hhmm: &str) -> Result<Duration> {
    let (hour, minute) = hhmm
        .split_once(':')
        .ok_or_else(|| anyhow!("expected HH:MM, got {hhmm:?}"))?;
    let hour: u8 = hour
        .parse()
        .with_context(|| format!("parse hour in {hhmm:?}"))?;
    let minute: u8 = minute
        .parse()
        .with_context(|| format!("parse minute in {hhmm:?}"))?;
    let at = time::Time::from_hms(hour, minute, 0)
        .with_context(|| format!("invalid time of day {hhmm:?}"))?;

    let mut next = now.replace_time(at);
    if next <= now {
        next += time::Duration::days(1);
    }
    Duration::try_from(next - now).with_context(|| format!("cleanup wait out of range for {hhmm:?}"))
}

#[cfg(test)]
#[path = "tests/scheduler_tests.rs"]
mod tests;
