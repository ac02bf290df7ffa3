use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ConfigProvider;
use crate::gateway::ChannelGateway;
use crate::model::{AdmissionRecord, SweepReport, parse_ts};
use crate::store::EngineStore;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("subject id must not be empty")]
    EmptySubject,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Delayed first-come admission queue for the free tier.
#[derive(Clone)]
pub struct AdmissionQueue {
    store: Arc<EngineStore>,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn ChannelGateway>,
    config: Arc<dyn ConfigProvider>,
}

impl AdmissionQueue {
    pub fn new(
        store: Arc<EngineStore>,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn ChannelGateway>,
        config: Arc<dyn ConfigProvider>,
    ) -> Self {
        Self {
            store,
            clock,
            gateway,
            config,
        }
    }

    /// Records a free-access request. Idempotent: while a pending request
    /// exists for the subject, re-enqueueing returns it unchanged.
    pub fn enqueue(&self, subject_id: &str) -> Result<AdmissionRecord, QueueError> {
        if subject_id.trim().is_empty() {
            return Err(QueueError::EmptySubject);
        }

        let (record, created) = self.store.enqueue_admission(subject_id, self.clock.now())?;
        if created {
            info!(subject_id, requested_at = %record.requested_at, "admission request queued");
        } else {
            debug!(subject_id, "admission request already pending");
        }
        Ok(record)
    }

    /// Time left until the subject's pending request becomes ready, zero if
    /// it is already due, or `None` without a pending request.
    pub fn wait_remaining(&self, subject_id: &str) -> Result<Option<time::Duration>> {
        let Some(pending) = self.store.pending_admission(subject_id) else {
            return Ok(None);
        };
        let delay = self.config.current()?.admission_delay();
        let elapsed = self.clock.now() - parse_ts(&pending.requested_at)?;
        Ok(Some((delay - elapsed).max(time::Duration::ZERO)))
    }

    /// Admits every pending request past the delay, oldest first.
    ///
    /// Each admission commits individually right after the gateway call
    /// succeeds; a failed call leaves the request pending so the next sweep
    /// retries it (admission is the only desired effect, so retry-until-
    /// success is the policy here). One subject's failure never aborts the
    /// batch.
    pub fn sweep_ready(&self, now: OffsetDateTime, delay: time::Duration) -> Result<SweepReport> {
        let ready = self.store.ready_admissions(now, delay)?;
        let mut report = SweepReport::new("queue-ready");
        report.candidates = ready.len();

        for request in ready {
            let subject_id = request.subject_id.as_str();
            match self.gateway.admit(subject_id) {
                Ok(handle) => match self.store.mark_admission_processed(&request.id, now) {
                    Ok(true) => {
                        info!(subject_id, reference = %handle.reference, "subject admitted");
                        report.succeeded += 1;
                    }
                    Ok(false) => {
                        debug!(subject_id, "admission already processed");
                        report.succeeded += 1;
                    }
                    Err(err) => {
                        warn!(subject_id, "failed to mark admission processed: {err:#}");
                        report.failed += 1;
                        report.failed_subjects.push(subject_id.to_string());
                    }
                },
                Err(err) => {
                    warn!(subject_id, %err, "admit failed, will retry next sweep");
                    report.failed += 1;
                    report.failed_subjects.push(subject_id.to_string());
                }
            }
        }

        debug!(
            candidates = report.candidates,
            succeeded = report.succeeded,
            failed = report.failed,
            "queue sweep done"
        );
        Ok(report)
    }

    /// Storage hygiene: drops processed requests older than the retention
    /// window.
    pub fn cleanup_old(&self, now: OffsetDateTime, retention: time::Duration) -> Result<usize> {
        self.store.delete_processed_admissions(now - retention)
    }
}

#[cfg(test)]
#[path = "tests/queue_tests.rs"]
mod tests;
