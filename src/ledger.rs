use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::gateway::{ChannelGateway, GatewayError};
use crate::model::{MembershipRecord, SweepReport};
use crate::store::EngineStore;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("subject already holds an active membership")]
    AlreadyActive,

    #[error("channel grant failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Tracks premium memberships: at most one active record per subject, with
/// expired records kept as history.
#[derive(Clone)]
pub struct MembershipLedger {
    store: Arc<EngineStore>,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn ChannelGateway>,
}

impl MembershipLedger {
    pub fn new(
        store: Arc<EngineStore>,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn ChannelGateway>,
    ) -> Self {
        Self {
            store,
            clock,
            gateway,
        }
    }

    /// Creates a new active membership, or extends an existing one from
    /// `max(now, current expiry)` so renewal never shortens a membership.
    pub fn activate(
        &self,
        subject_id: &str,
        source_token: Option<&str>,
        duration: time::Duration,
    ) -> Result<MembershipRecord, LedgerError> {
        self.activate_with_policy(subject_id, source_token, duration, false)
    }

    /// Like [`activate`](Self::activate), but failing with `AlreadyActive`
    /// instead of extending when `forbid_existing` is set.
    pub(crate) fn activate_with_policy(
        &self,
        subject_id: &str,
        source_token: Option<&str>,
        duration: time::Duration,
        forbid_existing: bool,
    ) -> Result<MembershipRecord, LedgerError> {
        let now = self.clock.now();
        let (record, undo) =
            self.store
                .commit_activation(subject_id, source_token, duration, now, forbid_existing)?;

        if let Err(err) = self.gateway.grant(subject_id) {
            warn!(subject_id, %err, "channel grant failed, rolling activation back");
            if let Err(undo_err) = self.store.undo_activation(undo) {
                error!(subject_id, "failed to roll back activation: {undo_err:#}");
            }
            return Err(LedgerError::Gateway(err));
        }

        info!(
            subject_id,
            expires_at = %record.expires_at,
            "membership active"
        );
        Ok(record)
    }

    /// Implicit view: `true` only while an active record is inside its
    /// deadline. No side effects; the authoritative revoke happens in
    /// [`sweep_expired`](Self::sweep_expired).
    pub fn is_active(&self, subject_id: &str) -> Result<bool> {
        match self.store.active_membership(subject_id) {
            Some(record) => record.is_active_at(self.clock.now()),
            None => Ok(false),
        }
    }

    pub fn active_membership(&self, subject_id: &str) -> Option<MembershipRecord> {
        self.store.active_membership(subject_id)
    }

    /// Revokes and transitions every active membership past its deadline.
    ///
    /// The revoke call happens first and the local transition commits after
    /// it returns: success or a terminal failure marks the record expired
    /// (the gateway is idempotent, so a terminal failure is not retried); a
    /// transient failure leaves the record active for the next sweep. One
    /// subject's failure never aborts the batch.
    pub fn sweep_expired(&self, now: OffsetDateTime) -> Result<SweepReport> {
        let candidates = self.store.expired_candidates(now)?;
        let mut report = SweepReport::new("membership-expiry");
        report.candidates = candidates.len();

        for membership in candidates {
            let subject_id = membership.subject_id.as_str();
            match self.gateway.revoke(subject_id) {
                Ok(()) => {
                    match self.store.mark_membership_expired(&membership.id, now) {
                        Ok(true) => {
                            info!(subject_id, "membership expired, access revoked");
                            report.succeeded += 1;
                        }
                        Ok(false) => {
                            // Renewed between listing and revoke; put the
                            // grant back (idempotent on the channel side).
                            debug!(subject_id, "membership renewed mid-sweep, restoring grant");
                            if let Err(err) = self.gateway.grant(subject_id) {
                                warn!(subject_id, %err, "failed to restore grant after revoke");
                                report.failed += 1;
                                report.failed_subjects.push(subject_id.to_string());
                            } else {
                                report.succeeded += 1;
                            }
                        }
                        Err(err) => {
                            // Revoke went through but the transition did not;
                            // the next sweep re-revokes (idempotent) and
                            // retries the transition.
                            error!(subject_id, "failed to mark membership expired: {err:#}");
                            report.failed += 1;
                            report.failed_subjects.push(subject_id.to_string());
                        }
                    }
                }
                Err(err) if err.is_transient() => {
                    warn!(subject_id, %err, "revoke failed, will retry next sweep");
                    report.failed += 1;
                    report.failed_subjects.push(subject_id.to_string());
                }
                Err(err) => {
                    warn!(subject_id, %err, "revoke failed terminally, expiring anyway");
                    if let Err(mark_err) =
                        self.store.mark_membership_expired(&membership.id, now)
                    {
                        error!(subject_id, "failed to mark membership expired: {mark_err:#}");
                    }
                    report.failed += 1;
                    report.failed_subjects.push(subject_id.to_string());
                }
            }
        }

        debug!(
            candidates = report.candidates,
            succeeded = report.succeeded,
            failed = report.failed,
            "membership sweep done"
        );
        Ok(report)
    }
}
