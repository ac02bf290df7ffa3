use anyhow::Result;
use time::OffsetDateTime;

use crate::ledger::LedgerError;
use crate::model::{
    MembershipRecord, MembershipStatus, compute_membership_id, format_ts, parse_ts,
};

use super::EngineStore;

/// Handle for undoing a committed activation whose gateway grant failed.
///
/// The undo carries the expiry it committed; if the record has moved on
/// since (a concurrent activation extended it), the undo is skipped so the
/// later activation survives.
#[derive(Clone, Debug)]
pub enum ActivationUndo {
    Inserted {
        id: String,
        expires_at: String,
    },
    Extended {
        id: String,
        prior_expires_at: String,
        new_expires_at: String,
    },
}

impl EngineStore {
    pub fn active_membership(&self, subject_id: &str) -> Option<MembershipRecord> {
        self.state()
            .memberships
            .iter()
            .find(|m| m.subject_id == subject_id && m.status == MembershipStatus::Active)
            .cloned()
    }

    /// Every record for a subject, newest activation first. Expired records
    /// are history and never deleted.
    pub fn membership_history(&self, subject_id: &str) -> Vec<MembershipRecord> {
        let mut out: Vec<MembershipRecord> = self
            .state()
            .memberships
            .iter()
            .filter(|m| m.subject_id == subject_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.activated_at
                .cmp(&a.activated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Conditional upsert keeping at most one active membership per subject:
    /// extends an existing active record from `max(now, current expiry)`, or
    /// inserts a new one.
    pub fn commit_activation(
        &self,
        subject_id: &str,
        source_token: Option<&str>,
        duration: time::Duration,
        now: OffsetDateTime,
        forbid_existing: bool,
    ) -> Result<(MembershipRecord, ActivationUndo), LedgerError> {
        let mut st = self.state();

        let existing = st
            .memberships
            .iter()
            .position(|m| m.subject_id == subject_id && m.status == MembershipStatus::Active);

        match existing {
            Some(_) if forbid_existing => Err(LedgerError::AlreadyActive),
            Some(idx) => {
                let prior_expires_at = st.memberships[idx].expires_at.clone();
                let base = parse_ts(&prior_expires_at)?.max(now);
                let new_expires_at = format_ts(base + duration);
                {
                    let record = &mut st.memberships[idx];
                    record.expires_at = new_expires_at.clone();
                    if let Some(token) = source_token {
                        record.source_token = Some(token.to_string());
                    }
                }
                let record = st.memberships[idx].clone();
                self.persist_memberships(&st)?;
                Ok((
                    record,
                    ActivationUndo::Extended {
                        id: st.memberships[idx].id.clone(),
                        prior_expires_at,
                        new_expires_at,
                    },
                ))
            }
            None => {
                let activated_at = format_ts(now);
                let id = compute_membership_id(subject_id, &activated_at);
                let record = MembershipRecord {
                    id: id.clone(),
                    subject_id: subject_id.to_string(),
                    source_token: source_token.map(str::to_string),
                    activated_at,
                    expires_at: format_ts(now + duration),
                    status: MembershipStatus::Active,
                    expired_at: None,
                };
                st.memberships.push(record.clone());
                self.persist_memberships(&st)?;
                let expires_at = record.expires_at.clone();
                Ok((record, ActivationUndo::Inserted { id, expires_at }))
            }
        }
    }

    pub fn undo_activation(&self, undo: ActivationUndo) -> Result<()> {
        let mut st = self.state();
        match undo {
            ActivationUndo::Inserted { id, expires_at } => {
                let Some(idx) = st
                    .memberships
                    .iter()
                    .position(|m| m.id == id && m.expires_at == expires_at)
                else {
                    return Ok(());
                };
                st.memberships.remove(idx);
            }
            ActivationUndo::Extended {
                id,
                prior_expires_at,
                new_expires_at,
            } => {
                let Some(record) = st
                    .memberships
                    .iter_mut()
                    .find(|m| m.id == id && m.expires_at == new_expires_at)
                else {
                    return Ok(());
                };
                record.expires_at = prior_expires_at;
            }
        }
        self.persist_memberships(&st)
    }

    /// Active records whose deadline has passed, oldest expiry first.
    pub fn expired_candidates(&self, now: OffsetDateTime) -> Result<Vec<MembershipRecord>> {
        let st = self.state();
        let mut out = Vec::new();
        for m in &st.memberships {
            if m.status != MembershipStatus::Active {
                continue;
            }
            if parse_ts(&m.expires_at)? <= now {
                out.push(m.clone());
            }
        }
        out.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Transitions a still-active, still-past-deadline record to expired.
    /// Returns `false` if the record is gone, already transitioned, or was
    /// extended past `now` since the sweep listed it.
    pub fn mark_membership_expired(&self, id: &str, now: OffsetDateTime) -> Result<bool> {
        let mut st = self.state();
        let Some(record) = st
            .memberships
            .iter_mut()
            .find(|m| m.id == id && m.status == MembershipStatus::Active)
        else {
            return Ok(false);
        };
        if parse_ts(&record.expires_at)? > now {
            return Ok(false);
        }
        record.status = MembershipStatus::Expired;
        record.expired_at = Some(format_ts(now));
        self.persist_memberships(&st)?;
        Ok(true)
    }
}
