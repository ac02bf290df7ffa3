use anyhow::Result;
use time::OffsetDateTime;

use crate::model::{AdmissionRecord, compute_admission_id, format_ts, parse_ts};

use super::EngineStore;

impl EngineStore {
    /// Insert-if-no-pending: at most one unprocessed request per subject can
    /// exist. A concurrent or repeated enqueue gets the existing record back
    /// unchanged (`created = false`).
    pub fn enqueue_admission(
        &self,
        subject_id: &str,
        now: OffsetDateTime,
    ) -> Result<(AdmissionRecord, bool)> {
        let mut st = self.state();

        if let Some(existing) = st
            .admissions
            .iter()
            .find(|a| a.subject_id == subject_id && !a.processed)
        {
            return Ok((existing.clone(), false));
        }

        let requested_at = format_ts(now);
        let record = AdmissionRecord {
            id: compute_admission_id(subject_id, &requested_at),
            subject_id: subject_id.to_string(),
            requested_at,
            processed: false,
            processed_at: None,
        };
        st.admissions.push(record.clone());
        self.persist_admissions(&st)?;
        Ok((record, true))
    }

    pub fn pending_admission(&self, subject_id: &str) -> Option<AdmissionRecord> {
        self.state()
            .admissions
            .iter()
            .find(|a| a.subject_id == subject_id && !a.processed)
            .cloned()
    }

    /// Pending requests past the admission delay, oldest request first.
    pub fn ready_admissions(
        &self,
        now: OffsetDateTime,
        delay: time::Duration,
    ) -> Result<Vec<AdmissionRecord>> {
        let st = self.state();
        let mut out = Vec::new();
        for a in &st.admissions {
            if a.processed {
                continue;
            }
            if parse_ts(&a.requested_at)? + delay <= now {
                out.push(a.clone());
            }
        }
        out.sort_by(|a, b| {
            a.requested_at
                .cmp(&b.requested_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(out)
    }

    /// Marks a pending request processed. Returns `false` if it is gone or
    /// was already processed.
    pub fn mark_admission_processed(&self, id: &str, now: OffsetDateTime) -> Result<bool> {
        let mut st = self.state();
        let Some(record) = st
            .admissions
            .iter_mut()
            .find(|a| a.id == id && !a.processed)
        else {
            return Ok(false);
        };
        record.processed = true;
        record.processed_at = Some(format_ts(now));
        self.persist_admissions(&st)?;
        Ok(true)
    }

    /// Deletes processed requests whose processing happened before the
    /// cutoff. Pending requests are never touched.
    pub fn delete_processed_admissions(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let mut st = self.state();

        let mut drop_ids = Vec::new();
        for a in &st.admissions {
            if !a.processed {
                continue;
            }
            if let Some(processed_at) = a.processed_at.as_deref()
                && parse_ts(processed_at)? <= cutoff
            {
                drop_ids.push(a.id.clone());
            }
        }
        if drop_ids.is_empty() {
            return Ok(0);
        }

        st.admissions.retain(|a| !drop_ids.contains(&a.id));
        self.persist_admissions(&st)?;
        Ok(drop_ids.len())
    }
}
