use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub fn format_ts(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| "<time>".to_string())
}

pub fn parse_ts(s: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).with_context(|| format!("parse timestamp {s:?}"))
}

pub fn compute_token_id(issued_by: &str, token_hash: &str, issued_at: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(issued_by.as_bytes());
    hasher.update(b"\n");
    hasher.update(token_hash.as_bytes());
    hasher.update(b"\n");
    hasher.update(issued_at.as_bytes());
    hasher.finalize().to_hex().to_string()
}

pub fn compute_membership_id(subject_id: &str, activated_at: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(subject_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(activated_at.as_bytes());
    hasher.finalize().to_hex().to_string()
}

pub fn compute_admission_id(subject_id: &str, requested_at: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"admission\n");
    hasher.update(subject_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(requested_at.as_bytes());
    hasher.finalize().to_hex().to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: String,

    // Stored hash of the token secret; the secret itself is never persisted.
    pub token_hash: String,

    pub issued_by: String,
    pub issued_at: String,

    /// Validity window and the membership duration granted on redemption.
    pub valid_for_secs: u64,

    pub expires_at: String,

    #[serde(default)]
    pub plan: Option<String>,

    #[serde(default)]
    pub redeemed: bool,

    #[serde(default)]
    pub redeemed_by: Option<String>,

    #[serde(default)]
    pub redeemed_at: Option<String>,
}

impl TokenRecord {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> Result<bool> {
        Ok(parse_ts(&self.expires_at)? <= now)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Active,
    Expired,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub id: String,
    pub subject_id: String,

    /// Token that activated this membership, if any.
    #[serde(default)]
    pub source_token: Option<String>,

    pub activated_at: String,
    pub expires_at: String,
    pub status: MembershipStatus,

    #[serde(default)]
    pub expired_at: Option<String>,
}

impl MembershipRecord {
    /// Implicit view: a record past its deadline reads as inactive even
    /// before the expiry sweep has transitioned it.
    pub fn is_active_at(&self, now: OffsetDateTime) -> Result<bool> {
        Ok(self.status == MembershipStatus::Active && now < parse_ts(&self.expires_at)?)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdmissionRecord {
    pub id: String,
    pub subject_id: String,
    pub requested_at: String,

    #[serde(default)]
    pub processed: bool,

    #[serde(default)]
    pub processed_at: Option<String>,
}

/// Outcome of one sweep pass, for logging and alerting collaborators.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SweepReport {
    pub job: String,
    pub candidates: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_subjects: Vec<String>,
}

impl SweepReport {
    pub fn new(job: &str) -> Self {
        Self {
            job: job.to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
#[path = "tests/model_tests.rs"]
mod tests;
