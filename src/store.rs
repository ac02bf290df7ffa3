use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::model::{AdmissionRecord, MembershipRecord, MembershipStatus, TokenRecord};

mod admissions;
mod memberships;
mod tokens;

pub use self::memberships::ActivationUndo;

const TOKENS_FILE: &str = "tokens.json";
const TOKENS_ARCHIVE_FILE: &str = "tokens_archive.json";
const MEMBERSHIPS_FILE: &str = "memberships.json";
const ADMISSIONS_FILE: &str = "admissions.json";

/// The authoritative store for tokens, memberships, and admission requests.
///
/// State lives in memory behind one lock and every mutation persists to the
/// data directory before the lock is released, so each store method is a
/// single transaction: the conditional mutations the engine's invariants
/// depend on (token claim, membership upsert, pending-unique enqueue) cannot
/// interleave. The gateway is never called while the lock is held.
pub struct EngineStore {
    data_dir: PathBuf,
    state: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    // Keyed by token hash; the secret itself is never stored.
    tokens: HashMap<String, TokenRecord>,
    memberships: Vec<MembershipRecord>,
    admissions: Vec<AdmissionRecord>,
}

impl EngineStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("create data dir {}", data_dir.display()))?;

        let tokens: HashMap<String, TokenRecord> = {
            let list: Vec<TokenRecord> = read_list(&data_dir.join(TOKENS_FILE))?;
            list.into_iter().map(|t| (t.token_hash.clone(), t)).collect()
        };
        let memberships: Vec<MembershipRecord> = read_list(&data_dir.join(MEMBERSHIPS_FILE))?;
        let admissions: Vec<AdmissionRecord> = read_list(&data_dir.join(ADMISSIONS_FILE))?;

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            state: Mutex::new(EngineState {
                tokens,
                memberships,
                admissions,
            }),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist_tokens(&self, st: &EngineState) -> Result<()> {
        let mut list: Vec<TokenRecord> = st.tokens.values().cloned().collect();
        list.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then_with(|| a.id.cmp(&b.id)));
        let bytes = serde_json::to_vec_pretty(&list).context("serialize tokens")?;
        write_atomic(&self.data_dir.join(TOKENS_FILE), &bytes).context("write tokens.json")
    }

    fn persist_memberships(&self, st: &EngineState) -> Result<()> {
        let mut list = st.memberships.clone();
        list.sort_by(|a, b| {
            a.activated_at
                .cmp(&b.activated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let bytes = serde_json::to_vec_pretty(&list).context("serialize memberships")?;
        write_atomic(&self.data_dir.join(MEMBERSHIPS_FILE), &bytes).context("write memberships.json")
    }

    fn persist_admissions(&self, st: &EngineState) -> Result<()> {
        let mut list = st.admissions.clone();
        list.sort_by(|a, b| {
            a.requested_at
                .cmp(&b.requested_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let bytes = serde_json::to_vec_pretty(&list).context("serialize admissions")?;
        write_atomic(&self.data_dir.join(ADMISSIONS_FILE), &bytes).context("write admissions.json")
    }

    fn append_token_archive(&self, stale: &[TokenRecord]) -> Result<()> {
        let path = self.data_dir.join(TOKENS_ARCHIVE_FILE);
        let mut archived: Vec<TokenRecord> = read_list(&path)?;
        archived.extend(stale.iter().cloned());
        let bytes = serde_json::to_vec_pretty(&archived).context("serialize token archive")?;
        write_atomic(&path, &bytes).context("write tokens_archive.json")
    }

    pub fn summary(&self) -> EngineSummary {
        let st = self.state();
        EngineSummary {
            tokens_issued: st.tokens.len(),
            tokens_redeemed: st.tokens.values().filter(|t| t.redeemed).count(),
            memberships_active: st
                .memberships
                .iter()
                .filter(|m| m.status == MembershipStatus::Active)
                .count(),
            memberships_expired: st
                .memberships
                .iter()
                .filter(|m| m.status == MembershipStatus::Expired)
                .count(),
            admissions_pending: st.admissions.iter().filter(|a| !a.processed).count(),
            admissions_processed: st.admissions.iter().filter(|a| a.processed).count(),
        }
    }
}

/// Read-only counts for reporting collaborators.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EngineSummary {
    pub tokens_issued: usize,
    pub tokens_redeemed: usize,
    pub memberships_active: usize,
    pub memberships_expired: usize,
    pub admissions_pending: usize,
    pub admissions_processed: usize,
}

fn read_list<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("create parent directories")?;
    }
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    fs::write(&tmp, bytes).with_context(|| format!("write temp file {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
