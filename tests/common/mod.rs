#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use time::OffsetDateTime;

use turnstile::clock::ManualClock;
use turnstile::config::{EngineConfig, MemoryConfig};
use turnstile::engine::Engine;
use turnstile::gateway::{ChannelGateway, GatewayError, InviteHandle};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayCall {
    Grant(String),
    Revoke(String),
    Admit(String),
}

/// Test double for the external channel: records every call and can be
/// programmed to fail specific operations per subject until cleared.
#[derive(Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<GatewayCall>>,
    fail_grant: Mutex<HashMap<String, GatewayError>>,
    fail_revoke: Mutex<HashMap<String, GatewayError>>,
    fail_admit: Mutex<HashMap<String, GatewayError>>,
}

impl RecordingGateway {
    pub fn fail_grant(&self, subject_id: &str, err: GatewayError) {
        lock(&self.fail_grant).insert(subject_id.to_string(), err);
    }

    pub fn fail_revoke(&self, subject_id: &str, err: GatewayError) {
        lock(&self.fail_revoke).insert(subject_id.to_string(), err);
    }

    pub fn fail_admit(&self, subject_id: &str, err: GatewayError) {
        lock(&self.fail_admit).insert(subject_id.to_string(), err);
    }

    pub fn clear_failures(&self) {
        lock(&self.fail_grant).clear();
        lock(&self.fail_revoke).clear();
        lock(&self.fail_admit).clear();
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, call: &GatewayCall) -> usize {
        lock(&self.calls).iter().filter(|c| *c == call).count()
    }

    /// Subjects admitted, in call order.
    pub fn admitted(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                GatewayCall::Admit(subject) => Some(subject.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ChannelGateway for RecordingGateway {
    fn grant(&self, subject_id: &str) -> Result<(), GatewayError> {
        lock(&self.calls).push(GatewayCall::Grant(subject_id.to_string()));
        match lock(&self.fail_grant).get(subject_id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn revoke(&self, subject_id: &str) -> Result<(), GatewayError> {
        lock(&self.calls).push(GatewayCall::Revoke(subject_id.to_string()));
        match lock(&self.fail_revoke).get(subject_id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn admit(&self, subject_id: &str) -> Result<InviteHandle, GatewayError> {
        lock(&self.calls).push(GatewayCall::Admit(subject_id.to_string()));
        match lock(&self.fail_admit).get(subject_id) {
            Some(err) => Err(err.clone()),
            None => Ok(InviteHandle {
                subject_id: subject_id.to_string(),
                reference: format!("invite-{subject_id}"),
            }),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TestContext {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<RecordingGateway>,
    pub config: Arc<MemoryConfig>,
    pub data_dir: tempfile::TempDir,
}

/// Fixed test epoch: 2023-11-14T22:13:20Z.
pub fn t0() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("valid epoch")
}

pub fn context() -> Result<TestContext> {
    context_with(EngineConfig::default())
}

pub fn context_with(cfg: EngineConfig) -> Result<TestContext> {
    let data_dir = tempfile::tempdir().context("create engine tempdir")?;
    let clock = Arc::new(ManualClock::new(t0()));
    let gateway = Arc::new(RecordingGateway::default());
    let config = Arc::new(MemoryConfig::new(cfg));

    let engine = Engine::open(
        data_dir.path(),
        clock.clone(),
        gateway.clone(),
        config.clone(),
    )?;

    Ok(TestContext {
        engine,
        clock,
        gateway,
        config,
        data_dir,
    })
}

pub fn hours(n: i64) -> time::Duration {
    time::Duration::hours(n)
}

pub fn minutes(n: i64) -> time::Duration {
    time::Duration::minutes(n)
}
