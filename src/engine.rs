use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::clock::Clock;
use crate::config::ConfigProvider;
use crate::gateway::ChannelGateway;
use crate::ledger::MembershipLedger;
use crate::queue::AdmissionQueue;
use crate::scheduler::SweepScheduler;
use crate::store::{EngineStore, EngineSummary};
use crate::tokens::TokenRegistry;

/// Wires the store and collaborators into the three engine components.
pub struct Engine {
    pub store: Arc<EngineStore>,
    pub tokens: TokenRegistry,
    pub memberships: MembershipLedger,
    pub admissions: AdmissionQueue,
    config: Arc<dyn ConfigProvider>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn open(
        data_dir: &Path,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn ChannelGateway>,
        config: Arc<dyn ConfigProvider>,
    ) -> Result<Self> {
        let store = Arc::new(EngineStore::open(data_dir)?);
        let memberships = MembershipLedger::new(store.clone(), clock.clone(), gateway.clone());
        let tokens = TokenRegistry::new(
            store.clone(),
            clock.clone(),
            config.clone(),
            memberships.clone(),
        );
        let admissions = AdmissionQueue::new(store.clone(), clock.clone(), gateway, config.clone());

        Ok(Self {
            store,
            tokens,
            memberships,
            admissions,
            config,
            clock,
        })
    }

    pub fn scheduler(&self) -> SweepScheduler {
        SweepScheduler::new(
            self.memberships.clone(),
            self.admissions.clone(),
            self.tokens.clone(),
            self.config.clone(),
            self.clock.clone(),
        )
    }

    /// Read-only counts for reporting collaborators.
    pub fn summary(&self) -> EngineSummary {
        self.store.summary()
    }
}
