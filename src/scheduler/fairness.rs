use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::FairnessConfig;
use crate::core::runtime_context::{RealTimeProvider, TimeProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentEdition {
    Cloud,
    #[default]
    #[serde(alias = "self-hosted")]
    SelfHosted,
}

/// Billing tier of the tenant that owns a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTier {
    Sandbox,
    Team,
    Professional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStrategy {
    TimeSlice,
    Nop,
}

impl ScheduleStrategy {
    pub fn for_edition(edition: DeploymentEdition) -> Self {
        match edition {
            DeploymentEdition::Cloud => ScheduleStrategy::TimeSlice,
            DeploymentEdition::SelfHosted => ScheduleStrategy::Nop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    None,
    ResourceLimitReached,
}

/// A run waiting for admission.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTicket {
    pub id: String,
    pub tenant_id: String,
    pub tier: QueueTier,
    pub enqueued_at: i64,
    pub deferrals: u32,
}

impl RunTicket {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, tier: QueueTier, enqueued_at: i64) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            tier,
            enqueued_at,
            deferrals: 0,
        }
    }
}

/// Asked by the dispatcher between nodes whether the run should give up its
/// slot.
pub trait PreemptionProbe: Send + Sync {
    fn should_yield(&self) -> bool;
}

/// CFS-style admission for runs sharing execution slots.
///
/// Only the sandbox tier is ever deferred, and only under
/// [`ScheduleStrategy::TimeSlice`]. Aging bounds how long a sandbox ticket can
/// be held back.
pub struct FairnessScheduler {
    strategy: ScheduleStrategy,
    config: FairnessConfig,
    time: Arc<dyn TimeProvider>,
    running_sandbox: AtomicUsize,
    waiting_sandbox: AtomicUsize,
}

impl FairnessScheduler {
    pub fn new(config: FairnessConfig) -> Self {
        Self::with_time_provider(config, Arc::new(RealTimeProvider))
    }

    pub fn with_time_provider(config: FairnessConfig, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            strategy: ScheduleStrategy::for_edition(config.edition),
            config,
            time,
            running_sandbox: AtomicUsize::new(0),
            waiting_sandbox: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> ScheduleStrategy {
        self.strategy
    }

    pub fn now(&self) -> i64 {
        self.time.now_timestamp()
    }

    pub fn running_sandbox(&self) -> usize {
        self.running_sandbox.load(Ordering::SeqCst)
    }

    pub fn waiting_sandbox(&self) -> usize {
        self.waiting_sandbox.load(Ordering::SeqCst)
    }

    pub fn can_schedule(&self, ticket: &RunTicket) -> SchedulerCommand {
        if self.strategy == ScheduleStrategy::Nop || ticket.tier != QueueTier::Sandbox {
            return SchedulerCommand::None;
        }
        let waited = self.time.elapsed_secs(ticket.enqueued_at);
        if waited >= self.config.max_wait_secs || ticket.deferrals >= self.config.max_deferrals {
            tracing::debug!(ticket = %ticket.id, waited, deferrals = ticket.deferrals, "admitting aged ticket");
            return SchedulerCommand::None;
        }
        if self.running_sandbox() >= self.config.sandbox_concurrency {
            return SchedulerCommand::ResourceLimitReached;
        }
        SchedulerCommand::None
    }

    /// Whether a run admitted at `started_at` has used up its time slice.
    pub fn check_slice(&self, tier: QueueTier, started_at: i64) -> SchedulerCommand {
        if self.strategy == ScheduleStrategy::Nop || tier != QueueTier::Sandbox {
            return SchedulerCommand::None;
        }
        if self.waiting_sandbox() > 0
            && self.time.elapsed_secs(started_at) >= self.config.granularity_secs
        {
            return SchedulerCommand::ResourceLimitReached;
        }
        SchedulerCommand::None
    }

    pub(crate) fn sandbox_started(&self) {
        self.running_sandbox.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn sandbox_finished(&self) {
        let _ = self
            .running_sandbox
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub(crate) fn sandbox_enqueued(&self) {
        self.waiting_sandbox.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn sandbox_dequeued(&self) {
        let _ = self
            .waiting_sandbox
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}
