use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::fairness::{FairnessScheduler, PreemptionProbe, QueueTier, RunTicket, SchedulerCommand};

/// Tiers in the order they are offered a slot.
const TIER_ORDER: [QueueTier; 3] = [QueueTier::Professional, QueueTier::Team, QueueTier::Sandbox];

#[derive(Default)]
struct Queues {
    professional: VecDeque<RunTicket>,
    team: VecDeque<RunTicket>,
    sandbox: VecDeque<RunTicket>,
}

impl Queues {
    fn tier_mut(&mut self, tier: QueueTier) -> &mut VecDeque<RunTicket> {
        match tier {
            QueueTier::Professional => &mut self.professional,
            QueueTier::Team => &mut self.team,
            QueueTier::Sandbox => &mut self.sandbox,
        }
    }

    fn len(&self) -> usize {
        self.professional.len() + self.team.len() + self.sandbox.len()
    }
}

/// FIFO queue per tier in front of a [`FairnessScheduler`].
pub struct RunQueue {
    scheduler: Arc<FairnessScheduler>,
    queues: Mutex<Queues>,
}

impl RunQueue {
    pub fn new(scheduler: Arc<FairnessScheduler>) -> Self {
        Self {
            scheduler,
            queues: Mutex::new(Queues::default()),
        }
    }

    pub fn scheduler(&self) -> &Arc<FairnessScheduler> {
        &self.scheduler
    }

    pub fn enqueue(&self, ticket: RunTicket) {
        if ticket.tier == QueueTier::Sandbox {
            self.scheduler.sandbox_enqueued();
        }
        tracing::debug!(ticket = %ticket.id, tier = ?ticket.tier, "run queued");
        self.queues.lock().tier_mut(ticket.tier).push_back(ticket);
    }

    /// Put back a run that yielded its slot. It waits behind everything
    /// already queued in its tier, with its aging reset.
    pub fn requeue(&self, mut ticket: RunTicket) {
        ticket.enqueued_at = self.scheduler.now();
        ticket.deferrals = 0;
        self.enqueue(ticket);
    }

    /// Admit the first ticket the scheduler accepts, scanning tiers from
    /// professional to sandbox. A deferred head ticket stays in place and has
    /// its deferral count bumped.
    pub fn try_dequeue(&self) -> Option<(RunTicket, AdmissionPermit)> {
        let mut queues = self.queues.lock();
        for tier in TIER_ORDER {
            let queue = queues.tier_mut(tier);
            let Some(head) = queue.front_mut() else {
                continue;
            };
            match self.scheduler.can_schedule(head) {
                SchedulerCommand::None => {
                    let ticket = queue.pop_front()?;
                    let permit = AdmissionPermit::new(self.scheduler.clone(), tier);
                    if tier == QueueTier::Sandbox {
                        self.scheduler.sandbox_dequeued();
                    }
                    return Some((ticket, permit));
                }
                SchedulerCommand::ResourceLimitReached => {
                    head.deferrals += 1;
                    tracing::debug!(ticket = %head.id, deferrals = head.deferrals, "run deferred");
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A run's claim on an execution slot, released on drop.
pub struct AdmissionPermit {
    scheduler: Arc<FairnessScheduler>,
    tier: QueueTier,
    started_at: i64,
}

impl AdmissionPermit {
    fn new(scheduler: Arc<FairnessScheduler>, tier: QueueTier) -> Self {
        if tier == QueueTier::Sandbox {
            scheduler.sandbox_started();
        }
        let started_at = scheduler.now();
        Self {
            scheduler,
            tier,
            started_at,
        }
    }

    pub fn tier(&self) -> QueueTier {
        self.tier
    }

    /// Probe handed to the dispatcher for this run's time slice.
    pub fn probe(&self) -> Arc<dyn PreemptionProbe> {
        Arc::new(SliceProbe {
            scheduler: self.scheduler.clone(),
            tier: self.tier,
            started_at: self.started_at,
        })
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.tier == QueueTier::Sandbox {
            self.scheduler.sandbox_finished();
        }
    }
}

struct SliceProbe {
    scheduler: Arc<FairnessScheduler>,
    tier: QueueTier,
    started_at: i64,
}

impl PreemptionProbe for SliceProbe {
    fn should_yield(&self) -> bool {
        self.scheduler.check_slice(self.tier, self.started_at) == SchedulerCommand::ResourceLimitReached
    }
}
