//! Admission control for concurrent runs.
//!
//! [`FairnessScheduler`] decides whether a queued [`RunTicket`] may start now,
//! and [`RunQueue`] holds tickets per tier and hands out RAII
//! [`AdmissionPermit`]s. Sandbox-tier runs on the cloud edition are time
//! sliced: a permit's [`PreemptionProbe`] asks the dispatcher to yield at the
//! next node boundary once the slice is used up and other sandbox work waits.

pub mod fairness;
pub mod run_queue;

pub use fairness::{
    DeploymentEdition, FairnessScheduler, PreemptionProbe, QueueTier, RunTicket, ScheduleStrategy,
    SchedulerCommand,
};
pub use run_queue::{AdmissionPermit, RunQueue};
