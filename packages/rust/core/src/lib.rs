//! Core routing engine for LeadGarage.
//!
//! This crate ties validation, routing, budget gating, spoke invocation,
//! scoring, and audit logging into the batch and continuous enrichment
//! cycles driven by [`Orchestrator`].

pub mod audit;
pub mod budget;
pub mod clock;
pub mod orchestrator;
pub mod router;
pub mod scoring;
pub mod validator;

pub use audit::{AuditLog, RoutingEntryDraft};
pub use budget::{BudgetController, BudgetPermit, BudgetSnapshot, CapabilitySnapshot, Denial};
pub use clock::{Clock, ManualClock, SystemClock};
pub use orchestrator::{
    BatchStats, CycleOutcome, CycleState, Orchestrator, ProgressReporter, SignalEvent,
    SilentProgress,
};
pub use router::{AttemptHistory, LastAttempt, Router};
pub use validator::{validate, validate_unclassified};
