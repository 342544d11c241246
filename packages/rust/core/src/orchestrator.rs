//! Orchestrator: pull invalid records, drive each through one routing cycle,
//! and aggregate batch statistics.
//!
//! One cycle per record per batch:
//!
//! ```text
//! Pending → Validating → Routing → BudgetCheck → Denied → Deferred
//!                                              → Invoking → Success → Scored → Merging → Logged
//!                                                         → Failed → Logged
//!                                  → (no capability) → Logged → ChronicBad | ManualFix
//! ```
//!
//! Records are processed on a bounded pool (`max_concurrent_agents`). A
//! record appears at most once per batch, so attempts for the same record
//! are strictly sequential.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use leadgarage_shared::{
    AgentStatus, AppConfig, Capability, Disposition, FailureType, HubSignal, OrchestratorConfig,
    Record, RecordId, RecordStatus, RecordType, Result, SpokeResult,
};
use leadgarage_spokes::SpokeRegistry;
use leadgarage_storage::Storage;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, trace, warn};

use crate::audit::{AuditLog, RoutingEntryDraft};
use crate::budget::{BudgetController, Denial};
use crate::clock::Clock;
use crate::router::Router;
use crate::scoring;
use crate::validator;

/// Buffered hub signals per subscriber before the oldest are dropped.
const SIGNAL_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Stats and outcomes
// ---------------------------------------------------------------------------

/// Counters for one batch, or cumulative across continuous-mode cycles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStats {
    /// Records pulled and handled.
    pub processed: u64,
    /// Successful repairs merged into the store.
    pub enriched: u64,
    /// Records now valid (after a repair, or already valid on pull).
    pub promoted: u64,
    /// Failed invocations and per-record store errors.
    pub failed: u64,
    /// Budget/throttle denials.
    pub deferred: u64,
    /// Records given a chronic-bad disposition.
    pub chronic_bad: u64,
    /// Records parked for a human without being chronic.
    pub manual_fix: u64,
    pub total_cost: f64,
}

impl BatchStats {
    pub fn merge(&mut self, other: &BatchStats) {
        self.processed += other.processed;
        self.enriched += other.enriched;
        self.promoted += other.promoted;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.chronic_bad += other.chronic_bad;
        self.manual_fix += other.manual_fix;
        self.total_cost += other.total_cost;
    }

    /// Nothing was pulled, or every record was deferred.
    pub fn made_no_progress(&self) -> bool {
        self.processed == self.deferred
    }

    fn add(&mut self, outcome: &CycleOutcome) {
        self.processed += 1;
        match outcome {
            CycleOutcome::Promoted => self.promoted += 1,
            CycleOutcome::Enriched { promoted, cost } => {
                self.enriched += 1;
                if *promoted {
                    self.promoted += 1;
                }
                self.total_cost += cost;
            }
            CycleOutcome::Failed { cost, .. } => {
                self.failed += 1;
                self.total_cost += cost;
            }
            CycleOutcome::Deferred(_) => self.deferred += 1,
            CycleOutcome::ChronicBad(_) => self.chronic_bad += 1,
            CycleOutcome::ManualFix => self.manual_fix += 1,
            CycleOutcome::StoreError => self.failed += 1,
        }
    }
}

/// Terminal state of one record's cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Valid on pull; promoted without routing.
    Promoted,
    /// Repair merged. `promoted` if the record now validates.
    Enriched { promoted: bool, cost: f64 },
    /// Invocation failed; eligible for retry unless it turns chronic.
    Failed { failure: FailureType, cost: f64 },
    /// Budget denial; record untouched.
    Deferred(Denial),
    /// Chronic-bad disposition applied.
    ChronicBad(Disposition),
    /// No capability qualifies; parked for a human.
    ManualFix,
    /// The store failed for this record.
    StoreError,
}

/// Intermediate states of a cycle, traced as the record moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Pending,
    Validating,
    Routing,
    BudgetCheck,
    Invoking,
    Merging,
    Scored,
    Logged,
}

/// A hub signal emitted by a spoke outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEvent {
    pub record_id: RecordId,
    pub capability: Capability,
    pub signal: HubSignal,
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for batch processing.
pub trait ProgressReporter: Send + Sync {
    /// Called after records are pulled.
    fn batch_started(&self, record_type: RecordType, records: usize);
    /// Called as each record's cycle completes.
    fn record_finished(&self, record_id: &RecordId, outcome: &CycleOutcome);
    /// Called when the batch completes.
    fn batch_finished(&self, record_type: RecordType, stats: &BatchStats);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn batch_started(&self, _record_type: RecordType, _records: usize) {}
    fn record_finished(&self, _record_id: &RecordId, _outcome: &CycleOutcome) {}
    fn batch_finished(&self, _record_type: RecordType, _stats: &BatchStats) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct Inner {
    config: OrchestratorConfig,
    storage: Arc<Storage>,
    registry: SpokeRegistry,
    router: Router,
    budget: Arc<BudgetController>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    multipliers: BTreeMap<Capability, f64>,
    record_timeout: Duration,
    signals: broadcast::Sender<SignalEvent>,
}

/// Drives records through validation, routing, budget gating, repair and logging.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        storage: Arc<Storage>,
        registry: SpokeRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let router = Router::new(config, &registry);
        let budget = Arc::new(BudgetController::new(config, clock.clone()));
        let audit = AuditLog::new(storage.clone(), clock.clone());
        let multipliers = config
            .agents
            .iter()
            .map(|a| (a.name, a.confidence_multiplier))
            .collect();
        let (signals, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                config: config.orchestrator.clone(),
                storage,
                registry,
                router,
                budget,
                audit,
                clock,
                multipliers,
                record_timeout: config.orchestrator.max_time_per_record(),
                signals,
            }),
        }
    }

    /// Override the per-invocation ceiling (sub-second values in tests).
    pub fn with_record_timeout(self, timeout: Duration) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.record_timeout = timeout;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                warn!("orchestrator already shared, timeout override ignored");
                Self { inner }
            }
        }
    }

    /// Receive hub signals emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.inner.signals.subscribe()
    }

    /// Shared budget controller (snapshots for reporting).
    pub fn budget(&self) -> &Arc<BudgetController> {
        &self.inner.budget
    }

    /// Pull up to `batch_size` invalid records of `record_type` and run one cycle for each.
    #[instrument(skip_all, fields(record_type = %record_type, batch_size))]
    pub async fn run_batch(
        &self,
        record_type: RecordType,
        batch_size: u32,
        progress: &dyn ProgressReporter,
    ) -> Result<BatchStats> {
        let records = self
            .inner
            .storage
            .list_invalid_records(record_type, batch_size)
            .await?;
        progress.batch_started(record_type, records.len());

        let semaphore = Arc::new(Semaphore::new(
            self.inner.config.max_concurrent_agents as usize,
        ));
        let mut seen = BTreeSet::new();
        let mut tasks = JoinSet::new();

        for record in records {
            if !seen.insert(record.record_id) {
                continue;
            }
            let inner = Arc::clone(&self.inner);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _slot = semaphore.acquire_owned().await;
                let record_id = record.record_id;
                let outcome = match inner.process_record(record).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(%record_id, error = %e, "store error, record skipped this cycle");
                        CycleOutcome::StoreError
                    }
                };
                (record_id, outcome)
            });
        }

        let mut stats = BatchStats::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((record_id, outcome)) => {
                    progress.record_finished(&record_id, &outcome);
                    stats.add(&outcome);
                }
                Err(e) => {
                    warn!(error = %e, "record task panicked");
                    stats.processed += 1;
                    stats.failed += 1;
                }
            }
        }

        info!(
            processed = stats.processed,
            enriched = stats.enriched,
            promoted = stats.promoted,
            failed = stats.failed,
            deferred = stats.deferred,
            chronic_bad = stats.chronic_bad,
            cost = stats.total_cost,
            "batch complete"
        );
        progress.batch_finished(record_type, &stats);
        Ok(stats)
    }

    /// Run batches for each record type until shutdown or `max_cycles`.
    ///
    /// Sleeps `idle` on the injected clock whenever a cycle makes no progress.
    /// Returns cumulative stats.
    #[instrument(skip_all, fields(batch_size, max_cycles))]
    pub async fn run_continuous(
        &self,
        record_types: &[RecordType],
        batch_size: u32,
        idle: Duration,
        mut shutdown: watch::Receiver<bool>,
        max_cycles: Option<u64>,
        progress: &dyn ProgressReporter,
    ) -> Result<BatchStats> {
        let mut total = BatchStats::default();
        let mut cycles: u64 = 0;

        loop {
            if *shutdown.borrow() {
                info!(cycles, "shutdown requested");
                break;
            }

            let mut cycle = BatchStats::default();
            for &record_type in record_types {
                match self.run_batch(record_type, batch_size, progress).await {
                    Ok(stats) => cycle.merge(&stats),
                    Err(e) => warn!(%record_type, error = %e, "batch failed, continuing"),
                }
            }
            total.merge(&cycle);
            cycles += 1;

            if max_cycles.is_some_and(|max| cycles >= max) {
                info!(cycles, "cycle limit reached");
                break;
            }

            if cycle.made_no_progress() {
                debug!(idle_secs = idle.as_secs_f64(), "nothing to do, sleeping");
                tokio::select! {
                    _ = self.inner.clock.sleep(idle) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            info!(cycles, "shutdown channel closed");
                            break;
                        }
                    }
                }
            }
        }
        Ok(total)
    }
}

impl Inner {
    /// One routing cycle for one record.
    #[instrument(skip_all, fields(record_id = %record.record_id))]
    async fn process_record(&self, record: Record) -> Result<CycleOutcome> {
        trace!(state = ?CycleState::Pending);

        trace!(state = ?CycleState::Validating);
        let validation = validator::validate(&record);
        if validation.is_valid {
            self.storage
                .set_record_status(&record.record_id, RecordStatus::Valid)
                .await?;
            debug!("valid on pull, promoted");
            return Ok(CycleOutcome::Promoted);
        }

        trace!(state = ?CycleState::Routing);
        let history = self.audit.history(&record.record_id).await?;
        let decision = self.router.route(&validation, &history);

        let Some(capability) = decision.capability_assigned else {
            let (status, record_status) = match decision.disposition {
                Disposition::Discard => (AgentStatus::Discarded, RecordStatus::Discarded),
                _ => (AgentStatus::ManualFix, RecordStatus::ManualFix),
            };
            let chronic = decision.is_chronic_bad;
            let disposition = decision.disposition;
            info!(
                chronic,
                disposition = disposition.as_str(),
                reason = %decision.routing_reason,
                "no capability assigned"
            );
            self.audit
                .record(RoutingEntryDraft::new(&record, decision, status))
                .await?;
            trace!(state = ?CycleState::Logged);
            self.storage
                .set_record_status(&record.record_id, record_status)
                .await?;
            return Ok(if chronic {
                CycleOutcome::ChronicBad(disposition)
            } else {
                CycleOutcome::ManualFix
            });
        };

        trace!(state = ?CycleState::BudgetCheck);
        let permit = match self.budget.acquire(capability) {
            Ok(permit) => permit,
            Err(denial) => {
                debug!(%capability, %denial, "budget denied, deferring");
                let mut draft = RoutingEntryDraft::new(&record, decision, AgentStatus::Deferred);
                draft.denial_reason = Some(denial.to_string());
                self.audit.record(draft).await?;
                return Ok(CycleOutcome::Deferred(denial));
            }
        };

        trace!(state = ?CycleState::Invoking);
        let started = self.clock.now();
        let result = match self.registry.get(capability) {
            Some(spoke) => {
                match tokio::time::timeout(self.record_timeout, spoke.repair(&record, &validation))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(%capability, timeout_ms = self.record_timeout.as_millis() as u64, "spoke call timed out");
                        SpokeResult::failed(FailureType::Timeout)
                    }
                }
            }
            None => {
                warn!(%capability, "no spoke registered");
                SpokeResult::failed(FailureType::ApiError)
            }
        };
        let completed = self.clock.now();
        let cost = permit.reserved();
        self.budget.release(permit, cost);

        let bay = decision.garage_bay;
        let mut draft = RoutingEntryDraft::new(&record, decision, AgentStatus::Failed);
        draft.agent_started_at = Some(started);
        draft.agent_completed_at = Some(completed);
        draft.agent_cost = cost;
        draft.hub_signal = result.hub_signal();

        // Proposals equal to the current values repair nothing
        let repaired = if result.is_success() {
            scoring::changed_fields(&record, result.repaired_fields())
        } else {
            BTreeMap::new()
        };

        let outcome = if !repaired.is_empty() {
            trace!(state = ?CycleState::Scored);
            let multiplier = self.multipliers.get(&capability).copied().unwrap_or(0.0);
            let confidence = scoring::score(&repaired, multiplier);

            let mut merged = record.clone();
            merged.merge_repair(&repaired);
            let promoted = validator::validate(&merged).is_valid;

            trace!(state = ?CycleState::Merging);
            draft.agent_status = AgentStatus::Success;
            draft.fields_repaired = repaired;
            draft.confidence = confidence;
            self.audit.record_repair(draft, promoted).await?;

            info!(%capability, ?bay, cost, confidence, promoted, "record repaired");
            CycleOutcome::Enriched { promoted, cost }
        } else {
            if result.is_success() {
                debug!(%capability, "spoke proposed no change, logging not_found");
            }
            let failure = result.failure_type().unwrap_or(FailureType::NotFound);
            draft.failure_type = Some(failure);
            self.audit.record(draft).await?;
            info!(%capability, ?bay, cost, failure = failure.as_str(), "repair failed");
            CycleOutcome::Failed { failure, cost }
        };
        trace!(state = ?CycleState::Logged);

        if let Some(signal) = result.hub_signal() {
            // No subscribers is fine
            let _ = self.signals.send(SignalEvent {
                record_id: record.record_id,
                capability,
                signal,
            });
        }

        Ok(outcome)
    }
}
