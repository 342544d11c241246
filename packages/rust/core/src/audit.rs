//! Audit log writer: append one routing log entry per routing cycle.
//!
//! The writer only ever inserts. Prior entries are read back to derive the
//! record's [`AttemptHistory`] for the router.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use leadgarage_shared::{
    AgentStatus, FailureType, HubSignal, LeadGarageError, Record, RecordId, RecordType, Result,
    RoutingDecision, RoutingLogEntry,
};
use leadgarage_storage::Storage;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::router::AttemptHistory;

/// Everything about one cycle except the id and timestamp the writer assigns.
#[derive(Debug, Clone)]
pub struct RoutingEntryDraft {
    pub record_id: RecordId,
    pub record_type: RecordType,
    pub decision: RoutingDecision,
    pub agent_status: AgentStatus,
    pub failure_type: Option<FailureType>,
    pub agent_started_at: Option<DateTime<Utc>>,
    pub agent_completed_at: Option<DateTime<Utc>>,
    pub agent_cost: f64,
    pub fields_repaired: BTreeMap<String, String>,
    pub confidence: u8,
    pub hub_signal: Option<HubSignal>,
    pub denial_reason: Option<String>,
}

impl RoutingEntryDraft {
    /// A draft with no invocation details filled in.
    pub fn new(record: &Record, decision: RoutingDecision, agent_status: AgentStatus) -> Self {
        Self {
            record_id: record.record_id,
            record_type: record.record_type,
            decision,
            agent_status,
            failure_type: None,
            agent_started_at: None,
            agent_completed_at: None,
            agent_cost: 0.0,
            fields_repaired: BTreeMap::new(),
            confidence: 0,
            hub_signal: None,
            denial_reason: None,
        }
    }
}

/// Insert-only writer over the routing log.
pub struct AuditLog {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Append an entry. Returns its routing id.
    pub async fn record(&self, draft: RoutingEntryDraft) -> Result<String> {
        let entry = self.build(draft)?;
        self.storage.insert_routing_entry(&entry).await?;
        logged(&entry);
        Ok(entry.routing_id)
    }

    /// Append a success entry and merge its repaired fields into the record
    /// in one store transaction. With `promote` the record also becomes valid.
    pub async fn record_repair(&self, draft: RoutingEntryDraft, promote: bool) -> Result<String> {
        if draft.agent_status != AgentStatus::Success || draft.fields_repaired.is_empty() {
            return Err(LeadGarageError::validation(
                "repair entry must be a success with repaired fields",
            ));
        }
        let entry = self.build(draft)?;
        self.storage.apply_repair(&entry, promote).await?;
        logged(&entry);
        Ok(entry.routing_id)
    }

    fn build(&self, draft: RoutingEntryDraft) -> Result<RoutingLogEntry> {
        match (draft.agent_status, draft.failure_type) {
            (AgentStatus::Failed, None) => {
                return Err(LeadGarageError::validation(
                    "failed routing entry must carry a failure type",
                ));
            }
            (status, Some(_)) if status != AgentStatus::Failed => {
                return Err(LeadGarageError::validation(format!(
                    "{} routing entry cannot carry a failure type",
                    status.as_str()
                )));
            }
            _ => {}
        }

        let decision = draft.decision;
        Ok(RoutingLogEntry {
            routing_id: Uuid::now_v7().to_string(),
            record_id: draft.record_id,
            record_type: draft.record_type,
            garage_bay: decision.garage_bay,
            capability_assigned: decision.capability_assigned,
            routing_reason: decision.routing_reason,
            repair_attempt_number: decision.repair_attempt_number,
            is_chronic_bad: decision.is_chronic_bad,
            disposition: decision.disposition,
            agent_status: draft.agent_status,
            failure_type: draft.failure_type,
            agent_started_at: draft.agent_started_at,
            agent_completed_at: draft.agent_completed_at,
            agent_cost: draft.agent_cost,
            fields_repaired: draft.fields_repaired,
            confidence: draft.confidence,
            hub_signal: draft.hub_signal,
            denial_reason: draft.denial_reason,
            routed_at: self.clock.now(),
        })
    }

    /// Prior entries for a record, oldest first.
    pub async fn entries(&self, record_id: &RecordId) -> Result<Vec<RoutingLogEntry>> {
        self.storage.list_routing_entries(record_id).await
    }

    /// Routing history derived from prior entries.
    pub async fn history(&self, record_id: &RecordId) -> Result<AttemptHistory> {
        let entries = self.entries(record_id).await?;
        Ok(AttemptHistory::from_entries(&entries))
    }
}

fn logged(entry: &RoutingLogEntry) {
    debug!(
        record_id = %entry.record_id,
        routing_id = %entry.routing_id,
        status = entry.agent_status.as_str(),
        attempt = entry.repair_attempt_number,
        "routing entry logged"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use leadgarage_shared::{Bay, Capability, Disposition, RoutingReason};

    async fn audit() -> (AuditLog, Arc<Storage>) {
        let tmp = std::env::temp_dir().join(format!("lg_audit_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp).await.expect("open db"));
        (
            AuditLog::new(storage.clone(), Arc::new(ManualClock::default())),
            storage,
        )
    }

    fn decision(attempt: u32) -> RoutingDecision {
        RoutingDecision {
            garage_bay: Some(Bay::BayA),
            capability_assigned: Some(Capability::WebScraper),
            routing_reason: RoutingReason {
                summary: "web_scraper covers needs".into(),
                ..RoutingReason::default()
            },
            repair_attempt_number: attempt,
            is_chronic_bad: false,
            disposition: Disposition::Repair,
        }
    }

    #[tokio::test]
    async fn record_then_history() {
        let (log, storage) = audit().await;
        let record = Record::new(RecordType::Company, BTreeMap::new());
        storage.insert_record(&record).await.unwrap();

        let mut failed = RoutingEntryDraft::new(&record, decision(1), AgentStatus::Failed);
        failed.failure_type = Some(FailureType::NotFound);
        failed.agent_cost = 0.001;
        log.record(failed).await.expect("log failure");

        let mut deferred = RoutingEntryDraft::new(&record, decision(2), AgentStatus::Deferred);
        deferred.denial_reason = Some("rate_limited".into());
        log.record(deferred).await.expect("log deferral");

        let history = log.history(&record.record_id).await.unwrap();
        assert_eq!(history.prior_attempts, 1);
        assert_eq!(history.chronic_failures, 1);
        assert!(history.exhausted.contains(&Capability::WebScraper));
        assert_eq!(log.entries(&record.record_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejects_inconsistent_failure_columns() {
        let (log, storage) = audit().await;
        let record = Record::new(RecordType::Company, BTreeMap::new());
        storage.insert_record(&record).await.unwrap();

        let failed = RoutingEntryDraft::new(&record, decision(1), AgentStatus::Failed);
        assert!(log.record(failed).await.is_err());

        let mut success = RoutingEntryDraft::new(&record, decision(1), AgentStatus::Success);
        success.failure_type = Some(FailureType::Timeout);
        assert!(log.record(success).await.is_err());

        assert_eq!(storage.count_routing_entries(&record.record_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repair_entry_lands_with_merge() {
        let (log, storage) = audit().await;
        let record = Record::new(
            RecordType::Company,
            BTreeMap::from([("company_name".to_string(), "Acme".to_string())]),
        );
        storage.insert_record(&record).await.unwrap();

        let mut success = RoutingEntryDraft::new(&record, decision(1), AgentStatus::Success);
        success.fields_repaired = BTreeMap::from([("domain".to_string(), "acme.com".to_string())]);
        log.record_repair(success, true).await.expect("repair logged");

        let stored = storage.get_record(&record.record_id).await.unwrap().unwrap();
        assert_eq!(stored.field("domain"), Some("acme.com"));
        assert_eq!(stored.status, leadgarage_shared::RecordStatus::Valid);
        assert_eq!(log.entries(&record.record_id).await.unwrap().len(), 1);

        // Not a repair: nothing written
        let empty = RoutingEntryDraft::new(&record, decision(2), AgentStatus::Success);
        assert!(log.record_repair(empty, false).await.is_err());
        assert_eq!(log.entries(&record.record_id).await.unwrap().len(), 1);
    }
}
