//! Routing: pick the bay and capability for a record's next repair attempt.
//!
//! The router is a pure function of the validation result, the record's
//! attempt history, and the static agent profiles. It never touches budget
//! state; the budget controller gates the decision afterwards.

use std::collections::{BTreeMap, BTreeSet};

use leadgarage_shared::{
    AgentProfile, AgentStatus, AppConfig, Bay, Capability, ChronicPolicy, Disposition,
    FailureType, RoutingDecision, RoutingLogEntry, RoutingReason, ValidationResult,
};
use leadgarage_spokes::SpokeRegistry;

// ---------------------------------------------------------------------------
// AttemptHistory
// ---------------------------------------------------------------------------

/// The most recent capability invocation for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastAttempt {
    pub bay: Bay,
    pub capability: Capability,
    /// `None` when the attempt succeeded.
    pub failure: Option<FailureType>,
}

/// Routing-relevant summary of a record's prior log entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptHistory {
    /// Entries that reached a spoke (success or failed).
    pub prior_attempts: u32,
    /// Counted failures over the record's lifetime. A success does not clear
    /// them: a record still being routed after a success did not validate.
    pub chronic_failures: u32,
    pub last_attempt: Option<LastAttempt>,
    /// Capabilities that returned `not_found` or `validation_error` for this record.
    pub exhausted: BTreeSet<Capability>,
}

impl AttemptHistory {
    /// Fold prior entries, oldest first. Deferred and disposition-only entries are skipped.
    pub fn from_entries(entries: &[RoutingLogEntry]) -> Self {
        let mut history = Self::default();
        for entry in entries {
            if !entry.agent_status.is_attempt() {
                continue;
            }
            let (Some(bay), Some(capability)) = (entry.garage_bay, entry.capability_assigned)
            else {
                continue;
            };
            history.prior_attempts += 1;

            let failure = match entry.agent_status {
                AgentStatus::Failed => entry.failure_type,
                _ => None,
            };
            if let Some(ft) = failure {
                if ft.counts_toward_chronic() {
                    history.chronic_failures += 1;
                }
                if !ft.allows_same_capability() && ft != FailureType::Ambiguous {
                    history.exhausted.insert(capability);
                }
            }
            history.last_attempt = Some(LastAttempt {
                bay,
                capability,
                failure,
            });
        }
        history
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Chooses the next action for an invalid record.
#[derive(Debug, Clone)]
pub struct Router {
    /// Enabled profiles with a registered spoke, in declaration order.
    candidates: Vec<AgentProfile>,
    coverage: BTreeMap<Capability, &'static [&'static str]>,
    chronic_threshold: u32,
    chronic_policy: ChronicPolicy,
}

impl Router {
    /// Build a router over the configured profiles and the spokes actually registered.
    pub fn new(config: &AppConfig, registry: &SpokeRegistry) -> Self {
        let coverage: BTreeMap<_, _> = config
            .agents
            .iter()
            .filter_map(|p| registry.covers(p.name).map(|c| (p.name, c)))
            .collect();
        let candidates = config
            .agents
            .iter()
            .filter(|p| p.enabled && coverage.contains_key(&p.name))
            .cloned()
            .collect();
        Self {
            candidates,
            coverage,
            chronic_threshold: config.orchestrator.chronic_threshold,
            chronic_policy: config.orchestrator.chronic_policy,
        }
    }

    /// Decide the next step for a record.
    pub fn route(&self, validation: &ValidationResult, history: &AttemptHistory) -> RoutingDecision {
        let attempt = history.prior_attempts + 1;
        let contradictions: Vec<_> = validation.contradictions.iter().copied().collect();

        if history.chronic_failures >= self.chronic_threshold {
            return RoutingDecision {
                garage_bay: None,
                capability_assigned: None,
                routing_reason: RoutingReason {
                    matched_missing: validation.missing_fields.iter().cloned().collect(),
                    contradictions,
                    escalation: None,
                    summary: format!(
                        "chronic: {} counted failures (threshold {})",
                        history.chronic_failures, self.chronic_threshold
                    ),
                },
                repair_attempt_number: attempt,
                is_chronic_bad: true,
                disposition: self.chronic_policy.disposition(),
            };
        }

        let needs = validation.needs();
        let (mut tier, mut escalation) = match history.last_attempt {
            None
            | Some(LastAttempt {
                failure: None, ..
            }) => (Bay::BayA, None),
            Some(LastAttempt {
                bay: Bay::BayB,
                failure: Some(FailureType::Ambiguous),
                capability,
            }) => {
                return self.manual_fix(
                    validation,
                    attempt,
                    format!("{capability} returned ambiguous candidates in bay_b"),
                    Some(format!("bay_b {}", FailureType::Ambiguous)),
                );
            }
            Some(LastAttempt {
                bay: Bay::BayA,
                capability,
                failure: Some(ft),
            }) => (Bay::BayB, Some(format!("bay_a {capability} {ft}"))),
            Some(LastAttempt {
                bay: Bay::BayB,
                capability,
                failure: Some(ft),
            }) => (Bay::BayB, Some(format!("bay_b {capability} {ft}"))),
        };

        let mut chosen = self.pick(tier, &needs, &history.exhausted);
        if chosen.is_none() && tier == Bay::BayA {
            tier = Bay::BayB;
            escalation = Some("no bay_a capability covers needs".into());
            chosen = self.pick(tier, &needs, &history.exhausted);
        }

        let Some(profile) = chosen else {
            let needs_list: Vec<&str> = needs.iter().map(String::as_str).collect();
            return self.manual_fix(
                validation,
                attempt,
                format!("no enabled capability covers [{}]", needs_list.join(", ")),
                escalation,
            );
        };

        let covered = self.coverage.get(&profile.name).copied().unwrap_or_default();
        let matched_missing = validation
            .missing_fields
            .iter()
            .filter(|f| covered.contains(&f.as_str()))
            .cloned()
            .collect();

        RoutingDecision {
            garage_bay: Some(tier),
            capability_assigned: Some(profile.name),
            routing_reason: RoutingReason {
                matched_missing,
                contradictions,
                escalation,
                summary: format!(
                    "{} (cost {}) covers needs in {tier}",
                    profile.name, profile.cost_per_call
                ),
            },
            repair_attempt_number: attempt,
            is_chronic_bad: false,
            disposition: Disposition::Repair,
        }
    }

    /// Cheapest enabled, non-exhausted profile in `bay` covering all `needs`.
    /// Ties keep declaration order.
    fn pick(
        &self,
        bay: Bay,
        needs: &BTreeSet<String>,
        exhausted: &BTreeSet<Capability>,
    ) -> Option<&AgentProfile> {
        self.candidates
            .iter()
            .filter(|p| p.bay == bay && !exhausted.contains(&p.name))
            .filter(|p| {
                let covered = self.coverage.get(&p.name).copied().unwrap_or_default();
                needs.iter().all(|n| covered.contains(&n.as_str()))
            })
            .fold(None, |best: Option<&AgentProfile>, p| match best {
                Some(b) if b.cost_per_call <= p.cost_per_call => Some(b),
                _ => Some(p),
            })
    }

    fn manual_fix(
        &self,
        validation: &ValidationResult,
        attempt: u32,
        summary: String,
        escalation: Option<String>,
    ) -> RoutingDecision {
        RoutingDecision {
            garage_bay: None,
            capability_assigned: None,
            routing_reason: RoutingReason {
                matched_missing: validation.missing_fields.iter().cloned().collect(),
                contradictions: validation.contradictions.iter().copied().collect(),
                escalation,
                summary,
            },
            repair_attempt_number: attempt,
            is_chronic_bad: false,
            disposition: Disposition::ManualFix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use leadgarage_shared::{Contradiction, RecordId, RecordType};

    fn router(config: &AppConfig) -> Router {
        let registry = SpokeRegistry::from_config(config).expect("registry");
        Router::new(config, &registry)
    }

    fn needs(missing: &[&str]) -> ValidationResult {
        ValidationResult::new(
            missing.iter().map(|f| (*f).to_string()).collect(),
            BTreeSet::new(),
        )
    }

    fn logged(
        bay: Bay,
        capability: Capability,
        status: AgentStatus,
        failure: Option<FailureType>,
    ) -> RoutingLogEntry {
        RoutingLogEntry {
            routing_id: uuid::Uuid::now_v7().to_string(),
            record_id: RecordId::new(),
            record_type: RecordType::Person,
            garage_bay: Some(bay),
            capability_assigned: Some(capability),
            routing_reason: RoutingReason::default(),
            repair_attempt_number: 1,
            is_chronic_bad: false,
            disposition: Disposition::Repair,
            agent_status: status,
            failure_type: failure,
            agent_started_at: None,
            agent_completed_at: None,
            agent_cost: 0.0,
            fields_repaired: BTreeMap::new(),
            confidence: 0,
            hub_signal: None,
            denial_reason: None,
            routed_at: Utc::now(),
        }
    }

    #[test]
    fn first_attempt_goes_to_cheapest_bay_a() {
        let r = router(&AppConfig::default());
        let decision = r.route(&needs(&["email"]), &AttemptHistory::default());
        assert_eq!(decision.garage_bay, Some(Bay::BayA));
        assert_eq!(decision.capability_assigned, Some(Capability::EmailDiscovery));
        assert_eq!(decision.repair_attempt_number, 1);
        assert_eq!(decision.disposition, Disposition::Repair);
        assert_eq!(decision.routing_reason.matched_missing, vec!["email".to_string()]);

        // company_name alone: web scraper (0.001) beats directory lookup (0.01)
        let decision = r.route(&needs(&["company_name"]), &AttemptHistory::default());
        assert_eq!(decision.capability_assigned, Some(Capability::WebScraper));

        // both fields: only the directory covers the full set
        let decision = r.route(&needs(&["company_name", "domain"]), &AttemptHistory::default());
        assert_eq!(decision.capability_assigned, Some(Capability::DirectoryLookup));
    }

    #[test]
    fn uncovered_needs_fall_through_to_bay_b() {
        let r = router(&AppConfig::default());
        let decision = r.route(&needs(&["title"]), &AttemptHistory::default());
        assert_eq!(decision.garage_bay, Some(Bay::BayB));
        assert_eq!(decision.capability_assigned, Some(Capability::AiExtractor));
        assert!(decision.routing_reason.escalation.is_some());
    }

    #[test]
    fn contradiction_routes_by_resolving_field() {
        let r = router(&AppConfig::default());
        let v = ValidationResult::new(
            BTreeSet::new(),
            BTreeSet::from([Contradiction::EmailDomainMismatch]),
        );
        let decision = r.route(&v, &AttemptHistory::default());
        assert_eq!(decision.capability_assigned, Some(Capability::EmailDiscovery));
        assert_eq!(
            decision.routing_reason.contradictions,
            vec![Contradiction::EmailDomainMismatch]
        );
    }

    #[test]
    fn bay_a_failure_escalates_to_bay_b() {
        let r = router(&AppConfig::default());
        let history = AttemptHistory::from_entries(&[logged(
            Bay::BayA,
            Capability::EmailDiscovery,
            AgentStatus::Failed,
            Some(FailureType::ApiError),
        )]);
        let decision = r.route(&needs(&["email"]), &history);
        assert_eq!(decision.garage_bay, Some(Bay::BayB));
        assert_eq!(decision.capability_assigned, Some(Capability::AiExtractor));
        assert_eq!(decision.repair_attempt_number, 2);
        assert!(
            decision
                .routing_reason
                .escalation
                .as_deref()
                .unwrap()
                .contains("api_error")
        );
    }

    #[test]
    fn ambiguous_in_bay_b_goes_to_manual_fix() {
        let r = router(&AppConfig::default());
        let history = AttemptHistory::from_entries(&[logged(
            Bay::BayB,
            Capability::AiExtractor,
            AgentStatus::Failed,
            Some(FailureType::Ambiguous),
        )]);
        let decision = r.route(&needs(&["title"]), &history);
        assert_eq!(decision.disposition, Disposition::ManualFix);
        assert_eq!(decision.capability_assigned, None);
        assert!(!decision.is_chronic_bad);
    }

    #[test]
    fn exhausted_capability_is_skipped() {
        let r = router(&AppConfig::default());
        let history = AttemptHistory::from_entries(&[logged(
            Bay::BayB,
            Capability::AiExtractor,
            AgentStatus::Failed,
            Some(FailureType::NotFound),
        )]);
        assert!(history.exhausted.contains(&Capability::AiExtractor));
        let decision = r.route(&needs(&["title"]), &history);
        assert_eq!(decision.disposition, Disposition::ManualFix);
        assert_eq!(decision.capability_assigned, None);
    }

    #[test]
    fn chronic_after_threshold() {
        let r = router(&AppConfig::default());
        let entries: Vec<_> = (0..3)
            .map(|_| {
                logged(
                    Bay::BayB,
                    Capability::AiExtractor,
                    AgentStatus::Failed,
                    Some(FailureType::Timeout),
                )
            })
            .collect();
        let history = AttemptHistory::from_entries(&entries);
        assert_eq!(history.chronic_failures, 3);
        let decision = r.route(&needs(&["title"]), &history);
        assert!(decision.is_chronic_bad);
        assert_eq!(decision.capability_assigned, None);
        assert_ne!(decision.garage_bay, Some(Bay::BayB));
        assert_eq!(decision.disposition, Disposition::ManualFix);
        assert_eq!(decision.repair_attempt_number, 4);

        let mut config = AppConfig::default();
        config.orchestrator.chronic_policy = ChronicPolicy::Discard;
        assert_eq!(router(&config).route(&needs(&["title"]), &history).disposition, Disposition::Discard);
    }

    #[test]
    fn deferrals_do_not_count_as_attempts() {
        let mut deferred = logged(Bay::BayA, Capability::EmailDiscovery, AgentStatus::Deferred, None);
        deferred.denial_reason = Some("concurrency ceiling".into());
        let history = AttemptHistory::from_entries(&[
            deferred.clone(),
            logged(
                Bay::BayA,
                Capability::EmailDiscovery,
                AgentStatus::Failed,
                Some(FailureType::Ambiguous),
            ),
            deferred,
        ]);
        assert_eq!(history.prior_attempts, 1);
        // ambiguous never counts toward chronic
        assert_eq!(history.chronic_failures, 0);
    }

    #[test]
    fn success_keeps_chronic_count() {
        let history = AttemptHistory::from_entries(&[
            logged(Bay::BayA, Capability::WebScraper, AgentStatus::Failed, Some(FailureType::ApiError)),
            logged(Bay::BayB, Capability::AiExtractor, AgentStatus::Success, None),
            logged(Bay::BayA, Capability::EmailDiscovery, AgentStatus::Failed, Some(FailureType::Timeout)),
        ]);
        assert_eq!(history.prior_attempts, 3);
        assert_eq!(history.chronic_failures, 2);
        assert_eq!(history.last_attempt.unwrap().failure, Some(FailureType::Timeout));
    }

    #[test]
    fn disabled_and_ties() {
        let mut config = AppConfig::default();
        config.agents[0].enabled = false; // email_discovery
        let r = router(&config);
        let decision = r.route(&needs(&["email"]), &AttemptHistory::default());
        assert_eq!(decision.capability_assigned, Some(Capability::AiExtractor));

        // equal cost: declaration order wins
        let mut config = AppConfig::default();
        config.agents[1].cost_per_call = 0.01; // web_scraper now ties directory_lookup
        config.agents.swap(1, 2);
        let r = router(&config);
        let decision = r.route(&needs(&["company_name"]), &AttemptHistory::default());
        assert_eq!(decision.capability_assigned, Some(Capability::DirectoryLookup));
    }
}
