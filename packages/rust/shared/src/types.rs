//! Core domain types for the enrichment garage.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LeadGarageError;

/// Well-known record field names.
pub mod fields {
    pub const COMPANY_NAME: &str = "company_name";
    pub const DOMAIN: &str = "domain";
    pub const WEBSITE: &str = "website";
    pub const EMAIL: &str = "email";
    pub const TITLE: &str = "title";
    pub const FIRST_NAME: &str = "first_name";
    pub const LAST_NAME: &str = "last_name";
    pub const FULL_NAME: &str = "full_name";
    pub const COMPANY_DOMAIN: &str = "company_domain";
}

// ---------------------------------------------------------------------------
// RecordId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for record identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Generate a new time-sortable record identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Entity kind of a lead record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Company,
    Person,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Company => "company",
            Self::Person => "person",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = LeadGarageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "company" => Ok(Self::Company),
            "person" => Ok(Self::Person),
            other => Err(LeadGarageError::validation(format!(
                "unknown record type '{other}': expected 'company' or 'person'"
            ))),
        }
    }
}

/// Where a record sits in the store-side lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Failed validation; eligible for routing.
    Invalid,
    /// Revalidated after a repair (promoted).
    Valid,
    /// Chronic-bad, parked for a human.
    ManualFix,
    /// Chronic-bad, dropped from automatic processing.
    Discarded,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Valid => "valid",
            Self::ManualFix => "manual_fix",
            Self::Discarded => "discarded",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = LeadGarageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid" => Ok(Self::Invalid),
            "valid" => Ok(Self::Valid),
            "manual_fix" => Ok(Self::ManualFix),
            "discarded" => Ok(Self::Discarded),
            other => Err(LeadGarageError::validation(format!(
                "unknown record status '{other}'"
            ))),
        }
    }
}

/// A company or person entity pending enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier, never reassigned.
    pub record_id: RecordId,
    pub record_type: RecordType,
    /// Field name to current value.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default = "default_status")]
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

fn default_status() -> RecordStatus {
    RecordStatus::Invalid
}

impl Record {
    /// Create a new invalid-queue record with a fresh identifier.
    pub fn new(record_type: RecordType, fields: BTreeMap<String, String>) -> Self {
        Self {
            record_id: RecordId::new(),
            record_type,
            fields,
            status: RecordStatus::Invalid,
            created_at: Utc::now(),
        }
    }

    /// Trimmed, non-empty value of a field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Merge repaired fields over the current values (merge, not replace).
    pub fn merge_repair(&mut self, repaired: &BTreeMap<String, String>) {
        for (name, value) in repaired {
            self.fields.insert(name.clone(), value.clone());
        }
    }
}

/// Bare lowercase host of a domain-or-URL value: scheme, `www.`, port and
/// path stripped. `None` when nothing is left.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let lower = raw.trim().to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let host = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .split(':')
        .next()
        .unwrap_or_default();
    let host = host.strip_prefix("www.").unwrap_or(host).trim_end_matches('.');
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A semantic conflict between two fields of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Contradiction {
    /// Person email domain differs from the employer's domain.
    EmailDomainMismatch,
    /// The record could not be classified at all.
    Unclassifiable,
}

impl Contradiction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailDomainMismatch => "email_domain_mismatch",
            Self::Unclassifiable => "unclassifiable",
        }
    }

    /// Fields whose repair resolves this contradiction.
    pub fn resolving_fields(&self) -> &'static [&'static str] {
        match self {
            Self::EmailDomainMismatch => &[fields::EMAIL],
            Self::Unclassifiable => &[],
        }
    }
}

/// Validator output for one record. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub missing_fields: BTreeSet<String>,
    pub contradictions: BTreeSet<Contradiction>,
}

impl ValidationResult {
    /// Build a result; `is_valid` holds iff there are no defects.
    pub fn new(missing_fields: BTreeSet<String>, contradictions: BTreeSet<Contradiction>) -> Self {
        Self {
            is_valid: missing_fields.is_empty() && contradictions.is_empty(),
            missing_fields,
            contradictions,
        }
    }

    pub fn valid() -> Self {
        Self::new(BTreeSet::new(), BTreeSet::new())
    }

    /// Fields a repair must produce: missing fields plus contradiction resolutions.
    pub fn needs(&self) -> BTreeSet<String> {
        let mut needs = self.missing_fields.clone();
        for c in &self.contradictions {
            needs.extend(c.resolving_fields().iter().map(|f| (*f).to_string()));
        }
        needs
    }
}

// ---------------------------------------------------------------------------
// Bays and capabilities
// ---------------------------------------------------------------------------

/// Cost tier of an enrichment capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bay {
    /// Cheap, automatic.
    #[serde(rename = "bay_a")]
    BayA,
    /// Expensive, reasoning-based.
    #[serde(rename = "bay_b")]
    BayB,
}

impl Bay {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BayA => "bay_a",
            Self::BayB => "bay_b",
        }
    }
}

impl fmt::Display for Bay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bay {
    type Err = LeadGarageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bay_a" => Ok(Self::BayA),
            "bay_b" => Ok(Self::BayB),
            other => Err(LeadGarageError::validation(format!("unknown bay '{other}'"))),
        }
    }
}

/// Identifier of an enrichment capability (spoke).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    EmailDiscovery,
    WebScraper,
    DirectoryLookup,
    AiExtractor,
}

impl Capability {
    /// All capabilities in declaration order.
    pub const ALL: [Capability; 4] = [
        Self::EmailDiscovery,
        Self::WebScraper,
        Self::DirectoryLookup,
        Self::AiExtractor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailDiscovery => "email_discovery",
            Self::WebScraper => "web_scraper",
            Self::DirectoryLookup => "directory_lookup",
            Self::AiExtractor => "ai_extractor",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = LeadGarageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| LeadGarageError::validation(format!("unknown capability '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Spoke outcomes
// ---------------------------------------------------------------------------

/// Closed taxonomy of repair failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// The record never should have entered routing for this spoke.
    ValidationError,
    /// Transport or auth failure. Always retryable.
    ApiError,
    /// Per-record ceiling exceeded.
    Timeout,
    /// Nothing found. Retry with a different capability only.
    NotFound,
    /// Conflicting candidates. Never auto-applied.
    Ambiguous,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::ApiError => "api_error",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::Ambiguous => "ambiguous",
        }
    }

    /// Whether this failure counts toward the chronic-bad threshold.
    pub fn counts_toward_chronic(&self) -> bool {
        matches!(self, Self::ApiError | Self::Timeout | Self::NotFound)
    }

    /// Whether the capability that produced this failure may be retried for the same record.
    pub fn allows_same_capability(&self) -> bool {
        matches!(self, Self::ApiError | Self::Timeout)
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureType {
    type Err = LeadGarageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation_error" => Ok(Self::ValidationError),
            "api_error" => Ok(Self::ApiError),
            "timeout" => Ok(Self::Timeout),
            "not_found" => Ok(Self::NotFound),
            "ambiguous" => Ok(Self::Ambiguous),
            other => Err(LeadGarageError::validation(format!(
                "unknown failure type '{other}'"
            ))),
        }
    }
}

/// Side-channel event emitted by a spoke outcome for downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubSignal {
    EmailVerified,
    DomainResolved,
    CompanyProfiled,
    AmbiguousCandidates,
}

impl HubSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailVerified => "email_verified",
            Self::DomainResolved => "domain_resolved",
            Self::CompanyProfiled => "company_profiled",
            Self::AmbiguousCandidates => "ambiguous_candidates",
        }
    }
}

impl FromStr for HubSignal {
    type Err = LeadGarageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email_verified" => Ok(Self::EmailVerified),
            "domain_resolved" => Ok(Self::DomainResolved),
            "company_profiled" => Ok(Self::CompanyProfiled),
            "ambiguous_candidates" => Ok(Self::AmbiguousCandidates),
            other => Err(LeadGarageError::validation(format!(
                "unknown hub signal '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpokeStatus {
    Success,
    Failed,
}

/// Uniform result of invoking a spoke.
///
/// Fields are private so the status/failure/repair invariants hold by
/// construction: use [`SpokeResult::success`] or [`SpokeResult::failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpokeResult {
    status: SpokeStatus,
    failure_type: Option<FailureType>,
    repaired_fields: BTreeMap<String, String>,
    hub_signal: Option<HubSignal>,
    metrics: serde_json::Value,
}

impl SpokeResult {
    /// A successful repair proposing `repaired_fields`.
    pub fn success(repaired_fields: BTreeMap<String, String>) -> Self {
        Self {
            status: SpokeStatus::Success,
            failure_type: None,
            repaired_fields,
            hub_signal: None,
            metrics: serde_json::Value::Null,
        }
    }

    /// A classified failure. Never carries repaired fields.
    pub fn failed(failure_type: FailureType) -> Self {
        Self {
            status: SpokeStatus::Failed,
            failure_type: Some(failure_type),
            repaired_fields: BTreeMap::new(),
            hub_signal: None,
            metrics: serde_json::Value::Null,
        }
    }

    pub fn with_signal(mut self, signal: HubSignal) -> Self {
        self.hub_signal = Some(signal);
        self
    }

    pub fn with_metrics(mut self, metrics: serde_json::Value) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn status(&self) -> SpokeStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == SpokeStatus::Success
    }

    pub fn failure_type(&self) -> Option<FailureType> {
        self.failure_type
    }

    pub fn repaired_fields(&self) -> &BTreeMap<String, String> {
        &self.repaired_fields
    }

    pub fn hub_signal(&self) -> Option<HubSignal> {
        self.hub_signal
    }

    pub fn metrics(&self) -> &serde_json::Value {
        &self.metrics
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// What the router wants done with a record this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Invoke the assigned capability.
    Repair,
    /// Park for a human.
    ManualFix,
    /// Drop from automatic processing.
    Discard,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Repair => "repair",
            Self::ManualFix => "manual_fix",
            Self::Discard => "discard",
        }
    }
}

impl FromStr for Disposition {
    type Err = LeadGarageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repair" => Ok(Self::Repair),
            "manual_fix" => Ok(Self::ManualFix),
            "discard" => Ok(Self::Discard),
            other => Err(LeadGarageError::validation(format!(
                "unknown disposition '{other}'"
            ))),
        }
    }
}

/// Structured explanation of a routing choice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingReason {
    /// Missing fields the chosen capability covers.
    pub matched_missing: Vec<String>,
    /// Contradictions that drove the choice.
    pub contradictions: Vec<Contradiction>,
    /// Why the tier moved (e.g. "bay_a api_error"), if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<String>,
    /// Human-readable one-liner.
    pub summary: String,
}

impl fmt::Display for RoutingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary)?;
        if !self.matched_missing.is_empty() {
            write!(f, " [missing: {}]", self.matched_missing.join(", "))?;
        }
        if !self.contradictions.is_empty() {
            let names: Vec<&str> = self.contradictions.iter().map(|c| c.as_str()).collect();
            write!(f, " [contradictions: {}]", names.join(", "))?;
        }
        if let Some(escalation) = &self.escalation {
            write!(f, " [escalated: {escalation}]")?;
        }
        Ok(())
    }
}

/// The router's choice for one repair attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub garage_bay: Option<Bay>,
    pub capability_assigned: Option<Capability>,
    pub routing_reason: RoutingReason,
    /// 1-based, per record.
    pub repair_attempt_number: u32,
    pub is_chronic_bad: bool,
    pub disposition: Disposition,
}

// ---------------------------------------------------------------------------
// Routing log
// ---------------------------------------------------------------------------

/// Outcome column of a routing log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Success,
    Failed,
    /// Budget/throttle denial; no capability invoked.
    Deferred,
    ManualFix,
    Discarded,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Deferred => "deferred",
            Self::ManualFix => "manual_fix",
            Self::Discarded => "discarded",
        }
    }

    /// Whether the entry represents a capability invocation.
    pub fn is_attempt(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl FromStr for AgentStatus {
    type Err = LeadGarageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "deferred" => Ok(Self::Deferred),
            "manual_fix" => Ok(Self::ManualFix),
            "discarded" => Ok(Self::Discarded),
            other => Err(LeadGarageError::validation(format!(
                "unknown agent status '{other}'"
            ))),
        }
    }
}

/// Durable, append-only audit record of one routing cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingLogEntry {
    pub routing_id: String,
    pub record_id: RecordId,
    pub record_type: RecordType,
    pub garage_bay: Option<Bay>,
    pub capability_assigned: Option<Capability>,
    pub routing_reason: RoutingReason,
    pub repair_attempt_number: u32,
    pub is_chronic_bad: bool,
    pub disposition: Disposition,
    pub agent_status: AgentStatus,
    pub failure_type: Option<FailureType>,
    pub agent_started_at: Option<DateTime<Utc>>,
    pub agent_completed_at: Option<DateTime<Utc>>,
    pub agent_cost: f64,
    pub fields_repaired: BTreeMap<String, String>,
    pub confidence: u8,
    pub hub_signal: Option<HubSignal>,
    pub denial_reason: Option<String>,
    pub routed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_roundtrip() {
        let id = RecordId::new();
        let parsed: RecordId = id.to_string().parse().expect("parse RecordId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn validity_follows_defects() {
        assert!(ValidationResult::valid().is_valid);

        let missing = BTreeSet::from(["email".to_string()]);
        let result = ValidationResult::new(missing, BTreeSet::new());
        assert!(!result.is_valid);

        let contradictions = BTreeSet::from([Contradiction::EmailDomainMismatch]);
        let result = ValidationResult::new(BTreeSet::new(), contradictions);
        assert!(!result.is_valid);
    }

    #[test]
    fn needs_include_contradiction_fields() {
        let result = ValidationResult::new(
            BTreeSet::from(["title".to_string()]),
            BTreeSet::from([Contradiction::EmailDomainMismatch]),
        );
        let needs: Vec<String> = result.needs().into_iter().collect();
        assert_eq!(needs, vec!["email".to_string(), "title".to_string()]);
    }

    #[test]
    fn failed_result_carries_no_repairs() {
        let result = SpokeResult::failed(FailureType::NotFound);
        assert!(!result.is_success());
        assert_eq!(result.failure_type(), Some(FailureType::NotFound));
        assert!(result.repaired_fields().is_empty());

        let ok = SpokeResult::success(BTreeMap::from([(
            "email".to_string(),
            "j.smith@acme.com".to_string(),
        )]))
        .with_signal(HubSignal::EmailVerified);
        assert!(ok.is_success());
        assert_eq!(ok.failure_type(), None);
        assert_eq!(ok.hub_signal(), Some(HubSignal::EmailVerified));
    }

    #[test]
    fn chronic_counting_failure_types() {
        assert!(FailureType::ApiError.counts_toward_chronic());
        assert!(FailureType::Timeout.counts_toward_chronic());
        assert!(FailureType::NotFound.counts_toward_chronic());
        assert!(!FailureType::Ambiguous.counts_toward_chronic());
        assert!(!FailureType::ValidationError.counts_toward_chronic());
    }

    #[test]
    fn enum_strings_match_serde() {
        for cap in Capability::ALL {
            let json = serde_json::to_string(&cap).unwrap();
            assert_eq!(json, format!("\"{}\"", cap.as_str()));
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert_eq!(serde_json::to_string(&Bay::BayB).unwrap(), "\"bay_b\"");
        assert_eq!(
            serde_json::to_string(&FailureType::ValidationError).unwrap(),
            "\"validation_error\""
        );
    }

    #[test]
    fn merge_repair_keeps_other_fields() {
        let mut record = Record::new(
            RecordType::Person,
            BTreeMap::from([("title".to_string(), "CFO".to_string())]),
        );
        record.merge_repair(&BTreeMap::from([(
            "email".to_string(),
            "j.smith@acme.com".to_string(),
        )]));
        assert_eq!(record.field("title"), Some("CFO"));
        assert_eq!(record.field("email"), Some("j.smith@acme.com"));
    }

    #[test]
    fn normalize_domain_strips_url_parts() {
        assert_eq!(
            normalize_domain("https://www.Acme.com/about?x=1").as_deref(),
            Some("acme.com")
        );
        assert_eq!(normalize_domain("acme.io:8080").as_deref(), Some("acme.io"));
        assert_eq!(normalize_domain("  "), None);
        assert_eq!(normalize_domain("https://"), None);
    }

    #[test]
    fn routing_reason_display_enumerates_fields() {
        let reason = RoutingReason {
            matched_missing: vec!["email".into()],
            contradictions: vec![],
            escalation: Some("bay_a api_error".into()),
            summary: "email_discovery covers needs".into(),
        };
        let text = reason.to_string();
        assert!(text.contains("[missing: email]"));
        assert!(text.contains("bay_a api_error"));
    }
}
