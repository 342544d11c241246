//! Capability adapters ("spokes") and the registry the orchestrator dispatches through.
//!
//! A spoke wraps one external enrichment service behind a uniform contract:
//! it reads a record snapshot, proposes repaired fields, and classifies every
//! failure into exactly one [`FailureType`]. Spokes never mutate the record
//! and never return `Err` for a repair outcome.

mod ai;
mod directory;
mod email;
mod web;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use leadgarage_shared::{
    AppConfig, Capability, FailureType, LeadGarageError, Record, Result, SpokeResult,
    ValidationResult, read_api_key,
};
use reqwest::{Client, StatusCode};

pub use ai::AiExtractorSpoke;
pub use directory::DirectoryLookupSpoke;
pub use email::{Deliverability, EmailDiscoverySpoke};
pub use web::WebScraperSpoke;

/// User-Agent string for spoke requests.
const USER_AGENT: &str = concat!("LeadGarage/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Uniform contract for an enrichment capability.
#[async_trait]
pub trait Spoke: Send + Sync {
    /// Capability this spoke implements.
    fn capability(&self) -> Capability;

    /// Field names this spoke can repair.
    fn covers(&self) -> &'static [&'static str];

    /// Attempt to repair `record` given its validation defects.
    ///
    /// Implementations must not retry internally; one call, one classified outcome.
    async fn repair(&self, record: &Record, validation: &ValidationResult) -> SpokeResult;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Lookup table from [`Capability`] to its spoke.
#[derive(Default, Clone)]
pub struct SpokeRegistry {
    spokes: BTreeMap<Capability, Arc<dyn Spoke>>,
}

impl SpokeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the reference spokes from config, sharing one HTTP client.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let services = &config.services;
        let client = build_client(Duration::from_secs(services.request_timeout_secs))?;

        let mut registry = Self::new();
        registry.register(EmailDiscoverySpoke::new(
            client.clone(),
            &services.verifier_url,
            read_api_key(&services.verifier_api_key_env),
        )?);
        registry.register(WebScraperSpoke::new(client.clone()));
        registry.register(DirectoryLookupSpoke::new(
            client.clone(),
            &services.directory_url,
            read_api_key(&services.directory_api_key_env),
        )?);
        registry.register(AiExtractorSpoke::new(
            client,
            &services.ai_base_url,
            read_api_key(&services.ai_api_key_env),
            &services.ai_model,
        )?);
        Ok(registry)
    }

    /// Register a spoke, replacing any previous spoke for the same capability.
    pub fn register(&mut self, spoke: impl Spoke + 'static) {
        self.spokes.insert(spoke.capability(), Arc::new(spoke));
    }

    /// Spoke for a capability.
    pub fn get(&self, capability: Capability) -> Option<Arc<dyn Spoke>> {
        self.spokes.get(&capability).cloned()
    }

    /// Declared coverage of a capability, if registered.
    pub fn covers(&self, capability: Capability) -> Option<&'static [&'static str]> {
        self.spokes.get(&capability).map(|s| s.covers())
    }

    /// Registered capabilities.
    pub fn capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.spokes.keys().copied()
    }
}

// ---------------------------------------------------------------------------
// Shared HTTP helpers
// ---------------------------------------------------------------------------

/// Build the HTTP client shared by all reference spokes.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(timeout)
        .build()
        .map_err(|e| LeadGarageError::Network(format!("failed to build HTTP client: {e}")))
}

/// Classify a transport error. Request timeouts are `timeout`, everything else `api_error`.
pub(crate) fn classify_transport(err: &reqwest::Error) -> FailureType {
    if err.is_timeout() {
        FailureType::Timeout
    } else {
        FailureType::ApiError
    }
}

/// Classify a non-success status from a JSON API. 404 means "no such entity".
pub(crate) fn classify_status(status: StatusCode) -> FailureType {
    if status == StatusCode::NOT_FOUND {
        FailureType::NotFound
    } else {
        FailureType::ApiError
    }
}

/// Parse and normalize a service base URL (no trailing slash).
pub(crate) fn base_url(raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| LeadGarageError::config(format!("invalid service URL '{raw}': {e}")))?;
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::{BTreeMap, BTreeSet};

    use leadgarage_shared::{Record, RecordType, ValidationResult};

    pub fn record(record_type: RecordType, fields: &[(&str, &str)]) -> Record {
        Record::new(
            record_type,
            fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    pub fn missing(fields: &[&str]) -> ValidationResult {
        ValidationResult::new(
            fields.iter().map(|f| (*f).to_string()).collect(),
            BTreeSet::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadgarage_shared::fields;

    #[test]
    fn registry_from_default_config() {
        let registry = SpokeRegistry::from_config(&AppConfig::default()).expect("build registry");
        let caps: Vec<Capability> = registry.capabilities().collect();
        assert_eq!(caps, Capability::ALL.to_vec());
        assert_eq!(
            registry.covers(Capability::EmailDiscovery),
            Some(&[fields::EMAIL][..])
        );
        assert!(
            registry
                .covers(Capability::AiExtractor)
                .unwrap()
                .contains(&fields::TITLE)
        );
    }

    #[test]
    fn register_replaces_same_capability() {
        let client = build_client(Duration::from_secs(1)).unwrap();
        let mut registry = SpokeRegistry::new();
        registry.register(WebScraperSpoke::new(client.clone()));
        registry.register(WebScraperSpoke::new(client));
        assert_eq!(registry.capabilities().count(), 1);
        assert!(registry.get(Capability::WebScraper).is_some());
        assert!(registry.get(Capability::AiExtractor).is_none());
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::NOT_FOUND), FailureType::NotFound);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), FailureType::ApiError);
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            FailureType::ApiError
        );
    }

    #[test]
    fn base_url_trims_trailing_slash() {
        assert_eq!(
            base_url("https://api.example.com/v1/").unwrap(),
            "https://api.example.com/v1"
        );
        assert!(base_url("not a url").is_err());
    }
}
