//! Business directory lookup: resolve a company's domain and canonical name.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use async_trait::async_trait;
use leadgarage_shared::{
    Capability, FailureType, HubSignal, Record, Result, SpokeResult, ValidationResult, fields,
    normalize_domain,
};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::{Spoke, base_url, classify_status, classify_transport};

const COVERS: &[&str] = &[fields::DOMAIN, fields::COMPANY_NAME];

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    companies: Vec<DirectoryEntry>,
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    name: String,
    #[serde(default)]
    domain: Option<String>,
}

/// Bay A spoke backed by a JSON business-directory search API.
pub struct DirectoryLookupSpoke {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl DirectoryLookupSpoke {
    pub fn new(client: Client, directory_url: &str, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            client,
            base_url: base_url(directory_url)?,
            api_key,
        })
    }
}

#[async_trait]
impl Spoke for DirectoryLookupSpoke {
    fn capability(&self) -> Capability {
        Capability::DirectoryLookup
    }

    fn covers(&self) -> &'static [&'static str] {
        COVERS
    }

    #[instrument(skip_all, fields(record_id = %record.record_id))]
    async fn repair(&self, record: &Record, validation: &ValidationResult) -> SpokeResult {
        let mut query: Vec<(&str, String)> = match (
            record.field(fields::COMPANY_NAME),
            record.field(fields::DOMAIN).and_then(normalize_domain),
        ) {
            (Some(name), _) => vec![("q", name.to_string())],
            (None, Some(domain)) => vec![("domain", domain)],
            (None, None) => return SpokeResult::failed(FailureType::ValidationError),
        };
        if let Some(key) = &self.api_key {
            query.push(("api_token", key.clone()));
        }

        let started = Instant::now();
        let url = format!("{}/companies/search", self.base_url);
        let response = match self.client.get(&url).query(&query).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "directory request failed");
                return SpokeResult::failed(classify_transport(&e));
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), "directory returned error status");
            return SpokeResult::failed(classify_status(response.status()));
        }

        let body: SearchResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "directory response undecodable");
                return SpokeResult::failed(FailureType::ApiError);
            }
        };

        let metrics = serde_json::json!({
            "matches": body.companies.len(),
            "latency_ms": started.elapsed().as_millis() as u64,
        });

        let domains: BTreeSet<String> = body
            .companies
            .iter()
            .filter_map(|c| c.domain.as_deref().and_then(normalize_domain))
            .collect();
        if domains.len() > 1 {
            debug!(candidates = domains.len(), "directory returned conflicting domains");
            return SpokeResult::failed(FailureType::Ambiguous)
                .with_signal(HubSignal::AmbiguousCandidates)
                .with_metrics(metrics);
        }

        let Some(best) = body.companies.first() else {
            return SpokeResult::failed(FailureType::NotFound).with_metrics(metrics);
        };

        let needs = validation.needs();
        let mut repaired = BTreeMap::new();
        if let Some(domain) = domains.into_iter().next() {
            if needs.contains(fields::DOMAIN) {
                repaired.insert(fields::DOMAIN.to_string(), domain);
            }
        }
        let name = best.name.trim();
        if needs.contains(fields::COMPANY_NAME) && !name.is_empty() {
            repaired.insert(fields::COMPANY_NAME.to_string(), name.to_string());
        }

        if repaired.is_empty() {
            return SpokeResult::failed(FailureType::NotFound).with_metrics(metrics);
        }
        let signal = if repaired.contains_key(fields::DOMAIN) {
            HubSignal::DomainResolved
        } else {
            HubSignal::CompanyProfiled
        };
        SpokeResult::success(repaired)
            .with_signal(signal)
            .with_metrics(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{missing, record};
    use leadgarage_shared::RecordType;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spoke(server: &MockServer) -> DirectoryLookupSpoke {
        let client = crate::build_client(std::time::Duration::from_secs(5)).unwrap();
        DirectoryLookupSpoke::new(client, &server.uri(), Some("dir-key".into())).unwrap()
    }

    async fn respond(server: &MockServer, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/companies/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn single_match_resolves_domain() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/companies/search"))
            .and(query_param("q", "Acme"))
            .and(query_param("api_token", "dir-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "companies": [{"name": "Acme Inc", "domain": "https://www.acme.com"}]
            })))
            .mount(&server)
            .await;

        let acme = record(RecordType::Company, &[("company_name", "Acme")]);
        let result = spoke(&server).repair(&acme, &missing(&["domain"])).await;
        assert!(result.is_success());
        assert_eq!(
            result.repaired_fields(),
            &BTreeMap::from([("domain".to_string(), "acme.com".to_string())])
        );
        assert_eq!(result.hub_signal(), Some(HubSignal::DomainResolved));
    }

    #[tokio::test]
    async fn lookup_by_domain_fills_name() {
        let server = MockServer::start().await;
        respond(
            &server,
            serde_json::json!({"companies": [{"name": "Acme Inc", "domain": "acme.com"}]}),
        )
        .await;

        let r = record(RecordType::Company, &[("domain", "acme.com")]);
        let result = spoke(&server).repair(&r, &missing(&["company_name"])).await;
        assert_eq!(
            result.repaired_fields().get("company_name").map(String::as_str),
            Some("Acme Inc")
        );
        assert_eq!(result.hub_signal(), Some(HubSignal::CompanyProfiled));
    }

    #[tokio::test]
    async fn conflicting_domains_are_ambiguous() {
        let server = MockServer::start().await;
        respond(
            &server,
            serde_json::json!({"companies": [
                {"name": "Acme Inc", "domain": "acme.com"},
                {"name": "Acme Ltd", "domain": "acme.co.uk"}
            ]}),
        )
        .await;

        let r = record(RecordType::Company, &[("company_name", "Acme")]);
        let result = spoke(&server).repair(&r, &missing(&["domain"])).await;
        assert_eq!(result.failure_type(), Some(FailureType::Ambiguous));
        assert_eq!(result.hub_signal(), Some(HubSignal::AmbiguousCandidates));
        assert!(result.repaired_fields().is_empty());
    }

    #[tokio::test]
    async fn no_match_is_not_found() {
        let server = MockServer::start().await;
        respond(&server, serde_json::json!({"companies": []})).await;

        let r = record(RecordType::Company, &[("company_name", "Nobody")]);
        let result = spoke(&server).repair(&r, &missing(&["domain"])).await;
        assert_eq!(result.failure_type(), Some(FailureType::NotFound));
    }

    #[tokio::test]
    async fn error_status_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let r = record(RecordType::Company, &[("company_name", "Acme")]);
        let result = spoke(&server).repair(&r, &missing(&["domain"])).await;
        assert_eq!(result.failure_type(), Some(FailureType::ApiError));
    }

    #[tokio::test]
    async fn nothing_to_search_by() {
        let server = MockServer::start().await;
        let r = record(RecordType::Company, &[]);
        let result = spoke(&server)
            .repair(&r, &missing(&["domain", "company_name"]))
            .await;
        assert_eq!(result.failure_type(), Some(FailureType::ValidationError));
    }
}
