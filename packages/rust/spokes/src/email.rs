//! Email discovery: guess address patterns and check them with a bulk verifier.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use leadgarage_shared::{
    Capability, FailureType, HubSignal, Record, Result, SpokeResult, ValidationResult, fields,
    normalize_domain,
};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::{Spoke, base_url, classify_transport};

const COVERS: &[&str] = &[fields::EMAIL];

/// Verifier verdict on one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deliverability {
    Deliverable,
    Undeliverable,
}

impl Deliverability {
    /// Map a verifier result code through the closed table.
    /// Unrecognized codes are `None`: the response cannot be trusted either way.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "valid" | "ok" | "role" | "role_based" | "catch_all" | "risky" => {
                Some(Self::Deliverable)
            }
            "invalid" | "disposable" | "unknown" => Some(Self::Undeliverable),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    result: String,
}

/// Bay A spoke that fills `email` for person records.
pub struct EmailDiscoverySpoke {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl EmailDiscoverySpoke {
    pub fn new(client: Client, verifier_url: &str, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            client,
            base_url: base_url(verifier_url)?,
            api_key,
        })
    }

    /// Ask the verifier about one address.
    async fn verify(
        &self,
        api_key: &str,
        email: &str,
    ) -> std::result::Result<Deliverability, FailureType> {
        let response = self
            .client
            .get(format!("{}/", self.base_url))
            .query(&[("api", api_key), ("email", email)])
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "verifier request failed");
                classify_transport(&e)
            })?;

        // Any non-success from the verifier itself is a service problem, never "no such email"
        if !response.status().is_success() {
            warn!(status = %response.status(), "verifier returned error status");
            return Err(FailureType::ApiError);
        }

        let body: VerifyResponse = response.json().await.map_err(|e| {
            warn!(error = %e, "verifier response undecodable");
            FailureType::ApiError
        })?;

        Deliverability::from_code(&body.result).ok_or_else(|| {
            warn!(code = %body.result, "unrecognized verifier result code");
            FailureType::ApiError
        })
    }
}

#[async_trait]
impl Spoke for EmailDiscoverySpoke {
    fn capability(&self) -> Capability {
        Capability::EmailDiscovery
    }

    fn covers(&self) -> &'static [&'static str] {
        COVERS
    }

    #[instrument(skip_all, fields(record_id = %record.record_id))]
    async fn repair(&self, record: &Record, _validation: &ValidationResult) -> SpokeResult {
        let Some((first, last)) = person_name(record) else {
            return SpokeResult::failed(FailureType::ValidationError);
        };
        let Some(domain) = record
            .field(fields::COMPANY_DOMAIN)
            .or_else(|| record.field(fields::DOMAIN))
            .and_then(normalize_domain)
        else {
            return SpokeResult::failed(FailureType::ValidationError);
        };
        let Some(api_key) = self.api_key.as_deref() else {
            warn!("no verifier API key configured");
            return SpokeResult::failed(FailureType::ApiError);
        };

        let started = Instant::now();
        let candidates = candidate_addresses(&first, &last, &domain);
        let mut checked = 0usize;

        for candidate in &candidates {
            checked += 1;
            match self.verify(api_key, candidate).await {
                Ok(Deliverability::Deliverable) => {
                    debug!(email = %candidate, checked, "deliverable candidate found");
                    return SpokeResult::success(BTreeMap::from([(
                        fields::EMAIL.to_string(),
                        candidate.clone(),
                    )]))
                    .with_signal(HubSignal::EmailVerified)
                    .with_metrics(serde_json::json!({
                        "candidates_checked": checked,
                        "latency_ms": started.elapsed().as_millis() as u64,
                    }));
                }
                Ok(Deliverability::Undeliverable) => continue,
                Err(failure) => {
                    return SpokeResult::failed(failure).with_metrics(serde_json::json!({
                        "candidates_checked": checked,
                        "latency_ms": started.elapsed().as_millis() as u64,
                    }));
                }
            }
        }

        SpokeResult::failed(FailureType::NotFound).with_metrics(serde_json::json!({
            "candidates_checked": checked,
            "latency_ms": started.elapsed().as_millis() as u64,
        }))
    }
}

/// Lowercased ASCII-alphanumeric first/last name, from the split fields or `full_name`.
fn person_name(record: &Record) -> Option<(String, String)> {
    let (first, last) = match (
        record.field(fields::FIRST_NAME),
        record.field(fields::LAST_NAME),
    ) {
        (Some(f), Some(l)) => (f.to_string(), l.to_string()),
        _ => {
            let full = record.field(fields::FULL_NAME)?;
            let mut parts = full.split_whitespace();
            let first = parts.next()?.to_string();
            let last = parts.last()?.to_string();
            (first, last)
        }
    };
    let clean = |s: &str| -> String {
        s.chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase()
    };
    let (first, last) = (clean(&first), clean(&last));
    if first.is_empty() || last.is_empty() {
        None
    } else {
        Some((first, last))
    }
}

/// Address patterns in the order they are tried.
fn candidate_addresses(first: &str, last: &str, domain: &str) -> Vec<String> {
    let initial = &first[..1];
    let locals = [
        format!("{first}.{last}"),
        format!("{initial}.{last}"),
        format!("{initial}{last}"),
        first.to_string(),
        format!("{first}{last}"),
    ];
    let mut out: Vec<String> = Vec::with_capacity(locals.len());
    for local in locals {
        let address = format!("{local}@{domain}");
        if !out.contains(&address) {
            out.push(address);
        }
    }
    out
}
