//! Record validation: decide what a record is missing or contradicts.
//!
//! Pure and deterministic. The validator never looks at history or budget.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use leadgarage_shared::{
    Contradiction, Record, RecordType, ValidationResult, fields, normalize_domain,
};
use regex::Regex;

/// Validate a record against its type's required fields.
pub fn validate(record: &Record) -> ValidationResult {
    let mut missing = BTreeSet::new();
    let mut contradictions = BTreeSet::new();

    match record.record_type {
        RecordType::Company => {
            if record.field(fields::COMPANY_NAME).is_none() {
                missing.insert(fields::COMPANY_NAME.to_string());
            }
            let domain = record
                .field(fields::DOMAIN)
                .or_else(|| record.field(fields::WEBSITE));
            if !domain.is_some_and(is_domain) {
                missing.insert(fields::DOMAIN.to_string());
            }
        }
        RecordType::Person => {
            match record.field(fields::EMAIL).and_then(email_domain) {
                None => {
                    missing.insert(fields::EMAIL.to_string());
                }
                Some(email_domain) => {
                    let employer = record
                        .field(fields::COMPANY_DOMAIN)
                        .and_then(normalize_domain);
                    if employer.is_some_and(|d| d != email_domain) {
                        contradictions.insert(Contradiction::EmailDomainMismatch);
                    }
                }
            }
            if record.field(fields::TITLE).is_none() {
                missing.insert(fields::TITLE.to_string());
            }
        }
    }

    ValidationResult::new(missing, contradictions)
}

/// Validation for input whose record type could not be determined.
///
/// Always invalid: every required field of every type is reported missing
/// unless present, plus the `unclassifiable` contradiction.
pub fn validate_unclassified(input: &BTreeMap<String, String>) -> ValidationResult {
    let present = |name: &str| input.get(name).is_some_and(|v| !v.trim().is_empty());
    let missing = [
        fields::COMPANY_NAME,
        fields::DOMAIN,
        fields::EMAIL,
        fields::TITLE,
    ]
    .into_iter()
    .filter(|f| !present(f))
    .map(str::to_string)
    .collect();
    ValidationResult::new(missing, BTreeSet::from([Contradiction::Unclassifiable]))
}

/// Whether `value` (bare domain or URL) names a plausible public host.
pub fn is_domain(value: &str) -> bool {
    static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+[a-z0-9-]{2,}$").expect("valid regex")
    });
    normalize_domain(value).is_some_and(|d| DOMAIN_RE.is_match(&d))
}

/// Domain of a structurally valid email address, lowercased.
pub fn email_domain(value: &str) -> Option<String> {
    static LOCAL_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[^\s@]+$").expect("valid regex"));

    let (local, domain) = value.trim().split_once('@')?;
    if !LOCAL_RE.is_match(local) || domain.contains('@') || domain.contains('/') {
        return None;
    }
    if !is_domain(domain) {
        return None;
    }
    normalize_domain(domain)
}
