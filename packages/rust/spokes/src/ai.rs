//! AI-assisted extraction via an OpenAI-compatible chat completion API.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use async_trait::async_trait;
use leadgarage_shared::{
    Capability, FailureType, HubSignal, Record, Result, SpokeResult, ValidationResult, fields,
    normalize_domain,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::{Spoke, base_url, classify_transport};

const COVERS: &[&str] = &[
    fields::COMPANY_NAME,
    fields::DOMAIN,
    fields::EMAIL,
    fields::TITLE,
];

const SYSTEM_PROMPT: &str = "You repair B2B lead records. Reply with a single JSON object \
whose keys are the requested field names. Use a string when you are confident, an array of \
strings when several values are plausible, and null when you do not know. Never invent data.";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

// ---------------------------------------------------------------------------
// Spoke
// ---------------------------------------------------------------------------

/// Bay B spoke: expensive, reasoning-based, covers every repairable field.
pub struct AiExtractorSpoke {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl AiExtractorSpoke {
    pub fn new(
        client: Client,
        ai_base_url: &str,
        api_key: Option<String>,
        model: &str,
    ) -> Result<Self> {
        Ok(Self {
            client,
            base_url: base_url(ai_base_url)?,
            api_key,
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Spoke for AiExtractorSpoke {
    fn capability(&self) -> Capability {
        Capability::AiExtractor
    }

    fn covers(&self) -> &'static [&'static str] {
        COVERS
    }

    #[instrument(skip_all, fields(record_id = %record.record_id, model = %self.model))]
    async fn repair(&self, record: &Record, validation: &ValidationResult) -> SpokeResult {
        let wanted: Vec<String> = validation
            .needs()
            .into_iter()
            .filter(|f| COVERS.contains(&f.as_str()))
            .collect();
        if wanted.is_empty() {
            return SpokeResult::failed(FailureType::ValidationError);
        }
        let Some(api_key) = self.api_key.as_deref() else {
            warn!("no AI API key configured");
            return SpokeResult::failed(FailureType::ApiError);
        };

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt(record, &wanted),
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let started = Instant::now();
        let response = match self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "chat completion request failed");
                return SpokeResult::failed(classify_transport(&e));
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), "chat completion returned error status");
            return SpokeResult::failed(FailureType::ApiError);
        }

        let body: ChatResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "chat completion response undecodable");
                return SpokeResult::failed(FailureType::ApiError);
            }
        };

        let usage = body.usage.unwrap_or_default();
        let metrics = serde_json::json!({
            "model": self.model,
            "tokens_in": usage.prompt_tokens,
            "tokens_out": usage.completion_tokens,
            "latency_ms": started.elapsed().as_millis() as u64,
        });

        let Some(content) = body.choices.into_iter().next().and_then(|c| c.message.content)
        else {
            return SpokeResult::failed(FailureType::ApiError).with_metrics(metrics);
        };

        match interpret_reply(&content, &wanted) {
            Ok(repaired) => {
                debug!(fields = repaired.len(), "extracted fields");
                let mut result = SpokeResult::success(repaired.clone()).with_metrics(metrics);
                if repaired.contains_key(fields::DOMAIN) {
                    result = result.with_signal(HubSignal::DomainResolved);
                } else if repaired.contains_key(fields::COMPANY_NAME) {
                    result = result.with_signal(HubSignal::CompanyProfiled);
                }
                result
            }
            Err(FailureType::Ambiguous) => SpokeResult::failed(FailureType::Ambiguous)
                .with_signal(HubSignal::AmbiguousCandidates)
                .with_metrics(metrics),
            Err(failure) => SpokeResult::failed(failure).with_metrics(metrics),
        }
    }
}

/// Record snapshot plus the list of fields to fill.
fn user_prompt(record: &Record, wanted: &[String]) -> String {
    let known: BTreeMap<&str, &str> = record
        .fields
        .iter()
        .filter_map(|(k, _)| record.field(k).map(|v| (k.as_str(), v)))
        .collect();
    let snapshot = serde_json::to_string(&known).unwrap_or_else(|_| "{}".into());
    format!(
        "Record type: {}\nKnown fields: {snapshot}\nFill these fields: {}",
        record.record_type,
        wanted.join(", ")
    )
}

/// Turn the model's reply into repaired fields.
///
/// Any requested field with more than one distinct candidate makes the whole
/// reply ambiguous. An unparseable reply is an `api_error`.
fn interpret_reply(
    content: &str,
    wanted: &[String],
) -> std::result::Result<BTreeMap<String, String>, FailureType> {
    let json = strip_code_fence(content);
    let object: serde_json::Map<String, Value> = serde_json::from_str(json).map_err(|e| {
        warn!(error = %e, "model reply is not a JSON object");
        FailureType::ApiError
    })?;

    let mut repaired = BTreeMap::new();
    for field in wanted {
        let candidates: BTreeSet<String> = match object.get(field) {
            Some(Value::String(s)) => normalize_value(field, s).into_iter().collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|s| normalize_value(field, s))
                .collect(),
            _ => BTreeSet::new(),
        };
        match candidates.len() {
            0 => {}
            1 => {
                if let Some(value) = candidates.into_iter().next() {
                    repaired.insert(field.clone(), value);
                }
            }
            _ => return Err(FailureType::Ambiguous),
        }
    }

    if repaired.is_empty() {
        Err(FailureType::NotFound)
    } else {
        Ok(repaired)
    }
}

fn normalize_value(field: &str, raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("null") || value.eq_ignore_ascii_case("unknown")
    {
        return None;
    }
    match field {
        fields::DOMAIN => normalize_domain(value),
        fields::EMAIL => {
            let lower = value.to_ascii_lowercase();
            lower.contains('@').then_some(lower)
        }
        _ => Some(value.to_string()),
    }
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{missing, record};
    use leadgarage_shared::RecordType;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spoke(server: &MockServer) -> AiExtractorSpoke {
        let client = crate::build_client(std::time::Duration::from_secs(5)).unwrap();
        AiExtractorSpoke::new(client, &server.uri(), Some("sk-test".into()), "test-model").unwrap()
    }

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 12}
        })
    }

    fn wanted(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| (*f).to_string()).collect()
    }

    #[test]
    fn reply_parsing() {
        let repaired =
            interpret_reply(r#"{"title": " CFO ", "email": null}"#, &wanted(&["title", "email"]))
                .unwrap();
        assert_eq!(repaired.len(), 1);
        assert_eq!(repaired.get("title").map(String::as_str), Some("CFO"));

        let fenced = "```json\n{\"domain\": \"https://acme.com/\"}\n```";
        let repaired = interpret_reply(fenced, &wanted(&["domain"])).unwrap();
        assert_eq!(repaired.get("domain").map(String::as_str), Some("acme.com"));
    }

    #[test]
    fn candidate_lists_are_ambiguous() {
        let reply = r#"{"domain": ["acme.com", "acme.io"]}"#;
        assert_eq!(
            interpret_reply(reply, &wanted(&["domain"])),
            Err(FailureType::Ambiguous)
        );
        // A list that collapses to one value is fine
        let reply = r#"{"domain": ["acme.com", "www.acme.com"]}"#;
        assert!(interpret_reply(reply, &wanted(&["domain"])).is_ok());
    }

    #[test]
    fn empty_or_garbage_replies() {
        assert_eq!(
            interpret_reply(r#"{"title": null}"#, &wanted(&["title"])),
            Err(FailureType::NotFound)
        );
        assert_eq!(
            interpret_reply("I don't know", &wanted(&["title"])),
            Err(FailureType::ApiError)
        );
    }

    #[tokio::test]
    async fn extracts_requested_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(bearer_token("sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                r#"{"company_name": "Acme Inc", "domain": "acme.com"}"#,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let r = record(RecordType::Company, &[("website", "")]);
        let result = spoke(&server)
            .repair(&r, &missing(&["company_name", "domain"]))
            .await;
        assert!(result.is_success());
        assert_eq!(result.repaired_fields().len(), 2);
        assert_eq!(result.hub_signal(), Some(HubSignal::DomainResolved));
        assert_eq!(result.metrics()["tokens_in"], serde_json::json!(120));
    }

    #[tokio::test]
    async fn ambiguous_reply_flags_candidates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion(r#"{"title": ["CFO", "VP Finance"]}"#)),
            )
            .mount(&server)
            .await;

        let r = record(RecordType::Person, &[("email", "a@acme.com")]);
        let result = spoke(&server).repair(&r, &missing(&["title"])).await;
        assert_eq!(result.failure_type(), Some(FailureType::Ambiguous));
        assert_eq!(result.hub_signal(), Some(HubSignal::AmbiguousCandidates));
    }

    #[tokio::test]
    async fn unauthorized_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let r = record(RecordType::Person, &[]);
        let result = spoke(&server).repair(&r, &missing(&["title"])).await;
        assert_eq!(result.failure_type(), Some(FailureType::ApiError));
    }

    #[tokio::test]
    async fn missing_key_skips_request() {
        let server = MockServer::start().await;
        let client = crate::build_client(std::time::Duration::from_secs(5)).unwrap();
        let keyless = AiExtractorSpoke::new(client, &server.uri(), None, "m").unwrap();

        let r = record(RecordType::Person, &[]);
        let result = keyless.repair(&r, &missing(&["title"])).await;
        assert_eq!(result.failure_type(), Some(FailureType::ApiError));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
