//! Web scraper: read a company's name off its homepage.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use leadgarage_shared::{
    Capability, FailureType, HubSignal, Record, SpokeResult, ValidationResult, fields,
    normalize_domain,
};
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use tracing::{debug, instrument, warn};

use crate::{Spoke, classify_transport};

const COVERS: &[&str] = &[fields::COMPANY_NAME];

/// Upper bound on a company name pulled from page chrome.
const MAX_NAME_LEN: usize = 120;

/// Bay A spoke that fills `company_name` from the homepage markup.
pub struct WebScraperSpoke {
    client: Client,
    /// Replaces `https://{domain}` (mock servers in tests).
    origin_override: Option<String>,
}

impl WebScraperSpoke {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            origin_override: None,
        }
    }

    /// Fetch every homepage from `origin` instead of the record's domain.
    #[cfg(test)]
    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin_override = Some(origin.trim_end_matches('/').to_string());
        self
    }

    fn homepage_url(&self, domain: &str) -> String {
        match &self.origin_override {
            Some(origin) => format!("{origin}/"),
            None => format!("https://{domain}/"),
        }
    }
}

#[async_trait]
impl Spoke for WebScraperSpoke {
    fn capability(&self) -> Capability {
        Capability::WebScraper
    }

    fn covers(&self) -> &'static [&'static str] {
        COVERS
    }

    #[instrument(skip_all, fields(record_id = %record.record_id))]
    async fn repair(&self, record: &Record, _validation: &ValidationResult) -> SpokeResult {
        let Some(domain) = [fields::DOMAIN, fields::WEBSITE, fields::COMPANY_DOMAIN]
            .into_iter()
            .find_map(|f| record.field(f))
            .and_then(normalize_domain)
        else {
            return SpokeResult::failed(FailureType::ValidationError);
        };

        let started = Instant::now();
        let url = self.homepage_url(&domain);
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(%url, error = %e, "homepage fetch failed");
                return SpokeResult::failed(classify_transport(&e));
            }
        };

        let status = response.status();
        if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
            return SpokeResult::failed(FailureType::NotFound);
        }
        if !status.is_success() {
            warn!(%url, %status, "homepage returned error status");
            return SpokeResult::failed(FailureType::ApiError);
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                warn!(%url, error = %e, "failed to read homepage body");
                return SpokeResult::failed(classify_transport(&e));
            }
        };

        let metrics = serde_json::json!({
            "bytes": body.len(),
            "latency_ms": started.elapsed().as_millis() as u64,
        });

        match extract_company_name(&body) {
            Some(name) => {
                debug!(%name, "company name extracted");
                SpokeResult::success(BTreeMap::from([(fields::COMPANY_NAME.to_string(), name)]))
                    .with_signal(HubSignal::CompanyProfiled)
                    .with_metrics(metrics)
            }
            None => SpokeResult::failed(FailureType::NotFound).with_metrics(metrics),
        }
    }
}

/// Company name from `og:site_name`, then `<title>` with any tagline suffix removed.
fn extract_company_name(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);

    let og_sel = Selector::parse(r#"meta[property="og:site_name"]"#).unwrap();
    let from_og = doc
        .select(&og_sel)
        .filter_map(|el| el.value().attr("content"))
        .map(clean_name)
        .find(|name| !name.is_empty());
    if from_og.is_some() {
        return from_og;
    }

    let title_sel = Selector::parse("title").unwrap();
    let title = doc.select(&title_sel).next()?.text().collect::<String>();
    let name = strip_tagline(&title);
    if name.is_empty() { None } else { Some(name) }
}

fn strip_tagline(title: &str) -> String {
    let head = title
        .split('|')
        .next()
        .unwrap_or_default()
        .split(" - ")
        .next()
        .unwrap_or_default();
    clean_name(head)
}

/// Collapse whitespace and cap the length.
fn clean_name(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > MAX_NAME_LEN {
        String::new()
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{missing, record};
    use leadgarage_shared::RecordType;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spoke(server: &MockServer) -> WebScraperSpoke {
        let client = crate::build_client(std::time::Duration::from_secs(5)).unwrap();
        WebScraperSpoke::new(client).with_origin(&server.uri())
    }

    fn acme() -> Record {
        record(RecordType::Company, &[("domain", "acme.com")])
    }

    #[test]
    fn og_site_name_preferred() {
        let html = r#"<html><head>
            <meta property="og:site_name" content="Acme  Corp">
            <title>Home | Acme Corporation</title>
        </head><body></body></html>"#;
        assert_eq!(extract_company_name(html).as_deref(), Some("Acme Corp"));
    }

    #[test]
    fn title_tagline_trimmed() {
        let html = "<html><head><title> Acme Corp | Widgets for everyone </title></head></html>";
        assert_eq!(extract_company_name(html).as_deref(), Some("Acme Corp"));
        assert_eq!(strip_tagline("Globex - Home"), "Globex");
    }

    #[test]
    fn no_name_in_page() {
        assert_eq!(extract_company_name("<html><body><p>hi</p></body></html>"), None);
        assert_eq!(
            extract_company_name("<html><head><title>   </title></head></html>"),
            None
        );
    }

    #[tokio::test]
    async fn scrapes_homepage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><head><title>Acme Corp | Widgets</title></head><body></body></html>",
            ))
            .mount(&server)
            .await;

        let result = spoke(&server)
            .repair(&acme(), &missing(&["company_name"]))
            .await;
        assert!(result.is_success());
        assert_eq!(
            result.repaired_fields().get("company_name").map(String::as_str),
            Some("Acme Corp")
        );
        assert_eq!(result.hub_signal(), Some(HubSignal::CompanyProfiled));
    }

    #[tokio::test]
    async fn missing_page_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = spoke(&server)
            .repair(&acme(), &missing(&["company_name"]))
            .await;
        assert_eq!(result.failure_type(), Some(FailureType::NotFound));
    }

    #[tokio::test]
    async fn server_error_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = spoke(&server)
            .repair(&acme(), &missing(&["company_name"]))
            .await;
        assert_eq!(result.failure_type(), Some(FailureType::ApiError));
    }

    #[tokio::test]
    async fn no_domain_is_validation_error() {
        let server = MockServer::start().await;
        let bare = record(RecordType::Company, &[("company_name", "")]);
        let result = spoke(&server).repair(&bare, &missing(&["company_name"])).await;
        assert_eq!(result.failure_type(), Some(FailureType::ValidationError));
    }
}
