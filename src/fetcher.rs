//! Upstream fetcher (component C): given `(token, search_term, year)`,
//! returns all result records for that term from the upstream, or a
//! classified error. The hardest subsystem in the core - see spec §4.C
//! for the algorithm this module implements verbatim.

use chrono::Utc;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::sleep;
use crate::error::FetchError;
use crate::models::PropertyRecord;

/// Candidate page sizes, tried largest first. The upstream sometimes
/// truncates large responses; on truncation the fetcher downsizes and
/// restarts the whole term from page 1.
const PAGE_SIZES: [u32; 4] = [1000, 500, 100, 50];

const MAX_PAGES: u32 = 100;
const INTER_PAGE_DELAY: Duration = Duration::from_secs(1);
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(2);
const GATEWAY_TIMEOUT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct SearchFilter<'a> {
    #[serde(rename = "pYear")]
    p_year: Operand<'a>,
    #[serde(rename = "fullTextSearch")]
    full_text_search: Operand<'a>,
}

#[derive(Debug, Serialize)]
struct Operand<'a> {
    operator: &'a str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
struct UpstreamResponse {
    #[serde(rename = "totalProperty")]
    total_property: TotalProperty,
    results: Vec<UpstreamResult>,
}

#[derive(Debug, Deserialize)]
struct TotalProperty {
    #[serde(rename = "propertyCount")]
    property_count: u64,
}

#[derive(Debug, Deserialize)]
struct UpstreamResult {
    pid: Value,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    #[serde(rename = "propType")]
    prop_type: Option<String>,
    city: Option<String>,
    #[serde(rename = "streetPrimary")]
    street_primary: Option<String>,
    #[serde(rename = "assessedValue")]
    assessed_value: Option<Value>,
    #[serde(rename = "appraisedValue")]
    appraised_value: Option<Value>,
    #[serde(rename = "geoID")]
    geo_id: Option<String>,
    #[serde(rename = "legalDescription")]
    legal_description: Option<String>,
}

/// Parses a field that may arrive as a number or a numeric string.
/// Empty/null yields `None`; garbage is a `ParseError`.
fn parse_numeric(value: &Option<Value>) -> Result<Option<Decimal>, FetchError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(Some(
            Decimal::try_from(n.as_f64().unwrap_or(0.0))
                .map_err(|e| FetchError::ParseError(e.to_string()))?,
        )),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<Decimal>()
            .map(Some)
            .map_err(|e| FetchError::ParseError(format!("invalid numeric value {s:?}: {e}"))),
        Some(other) => Err(FetchError::ParseError(format!(
            "expected number or string, got {other}"
        ))),
    }
}

fn try_into_record(result: UpstreamResult, search_term: &str) -> Result<Option<PropertyRecord>, FetchError> {
    let property_id = match &result.pid {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(FetchError::ParseError(format!("invalid pid: {other}"))),
    };

    if property_id.is_empty() {
        return Ok(None);
    }

    let assessed_value = parse_numeric(&result.assessed_value)?;
    let appraised_value = parse_numeric(&result.appraised_value)?.unwrap_or(Decimal::ZERO);

    Ok(Some(
        PropertyRecord::builder()
            .property_id(property_id)
            .maybe_owner_name(result.display_name)
            .maybe_property_type(result.prop_type)
            .maybe_city(result.city)
            .maybe_address(result.street_primary)
            .maybe_assessed_value(assessed_value)
            .appraised_value(appraised_value)
            .maybe_geo_id(result.geo_id)
            .maybe_legal_description(result.legal_description)
            .search_term(search_term.to_string())
            .scraped_at(Utc::now())
            .build(),
    ))
}

/// Outcome of a successful fetch of one search term.
#[derive(Debug)]
pub struct FetchOutcome {
    pub records: Vec<PropertyRecord>,
    pub total: u64,
    pub page_size: u32,
}

pub struct UpstreamFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build upstream fetcher HTTP client"),
            base_url: base_url.into(),
        }
    }

    /// Fetches all result records for `search_term`, adapting page size
    /// downward on truncation (spec §4.C algorithm).
    pub async fn fetch(
        &self,
        token: &str,
        search_term: &str,
        year: &str,
    ) -> Result<FetchOutcome, FetchError> {
        let mut last_error: Option<FetchError> = None;

        for &page_size in PAGE_SIZES.iter() {
            match self.fetch_at_page_size(token, search_term, year, page_size).await {
                Ok(outcome) => return Ok(outcome),
                Err(FetchError::Truncated { .. }) | Err(FetchError::ParseError(_)) => {
                    warn!(search_term, page_size, "truncated response, downsizing page size");
                    last_error = Some(FetchError::Truncated { page_size });
                    continue;
                }
                Err(other) => return Err(other),
            }
        }

        Err(FetchError::Unrecoverable(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "all page sizes truncated".to_string()),
        ))
    }

    /// Paginates through every page at a fixed page size, handling the
    /// per-page error classification in spec §4.C step 5.
    async fn fetch_at_page_size(
        &self,
        token: &str,
        search_term: &str,
        year: &str,
        page_size: u32,
    ) -> Result<FetchOutcome, FetchError> {
        let mut accumulated: Vec<PropertyRecord> = Vec::new();
        #[allow(unused_assignments)]
        let mut total: u64 = 0;
        let mut page: u32 = 1;

        loop {
            let (body, last_page_len) = loop {
                match self
                    .fetch_page_raw(token, search_term, year, page, page_size)
                    .await?
                {
                    PageOutcome::Ready(resp, len) => break (resp, len),
                    PageOutcome::RateLimited => {
                        debug!(search_term, page, "rate-limited, retrying same page");
                        sleep(RATE_LIMIT_DELAY).await;
                    }
                    PageOutcome::GatewayTimeout => {
                        debug!(search_term, page, "gateway timeout, retrying same page");
                        sleep(GATEWAY_TIMEOUT_DELAY).await;
                    }
                }
            };

            total = body.total_property.property_count;
            let page_record_count = body.results.len();

            for result in body.results {
                if let Some(record) = try_into_record(result, search_term)? {
                    accumulated.push(record);
                }
            }

            if accumulated.len() as u64 >= total || last_page_len < page_size as usize || page >= MAX_PAGES {
                return Ok(FetchOutcome {
                    records: accumulated,
                    total,
                    page_size,
                });
            }

            let _ = page_record_count;
            page += 1;
            sleep(INTER_PAGE_DELAY).await;
        }
    }

    async fn fetch_page_raw(
        &self,
        token: &str,
        search_term: &str,
        year: &str,
        page: u32,
        page_size: u32,
    ) -> Result<PageOutcome, FetchError> {
        let filter = SearchFilter {
            p_year: Operand {
                operator: "=",
                value: year,
            },
            full_text_search: Operand {
                operator: "match",
                value: search_term,
            },
        };

        let response = self
            .client
            .post(&self.base_url)
            .query(&[("page", page.to_string()), ("pageSize", page_size.to_string())])
            .header("Authorization", token)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(&filter)
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED => return Err(FetchError::TokenExpired),
            StatusCode::CONFLICT => return Ok(PageOutcome::RateLimited),
            StatusCode::GATEWAY_TIMEOUT => return Ok(PageOutcome::GatewayTimeout),
            s if !s.is_success() => return Err(FetchError::UpstreamError(s.as_u16())),
            _ => {}
        }

        let raw = response.text().await?;

        if !ends_cleanly(&raw) {
            return Err(FetchError::Truncated { page_size });
        }

        let parsed: UpstreamResponse =
            serde_json::from_str(&raw).map_err(|e| FetchError::ParseError(e.to_string()))?;
        let len = parsed.results.len();

        info!(search_term, page, page_size, len, total = parsed.total_property.property_count, "fetched page");
        Ok(PageOutcome::Ready(parsed, len))
    }
}

enum PageOutcome {
    Ready(UpstreamResponse, usize),
    RateLimited,
    GatewayTimeout,
}

/// Truncation detection: the raw response body does not end in `}` or
/// `]`, indicating the upstream cut the payload mid-stream.
fn ends_cleanly(body: &str) -> bool {
    matches!(body.trim_end().chars().last(), Some('}') | Some(']'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn ends_cleanly_detects_truncation() {
        assert!(ends_cleanly(r#"{"a": 1}"#));
        assert!(ends_cleanly(r#"[1, 2, 3]"#));
        assert!(!ends_cleanly(r#"{"a": "unterminated"#));
    }

    #[test]
    fn parse_numeric_handles_numbers_and_strings() {
        assert_eq!(
            parse_numeric(&Some(Value::String("123.45".into()))).unwrap(),
            Some(Decimal::new(12345, 2))
        );
        assert_eq!(parse_numeric(&Some(Value::Null)).unwrap(), None);
        assert_eq!(parse_numeric(&None).unwrap(), None);
        assert_eq!(
            parse_numeric(&Some(Value::String("".into()))).unwrap(),
            None
        );
        assert!(parse_numeric(&Some(Value::String("garbage".into()))).is_err());
    }

    #[test]
    fn records_with_empty_property_id_are_dropped() {
        let result = UpstreamResult {
            pid: Value::String("".into()),
            display_name: None,
            prop_type: None,
            city: None,
            street_primary: None,
            assessed_value: None,
            appraised_value: None,
            geo_id: None,
            legal_description: None,
        };
        assert!(try_into_record(result, "Trust").unwrap().is_none());
    }

    #[tokio::test]
    async fn happy_small_fetch_returns_all_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("page", "1"))
            .and(query_param("pageSize", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalProperty": {"propertyCount": 3},
                "results": [
                    {"pid": 101, "displayName": "A", "propType": "res", "city": null,
                     "streetPrimary": "1 Main St", "assessedValue": 100, "appraisedValue": 200,
                     "geoID": null, "legalDescription": null},
                    {"pid": 102, "displayName": "B", "propType": "res", "city": null,
                     "streetPrimary": "2 Main St", "assessedValue": null, "appraisedValue": 300,
                     "geoID": null, "legalDescription": null},
                    {"pid": 103, "displayName": "C", "propType": "res", "city": null,
                     "streetPrimary": "3 Main St", "assessedValue": 400, "appraisedValue": 500,
                     "geoID": null, "legalDescription": null},
                ]
            })))
            .mount(&server)
            .await;

        let fetcher = UpstreamFetcher::new(server.uri());
        let outcome = fetcher.fetch("token", "Trust", "2026").await.unwrap();

        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.page_size, 1000);
        assert_eq!(outcome.records.len(), 3);
        let ids: std::collections::HashSet<_> =
            outcome.records.iter().map(|r| r.property_id.clone()).collect();
        assert_eq!(
            ids,
            ["101", "102", "103"].into_iter().map(String::from).collect()
        );
    }

    #[tokio::test]
    async fn empty_result_set_returns_no_records_and_no_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalProperty": {"propertyCount": 0},
                "results": []
            })))
            .mount(&server)
            .await;

        let fetcher = UpstreamFetcher::new(server.uri());
        let outcome = fetcher.fetch("token", "Nonexistent", "2026").await.unwrap();
        assert_eq!(outcome.total, 0);
        assert!(outcome.records.is_empty());
    }

    #[tokio::test]
    async fn token_expiry_surfaces_immediately_without_downsizing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let fetcher = UpstreamFetcher::new(server.uri());
        let err = fetcher.fetch("token", "Smith", "2026").await.unwrap_err();
        assert!(matches!(err, FetchError::TokenExpired));
    }

    #[tokio::test]
    async fn truncated_at_every_page_size_is_unrecoverable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"totalProperty": {"propertyCount"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let fetcher = UpstreamFetcher::new(server.uri());
        let err = fetcher.fetch("token", "LLC", "2026").await.unwrap_err();
        assert!(matches!(err, FetchError::Unrecoverable(_)));
    }
}
