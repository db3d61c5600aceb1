//! Upstream COVID-19 data sources.
//!
//! `CoronaApiClient` implements `MetricsProvider` and `CountryReporter` on
//! top of three public APIs: case history per country, government response
//! stringency per country code, and a country name → ISO alpha-3 lookup used
//! to address the stringency API.

pub mod probe;

use crate::config::UpstreamConfig;
use crate::core::{CountryReport, CountryReporter, Metric, MetricsProvider, NotificationError, Scope};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, instrument, trace};

pub use probe::HttpProber;

/// Case history of one country (or region) as reported by the cases API.
#[derive(Debug, Deserialize)]
struct CaseHistory {
    #[serde(default)]
    country: String,
    #[serde(default)]
    continent: String,
    #[serde(default)]
    population: f64,
    /// Cumulative count keyed by `YYYY-MM-DD`.
    #[serde(default)]
    dates: BTreeMap<String, f64>,
}

impl CaseHistory {
    /// The whole recorded range, or `None` for an empty history.
    fn full_scope(&self) -> Option<Scope> {
        let first = self.dates.keys().next()?;
        let last = self.dates.keys().next_back()?;
        format!("{first}-{last}").parse().ok()
    }

    /// Cases added between the start and end of `scope`.
    fn count_in_scope(&self, scope: &Scope) -> Result<f64, NotificationError> {
        let at = |date: NaiveDate| {
            self.dates
                .get(&date.format("%Y-%m-%d").to_string())
                .copied()
                .ok_or_else(|| NotificationError::InvalidScope(scope.to_string()))
        };
        Ok(at(scope.end)? - at(scope.start)?)
    }
}

/// The case series the history endpoint can return.
#[derive(Debug, Clone, Copy)]
enum CaseStatus {
    Confirmed,
    Recovered,
}

impl CaseStatus {
    fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Confirmed => "Confirmed",
            CaseStatus::Recovered => "Recovered",
        }
    }
}

#[derive(Debug, Deserialize)]
struct PolicyActions {
    #[serde(rename = "stringencyData")]
    stringency_data: StringencyData,
}

#[derive(Debug, Deserialize)]
struct StringencyData {
    stringency: Option<f64>,
    stringency_actual: Option<f64>,
    /// Set instead of the values when no data exists for the date.
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountryCode {
    alpha3_code: String,
}

/// HTTP client for the upstream metric APIs.
pub struct CoronaApiClient {
    client: reqwest::Client,
    cases_api_url: String,
    stringency_api_url: String,
    countries_api_url: String,
}

impl CoronaApiClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            cases_api_url: config.cases_api_url.trim_end_matches('/').to_string(),
            stringency_api_url: config.stringency_api_url.trim_end_matches('/').to_string(),
            countries_api_url: config.countries_api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetches the `All` entry of the case history of `country`.
    async fn case_history(
        &self,
        country: &str,
        status: CaseStatus,
    ) -> Result<CaseHistory, NotificationError> {
        let request = self
            .client
            .get(format!("{}/history", self.cases_api_url))
            .query(&[("country", country), ("status", status.as_str())]);
        let mut history: HashMap<String, CaseHistory> = self.get_json(request).await?;
        history.remove("All").ok_or_else(|| {
            NotificationError::Upstream(format!("no case history for '{country}'"))
        })
    }

    /// Latest cumulative confirmed case count for `country`.
    #[instrument(skip(self))]
    pub async fn latest_confirmed(&self, country: &str) -> Result<f64, NotificationError> {
        let all = self.case_history(country, CaseStatus::Confirmed).await?;
        let (date, value) = all.dates.iter().next_back().ok_or_else(|| {
            NotificationError::Upstream(format!("empty case history for '{country}'"))
        })?;
        debug!(date = %date, value, "Latest confirmed cases");
        Ok(*value)
    }

    /// Stringency index for `country` on the most recent complete day.
    #[instrument(skip(self))]
    pub async fn latest_stringency(&self, country: &str) -> Result<f64, NotificationError> {
        let code = self.country_code(country).await?;
        let date = yesterday();
        let request = self.client.get(format!(
            "{}/stringency/actions/{}/{}",
            self.stringency_api_url,
            code,
            date.format("%Y-%m-%d")
        ));
        let actions: PolicyActions = self.get_json(request).await?;

        let data = actions.stringency_data;
        data.stringency.or(data.stringency_actual).ok_or_else(|| {
            NotificationError::Upstream(
                data.msg
                    .unwrap_or_else(|| format!("no stringency data for '{code}' on {date}")),
            )
        })
    }

    /// Resolves a country name to its ISO alpha-3 code. Inputs that already
    /// look like a code are passed through.
    pub async fn country_code(&self, country: &str) -> Result<String, NotificationError> {
        if country.len() == 3 && country.chars().all(|c| c.is_ascii_uppercase()) {
            return Ok(country.to_string());
        }
        let request = self
            .client
            .get(format!("{}/name/{}", self.countries_api_url, country))
            .query(&[("fullText", "true"), ("fields", "name,alpha3Code")]);
        let matches: Vec<CountryCode> = self.get_json(request).await?;
        let code = matches
            .into_iter()
            .next()
            .map(|c| c.alpha3_code)
            .ok_or_else(|| NotificationError::Upstream(format!("unknown country '{country}'")))?;
        trace!(country, code = %code, "Resolved country code");
        Ok(code)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, NotificationError> {
        let response = request
            .send()
            .await
            .map_err(|e| NotificationError::Upstream(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Upstream(format!(
                "{} responded with status {}",
                response.url(),
                status
            )));
        }
        response
            .json()
            .await
            .map_err(|e| NotificationError::Upstream(format!("failed to decode response: {e}")))
    }
}

#[async_trait]
impl MetricsProvider for CoronaApiClient {
    async fn latest_value(&self, metric: Metric, country: &str) -> Result<f64, NotificationError> {
        match metric {
            Metric::Confirmed => self.latest_confirmed(country).await,
            Metric::Stringency => self.latest_stringency(country).await,
        }
    }
}

#[async_trait]
impl CountryReporter for CoronaApiClient {
    #[instrument(skip(self))]
    async fn country_report(
        &self,
        country: &str,
        scope: Option<Scope>,
    ) -> Result<CountryReport, NotificationError> {
        let (confirmed, recovered) = tokio::try_join!(
            self.case_history(country, CaseStatus::Confirmed),
            self.case_history(country, CaseStatus::Recovered),
        )?;

        let scope = match scope {
            Some(scope) => scope,
            None => confirmed.full_scope().ok_or_else(|| {
                NotificationError::Upstream(format!("empty case history for '{country}'"))
            })?,
        };

        let confirmed_in_scope = confirmed.count_in_scope(&scope)?;
        let recovered_in_scope = recovered.count_in_scope(&scope)?;
        let population_percentage = if confirmed.population > 0.0 {
            (confirmed_in_scope / confirmed.population * 100.0).round() / 100.0
        } else {
            0.0
        };

        Ok(CountryReport {
            country: confirmed.country,
            continent: confirmed.continent,
            scope: scope.to_string(),
            confirmed: confirmed_in_scope,
            recovered: recovered_in_scope,
            population_percentage,
        })
    }
}

/// Stringency data is published with a delay, so today is usually empty.
fn yesterday() -> NaiveDate {
    let today = Utc::now().date_naive();
    today.checked_sub_days(Days::new(1)).unwrap_or(today)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> CoronaApiClient {
        let config = UpstreamConfig {
            cases_api_url: server.uri(),
            stringency_api_url: server.uri(),
            countries_api_url: server.uri(),
            request_timeout_ms: 1000,
        };
        CoronaApiClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_confirmed_uses_most_recent_date() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history"))
            .and(query_param("country", "Norway"))
            .and(query_param("status", "Confirmed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "All": {
                    "country": "Norway",
                    "population": 5009150,
                    "dates": {
                        "2021-03-01": 120.0,
                        "2021-03-03": 140.0,
                        "2021-03-02": 130.0
                    }
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let value = client.latest_value(Metric::Confirmed, "Norway").await.unwrap();
        assert_eq!(value, 140.0);
    }

    #[tokio::test]
    async fn test_confirmed_without_history_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client.latest_value(Metric::Confirmed, "Atlantis").await;
        assert!(matches!(result, Err(NotificationError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_stringency_resolves_country_code_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/name/Norway"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{ "name": "Norway", "alpha3Code": "NOR" }])),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/stringency/actions/NOR/\d{4}-\d{2}-\d{2}$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "policyActions": [],
                "stringencyData": {
                    "date_value": "2021-03-01",
                    "country_code": "NOR",
                    "stringency_actual": 44.0,
                    "stringency": 43.5
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let value = client.latest_value(Metric::Stringency, "Norway").await.unwrap();
        assert_eq!(value, 43.5);
    }

    #[tokio::test]
    async fn test_stringency_unavailable_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/stringency/actions/SWE/.*$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "policyActions": [],
                "stringencyData": { "msg": "Data unavailable" }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client.latest_value(Metric::Stringency, "SWE").await;
        assert_eq!(
            result,
            Err(NotificationError::Upstream("Data unavailable".to_string()))
        );
    }

    #[tokio::test]
    async fn test_non_success_status_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client.latest_value(Metric::Confirmed, "Norway").await;
        assert!(matches!(result, Err(NotificationError::Upstream(_))));
    }

    async fn mount_history(server: &MockServer, status: &str, dates: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/history"))
            .and(query_param("country", "Norway"))
            .and(query_param("status", status))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "All": {
                    "country": "Norway",
                    "continent": "Europe",
                    "population": 5000,
                    "dates": dates
                }
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_country_report_counts_cases_within_scope() {
        let server = MockServer::start().await;
        mount_history(
            &server,
            "Confirmed",
            json!({ "2021-03-01": 100.0, "2021-03-02": 400.0, "2021-03-03": 1100.0 }),
        )
        .await;
        mount_history(
            &server,
            "Recovered",
            json!({ "2021-03-01": 10.0, "2021-03-02": 20.0, "2021-03-03": 70.0 }),
        )
        .await;

        let client = client_for(&server);
        let scope: Scope = "2021-03-01-2021-03-03".parse().unwrap();
        let report = client.country_report("Norway", Some(scope)).await.unwrap();

        assert_eq!(
            report,
            CountryReport {
                country: "Norway".to_string(),
                continent: "Europe".to_string(),
                scope: "2021-03-01-2021-03-03".to_string(),
                confirmed: 1000.0,
                recovered: 60.0,
                population_percentage: 0.2,
            }
        );
    }

    #[tokio::test]
    async fn test_country_report_without_scope_spans_whole_history() {
        let server = MockServer::start().await;
        mount_history(
            &server,
            "Confirmed",
            json!({ "2021-03-02": 400.0, "2021-03-01": 100.0, "2021-03-03": 1100.0 }),
        )
        .await;
        mount_history(
            &server,
            "Recovered",
            json!({ "2021-03-01": 10.0, "2021-03-03": 70.0 }),
        )
        .await;

        let client = client_for(&server);
        let report = client.country_report("Norway", None).await.unwrap();

        assert_eq!(report.scope, "2021-03-01-2021-03-03");
        assert_eq!(report.confirmed, 1000.0);
        assert_eq!(report.recovered, 60.0);
    }

    #[tokio::test]
    async fn test_country_report_outside_history_is_invalid_scope() {
        let server = MockServer::start().await;
        mount_history(&server, "Confirmed", json!({ "2021-03-01": 100.0 })).await;
        mount_history(&server, "Recovered", json!({ "2021-03-01": 10.0 })).await;

        let client = client_for(&server);
        let scope: Scope = "2020-01-01-2021-03-01".parse().unwrap();
        let result = client.country_report("Norway", Some(scope)).await;

        assert_eq!(
            result,
            Err(NotificationError::InvalidScope("2020-01-01-2021-03-01".to_string()))
        );
    }

    #[test]
    fn test_yesterday_is_before_today() {
        assert!(yesterday() < Utc::now().date_naive());
    }
}
