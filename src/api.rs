//! HTTP surface for managing webhooks, plus the country statistics and
//! diagnostics endpoints.
//!
//! Handlers are thin: they translate requests into calls on the store, the
//! registration routine and the country reporter, and map
//! `NotificationError` onto status codes. They never touch the scheduler or
//! its change cache.

use crate::config::UpstreamConfig;
use crate::core::{
    CountryReport, CountryReporter, NotificationError, ReachabilityProber, Scope, Webhook,
    WebhookId, WebhookStore,
};
use crate::notification::webhook::{register, WebhookRequest};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Version reported by the diagnostics endpoint.
pub const API_VERSION: &str = "v1";

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn WebhookStore>,
    pub prober: Arc<dyn ReachabilityProber>,
    pub reporter: Arc<dyn CountryReporter>,
    pub upstream: UpstreamConfig,
    pub started: Instant,
}

/// Body of a successful registration.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Created {
    pub id: WebhookId,
}

/// A stored webhook together with its id, as listed by `GET /notifications`.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct WebhookEntry {
    pub id: WebhookId,
    #[serde(flatten)]
    pub webhook: Webhook,
}

/// Query string of `GET /country/{country}`.
#[derive(Debug, Deserialize)]
pub struct CountryQuery {
    pub scope: Option<String>,
}

/// Response of the diagnostics endpoint.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Diag {
    pub mmediagroupapi: u16,
    pub covidtrackerapi: u16,
    pub restcountriesapi: u16,
    /// Number of stored webhooks, or `-1` if the store could not be read.
    pub registered: i64,
    pub version: String,
    /// Seconds since the server started.
    pub uptime: u64,
}

impl IntoResponse for NotificationError {
    fn into_response(self) -> Response {
        let status = match &self {
            NotificationError::InvalidField(_)
            | NotificationError::InvalidTrigger(_)
            | NotificationError::UnreachableTarget { .. }
            | NotificationError::InvalidBody(_)
            | NotificationError::InvalidScope(_)
            | NotificationError::NotFound(_) => StatusCode::BAD_REQUEST,
            NotificationError::StoreUnavailable(_)
            | NotificationError::DeliveryFailed(_)
            | NotificationError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Builds the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/notifications", get(list_webhooks).post(create_webhook))
        .route(
            "/notifications/{id}",
            get(get_webhook).delete(delete_webhook),
        )
        .route("/country/{country}", get(country_report))
        .route("/diag", get(diag))
        .with_state(state)
}

/// Serves `app` on `listener` until the shutdown signal fires.
pub async fn serve(listener: TcpListener, app: Router, mut shutdown_rx: watch::Receiver<bool>) {
    let addr = listener.local_addr().ok();
    info!(?addr, "HTTP API listening");
    let shutdown = async move {
        let _ = shutdown_rx.changed().await;
        info!("HTTP API received shutdown signal.");
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("HTTP API server error: {}", e);
    }
}

async fn create_webhook(
    State(state): State<ApiState>,
    body: Result<Json<WebhookRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Created>), NotificationError> {
    let Json(request) = body.map_err(|e| NotificationError::InvalidBody(e.body_text()))?;
    let id = register(&request, state.prober.as_ref(), state.store.as_ref())
        .await
        .inspect_err(|e| warn!(error = %e, "Rejected webhook registration"))?;
    Ok((StatusCode::CREATED, Json(Created { id })))
}

async fn list_webhooks(
    State(state): State<ApiState>,
) -> Result<Json<Vec<WebhookEntry>>, NotificationError> {
    let entries = state
        .store
        .list_all()
        .await?
        .into_iter()
        .map(|(id, webhook)| WebhookEntry { id, webhook })
        .collect();
    Ok(Json(entries))
}

async fn get_webhook(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Webhook>, NotificationError> {
    Ok(Json(state.store.get(&WebhookId::new(id)).await?))
}

async fn delete_webhook(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, NotificationError> {
    let id = WebhookId::new(id);
    state.store.delete(&id).await?;
    info!(id = %id, "Deleted webhook");
    Ok(StatusCode::NO_CONTENT)
}

async fn country_report(
    State(state): State<ApiState>,
    Path(country): Path<String>,
    Query(query): Query<CountryQuery>,
) -> Result<Json<CountryReport>, NotificationError> {
    let scope = query
        .scope
        .as_deref()
        .map(str::parse::<Scope>)
        .transpose()?;
    let report = state
        .reporter
        .country_report(&country, scope)
        .await
        .inspect_err(|e| warn!(country = %country, error = %e, "Country report failed"))?;
    Ok(Json(report))
}

/// The URLs `/diag` checks for each upstream.
///
/// The cases API has no resource at its versioned root, so its `/cases`
/// listing is checked instead. The stringency API is checked without its
/// version segment.
pub fn diag_targets(upstream: &UpstreamConfig) -> [String; 3] {
    [
        format!("{}/cases", upstream.cases_api_url.trim_end_matches('/')),
        strip_version_segment(&upstream.stringency_api_url).to_string(),
        upstream.countries_api_url.clone(),
    ]
}

/// Drops a trailing `/v<digits>` path segment, if present.
fn strip_version_segment(url: &str) -> &str {
    let trimmed = url.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((base, last))
            if last.len() > 1
                && last.starts_with('v')
                && last[1..].chars().all(|c| c.is_ascii_digit()) =>
        {
            base
        }
        _ => trimmed,
    }
}

async fn diag(State(state): State<ApiState>) -> Json<Diag> {
    let [cases, stringency, countries] = diag_targets(&state.upstream);
    let (cases, stringency, countries) = tokio::join!(
        state.prober.probe(&cases),
        state.prober.probe(&stringency),
        state.prober.probe(&countries),
    );
    let registered = match state.store.list_all().await {
        Ok(records) => records.len() as i64,
        Err(e) => {
            warn!(error = %e, "Failed to count webhooks for diagnostics");
            -1
        }
    };
    Json(Diag {
        mmediagroupapi: cases,
        covidtrackerapi: stringency,
        restcountriesapi: countries,
        registered,
        version: API_VERSION.to_string(),
        uptime: state.started.elapsed().as_secs(),
    })
}
