use crate::error::{Result, StatsError};
use crate::model::{NetworkQuery, NetworkSelector, PushStatsInfo, SharedTrafficInfo};
use crate::quota::{Availability, BillingCycle, QuotaSettings, SettingChange};
use crate::service::{Caller, NetStatsService};
use crate::telemetry;
use axum::{
    Router,
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// Admin HTTP surface over [`NetStatsService`].
pub struct ApiServer {
    addr: String,
    state: AppState,
}

#[derive(Clone)]
struct AppState {
    service: Arc<NetStatsService>,
    token: Option<Arc<str>>,
}

impl AppState {
    /// Without a configured token every caller holds the stats capability.
    fn caller(&self, headers: &HeaderMap) -> Caller {
        let Some(token) = &self.token else {
            return Caller::trusted();
        };
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented == Some(token.as_ref()) {
            Caller::trusted()
        } else {
            Caller::anonymous()
        }
    }

    /// Gate for the mutating endpoints that do not go through a caller-checked query.
    fn authorize(&self, headers: &HeaderMap) -> std::result::Result<(), ApiError> {
        if self.caller(headers).can_read_stats() {
            Ok(())
        } else {
            Err(StatsError::Permission("caller lacks the stats capability".into()).into())
        }
    }
}

struct ApiError(StatsError);

impl From<StatsError> for ApiError {
    fn from(err: StatsError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    code: u32,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StatsError::Validation(_) => StatusCode::BAD_REQUEST,
            StatsError::Permission(_) => StatusCode::FORBIDDEN,
            StatsError::State(_) => StatusCode::CONFLICT,
            StatsError::NotFound(_) => StatusCode::NOT_FOUND,
            StatsError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("API request failed: {}", self.0);
        }
        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
    started: bool,
}

#[derive(Debug, Deserialize)]
struct IfaceParams {
    iface: String,
    #[serde(default)]
    start: u64,
    #[serde(default = "default_end")]
    end: u64,
}

#[derive(Debug, Deserialize)]
struct UidParams {
    iface: String,
    uid: u32,
    #[serde(default)]
    start: u64,
    #[serde(default = "default_end")]
    end: u64,
}

#[derive(Debug, Deserialize)]
struct ArchivedParams {
    uid: u32,
    #[serde(default)]
    start: u64,
    #[serde(default = "default_end")]
    end: u64,
}

#[derive(Debug, Deserialize)]
struct NetworkParams {
    sim_id: Option<u32>,
    ident: Option<String>,
    uid: Option<u32>,
    #[serde(default)]
    start: u64,
    #[serde(default = "default_end")]
    end: u64,
}

impl NetworkParams {
    fn query(&self) -> NetworkQuery {
        let network = match (self.sim_id, &self.ident) {
            (Some(sim_id), _) => NetworkSelector::Sim { sim_id },
            (None, ident) => NetworkSelector::Ident {
                ident: ident.clone().unwrap_or_default(),
            },
        };
        NetworkQuery {
            network,
            start: self.start,
            end: self.end,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpdateParams {
    #[serde(default)]
    wait: bool,
    #[serde(default)]
    backup: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct UpdateResponse {
    started: bool,
    written: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GenericResponse {
    success: bool,
    message: String,
}

impl GenericResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SharedResponse {
    accounted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct QuotaResponse {
    settings: Option<QuotaSettings>,
    cycle: Option<BillingCycle>,
    month_usage: u64,
    availability: Availability,
}

#[derive(Debug, Deserialize)]
struct UsersRequest {
    foreground: Option<u32>,
    default: Option<u32>,
    /// `Some(None)` clears the private account.
    #[serde(default, with = "double_option")]
    private: Option<Option<u32>>,
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<u32>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u32>::deserialize(deserializer).map(Some)
    }
}

#[derive(Debug, Deserialize)]
struct IntervalRequest {
    secs: u64,
}

#[derive(Debug, Deserialize)]
struct LogLevelRequest {
    level: String,
}

fn default_end() -> u64 {
    u64::MAX
}

impl ApiServer {
    pub fn new(addr: impl Into<String>, token: Option<String>, service: Arc<NetStatsService>) -> Self {
        Self {
            addr: addr.into(),
            state: AppState {
                service,
                token: token.map(Arc::from),
            },
        }
    }

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/api/stats/iface", get(iface_stats))
            .route("/api/stats/uid", get(uid_stats))
            .route("/api/stats/archived", get(archived_stats))
            .route("/api/stats/all", get(all_stats))
            .route("/api/stats/app", get(reported_app_stats).post(report_app_stats))
            .route("/api/stats/shared", post(report_shared_traffic))
            .route("/api/stats/network", get(network_stats))
            .route("/api/stats/uid-network", get(uid_network_stats))
            .route("/api/update", post(force_update))
            .route("/api/reset", post(reset_all))
            .route("/api/quota/{sim}", get(quota).put(change_setting))
            .route("/api/sims/{sim}", post(activate_sim).delete(deactivate_sim))
            .route("/api/packages/{uid}", post(package_added).delete(package_removed))
            .route("/api/users", put(set_users))
            .route("/api/cache-interval", put(set_cache_interval))
            .route("/api/log-level", put(set_log_level))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let app = Self::router(self.state);

        info!("Starting API server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("API server stopped");
        Ok(())
    }
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        started: state.service.is_started(),
    })
}

async fn iface_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<IfaceParams>,
) -> ApiResult<crate::model::Totals> {
    let totals = state
        .service
        .get_iface_stats(state.caller(&headers), &params.iface, params.start, params.end)
        .await?;
    Ok(Json(totals))
}

async fn uid_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UidParams>,
) -> ApiResult<crate::model::Totals> {
    let totals = state
        .service
        .get_uid_stats(
            state.caller(&headers),
            &params.iface,
            params.uid,
            params.start,
            params.end,
        )
        .await?;
    Ok(Json(totals))
}

async fn archived_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ArchivedParams>,
) -> ApiResult<crate::model::Totals> {
    let totals = state
        .service
        .get_archived_uid_stats(state.caller(&headers), params.uid, params.start, params.end)
        .await?;
    Ok(Json(totals))
}

async fn all_stats(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Vec<crate::model::TrafficSample>> {
    Ok(Json(state.service.get_all_stats(state.caller(&headers)).await?))
}

async fn reported_app_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Vec<crate::model::TrafficSample>> {
    Ok(Json(state.service.get_reported_app_stats(state.caller(&headers)).await?))
}

#[instrument(skip(state, headers))]
async fn report_app_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(info): Json<PushStatsInfo>,
) -> ApiResult<GenericResponse> {
    state.service.report_app_stats(state.caller(&headers), &info).await?;
    Ok(GenericResponse::ok("app stats queued"))
}

async fn report_shared_traffic(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(info): Json<SharedTrafficInfo>,
) -> ApiResult<SharedResponse> {
    let accounted = state
        .service
        .report_shared_traffic(state.caller(&headers), &info)
        .await?;
    Ok(Json(SharedResponse { accounted }))
}

async fn network_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<NetworkParams>,
) -> ApiResult<std::collections::HashMap<u32, crate::model::Totals>> {
    let totals = state
        .service
        .get_traffic_by_network(state.caller(&headers), &params.query())
        .await?;
    Ok(Json(totals))
}

async fn uid_network_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<NetworkParams>,
) -> ApiResult<Vec<crate::model::TimeBucketedTotals>> {
    let uid = params
        .uid
        .ok_or_else(|| StatsError::validation("uid is required"))?;
    let buckets = state
        .service
        .get_traffic_by_uid_network(state.caller(&headers), uid, &params.query())
        .await?;
    Ok(Json(buckets))
}

#[instrument(skip(state, headers))]
async fn force_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UpdateParams>,
) -> ApiResult<UpdateResponse> {
    let caller = state.caller(&headers);
    if params.backup {
        state.service.force_update_and_backup(caller).await?;
        return Ok(Json(UpdateResponse {
            started: true,
            written: None,
        }));
    }
    if params.wait {
        let written = state.service.force_update_and_wait(caller).await?;
        return Ok(Json(UpdateResponse {
            started: true,
            written: Some(written),
        }));
    }
    let started = state.service.force_update(caller)?;
    Ok(Json(UpdateResponse {
        started,
        written: None,
    }))
}

#[instrument(skip(state, headers))]
async fn reset_all(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<GenericResponse> {
    state.service.reset_all(state.caller(&headers)).await?;
    Ok(GenericResponse::ok("all statistics reset"))
}

async fn quota(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(sim): Path<u32>,
) -> ApiResult<QuotaResponse> {
    let caller = state.caller(&headers);
    let month_usage = state.service.month_usage(caller, sim).await?;
    let availability = state.service.availability(caller, sim).await?;
    Ok(Json(QuotaResponse {
        settings: state.service.quota_settings(sim),
        cycle: state.service.billing_cycle(sim),
        month_usage,
        availability,
    }))
}

#[instrument(skip(state, headers))]
async fn change_setting(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(sim): Path<u32>,
    Json(change): Json<SettingChange>,
) -> ApiResult<QuotaSettings> {
    state.authorize(&headers)?;
    Ok(Json(state.service.on_settings_changed(sim, change).await?))
}

async fn activate_sim(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(sim): Path<u32>,
) -> ApiResult<BillingCycle> {
    state.authorize(&headers)?;
    Ok(Json(state.service.activate_sim(sim).await?))
}

async fn deactivate_sim(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(sim): Path<u32>,
) -> ApiResult<GenericResponse> {
    state.authorize(&headers)?;
    state.service.deactivate_sim(sim);
    Ok(GenericResponse::ok(format!("sim {sim} deactivated")))
}

async fn package_added(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uid): Path<u32>,
) -> ApiResult<GenericResponse> {
    state.authorize(&headers)?;
    state.service.on_package_added(uid).await;
    Ok(GenericResponse::ok(format!("uid {uid} classified")))
}

#[instrument(skip(state, headers))]
async fn package_removed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uid): Path<u32>,
) -> ApiResult<GenericResponse> {
    state.authorize(&headers)?;
    state.service.on_package_removed(uid).await?;
    Ok(GenericResponse::ok(format!("uid {uid} archived")))
}

async fn set_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<UsersRequest>,
) -> ApiResult<GenericResponse> {
    state.authorize(&headers)?;
    if let Some(foreground) = request.foreground {
        state.service.set_foreground_user(foreground);
    }
    if let Some(default) = request.default {
        state.service.set_default_user(default);
    }
    if let Some(private) = request.private {
        state.service.set_private_user(private);
    }
    Ok(GenericResponse::ok("accounts updated"))
}

async fn set_cache_interval(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IntervalRequest>,
) -> ApiResult<GenericResponse> {
    state.authorize(&headers)?;
    let secs = state.service.set_cache_interval(request.secs);
    Ok(GenericResponse::ok(format!("cache interval set to {}s", secs)))
}

async fn set_log_level(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LogLevelRequest>,
) -> ApiResult<GenericResponse> {
    state.authorize(&headers)?;
    telemetry::reload_log_level(&request.level).map_err(StatsError::validation)?;
    info!(level = %request.level, "log level changed");
    Ok(GenericResponse::ok(format!("log level set to {}", request.level)))
}
