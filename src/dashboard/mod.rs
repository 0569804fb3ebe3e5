use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::UrsaError;
use crate::region::{MultiRegionCoordinator, Region};
use crate::scheduler::Scheduler;
use crate::store::{Priority, StateStore, WorksetState};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

#[derive(Clone)]
pub struct DashboardState {
    pub store: Arc<dyn StateStore>,
    pub scheduler: Arc<Scheduler>,
    pub coordinator: Option<Arc<MultiRegionCoordinator>>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

struct ApiError(StatusCode, String);

impl From<UrsaError> for ApiError {
    fn from(e: UrsaError) -> Self {
        let status = match &e {
            UrsaError::WorksetNotFound(_) => StatusCode::NOT_FOUND,
            UrsaError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            UrsaError::Conflict { .. }
            | UrsaError::NotOwner { .. }
            | UrsaError::AlreadyExists(_) => StatusCode::CONFLICT,
            UrsaError::RegionUnavailable(_) | UrsaError::NoHealthyRegion => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    state: Option<String>,
    priority: Option<String>,
    limit: Option<usize>,
    cursor: Option<String>,
}

#[derive(Serialize)]
struct QueueStatsResponse {
    total: usize,
    by_state: std::collections::BTreeMap<WorksetState, usize>,
    in_queue: usize,
}

#[derive(Serialize)]
struct QueuedWorkset {
    position: usize,
    workset_id: String,
    priority: Priority,
    customer_id: Option<String>,
    cluster_affinity: Option<String>,
}

#[derive(Serialize)]
struct RegionsResponse {
    enabled: bool,
    primary: Option<String>,
    read_region: Option<String>,
    regions: Vec<Region>,
}

/// Read-only monitoring API.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/stats/queue", get(queue_stats_handler))
        .route("/api/stats/clusters", get(cluster_stats_handler))
        .route("/api/queue", get(ready_queue_handler))
        .route("/api/worksets", get(list_worksets_handler))
        .route("/api/worksets/:id", get(get_workset_handler))
        .route("/api/regions", get(regions_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn queue_stats_handler(
    State(state): State<DashboardState>,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    let stats = state.scheduler.queue_stats().await?;
    Ok(Json(QueueStatsResponse {
        total: stats.total,
        in_queue: stats.count(WorksetState::Ready),
        by_state: stats.by_state,
    }))
}

async fn cluster_stats_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.scheduler.scheduler_stats())
}

/// Head of the READY queue in dispatch order.
async fn ready_queue_handler(
    State(state): State<DashboardState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<QueuedWorkset>>, ApiError> {
    let limit = page_size(query.limit);
    let worksets = state.scheduler.queue().peek(limit).await?;
    Ok(Json(
        worksets
            .into_iter()
            .enumerate()
            .map(|(position, ws)| QueuedWorkset {
                position,
                workset_id: ws.workset_id,
                priority: ws.priority,
                customer_id: ws.customer_id,
                cluster_affinity: ws.cluster_affinity,
            })
            .collect(),
    ))
}

async fn list_worksets_handler(
    State(state): State<DashboardState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ws_state: WorksetState = query
        .state
        .as_deref()
        .unwrap_or("READY")
        .parse()
        .map_err(bad_request)?;
    let priority = query
        .priority
        .as_deref()
        .map(str::parse::<Priority>)
        .transpose()
        .map_err(bad_request)?;

    let page = state
        .store
        .list_by_state(ws_state, priority, page_size(query.limit), query.cursor.as_deref())
        .await?;
    Ok(Json(page))
}

async fn get_workset_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.get(&id).await?))
}

async fn regions_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let Some(coordinator) = state.coordinator.as_ref() else {
        return Json(RegionsResponse {
            enabled: false,
            primary: None,
            read_region: None,
            regions: Vec::new(),
        });
    };
    Json(RegionsResponse {
        enabled: true,
        primary: coordinator.primary_region().await,
        read_region: coordinator.read_region().await,
        regions: coordinator.regions().await,
    })
}

fn bad_request(message: String) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, message)
}

fn page_size(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}
