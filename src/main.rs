//! Reference Data Populator - builds a four-level geographic hierarchy with
//! localized names from an external language-model data source.

mod completeness;
mod config;
mod data_source;
mod jobs;
mod openrouter;
mod populator;
mod response_parser;
mod schema;
mod store;
mod supabase;
mod translator;

#[cfg(test)]
mod test_support;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use config::PopulationConfig;
use data_source::DataSourceClient;
use jobs::{JobError, JobManager, JobStore, MemoryJobStore};
use openrouter::OpenRouterClient;
use populator::HierarchyPopulator;
use schema::{Job, JobStatus};
use serde_json::{json, Value};
use std::sync::Arc;
use store::{MemoryReferenceStore, ReferenceStore};
use supabase::{SupabaseClient, SupabaseJobStore, SupabaseReferenceStore};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    manager: Arc<JobManager>,
    config: Arc<PopulationConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "refdata_populator=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PopulationConfig::from_env()?;
    info!(
        "Population config: default languages {:?}, {} items per call, {}ms between calls",
        config.default_languages, config.max_items_per_call, config.call_delay_ms
    );

    // Initialize OpenRouter client
    let openrouter = OpenRouterClient::from_env()?;
    info!("OpenRouter client initialized (model: {})", openrouter.model());

    let (reference_store, job_store): (Arc<dyn ReferenceStore>, Arc<dyn JobStore>) =
        match SupabaseClient::from_env() {
            Some(client) => (
                Arc::new(SupabaseReferenceStore::new(client.clone())),
                Arc::new(SupabaseJobStore::new(client)),
            ),
            None => {
                warn!("SUPABASE_URL not set, using in-memory stores");
                (
                    Arc::new(MemoryReferenceStore::new()),
                    Arc::new(MemoryJobStore::new()),
                )
            }
        };

    let data_source = DataSourceClient::new(Arc::new(openrouter), config.request_timeout());
    let populator = HierarchyPopulator::new(reference_store, data_source, config.clone());
    let manager = JobManager::new(job_store, Arc::new(populator), config.default_languages.clone());
    manager.recover_interrupted().await?;

    let state = AppState {
        manager: Arc::new(manager),
        config: Arc::new(config),
    };

    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Run server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config))
        .route("/jobs", get(list_jobs).post(start_job))
        .route("/jobs/:id", get(get_job))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

type ApiError = (StatusCode, Json<Value>);

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Effective population config.
async fn get_config(State(state): State<AppState>) -> Json<PopulationConfig> {
    Json((*state.config).clone())
}

#[derive(serde::Deserialize)]
struct StartJobRequest {
    root_name: String,
    #[serde(default)]
    languages: Vec<String>,
}

#[derive(serde::Serialize)]
struct StartJobResponse {
    job_id: String,
    status: JobStatus,
}

/// Start populating a root region. Runs in the background.
async fn start_job(
    State(state): State<AppState>,
    Json(request): Json<StartJobRequest>,
) -> Result<(StatusCode, Json<StartJobResponse>), ApiError> {
    let started = state
        .manager
        .start_job(&request.root_name, &request.languages)
        .await
        .map_err(job_error)?;

    info!("Started job {} for '{}'", started.job.id, started.job.root_name);
    Ok((
        StatusCode::ACCEPTED,
        Json(StartJobResponse {
            job_id: started.job.id,
            status: started.job.status,
        }),
    ))
}

/// Get a job by ID.
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state.manager.get_status(&id).await.map(Json).map_err(job_error)
}

/// List all known jobs, newest first.
async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<Job>>, ApiError> {
    let mut jobs = state.manager.list_jobs().await.map_err(job_error)?;
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(jobs))
}

fn job_error(err: JobError) -> ApiError {
    let message = err.to_string();
    match err {
        JobError::AlreadyActive { job_id, .. } => (
            StatusCode::CONFLICT,
            Json(json!({ "error": message, "code": "already_active", "job_id": job_id })),
        ),
        JobError::AlreadyCompleted {
            job_id,
            completed_at,
            ..
        } => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": message,
                "code": "already_completed",
                "job_id": job_id,
                "completed_at": completed_at,
            })),
        ),
        JobError::NotFound(_) => (StatusCode::NOT_FOUND, Json(json!({ "error": message }))),
        JobError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))),
        JobError::Store(e) => {
            error!("Job store error: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": message })),
            )
        }
    }
}
