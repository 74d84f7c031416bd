use crate::{
    app::{App, AppError, CaptureOutcome, CaptureRequest, Insights, PipelineStatus},
    config::Config,
    items::Item,
    search::{SearchRequest, SearchResponse},
};
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

// Captures carry page text and data-url thumbnails, nothing bigger.
const BODY_LIMIT: usize = 10 * 1024 * 1024;

#[derive(Clone)]
struct SharedState {
    app: Arc<App>,
}

async fn start_app(app: App, addr: String) {
    let app = Arc::new(app);

    let signal = shutdown_signal(app.clone());
    let shared_state = Arc::new(SharedState { app: app.clone() });

    async fn shutdown_signal(app: Arc<App>) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        log::warn!("waiting for the enrichment queue to stop");
        app.shutdown();
    }

    let router = build_router(shared_state);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    log::info!("listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(signal)
        .await
        .unwrap();
}

fn build_router(shared_state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/capture", post(capture))
        .route("/api/search", post(search))
        .route("/api/timeline", get(timeline))
        .route("/api/items/:id", get(get_item).delete(delete_item))
        .route("/api/insights", get(insights))
        .route("/api/status", get(status))
        .route("/api/health", get(health))
        .route("/api/config", get(get_config))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

pub fn start_daemon(app: App, addr: String) {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async { start_app(app, addr).await });
}

// Wrapper so handlers can use `?` on anything convertible to AppError.
#[derive(Debug)]
struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        match self.0 {
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                json!({"error": self.0.to_string()}).to_string(),
            ),
            AppError::Invalid(_) => (
                StatusCode::BAD_REQUEST,
                json!({"error": self.0.to_string()}).to_string(),
            ),
            AppError::IO(_) => {
                log::error!("{self:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": self.0.to_string()}).to_string(),
                )
            }
            AppError::Other(_) => {
                log::error!("{self:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": self.0.to_string()}).to_string(),
                )
            }
        }
        .into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn capture(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<CaptureRequest>,
) -> Result<(StatusCode, Json<CaptureOutcome>), HttpError> {
    log::debug!("payload: {payload:?}");

    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let outcome = app.capture(payload)?;
        Ok((StatusCode::CREATED, Json(outcome)))
    })
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    let app = state.app.clone();

    tokio::task::block_in_place(move || app.search(payload).map(Json).map_err(Into::into))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimelineParams {
    pub owner: Option<String>,
    pub limit: Option<usize>,
}

async fn timeline(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<TimelineParams>,
) -> Result<Json<Vec<Item>>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        app.timeline(params.owner, params.limit)
            .map(Json)
            .map_err(Into::into)
    })
}

async fn get_item(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<u64>,
) -> Result<Json<Item>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || app.get_item(id).map(Json).map_err(Into::into))
}

async fn delete_item(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<u64>,
) -> Result<StatusCode, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        app.delete_item(id)?;
        Ok(StatusCode::NO_CONTENT)
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OwnerParams {
    pub owner: Option<String>,
}

async fn insights(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<OwnerParams>,
) -> Result<Json<Insights>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || app.insights(params.owner).map(Json).map_err(Into::into))
}

async fn status(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<PipelineStatus>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || app.status().map(Json).map_err(Into::into))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn get_config(State(state): State<Arc<SharedState>>) -> Result<Json<Config>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || Ok(Json(app.config())))
}
