//! HTTP surface: thin translation of requests into store operations.
//!
//! Routes mirror the store API one-to-one; the only logic living here is
//! status-code mapping, the run wait-group that lets shutdown drain
//! in-flight run calls, and the idempotence check on RunActions.

use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;

use crate::capacity::ExecutorResources;
use crate::container::{AllocationRequest, Container, ContainerState, RunRequest};
use crate::error::Error;
use crate::sandbox::SandboxProvider;
use crate::store::ContainerStore;

// =============================================================================
// Wait Group
// =============================================================================

/// Counts in-flight run calls so shutdown can drain them.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

#[derive(Default)]
struct WaitGroupInner {
    count: Mutex<usize>,
    notify: Notify,
}

/// Decrements the wait group when dropped.
pub struct WaitGroupGuard {
    inner: Arc<WaitGroupInner>,
}

impl WaitGroup {
    /// Registers one in-flight call.
    #[must_use]
    pub fn enter(&self) -> WaitGroupGuard {
        *self.inner.count.lock().unwrap() += 1;
        WaitGroupGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Resolves once every guard has been dropped.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if *self.inner.count.lock().unwrap() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        let mut count = self.inner.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.inner.notify.notify_waiters();
        }
    }
}

// =============================================================================
// State & Router
// =============================================================================

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    store: Arc<ContainerStore>,
    provider: Arc<dyn SandboxProvider>,
    run_group: WaitGroup,
}

impl AppState {
    /// Creates the state.
    #[must_use]
    pub fn new(store: Arc<ContainerStore>, provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            store,
            provider,
            run_group: WaitGroup::default(),
        }
    }

    /// The wait group drained during shutdown.
    #[must_use]
    pub fn run_group(&self) -> WaitGroup {
        self.run_group.clone()
    }
}

/// Builds the router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/containers", get(list_containers))
        .route(
            "/containers/:guid",
            post(allocate_container)
                .get(get_container)
                .delete(delete_container),
        )
        .route("/containers/:guid/initialize", put(initialize_container))
        .route("/containers/:guid/run", post(run_actions))
        .route("/resources/remaining", get(remaining_resources))
        .route("/resources/total", get(total_resources))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves `state` on `listener` until `shutdown` resolves, then drains
/// in-flight run calls before returning.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> crate::error::Result<()> {
    let run_group = state.run_group();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Error::Io)?;
    tracing::info!("http surface stopped; draining in-flight runs");
    run_group.wait().await;
    Ok(())
}

// =============================================================================
// Error Mapping
// =============================================================================

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::ContainerNotFound => StatusCode::NOT_FOUND,
            Error::InvalidTransition => StatusCode::CONFLICT,
            Error::GuidAlreadyAllocated(_) => StatusCode::BAD_REQUEST,
            Error::InsufficientResources { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Sandbox(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn ping(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.provider.ping().await.map_err(Error::from)?;
    Ok(StatusCode::OK)
}

async fn allocate_container(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    Json(req): Json<AllocationRequest>,
) -> Result<(StatusCode, Json<Container>), ApiError> {
    let container = state.store.reserve(&guid, &req)?;
    Ok((StatusCode::CREATED, Json(container)))
}

async fn get_container(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<Json<Container>, ApiError> {
    Ok(Json(state.store.get(&guid)?))
}

async fn list_containers(State(state): State<AppState>) -> Json<Vec<Container>> {
    Json(state.store.list())
}

async fn initialize_container(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    Json(req): Json<RunRequest>,
) -> Result<StatusCode, ApiError> {
    state.store.initialize(&guid, &req)?;
    Ok(StatusCode::OK)
}

/// Drives Create + Run for an Initializing container on a background
/// task tracked by the run wait-group. Idempotent by GUID: a container
/// already past Initializing is a no-op.
async fn run_actions(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<StatusCode, ApiError> {
    let info = state.store.get(&guid)?;
    match info.state {
        ContainerState::Reserved => return Err(ApiError(Error::InvalidTransition)),
        ContainerState::Initializing => {}
        // Run already requested for this guid.
        _ => return Ok(StatusCode::OK),
    }

    let guard = state.run_group.enter();
    let store = Arc::clone(&state.store);
    tokio::spawn(async move {
        let _guard = guard;
        if let Err(err) = store.create(&guid).await {
            tracing::warn!(guid = %guid, error = %err, "create failed");
            return;
        }
        if let Err(err) = store.run(&guid).await {
            tracing::warn!(guid = %guid, error = %err, "run failed");
        }
    });
    Ok(StatusCode::ACCEPTED)
}

async fn delete_container(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.destroy(&guid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remaining_resources(State(state): State<AppState>) -> Json<ExecutorResources> {
    Json(state.store.remaining_resources())
}

async fn total_resources(State(state): State<AppState>) -> Json<ExecutorResources> {
    Json(state.store.total_resources())
}
