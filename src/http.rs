/// HTTP surface for a running scheduler.
///
/// # Example
///
/// ```ignore
/// use koru_recall::http::HttpServer;
///
/// let handle = Scheduler::new(engine).start();
/// HttpServer::new(handle).bind("0.0.0.0:8080").await?;
/// ```
///
/// # API Endpoints
///
/// - `GET /health` - Health report (503 when a tier is halted)
/// - `GET /streams` - Tick stream states
/// - `POST /tick/:kind` - Force a tick (`wm`, `stm`, `consolidation`, `homeostasis`, `decay`)
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;

use crate::engine::TickReport;
use crate::error::{RecallError, RecallResult};
use crate::health::{HealthReport, HealthStatus};
use crate::scheduler::{SchedulerHandle, StreamState, TickKind};

/// HTTP server over a [`SchedulerHandle`].
pub struct HttpServer {
    handle: SchedulerHandle,
}

impl HttpServer {
    pub fn new(handle: SchedulerHandle) -> Self {
        Self { handle }
    }

    /// Serve until the process exits.
    pub async fn bind(self, addr: &str) -> RecallResult<()> {
        self.bind_with_shutdown(addr, std::future::pending()).await
    }

    /// Serve until `signal` resolves.
    pub async fn bind_with_shutdown(
        self,
        addr: &str,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> RecallResult<()> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| RecallError::InvalidConfig(format!("Invalid address '{addr}': {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "HTTP surface listening");
        axum::serve(listener, create_router(self.handle))
            .with_graceful_shutdown(signal)
            .await?;
        Ok(())
    }
}

/// Create the router.
pub fn create_router(handle: SchedulerHandle) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/health", get(handle_health))
        .route("/streams", get(handle_streams))
        .route("/tick/:kind", post(handle_tick))
        .with_state(handle)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: RecallError) -> ApiError {
    let status = match &err {
        RecallError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        RecallError::TierHalted { .. } => StatusCode::CONFLICT,
        RecallError::Shutdown | RecallError::FeedUnavailable(_) | RecallError::Transient { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

async fn handle_health(State(handle): State<SchedulerHandle>) -> Result<(StatusCode, Json<HealthReport>), ApiError> {
    let report = handle.health().await.map_err(api_error)?;
    let status = match report.status {
        HealthStatus::Halted => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    Ok((status, Json(report)))
}

async fn handle_streams(State(handle): State<SchedulerHandle>) -> Json<Vec<StreamState>> {
    Json(handle.streams())
}

async fn handle_tick(
    State(handle): State<SchedulerHandle>,
    Path(kind): Path<String>,
) -> Result<Json<TickReport>, ApiError> {
    let kind: TickKind = kind.parse().map_err(api_error)?;
    handle.force_tick(kind).await.map(Json).map_err(api_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecallConfig;
    use crate::engine::RecallEngine;
    use crate::scheduler::Scheduler;

    fn handle() -> SchedulerHandle {
        let engine = RecallEngine::builder(RecallConfig::default()).build().unwrap();
        Scheduler::new(engine).start()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let handle = handle();
        let (status, Json(report)) = handle_health(State(handle.clone())).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report.streams.len(), TickKind::ALL.len());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_tick_endpoint() {
        let handle = handle();
        let Json(report) = handle_tick(State(handle.clone()), Path("stm".into())).await.unwrap();
        assert!(matches!(report, TickReport::ShortTerm(_)));

        let (status, _) = handle_tick(State(handle.clone()), Path("nap".into())).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        handle.shutdown().await;
        let (status, _) = handle_tick(State(handle.clone()), Path("wm".into())).await.unwrap_err();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
