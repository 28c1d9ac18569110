use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{Html, Json, Response},
    routing::get,
    Router,
};
use log::{error, info};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::capture::Capture;
use crate::context::RequestContext;
use crate::error::FaultLogError;
use crate::record::ErrorRecord;
use crate::report::{ReportRenderer, ReportSettings};
use crate::store::ErrorStore;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    store: ErrorStore,
    capture: &'static Capture,
    settings: ReportSettings,
}

impl AppState {
    pub fn new(store: ErrorStore, capture: &'static Capture, settings: ReportSettings) -> Self {
        AppState {
            store,
            capture,
            settings,
        }
    }
}

/// Error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub records: i64,
}

pub struct WebServer {
    host: String,
    port: u16,
}

impl WebServer {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    pub async fn start(&self, state: AppState) -> Result<(), FaultLogError> {
        let app = Self::create_router(state);

        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| FaultLogError::Error(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FaultLogError::Error(format!("Failed to bind to {}: {}", addr, e)))?;

        println!("faultlog report available on http://{}", addr);
        info!("Server ready to handle requests on {}", addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| FaultLogError::Error(format!("Server error: {}", e)))?;

        info!("Server shutdown complete");
        Ok(())
    }

    fn create_router(state: AppState) -> Router {
        Router::new()
            .route("/", get(report_page))
            .route("/api/errors", get(list_errors))
            .route("/health", get(health_check))
            .layer(middleware::from_fn(request_context))
            .with_state(state)
    }
}

/// Makes the peer address visible to anything captured while serving the request.
async fn request_context(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    RequestContext::scope_async(addr.ip().to_string(), next.run(request)).await
}

/// Runs blocking store work off the async runtime, keeping the request's address.
async fn blocking<F, R>(func: F) -> Result<R, StatusCode>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let remote_address = RequestContext::remote_address();

    tokio::task::spawn_blocking(move || RequestContext::scope(remote_address, func))
        .await
        .map_err(|e| {
            error!("Blocking task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

/// GET /
/// The error log as an HTML table, newest first.
pub async fn report_page(State(state): State<AppState>) -> Result<Html<String>, StatusCode> {
    let report = blocking(move || {
        ReportRenderer::new(&state.store, state.capture, state.settings).render()
    })
    .await?;

    Ok(Html(report.to_html()))
}

/// GET /api/errors
/// The error log as JSON, newest first.
pub async fn list_errors(
    State(state): State<AppState>,
) -> Result<Json<Vec<ErrorRecord>>, (StatusCode, Json<ErrorResponse>)> {
    let internal = |error: String| (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error }));

    let result = blocking(move || {
        state.store.read_all().inspect_err(|err| {
            let _ = state.capture.report_error(err, "Reading error logs for /api/errors");
        })
    })
    .await
    .map_err(|_| internal("Internal error".to_string()))?;

    result
        .map(Json)
        .map_err(|err| internal(err.to_string()))
}

/// GET /health
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<ErrorResponse>)> {
    let count = blocking(move || state.store.count())
        .await
        .map_err(|status| {
            (
                status,
                Json(ErrorResponse {
                    error: "Internal error".to_string(),
                }),
            )
        })?;

    match count {
        Ok(records) => Ok(Json(HealthResponse {
            status: "ok",
            records,
        })),
        Err(err) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: err.to_string(),
            }),
        )),
    }
}

/// Waits for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
