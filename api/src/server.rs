use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::{self, AppState};
use crate::{ApiError, ApiResult, Config, FileService};

pub struct Server {
    config: Config,
    app_state: Arc<AppState>,
}

impl Server {
    pub fn new(config: Config, service: Arc<dyn FileService>) -> Self {
        Self {
            config,
            app_state: Arc::new(AppState { service }),
        }
    }

    /// Serves until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> ApiResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();

        let addr = &self.config.listen_addr;
        tracing::info!("Starting HTTP API on {}", addr);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ApiError::InternalError(format!("Failed to bind to {}: {}", addr, e)))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ApiError::InternalError(format!("Server error: {}", e)))?;

        tracing::info!("HTTP API stopped");
        Ok(())
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handlers::health_check))
            .route("/status", get(handlers::cluster_status))
            .route("/nodes", get(handlers::list_nodes))
            .route("/files", get(handlers::list_files))
            .route(
                "/files/:name",
                get(handlers::get_file).put(handlers::put_file),
            )
            .route("/shutdown", post(handlers::shutdown))
            .with_state(self.app_state.clone())
            .layer(DefaultBodyLimit::max(self.config.max_upload_bytes))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .fallback(not_found)
    }
}

async fn not_found() -> ApiResult<axum::response::Response> {
    Err(ApiError::NotFound("no such route".to_string()))
}
