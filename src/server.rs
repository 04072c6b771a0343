//! HTTP API consumed by the external frontend.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/data-sources/types` | Connector kinds with schema and icon |
//! | `GET`  | `/data-sources/connected` | Configured sources |
//! | `POST` | `/data-sources` | Connect a source; returns its id |
//! | `DELETE` | `/data-sources/{id}` | Disconnect a source (cascades) |
//! | `POST` | `/data-sources/{name}/list-locations` | Selectable sub-partitions |
//! | `GET`  | `/search?query&top_k` | Run the query pipeline |
//! | `GET`  | `/status` | Queue depths |
//! | `POST` | `/clear-index` | Wipe both indexes and all documents |
//!
//! # Error Contract
//!
//! A rejected config comes back as `400` with the validation message; a
//! [`ConnectorError::Known`] passes its literal message through as `501`;
//! everything else is a `500` with an opaque message and a logged chain.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; the frontend is served
//! from elsewhere.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::app::{App, StatusReport};
use crate::error::ConnectorError;
use crate::models::{ConfigField, Location};
use crate::search::{self, SearchResult};

/// Start serving. Runs until interrupted.
pub async fn run_server(app: Arc<App>) -> anyhow::Result<()> {
    let bind = app.config.server.bind.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/data-sources/types", get(handle_list_types))
        .route("/data-sources/connected", get(handle_list_connected))
        .route("/data-sources", post(handle_create_source))
        .route("/data-sources/{id}", delete(handle_delete_source))
        .route(
            "/data-sources/{name}/list-locations",
            post(handle_list_locations),
        )
        .route("/search", get(handle_search))
        .route("/status", get(handle_status))
        .route("/clear-index", post(handle_clear_index))
        .layer(cors)
        .with_state(app);

    info!(%bind, "http server listening");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, shutting down");
        })
        .await?;
    Ok(())
}

// ============ Error mapping ============

struct ApiError {
    status: StatusCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<ConnectorError> for ApiError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::InvalidConfig(message) => ApiError {
                status: StatusCode::BAD_REQUEST,
                message,
            },
            ConnectorError::Known(message) => ApiError {
                status: StatusCode::NOT_IMPLEMENTED,
                message,
            },
            other => {
                error!(err = %other, "request failed");
                ApiError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "internal error".to_string(),
                }
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!(%err, "request failed");
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

// ============ GET /data-sources/types ============

#[derive(Serialize)]
struct SourceTypeDescriptor {
    name: String,
    display_name: String,
    config_fields: Vec<ConfigField>,
    image_base64: Option<String>,
    has_prerequisites: bool,
}

async fn handle_list_types(State(app): State<Arc<App>>) -> Json<Vec<SourceTypeDescriptor>> {
    let descriptors = app
        .registry
        .classes()
        .into_iter()
        .map(|class| SourceTypeDescriptor {
            name: class.name().to_string(),
            display_name: class.display_name().to_string(),
            config_fields: class.config_fields(),
            image_base64: load_icon(&app, class.name()),
            has_prerequisites: class.has_prerequisites(),
        })
        .collect();
    Json(descriptors)
}

/// Inline `{icons_dir}/{name}.png` as a data URI, falling back to the
/// default icon, then to nothing.
fn load_icon(app: &App, type_name: &str) -> Option<String> {
    let named = app.config.icons_dir.join(format!("{}.png", type_name));
    let fallback = app.config.icons_dir.join("default_icon.png");

    let bytes = std::fs::read(&named)
        .or_else(|_| std::fs::read(&fallback))
        .ok();
    match bytes {
        Some(bytes) => Some(format!("data:image/png;base64,{}", BASE64.encode(bytes))),
        None => {
            warn!(type_name, dir = %app.config.icons_dir.display(), "no icon found");
            None
        }
    }
}

// ============ GET /data-sources/connected ============

#[derive(Serialize)]
struct ConnectedSource {
    id: i64,
    name: String,
}

async fn handle_list_connected(
    State(app): State<Arc<App>>,
) -> Result<Json<Vec<ConnectedSource>>, ApiError> {
    let sources = app.store.load_sources().await?;
    Ok(Json(
        sources
            .into_iter()
            .map(|source| ConnectedSource {
                id: source.id,
                name: source.type_name,
            })
            .collect(),
    ))
}

// ============ POST /data-sources ============

#[derive(Deserialize)]
struct CreateSourceRequest {
    name: String,
    config: serde_json::Value,
}

async fn handle_create_source(
    State(app): State<Arc<App>>,
    Json(request): Json<CreateSourceRequest>,
) -> Result<Json<i64>, ApiError> {
    let id = app.create_source(&request.name, request.config).await?;
    Ok(Json(id))
}

// ============ DELETE /data-sources/{id} ============

async fn handle_delete_source(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    app.delete_source(id).await?;
    Ok(StatusCode::OK)
}

// ============ POST /data-sources/{name}/list-locations ============

async fn handle_list_locations(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Json(config): Json<serde_json::Value>,
) -> Result<Json<Vec<Location>>, ApiError> {
    let class = app.registry.get_class(&name).ok_or_else(|| {
        ApiError::from(ConnectorError::Known(format!(
            "source type {} does not exist",
            name
        )))
    })?;
    let locations = class.list_locations(&config).await?;
    Ok(Json(locations))
}

// ============ GET /search ============

#[derive(Deserialize)]
struct SearchParams {
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    10
}

async fn handle_search(
    State(app): State<Arc<App>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<SearchResult>>, ApiError> {
    app.counters.record_search();
    let results = search::search_documents(&app, &params.query, params.top_k).await?;
    Ok(Json(results))
}

// ============ GET /status ============

async fn handle_status(State(app): State<Arc<App>>) -> Result<Json<StatusReport>, ApiError> {
    Ok(Json(app.status().await?))
}

// ============ POST /clear-index ============

async fn handle_clear_index(State(app): State<Arc<App>>) -> Result<StatusCode, ApiError> {
    app.clear_index().await?;
    Ok(StatusCode::OK)
}
