//! HTTP API for receipt ingestion and the points balance.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/receipts` | Upload a receipt image (multipart field `receipt`) |
//! | `GET`  | `/api/receipts` | List processed receipts, newest first |
//! | `GET`  | `/api/points` | Current points balance |
//! | `GET`  | `/health` | Liveness probe |
//!
//! # Error Contract
//!
//! ```json
//! { "error": "Duplicate receipt detected. ...", "code": "duplicate_receipt" }
//! ```
//!
//! `details` is present for server-side failures (recognition unavailable,
//! internal errors). Status codes: 400 for intake problems and rejected
//! recognition, 409 for duplicates, 500 otherwise.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the browser upload
//! client can be served from a different origin.

use std::sync::Arc;

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::artifact::is_image_type;
use crate::config::Config;
use crate::error::IngestError;
use crate::ingest::{Ingestor, Upload};
use crate::models::{format_ts_iso, Receipt};
use crate::{db, migrate};

/// Multipart field carrying the image.
pub const UPLOAD_FIELD: &str = "receipt";

/// Headroom above the upload limit for multipart framing and other fields.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    ingestor: Arc<Ingestor>,
}

impl AppState {
    pub fn new(ingestor: Arc<Ingestor>) -> Self {
        Self { ingestor }
    }
}

/// Builds the router with CORS, request tracing, and the body limit.
pub fn router(state: AppState) -> Router {
    let body_limit = state
        .ingestor
        .artifacts()
        .max_bytes()
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/receipts",
            get(handle_list_receipts).post(handle_upload_receipt),
        )
        .route("/api/points", get(handle_points))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind`.
///
/// Connects to the database, applies the schema, creates the upload
/// directory, and serves until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    tokio::fs::create_dir_all(&config.uploads.dir).await?;

    let ingestor = Ingestor::from_config(config, pool)?;
    let listener = TcpListener::bind(&config.server.bind).await?;

    tracing::info!(
        bind = %config.server.bind,
        recognition = %config.recognition.endpoint,
        uploads = %config.uploads.dir.display(),
        "Receipt Rewards API listening"
    );

    serve(listener, AppState::new(Arc::new(ingestor))).await
}

/// Serves the API on an already-bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutdown signal received");
    }
}

// ============ Error response ============

/// JSON error body.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// Error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.code,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        AppError {
            status: err.status(),
            code: err.code().to_string(),
            message: err.to_string(),
            details: err.details(),
        }
    }
}

/// Constructs a 500 error for read-side failures.
fn internal(message: impl Into<String>, err: anyhow::Error) -> AppError {
    tracing::error!(error = ?err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal_error".to_string(),
        message: message.into(),
        details: None,
    }
}

// ============ POST /api/receipts ============

#[derive(Serialize)]
struct UploadResponse {
    success: bool,
    receipt: UploadedReceipt,
    message: String,
}

#[derive(Serialize)]
struct UploadedReceipt {
    id: i64,
    merchant: String,
    total: Decimal,
    points_awarded: i64,
    confidence: f64,
    processed_at: String,
}

/// Handler for `POST /api/receipts`.
///
/// Reads the `receipt` field and runs it through the ingestion pipeline.
/// Non-image uploads are refused before their body is read.
async fn handle_upload_receipt(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    let multipart = match multipart {
        Ok(m) => m,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "request is not multipart");
            return Err(IngestError::NoFileProvided.into());
        }
    };

    let max_bytes = state.ingestor.artifacts().max_bytes();
    let upload = read_upload(multipart, max_bytes).await?;
    let outcome = state.ingestor.ingest(upload).await?;

    Ok(Json(UploadResponse {
        success: true,
        receipt: UploadedReceipt {
            id: outcome.receipt.id,
            merchant: outcome.receipt.merchant,
            total: outcome.receipt.total_amount,
            points_awarded: outcome.receipt.points_awarded,
            confidence: outcome.receipt.confidence,
            processed_at: format_ts_iso(outcome.receipt.processed_at),
        },
        message: outcome.message,
    }))
}

/// Pulls the upload field out of the multipart stream.
///
/// Returns `Ok(None)` when no `receipt` field is present.
async fn read_upload(
    mut multipart: Multipart,
    max_bytes: usize,
) -> Result<Option<Upload>, IngestError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, max_bytes))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or("upload").to_string();
        let media_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        if !is_image_type(&media_type) {
            return Err(IngestError::InvalidMediaType(media_type));
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| multipart_error(e, max_bytes))?
        {
            if bytes.len() + chunk.len() > max_bytes {
                return Err(IngestError::SizeExceeded { limit: max_bytes });
            }
            bytes.extend_from_slice(&chunk);
        }

        if bytes.is_empty() {
            return Ok(None);
        }

        return Ok(Some(Upload {
            bytes,
            file_name,
            media_type,
        }));
    }

    Ok(None)
}

fn multipart_error(err: MultipartError, max_bytes: usize) -> IngestError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        IngestError::SizeExceeded { limit: max_bytes }
    } else {
        tracing::warn!(error = %err, "malformed multipart body");
        IngestError::NoFileProvided
    }
}

// ============ GET /api/receipts ============

#[derive(Serialize)]
struct ReceiptListResponse {
    receipts: Vec<Receipt>,
}

async fn handle_list_receipts(
    State(state): State<AppState>,
) -> Result<Json<ReceiptListResponse>, AppError> {
    let receipts = state
        .ingestor
        .ledger()
        .list_receipts()
        .await
        .map_err(|e| internal("Failed to fetch receipts", e))?;
    Ok(Json(ReceiptListResponse { receipts }))
}

// ============ GET /api/points ============

#[derive(Serialize)]
struct PointsResponse {
    total_points: i64,
}

async fn handle_points(State(state): State<AppState>) -> Result<Json<PointsResponse>, AppError> {
    let total_points = state
        .ingestor
        .ledger()
        .total_points()
        .await
        .map_err(|e| internal("Failed to fetch points balance", e))?;
    Ok(Json(PointsResponse { total_points }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "Receipt Rewards API".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
