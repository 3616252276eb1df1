use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use axum::{
    Router,
    extract::{FromRef, Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tokio::{net::TcpListener, time::Duration};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    clients::health::HealthChecker,
    models::{
        forms::{CreateNotificationBatchForm, CreateNotificationForm, ListForm},
        health::HealthStatus,
        notification::Notification,
        response::{AcceptedResponse, ErrorResponse, NotificationListResponse},
        validation::ValidationError,
    },
    services::notification::NotificationService,
};

#[derive(Clone)]
pub struct AppState {
    pub notifications: NotificationService,
    pub health_checker: Arc<HealthChecker>,
}

impl FromRef<AppState> for Arc<HealthChecker> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.health_checker)
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("invalid request body: {0}")]
    BadRequest(String),

    #[error("notification {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Internal(#[from] Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(e) => {
                error!(error = %e, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = ErrorResponse {
            error_detail: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route(
            "/api/v1/notifications",
            post(create_notification).get(list_notifications),
        )
        .route("/api/v1/notifications/batch", post(create_notification_batch))
        .route("/api/v1/notifications/{id}", get(find_notification))
        .route("/health", get(health_check))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health endpoint alone, for processes without the notification API.
pub fn health_router(health_checker: Arc<HealthChecker>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(health_checker)
}

pub async fn run_api_server(port: u16, app: Router, token: CancellationToken) -> Result<(), Error> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow!("Failed to bind {}: {}", addr, e))?;

    info!(address = %addr, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(|e| anyhow!("HTTP server failed: {}", e))?;

    info!(address = %addr, "HTTP server stopped");

    Ok(())
}

async fn create_notification(
    State(state): State<AppState>,
    payload: Result<Json<CreateNotificationForm>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let Json(form) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let request = form.validate()?;

    let notification = state.notifications.create(request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse::new(notification.id, timestamp())),
    ))
}

async fn create_notification_batch(
    State(state): State<AppState>,
    payload: Result<Json<CreateNotificationBatchForm>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let Json(form) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let requests = form.validate()?;

    let group_id = state.notifications.bulk_create(requests).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse::new(group_id, timestamp())),
    ))
}

async fn list_notifications(
    State(state): State<AppState>,
    Query(form): Query<ListForm>,
) -> Result<Json<NotificationListResponse>, ApiError> {
    let filter = form.filter()?;
    let page = state.notifications.list(&filter, form.page()).await?;

    Ok(Json(NotificationListResponse {
        total: page.total,
        notifications: page.notifications,
    }))
}

async fn find_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, ApiError> {
    state
        .notifications
        .find(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

async fn health_check(State(health_checker): State<Arc<HealthChecker>>) -> impl IntoResponse {
    let health = health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}
