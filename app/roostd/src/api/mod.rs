//! HTTP API surface.
//!
//! Thin handlers over the server core: every route resolves its server,
//! calls one core operation, and maps the daemon error taxonomy onto HTTP
//! statuses. Authentication against the node token and the Panel-signed
//! request tokens is enforced by middleware collaborators in front of this
//! router; the handlers themselves assume an authenticated caller.

mod backups;
mod files;
mod servers;
mod transfers;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use roost_server::{CommonError, Manager, Server};
use serde_json::json;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub config: Arc<Config>,
}

/// Builds the API router.
pub fn router(manager: Arc<Manager>, config: Arc<Config>) -> Router {
    let state = AppState { manager, config: Arc::clone(&config) };
    let upload_limit = (config.api.upload_limit.max(1) as usize) * 1024 * 1024;

    Router::new()
        .route("/api/system", get(servers::system_info))
        .route("/api/servers", get(servers::list).post(servers::create))
        .route("/api/servers/:server", get(servers::view).delete(servers::remove))
        .route("/api/servers/:server/power", post(servers::power))
        .route("/api/servers/:server/commands", post(servers::commands))
        .route("/api/servers/:server/logs", get(servers::logs))
        .route("/api/servers/:server/files/contents", get(files::contents))
        .route("/api/servers/:server/files/list-directory", get(files::list_directory))
        .route("/api/servers/:server/files/rename", put(files::rename))
        .route("/api/servers/:server/files/copy", post(files::copy))
        .route("/api/servers/:server/files/write", post(files::write))
        .route("/api/servers/:server/files/create-directory", post(files::create_directory))
        .route("/api/servers/:server/files/delete", post(files::delete_files))
        .route("/api/servers/:server/files/chmod", post(files::chmod))
        .route("/api/servers/:server/files/compress", post(files::compress))
        .route("/api/servers/:server/files/decompress", post(files::decompress))
        .route("/api/servers/:server/files/search", get(files::search))
        .route("/api/servers/:server/files/pull", post(files::pull))
        .route("/api/servers/:server/backup", post(backups::create))
        .route("/api/servers/:server/backup/:backup/restore", post(backups::restore))
        .route("/api/servers/:server/backup/:backup", delete(backups::remove))
        .route(
            "/api/servers/:server/transfer",
            get(transfers::status)
                .post(transfers::start_outbound)
                .delete(transfers::cancel),
        )
        .route("/api/transfers", post(transfers::ingest))
        .route("/api/users/:user/deauthorize", post(deauthorize))
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// API error envelope: the taxonomy kind mapped to a status plus a request
/// id for correlation with the daemon log.
pub struct ApiError {
    error: CommonError,
    request_id: Uuid,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.error {
            CommonError::BadPathResolution(_) | CommonError::NotFound(_) => StatusCode::NOT_FOUND,
            CommonError::DiskSpace(_) => StatusCode::CONFLICT,
            CommonError::AlreadyExists(_)
            | CommonError::Conflict(_)
            | CommonError::AlreadyRunning
            | CommonError::AlreadyStopped => StatusCode::CONFLICT,
            CommonError::Suspended(_) => StatusCode::BAD_REQUEST,
            CommonError::InvalidState(_)
            | CommonError::InvalidInput(_)
            | CommonError::ChecksumMismatch(_)
            | CommonError::NotADirectory(_)
            | CommonError::IsADirectory(_) => StatusCode::BAD_REQUEST,
            CommonError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            CommonError::RemoteUnavailable(_) => StatusCode::BAD_GATEWAY,
            CommonError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CommonError::Cancelled => StatusCode::BAD_REQUEST,
            CommonError::Io(_) | CommonError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CommonError> for ApiError {
    fn from(error: CommonError) -> Self {
        Self {
            error,
            request_id: Uuid::new_v4(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(request_id = %self.request_id, error = %self.error, "request failed");
        } else {
            tracing::debug!(request_id = %self.request_id, error = %self.error, "request rejected");
        }
        let body = Json(json!({
            "error": self.error.to_string(),
            "request_id": self.request_id.to_string(),
        }));
        let mut response = (status, body).into_response();
        if let Ok(value) = self.request_id.to_string().parse() {
            response.headers_mut().insert("X-Request-Id", value);
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Resolves a server or answers 404.
pub(crate) fn server_or_404(state: &AppState, id: Uuid) -> ApiResult<Arc<Server>> {
    state
        .manager
        .get(id)
        .ok_or_else(|| CommonError::not_found(format!("server {id}")).into())
}

/// Severs every WebSocket and SFTP session a user holds on this node.
async fn deauthorize(
    State(state): State<AppState>,
    Path(user): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.manager.deauthorize_user(user);
    Ok(StatusCode::NO_CONTENT)
}
