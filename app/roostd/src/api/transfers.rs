//! Transfer routes: outbound start/cancel and the inbound ingest endpoint.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use base64::Engine;
use futures::TryStreamExt;
use roost_server::transfer::Incoming;
use roost_server::CommonError;
use serde::Deserialize;
use tokio_util::io::StreamReader;
use uuid::Uuid;

use super::{server_or_404, ApiResult, AppState};

#[derive(Deserialize)]
pub(super) struct OutboundRequest {
    /// Peer daemon transfer-ingest URL.
    url: String,
    /// Panel-issued bearer token forwarded to the peer.
    token: String,
    /// Local backup UUIDs to include.
    #[serde(default)]
    backups: Vec<Uuid>,
}

pub(super) async fn start_outbound(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Json(body): Json<OutboundRequest>,
) -> ApiResult<StatusCode> {
    let server = server_or_404(&state, server)?;
    server.transfer_to(body.url, body.token, body.backups).await?;
    Ok(StatusCode::ACCEPTED)
}

pub(super) async fn status(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
) -> ApiResult<axum::Json<serde_json::Value>> {
    let server = server_or_404(&state, server)?;
    let body = match server.current_transfer().await {
        Some(transfer) => serde_json::json!({
            "status": transfer.status(),
            "progress": transfer.progress().bar(25),
        }),
        None => serde_json::json!({ "status": serde_json::Value::Null }),
    };
    Ok(axum::Json(body))
}

pub(super) async fn cancel(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let server = server_or_404(&state, server)?;
    match server.current_transfer().await {
        Some(transfer) => {
            transfer.request_cancellation();
            Ok(StatusCode::ACCEPTED)
        }
        None => Err(CommonError::not_found("no transfer is in flight").into()),
    }
}

/// Inbound transfer ingest. The multipart body arrives in strict wire
/// order; every part is routed into the core state machine and any failure
/// unwinds through its cleanup path.
pub(super) async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<StatusCode> {
    let uuid = token_subject(&headers)?;
    let mut incoming = Incoming::prepare(Arc::clone(&state.manager), uuid).await?;

    match drive(&mut incoming, &mut multipart).await {
        Ok(()) => {
            incoming.finish().await?;
            Ok(StatusCode::OK)
        }
        // fail_with cleans up and always hands the original error back.
        Err(err) => Err(incoming
            .fail_with(err)
            .await
            .expect_err("failure path returns its error")
            .into()),
    }
}

async fn drive(incoming: &mut Incoming, multipart: &mut Multipart) -> Result<(), CommonError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| CommonError::invalid_input(format!("multipart: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "archive" => {
                let reader = StreamReader::new(field.map_err(std::io::Error::other));
                incoming.receive_archive(reader).await?;
            }
            "checksum_archive" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| CommonError::invalid_input(format!("multipart: {e}")))?;
                incoming.verify_archive(&value)?;
            }
            "install_logs" => {
                let reader = StreamReader::new(field.map_err(std::io::Error::other));
                incoming.receive_install_log(reader).await;
            }
            name if name.starts_with("checksum_backup_") => {
                let owned = name.to_string();
                let value = field
                    .text()
                    .await
                    .map_err(|e| CommonError::invalid_input(format!("multipart: {e}")))?;
                incoming.verify_backup(&owned, &value)?;
            }
            name if name.starts_with("backup_") => {
                let owned = name.to_string();
                let reader = StreamReader::new(field.map_err(std::io::Error::other));
                incoming.receive_backup(&owned, reader).await?;
            }
            other => {
                tracing::debug!(field = other, "ignoring unknown transfer field");
            }
        }
    }
    Ok(())
}

/// Extracts the server UUID from the transfer token's subject claim.
///
/// Signature validation of the Panel-issued token happens in the
/// authentication middleware in front of this router; by the time a request
/// reaches the handler the token is trusted, and only the subject needs to
/// be read back out of it.
fn token_subject(headers: &HeaderMap) -> Result<Uuid, CommonError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| CommonError::invalid_input("missing transfer token"))?;

    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| CommonError::invalid_input("malformed transfer token"))?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| CommonError::invalid_input("malformed transfer token payload"))?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded)
        .map_err(|_| CommonError::invalid_input("malformed transfer token claims"))?;

    claims
        .get("sub")
        .or_else(|| claims.get("subject"))
        .and_then(|v| v.as_str())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| CommonError::invalid_input("transfer token is missing a server subject"))
}
