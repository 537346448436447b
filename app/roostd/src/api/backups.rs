//! Backup routes: create, restore, delete.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use roost_backup::{
    AdapterKind, BackupAdapter, BackupMeta, LocalBackup, ResticBackup, S3Backup,
};
use roost_server::{CommonError, Server};
use roost_system::Rate;
use serde::Deserialize;
use tokio_util::io::SyncIoBridge;
use uuid::Uuid;

use super::{server_or_404, ApiResult, AppState};

fn write_rate(state: &AppState) -> Option<Arc<Rate>> {
    let limit = state.config.backups.write_limit * 1024 * 1024;
    (limit > 0).then(|| Arc::new(Rate::new(limit, std::time::Duration::from_secs(1))))
}

fn build_adapter(
    state: &AppState,
    server: &Arc<Server>,
    kind: AdapterKind,
    uuid: Uuid,
    ignore: String,
) -> ApiResult<Arc<dyn BackupAdapter>> {
    let meta = BackupMeta {
        uuid,
        server_uuid: server.id(),
        ignore,
    };
    let node = server.node();
    Ok(match kind {
        AdapterKind::Local => {
            let mut backup =
                LocalBackup::new(meta, node.backup_dir.clone(), node.backup_compression);
            if let Some(rate) = write_rate(state) {
                backup = backup.with_rate(rate);
            }
            Arc::new(backup)
        }
        AdapterKind::S3 => {
            let mut backup = S3Backup::new(
                meta,
                Arc::clone(server.remote()),
                node.tmp_dir.clone(),
                node.backup_compression,
            );
            if let Some(rate) = write_rate(state) {
                backup = backup.with_rate(rate);
            }
            Arc::new(backup)
        }
        AdapterKind::Restic => {
            let cfg = &state.config.backups;
            if cfg.restic_repository.is_empty() {
                return Err(CommonError::invalid_input(
                    "restic backups are not configured on this node",
                )
                .into());
            }
            Arc::new(ResticBackup::new(
                meta,
                roost_backup::restic::ResticSettings {
                    repository: cfg.restic_repository.clone(),
                    password_file: cfg.restic_password_file.clone(),
                    environment: Vec::new(),
                },
                server.filesystem().path().to_path_buf(),
            ))
        }
    })
}

#[derive(Deserialize)]
pub(super) struct CreateBackupRequest {
    uuid: Uuid,
    adapter: AdapterKind,
    #[serde(default)]
    ignore: String,
}

/// Kicks off a backup generation in the background; the terminal event and
/// Panel report come from the core.
pub(super) async fn create(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Json(body): Json<CreateBackupRequest>,
) -> ApiResult<StatusCode> {
    let server = server_or_404(&state, server)?;
    let adapter = build_adapter(&state, &server, body.adapter, body.uuid, body.ignore)?;

    tokio::spawn(async move {
        let _ = server.backup(adapter).await;
    });
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
pub(super) struct RestoreBackupRequest {
    adapter: AdapterKind,
    #[serde(default)]
    truncate_directory: bool,
    /// Panel-issued download URL; required for the s3 adapter.
    #[serde(default)]
    download_url: Option<String>,
}

pub(super) async fn restore(
    State(state): State<AppState>,
    Path((server, backup)): Path<(Uuid, Uuid)>,
    Json(body): Json<RestoreBackupRequest>,
) -> ApiResult<StatusCode> {
    let server = server_or_404(&state, server)?;
    let adapter = build_adapter(&state, &server, body.adapter, backup, String::new())?;

    let reader: Box<dyn std::io::Read + Send> = match body.adapter {
        AdapterKind::S3 => {
            let url = body.download_url.ok_or_else(|| {
                CommonError::invalid_input("download_url is required to restore an s3 backup")
            })?;
            let response = reqwest::get(&url)
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| CommonError::remote_unavailable(e.to_string()))?;
            let stream = tokio_util::io::StreamReader::new(futures::TryStreamExt::map_err(
                response.bytes_stream(),
                std::io::Error::other,
            ));
            Box::new(SyncIoBridge::new(stream))
        }
        _ => Box::new(std::io::empty()),
    };

    tokio::spawn(async move {
        let _ = server.restore_backup(adapter, reader, body.truncate_directory).await;
    });
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
pub(super) struct RemoveBackupRequest {
    #[serde(default = "default_adapter")]
    adapter: AdapterKind,
}

fn default_adapter() -> AdapterKind {
    AdapterKind::Local
}

pub(super) async fn remove(
    State(state): State<AppState>,
    Path((server, backup)): Path<(Uuid, Uuid)>,
    body: Option<Json<RemoveBackupRequest>>,
) -> ApiResult<StatusCode> {
    let server = server_or_404(&state, server)?;
    let kind = body.map(|Json(b)| b.adapter).unwrap_or(AdapterKind::Local);
    let adapter = build_adapter(&state, &server, kind, backup, String::new())?;
    adapter
        .remove()
        .await
        .map_err(CommonError::from)?;
    Ok(StatusCode::NO_CONTENT)
}
