//! File-manager routes over the sandboxed filesystem.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use roost_fs::{ArchiveFormat, Filesystem, SearchOptions};
use roost_server::{CommonError, Server};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{server_or_404, ApiResult, AppState};

/// Runs a blocking filesystem closure off the async workers.
async fn blocking<T, F>(server: &Arc<Server>, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Filesystem) -> Result<T, CommonError> + Send + 'static,
{
    let fs = Arc::clone(server.filesystem());
    let result = tokio::task::spawn_blocking(move || f(&fs))
        .await
        .map_err(|e| CommonError::internal(e.to_string()))?;
    Ok(result?)
}

#[derive(Deserialize)]
pub(super) struct FileQuery {
    file: String,
}

pub(super) async fn contents(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Vec<u8>> {
    let server = server_or_404(&state, server)?;
    blocking(&server, move |fs| fs.read(&query.file)).await
}

#[derive(Deserialize)]
pub(super) struct DirectoryQuery {
    directory: String,
}

pub(super) async fn list_directory(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Query(query): Query<DirectoryQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let server = server_or_404(&state, server)?;
    let entries = blocking(&server, move |fs| fs.list_dir(&query.directory)).await?;
    Ok(Json(json!(entries)))
}

#[derive(Deserialize)]
pub(super) struct RenameRequest {
    #[serde(default)]
    root: String,
    files: Vec<RenamePair>,
}

#[derive(Deserialize)]
pub(super) struct RenamePair {
    from: String,
    to: String,
}

pub(super) async fn rename(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Json(body): Json<RenameRequest>,
) -> ApiResult<StatusCode> {
    let server = server_or_404(&state, server)?;
    blocking(&server, move |fs| {
        for pair in &body.files {
            fs.rename(
                &join(&body.root, &pair.from),
                &join(&body.root, &pair.to),
            )?;
        }
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub(super) struct CopyRequest {
    location: String,
}

pub(super) async fn copy(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Json(body): Json<CopyRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let server = server_or_404(&state, server)?;
    let name = blocking(&server, move |fs| fs.copy_file(&body.location)).await?;
    Ok(Json(json!({ "name": name })))
}

pub(super) async fn write(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Query(query): Query<FileQuery>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let server = server_or_404(&state, server)?;
    blocking(&server, move |fs| {
        let mut cursor = std::io::Cursor::new(&body);
        fs.write_file(&query.file, &mut cursor, body.len() as u64, 0o644)
            .map(|_| ())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub(super) struct CreateDirectoryRequest {
    name: String,
    #[serde(default)]
    path: String,
}

pub(super) async fn create_directory(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Json(body): Json<CreateDirectoryRequest>,
) -> ApiResult<StatusCode> {
    let server = server_or_404(&state, server)?;
    blocking(&server, move |fs| {
        fs.mkdir_all(&join(&body.path, &body.name), 0o755)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub(super) struct DeleteRequest {
    #[serde(default)]
    root: String,
    files: Vec<String>,
}

pub(super) async fn delete_files(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Json(body): Json<DeleteRequest>,
) -> ApiResult<StatusCode> {
    let server = server_or_404(&state, server)?;
    blocking(&server, move |fs| {
        for file in &body.files {
            fs.remove_all(&join(&body.root, file))?;
        }
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub(super) struct ChmodRequest {
    #[serde(default)]
    root: String,
    files: Vec<ChmodEntry>,
}

#[derive(Deserialize)]
pub(super) struct ChmodEntry {
    file: String,
    /// Octal permission string, e.g. `755`.
    mode: String,
}

pub(super) async fn chmod(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Json(body): Json<ChmodRequest>,
) -> ApiResult<StatusCode> {
    let server = server_or_404(&state, server)?;
    blocking(&server, move |fs| {
        for entry in &body.files {
            let mode = u32::from_str_radix(&entry.mode, 8)
                .map_err(|_| CommonError::invalid_input(format!("bad mode {}", entry.mode)))?;
            fs.chmod(&join(&body.root, &entry.file), mode)?;
        }
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub(super) struct CompressRequest {
    #[serde(default)]
    root: String,
    files: Vec<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_extension")]
    extension: String,
}

fn default_extension() -> String {
    "tar.gz".to_string()
}

pub(super) async fn compress(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Json(body): Json<CompressRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let server = server_or_404(&state, server)?;
    let format = ArchiveFormat::from_extension(&body.extension)
        .ok_or_else(|| CommonError::invalid_input(format!("unsupported extension {}", body.extension)))?;
    let (info, path) = blocking(&server, move |fs| {
        fs.compress_files(&body.root, body.name.as_deref(), &body.files, format)
    })
    .await?;
    Ok(Json(json!({ "path": path, "entry": info, "mimetype": format.mimetype() })))
}

#[derive(Deserialize)]
pub(super) struct DecompressRequest {
    #[serde(default)]
    root: String,
    file: String,
}

pub(super) async fn decompress(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Json(body): Json<DecompressRequest>,
) -> ApiResult<StatusCode> {
    let server = server_or_404(&state, server)?;
    blocking(&server, move |fs| fs.decompress(&body.root, &body.file)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub(super) struct SearchQuery {
    #[serde(default)]
    directory: String,
    pattern: String,
}

pub(super) async fn search(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let server = server_or_404(&state, server)?;
    let results = blocking(&server, move |fs| {
        fs.search(
            &query.directory,
            &SearchOptions {
                pattern: query.pattern.clone(),
                ..Default::default()
            },
        )
    })
    .await?;
    Ok(Json(json!({ "results": results })))
}

#[derive(Deserialize)]
pub(super) struct PullRequest {
    url: String,
    #[serde(default)]
    directory: String,
    #[serde(default)]
    file_name: Option<String>,
}

/// Downloads a remote file into the server's filesystem, bounded by the
/// per-server concurrency cap. The download itself runs in the background.
pub(super) async fn pull(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Json(body): Json<PullRequest>,
) -> ApiResult<StatusCode> {
    let server = server_or_404(&state, server)?;

    let permit = Arc::clone(server.pull_semaphore())
        .try_acquire_owned()
        .map_err(|_| CommonError::conflict("too many concurrent downloads for this server"))?;

    let url: reqwest::Url = body
        .url
        .parse()
        .map_err(|_| CommonError::invalid_input(format!("invalid url {}", body.url)))?;
    let name = body.file_name.unwrap_or_else(|| {
        url.path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("download")
            .to_string()
    });
    let dest = join(&body.directory, &name);

    tokio::spawn(async move {
        let _permit = permit;
        if let Err(err) = download_to(&server, &url, &dest).await {
            server.publish_error("remote file download failed", &err);
        }
    });
    Ok(StatusCode::ACCEPTED)
}

async fn download_to(
    server: &Arc<Server>,
    url: &reqwest::Url,
    dest: &str,
) -> Result<(), CommonError> {
    let response = reqwest::get(url.clone())
        .await
        .map_err(|e| CommonError::remote_unavailable(e.to_string()))?
        .error_for_status()
        .map_err(|e| CommonError::remote_unavailable(e.to_string()))?;

    if let Some(length) = response.content_length() {
        if !server.filesystem().can_fit(length as i64) {
            return Err(CommonError::disk_space(dest.to_string()));
        }
    }

    let fs = Arc::clone(server.filesystem());
    let mut file = {
        let dest = dest.to_string();
        tokio::task::spawn_blocking(move || fs.touch(&dest, 0o644))
            .await
            .map_err(|e| CommonError::internal(e.to_string()))??
    };

    use futures::StreamExt;
    use std::io::Write;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CommonError::remote_unavailable(e.to_string()))?;
        if !server.filesystem().can_fit(chunk.len() as i64) {
            let _ = server.filesystem().remove(dest);
            return Err(CommonError::disk_space(dest.to_string()));
        }
        file.write_all(&chunk)?;
        server.filesystem().add_disk(chunk.len() as i64);
    }
    file.flush()?;
    Ok(())
}

fn join(root: &str, name: &str) -> String {
    if root.is_empty() || root == "/" {
        name.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), name)
    }
}
