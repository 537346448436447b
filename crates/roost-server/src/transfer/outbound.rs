//! Outbound transfer: stream archive + backups + install log to a peer.

use std::io::Write;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use roost_env::ProcessState;
use roost_fs::{Archive, CompressionLevel, IgnoreSet};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use uuid::Uuid;

use super::{Transfer, TransferStatus};
use crate::{CommonError, PowerAction, Result, Server};

impl Server {
    /// Starts an outbound transfer to a peer daemon. Only one transfer per
    /// server may be in flight.
    pub async fn transfer_to(
        self: &Arc<Self>,
        peer_url: String,
        token: String,
        backups: Vec<Uuid>,
    ) -> Result<Arc<Transfer>> {
        {
            let mut slot = self.transfer.lock().await;
            if slot.is_some() || self.is_transferring() {
                return Err(CommonError::conflict("a transfer is already in progress"));
            }
            let transfer = Transfer::new(Arc::clone(self), peer_url, token, backups);
            *slot = Some(Arc::clone(&transfer));

            let task = Arc::clone(&transfer);
            tokio::spawn(async move {
                let server = Arc::clone(task.server());
                let result = tokio::select! {
                    () = task.cancel.cancelled() => Err(CommonError::Cancelled),
                    result = task.run() => result,
                };

                match result {
                    Ok(()) => {
                        task.set_status(TransferStatus::Completed);
                        task.send_message("Transfer completed successfully.");
                    }
                    Err(err) => {
                        if task.status() != TransferStatus::Cancelled {
                            task.set_status(TransferStatus::Failed);
                        }
                        server.publish_error("transfer to peer failed", &err);
                        if let Err(report) = server
                            .remote()
                            .set_transfer_status(server.id(), false)
                            .await
                        {
                            tracing::warn!(server = %server.id(), error = %report, "failed to report transfer failure");
                        }
                    }
                }
                server.set_transferring(false);
                server.transfer.lock().await.take();
            });

            Ok(Arc::clone(slot.as_ref().expect("just stored")))
        }
    }

    /// The in-flight transfer, if any.
    pub async fn current_transfer(&self) -> Option<Arc<Transfer>> {
        self.transfer.lock().await.clone()
    }
}

impl Transfer {
    async fn run(self: &Arc<Self>) -> Result<()> {
        let server = Arc::clone(self.server());

        self.send_message("Preparing to stream server data to destination...");
        self.set_status(TransferStatus::Processing);

        // A transfer always starts from a stopped server. A stop that does
        // not finish inside the window is escalated to a kill below.
        if server.state() != ProcessState::Offline {
            match server
                .handle_power_action(PowerAction::Stop, Some(Duration::from_secs(15)))
                .await
            {
                Ok(()) | Err(CommonError::AlreadyStopped) | Err(CommonError::Timeout(_)) => {}
                Err(err) => return Err(err),
            }
            server
                .environment()
                .wait_for_stop(Duration::from_secs(60), true)
                .await
                .map_err(CommonError::from)?;
        }
        server.set_transferring(true);

        let size = {
            let fs = Arc::clone(server.filesystem());
            tokio::task::spawn_blocking(move || fs.disk_usage(true))
                .await
                .map_err(|e| CommonError::internal(e.to_string()))??
        };
        self.progress().set_total(size);

        // Progress report every five seconds while the stream runs.
        let ticker = Arc::clone(self);
        let tick_guard = self.cancel.child_token();
        let tick_stop = tick_guard.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.tick().await;
            loop {
                tokio::select! {
                    () = tick_stop.cancelled() => return,
                    _ = interval.tick() => {
                        let message = format!("Uploading {}", ticker.progress().bar(25));
                        ticker.send_message(&message);
                    }
                }
            }
        });

        let result = self.push_archive().await;
        tick_guard.cancel();
        result
    }

    /// Streams the multipart body: `archive`, its checksum, each selected
    /// backup with its checksum, then the install log (best-effort).
    async fn push_archive(self: &Arc<Self>) -> Result<()> {
        let server = Arc::clone(self.server());

        self.send_message("Streaming archive to destination...");

        let mut form = reqwest::multipart::Form::new();

        // -- archive ---------------------------------------------------
        let (writer, reader) = tokio::io::duplex(256 * 1024);
        let (sum_tx, sum_rx) = oneshot::channel::<String>();
        let stop = Arc::new(AtomicBool::new(false));
        {
            let stop = Arc::clone(&stop);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                stop.store(true, std::sync::atomic::Ordering::Relaxed);
            });
        }

        let fs = Arc::clone(server.filesystem());
        let progress = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let result = (|| {
                let ignore = IgnoreSet::for_server(&fs, "")?;
                let archive = Archive::new(&fs).with_ignore(ignore).with_stop_flag(stop);
                let mut hasher = Sha256::new();
                let sink = HashingWriter {
                    inner: SyncIoBridge::new(writer),
                    hasher: &mut hasher,
                    progress: Some(&progress),
                };
                archive.stream(sink, CompressionLevel::BestSpeed)?;
                let _ = sum_tx.send(hex::encode(hasher.finalize()));
                Ok::<(), CommonError>(())
            })();
            if let Err(err) = result {
                // Dropping the checksum sender fails the multipart body,
                // which unwinds the request on the async side.
                tracing::error!(error = %err, "failed streaming transfer archive");
            }
        });

        form = form.part(
            "archive",
            reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(ReaderStream::new(reader)))
                .file_name("archive.tar.gz"),
        );
        form = form.part("checksum_archive", pending_text_part(sum_rx));

        // -- backups ---------------------------------------------------
        let backup_dir = server.node().backup_dir.join(server.id().to_string());
        let mut streamed = 0usize;
        for backup in &self.backups {
            let path = backup_dir.join(format!("{backup}.tar.gz"));
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(err) => {
                    tracing::debug!(backup = %backup, error = %err, "backup not found locally, skipping");
                    continue;
                }
            };
            streamed += 1;
            if let Ok(meta) = file.metadata().await {
                self.progress().add_total(meta.len());
            }

            let (tx, rx) = oneshot::channel::<String>();
            let stream = HashedFileStream {
                inner: ReaderStream::new(file),
                hasher: Some(Sha256::new()),
                checksum: Some(tx),
            };
            let field = format!("backup_{backup}.tar.gz");
            form = form.part(
                field.clone(),
                reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(stream))
                    .file_name(format!("{backup}.tar.gz")),
            );
            form = form.part(format!("checksum_{field}"), pending_text_part(rx));
        }
        if streamed > 0 {
            self.send_message(&format!("Streaming {streamed} backup files to destination..."));
        }

        // -- install log (best-effort) ---------------------------------
        let log_path = server.node().install_log_path(server.id());
        if let Ok(file) = tokio::fs::File::open(&log_path).await {
            form = form.part(
                "install_logs",
                reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(ReaderStream::new(
                    file,
                )))
                .file_name("install.log"),
            );
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CommonError::internal(e.to_string()))?;
        let response = client
            .post(&self.peer_url)
            .header(reqwest::header::AUTHORIZATION, &self.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| CommonError::remote_unavailable(format!("peer daemon: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CommonError::remote_unavailable(format!(
                "unexpected status code from destination: {status}: {body}"
            )));
        }

        self.send_message("Finished streaming archive and backups to destination.");
        Ok(())
    }
}

/// Part whose body becomes available only after an upstream stream has
/// finished (the checksum of the part streamed just before it). The
/// multipart writer reads parts in order, so by the time this part is
/// polled the sender side has finalized the digest.
fn pending_text_part(rx: oneshot::Receiver<String>) -> reqwest::multipart::Part {
    let stream = futures::stream::once(async move {
        rx.await
            .map(Bytes::from)
            .map_err(|_| std::io::Error::other("checksum was never computed"))
    });
    reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(stream))
}

/// Blocking writer tee: bytes go to the duplex pipe and the hasher, and
/// count toward transfer progress.
struct HashingWriter<'h, W: Write> {
    inner: W,
    hasher: &'h mut Sha256,
    progress: Option<&'h Arc<Transfer>>,
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        if let Some(progress) = self.progress {
            progress.progress().add(n as u64);
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Async stream tee for backup files: hashes chunks as they pass and sends
/// the hex digest when the file is exhausted.
struct HashedFileStream {
    inner: ReaderStream<tokio::fs::File>,
    hasher: Option<Sha256>,
    checksum: Option<oneshot::Sender<String>>,
}

impl Stream for HashedFileStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(hasher) = self.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => {
                if let (Some(hasher), Some(tx)) = (self.hasher.take(), self.checksum.take()) {
                    let _ = tx.send(hex::encode(hasher.finalize()));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
