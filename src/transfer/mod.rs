//! Raw-TCP bulk file transfer for the legacy client, which cannot speak
//! multipart HTTP. Two listeners with a minimal line protocol:
//!
//! - download: `<api_key>\n<filename>\n` -> `OK <size>\n<bytes>` or
//!   `ERROR <reason>\n`
//! - upload: `<api_key>\n<filename>\n<size>\n<bytes>` -> `OK\n` or
//!   `ERROR <reason>\n`
//!
//! Filenames are resolved inside the transfer root; escapes are refused.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BackhaulError, Result};

pub struct TransferService {
    root: PathBuf,
    api_key: String,
    max_bytes: u64,
}

impl TransferService {
    pub fn new(root: PathBuf, api_key: String, max_bytes: u64) -> Self {
        Self {
            root,
            api_key,
            max_bytes,
        }
    }

    /// Accept loop for the download port. Each connection is handled in a
    /// spawned task; `shutdown` stops accepting.
    pub async fn serve_download(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let service = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = service.handle_download(stream).await {
                                warn!(error = %e, "download connection failed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "download accept error"),
                },
                _ = shutdown.cancelled() => {
                    info!("download listener shutting down");
                    break;
                }
            }
        }
    }

    /// Accept loop for the upload port.
    pub async fn serve_upload(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let service = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = service.handle_upload(stream).await {
                                warn!(error = %e, "upload connection failed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "upload accept error"),
                },
                _ = shutdown.cancelled() => {
                    info!("upload listener shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_download(&self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        if !self.check_api_key(&mut reader, &mut writer, "download").await? {
            return Ok(());
        }

        let filename = read_trimmed_line(&mut reader).await?;
        if filename.is_empty() {
            return refuse(&mut writer, "Empty filename").await;
        }

        info!(filename = %filename, "download request");

        let Some(path) = self.resolve_existing(&filename) else {
            warn!(filename = %filename, "download file not found");
            return refuse(&mut writer, &format!("File not found: {filename}")).await;
        };

        let size = tokio::fs::metadata(&path).await?.len();
        if size > self.max_bytes {
            warn!(filename = %filename, size, max = self.max_bytes, "download file too large");
            return refuse(
                &mut writer,
                &format!("File too large ({size} bytes, max {})", self.max_bytes),
            )
            .await;
        }

        let bytes = tokio::fs::read(&path).await?;
        writer
            .write_all(format!("OK {}\n", bytes.len()).as_bytes())
            .await?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;

        info!(filename = %filename, size = bytes.len(), "download sent");
        Ok(())
    }

    async fn handle_upload(&self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        if !self.check_api_key(&mut reader, &mut writer, "upload").await? {
            return Ok(());
        }

        let filename = read_trimmed_line(&mut reader).await?;
        if filename.is_empty() {
            return refuse(&mut writer, "Empty filename").await;
        }

        let size_line = read_trimmed_line(&mut reader).await?;
        let size: u64 = match size_line.parse() {
            Ok(size) => size,
            Err(_) => {
                warn!(size_line = %size_line, "upload invalid size");
                return refuse(&mut writer, &format!("Invalid size: {size_line}")).await;
            }
        };

        if size > self.max_bytes {
            warn!(filename = %filename, size, max = self.max_bytes, "upload file too large");
            return refuse(
                &mut writer,
                &format!("File too large ({size} bytes, max {})", self.max_bytes),
            )
            .await;
        }

        let Some(path) = self.resolve_for_write(&filename) else {
            warn!(filename = %filename, "upload rejected (path escape)");
            return refuse(&mut writer, "Path not allowed").await;
        };

        info!(filename = %filename, size, "upload receiving");

        let mut buffer = vec![0u8; size as usize];
        if let Err(e) = reader.read_exact(&mut buffer).await {
            warn!(filename = %filename, error = %e, "upload incomplete transfer");
            return refuse(&mut writer, "Incomplete transfer").await;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &buffer).await?;

        writer.write_all(b"OK\n").await?;
        writer.flush().await?;

        info!(path = %path.display(), size, "upload saved");
        Ok(())
    }

    async fn check_api_key(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        context: &str,
    ) -> Result<bool> {
        let provided = read_trimmed_line(reader).await?;
        if provided != self.api_key {
            warn!(context = %context, "auth failed: invalid API key");
            refuse(writer, "Unauthorized").await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Resolve a requested filename against the transfer root, refusing
    /// anything that escapes it. Returns `None` if the file doesn't exist.
    fn resolve_existing(&self, filename: &str) -> Option<PathBuf> {
        let path = self.confine(filename)?;
        path.is_file().then_some(path)
    }

    /// Same confinement for uploads, where the file may not exist yet.
    fn resolve_for_write(&self, filename: &str) -> Option<PathBuf> {
        self.confine(filename)
    }

    /// Reject absolute paths and any `..` component, then join to the root.
    /// Component-level checking works for not-yet-existing paths, where
    /// canonicalize would fail.
    fn confine(&self, filename: &str) -> Option<PathBuf> {
        let requested = Path::new(filename);
        if requested.is_absolute() {
            return None;
        }
        for component in requested.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    debug!(filename = %filename, "refusing path component");
                    return None;
                }
            }
        }
        Some(self.root.join(requested))
    }
}

async fn read_trimmed_line(reader: &mut BufReader<OwnedReadHalf>) -> Result<String> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(|e| BackhaulError::Transfer {
            reason: format!("read failed: {e}"),
        })?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn refuse(writer: &mut OwnedWriteHalf, reason: &str) -> Result<()> {
    writer
        .write_all(format!("ERROR {reason}\n").as_bytes())
        .await?;
    writer.flush().await?;
    Ok(())
}
