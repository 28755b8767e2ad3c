//! File-operation broker: list/read/write requests executed remotely by the
//! polling client, plus the synchronous directory-bundling capability.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::approval::{ApprovalGate, TOOL_WRITE};
use crate::broker::{Broker, SubmitOutcome, WorkItem};
use crate::error::{BackhaulError, Result};

/// Default ceiling applied to `read_file` content when the caller gives none.
pub const DEFAULT_MAX_READ_SIZE: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperationKind {
    List,
    Read,
    Write,
}

impl std::fmt::Display for FileOperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileOperationKind::List => write!(f, "list"),
            FileOperationKind::Read => write!(f, "read"),
            FileOperationKind::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOpPayload {
    pub operation: FileOperationKind,
    pub path: String,
    /// Present for writes only.
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size: u64,
}

/// Outcome reported by the remote executor for one file operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOpResult {
    #[serde(default)]
    pub op_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<FileEntry>>,
}

/// A successful `read_file`, after the size ceiling was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub content: String,
    pub truncated: bool,
    pub total_size: usize,
}

pub struct FileOpBroker {
    engine: Broker<FileOpPayload, FileOpResult>,
    approvals: Arc<ApprovalGate>,
    /// Budget for reads and lists.
    read_timeout: Duration,
    /// Budget for writes; also covers the human-approval wait, so it is the
    /// longer of the two.
    write_timeout: Duration,
    max_read_size: usize,
    transfer_root: PathBuf,
}

impl FileOpBroker {
    pub fn new(
        engine: Broker<FileOpPayload, FileOpResult>,
        approvals: Arc<ApprovalGate>,
        read_timeout: Duration,
        write_timeout: Duration,
        max_read_size: usize,
        transfer_root: PathBuf,
    ) -> Self {
        Self {
            engine,
            approvals,
            read_timeout,
            write_timeout,
            max_read_size,
            transfer_root,
        }
    }

    async fn queue_operation(
        &self,
        payload: FileOpPayload,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Option<FileOpResult> {
        let operation = payload.operation;
        let path = payload.path.clone();
        info!(operation = %operation, path = %path, "queued file operation");

        match self.engine.submit(payload, timeout, cancel).await {
            Ok(SubmitOutcome::Completed(result)) => Some(result),
            Ok(SubmitOutcome::TimedOut) | Ok(SubmitOutcome::Cancelled) => None,
            Err(err) => {
                warn!(operation = %operation, path = %path, error = %err, "failed to queue file operation");
                None
            }
        }
    }

    /// List a remote directory. `None` means timeout/cancellation; a result
    /// carrying an error string is a remote-reported failure, passed through.
    pub async fn list_directory(&self, path: &str, cancel: CancellationToken) -> Option<FileOpResult> {
        let payload = FileOpPayload {
            operation: FileOperationKind::List,
            path: path.to_string(),
            content: None,
        };
        self.queue_operation(payload, self.read_timeout, cancel).await
    }

    /// Read a remote file, truncating the returned content to `max_size`
    /// characters (default ceiling otherwise). Remote errors surface as
    /// `None`, same as a timeout.
    pub async fn read_file(
        &self,
        path: &str,
        max_size: Option<usize>,
        cancel: CancellationToken,
    ) -> Option<FileContent> {
        let payload = FileOpPayload {
            operation: FileOperationKind::Read,
            path: path.to_string(),
            content: None,
        };
        let result = self.queue_operation(payload, self.read_timeout, cancel).await?;
        if result.error.is_some() {
            return None;
        }

        let content = result.content.unwrap_or_default();
        let limit = max_size.unwrap_or(self.max_read_size);
        let total = content.chars().count();

        if total > limit {
            Some(FileContent {
                content: content.chars().take(limit).collect(),
                truncated: true,
                total_size: total,
            })
        } else {
            Some(FileContent {
                content,
                truncated: false,
                total_size: total,
            })
        }
    }

    /// Write a remote file. With a session attached the write first passes
    /// the approval gate; a rejection returns `false` without the write ever
    /// becoming visible to pollers. Success is a result with no error set.
    pub async fn write_file(
        &self,
        path: &str,
        content: &str,
        session_id: Option<&str>,
        cancel: CancellationToken,
    ) -> bool {
        if let Some(sid) = session_id {
            let description = format!("Write {} bytes to {}", content.len(), path);
            let approved = self
                .approvals
                .request_approval(sid, TOOL_WRITE, &description, self.write_timeout, cancel.clone())
                .await;
            if !approved {
                warn!(path = %path, "write rejected by user");
                return false;
            }
        }

        let payload = FileOpPayload {
            operation: FileOperationKind::Write,
            path: path.to_string(),
            content: Some(content.to_string()),
        };
        match self.queue_operation(payload, self.write_timeout, cancel).await {
            Some(result) => result.error.is_none(),
            None => false,
        }
    }

    /// Claim the oldest pending operation for the polling executor.
    pub fn poll_pending_operation(&self) -> Option<WorkItem<FileOpPayload>> {
        let item = self.engine.poll_next()?;
        info!(
            id = %item.id,
            operation = %item.payload.operation,
            path = %item.payload.path,
            "dispatched file operation to client"
        );
        Some(item)
    }

    /// Record a result posted by the executor and wake the waiting caller.
    /// Results with an empty identifier are ignored.
    pub fn submit_result(&self, result: FileOpResult) {
        if result.op_id.is_empty() {
            return;
        }

        info!(
            id = %result.op_id,
            error = result.error.as_deref().unwrap_or("none"),
            "file operation result received"
        );

        let id = result.op_id.clone();
        self.engine.complete(&id, result);
    }

    /// Archive a server-local directory into the transfer staging root so the
    /// legacy client can fetch it over the bulk-download port. Synchronous:
    /// no remote counterpart, hence no rendezvous.
    pub fn create_bundle(&self, source_path: &str, output_name: Option<&str>) -> Result<(PathBuf, u64)> {
        let file_name = sanitize_bundle_name(output_name);

        let requested = Path::new(source_path);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.transfer_root.join(requested)
        };

        let root = self.transfer_root.canonicalize()?;
        let source = joined.canonicalize().map_err(|_| BackhaulError::PathEscape {
            path: source_path.to_string(),
        })?;
        if !source.starts_with(&root) {
            warn!(path = %source_path, "bundle rejected (path escape)");
            return Err(BackhaulError::PathEscape {
                path: source_path.to_string(),
            });
        }
        if !source.is_dir() {
            return Err(BackhaulError::Bundle {
                reason: format!("source is not a directory: {}", source.display()),
            });
        }

        let output_path = root.join(&file_name);
        let file = std::fs::File::create(&output_path)?;
        let encoder = GzEncoder::new(file, Compression::fast());
        let mut archive = tar::Builder::new(encoder);
        archive
            .append_dir_all("", &source)
            .map_err(|e| BackhaulError::Bundle {
                reason: format!("failed to archive {}: {}", source.display(), e),
            })?;
        let encoder = archive.into_inner().map_err(|e| BackhaulError::Bundle {
            reason: e.to_string(),
        })?;
        encoder.finish().map_err(|e| BackhaulError::Bundle {
            reason: e.to_string(),
        })?;

        let size = std::fs::metadata(&output_path)?.len();
        info!(
            output = %output_path.display(),
            size,
            source = %source.display(),
            "created bundle"
        );
        Ok((output_path, size))
    }

    pub fn stats(&self) -> crate::broker::BrokerStats {
        self.engine.stats()
    }
}

/// Strip any directory components from a requested bundle name; fall back to
/// a default when the remainder is empty or hidden.
fn sanitize_bundle_name(output_name: Option<&str>) -> String {
    let fallback = "bundle.tar.gz";
    let candidate = output_name.unwrap_or(fallback);
    match Path::new(candidate).file_name().and_then(|n| n.to_str()) {
        Some(name) if !name.is_empty() && !name.starts_with('.') => name.to_string(),
        _ => fallback.to_string(),
    }
}
