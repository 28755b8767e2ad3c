use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum BackhaulError {
    #[error("admission failed for {id}: waiter or work item already registered")]
    Admission { id: String },

    #[error("waiter for {id} dropped without delivering a result")]
    WaiterLost { id: String },

    #[error("config parse error in {path}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    #[error("path escapes transfer root: {path}")]
    PathEscape { path: String },

    #[error("bundle error: {reason}")]
    Bundle { reason: String },

    #[error("transfer error: {reason}")]
    Transfer { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackhaulError>;
