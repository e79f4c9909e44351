use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::jobs::Stage;

/// 缓存层内部错误，不会越过缓存边界
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O {operation} failed: {}: {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
        operation: &'static str,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    pub fn io(source: std::io::Error, path: impl AsRef<Path>, operation: &'static str) -> Self {
        Self::Io {
            source,
            path: path.as_ref().to_path_buf(),
            operation,
        }
    }
}

/// 外部协作方（TTS、素材、合成）返回的错误
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Provider(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Provider,
    ResourceExhausted,
    Deadline,
    Cancelled,
    Internal,
}

/// 任务终止原因，记录在任务状态中
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("{stage} failed: {message}")]
    Stage { stage: Stage, message: String },

    #[error("{stage} ran out of resources: {message}")]
    ResourceExhausted { stage: Stage, message: String },

    #[error("job exceeded its deadline of {}s", .0.as_secs())]
    DeadlineExceeded(Duration),

    #[error("job was cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn from_pipeline(stage: Stage, err: PipelineError) -> Self {
        match err {
            PipelineError::Provider(message) => Self::Stage { stage, message },
            PipelineError::ResourceExhausted(message) => Self::ResourceExhausted { stage, message },
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Stage { .. } => FailureKind::Provider,
            Self::ResourceExhausted { .. } => FailureKind::ResourceExhausted,
            Self::DeadlineExceeded(_) => FailureKind::Deadline,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Internal(_) => FailureKind::Internal,
        }
    }
}

/// 对外接口的查询类错误
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported cache scope: {0}")]
    UnknownScope(String),
}
