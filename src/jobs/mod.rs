mod pipeline;
mod scheduler;
mod worker;

pub use pipeline::*;
pub use scheduler::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{FailureKind, JobError, ServiceError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Initializing,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// 工作流程的三个阶段，按顺序执行
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Audio,
    Media,
    Composition,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio synthesis",
            Self::Media => "background media",
            Self::Composition => "video composition",
        })
    }
}

/// 视频请求：圣训内容（必须带非空 text），其余字段原样参与指纹
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoRequest(Value);

impl VideoRequest {
    pub fn new(hadith: Value) -> Result<Self, ServiceError> {
        if !hadith.is_object() {
            return Err(ServiceError::InvalidRequest("hadith payload must be an object".into()));
        }
        let has_text = hadith
            .get("text")
            .and_then(Value::as_str)
            .is_some_and(|text| !text.trim().is_empty());
        if !has_text {
            return Err(ServiceError::InvalidRequest("hadith text is missing or empty".into()));
        }
        Ok(Self(hadith))
    }

    pub fn text(&self) -> &str {
        self.0.get("text").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn payload(&self) -> &Value {
        &self.0
    }

    pub fn fingerprint(&self) -> String {
        crate::cache::fingerprint(&self.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub video_type: Option<String>,
    pub use_ai_voice: bool,
    pub use_ai_background: bool,
    pub enhance_locally: bool,
    pub custom_prompt: String,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            video_type: None,
            use_ai_voice: true,
            use_ai_background: false,
            enhance_locally: true,
            custom_prompt: String::new(),
        }
    }
}

/// 任务记录；轮询时返回其副本
#[derive(Clone, Debug, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub start_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl JobSnapshot {
    fn new(job_id: String) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            status: JobStatus::Initializing,
            progress: 0,
            message: "queued for generation".to_string(),
            start_time: now,
            updated_at: now,
            result: None,
            error: None,
            failure_kind: None,
        }
    }

    /// 终止状态之后不再变化，进度只增不减
    fn advance(&mut self, progress: u8, message: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Processing;
        self.progress = self.progress.max(progress.min(100));
        self.message = message.to_string();
        self.updated_at = Utc::now();
        true
    }

    fn complete(&mut self, result: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.message = "video ready".to_string();
        self.result = Some(result.to_string());
        self.updated_at = Utc::now();
        true
    }

    fn fail(&mut self, err: &JobError) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = match err {
            JobError::Cancelled => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        };
        self.message = format!("failed: {err}");
        self.error = Some(err.to_string());
        self.failure_kind = Some(err.kind());
        self.updated_at = Utc::now();
        true
    }

    fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Cancelled;
        self.message = "job cancelled".to_string();
        self.failure_kind = Some(FailureKind::Cancelled);
        self.updated_at = Utc::now();
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitState {
    /// 新任务已进入工作池
    Submitted,
    /// 命中结果缓存，没有创建任务
    Completed,
    /// 同一指纹已有进行中的任务，返回该任务
    Attached,
}

#[derive(Clone, Debug, Serialize)]
pub struct SubmitOutcome {
    pub job_id: Option<String>,
    pub status: SubmitState,
    pub cached: bool,
    /// 并入了同指纹的进行中任务
    pub deduplicated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

// 时间戳 + pid + 进程内序号，同一秒内并发提交也不会重复
fn next_job_id() -> String {
    format!(
        "job_{}_{}_{}",
        Utc::now().timestamp(),
        std::process::id(),
        JOB_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}
