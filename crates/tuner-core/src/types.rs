use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrainingJobId(pub String);

/// Identifier assigned by the remote job orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteJobId(pub String);

macro_rules! display_newtype {
    ($($t:ty),*) => {
        $(impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        })*
    };
}

display_newtype!(DatasetId, OwnerId, ImageId, TrainingJobId, RemoteJobId);

impl OwnerId {
    /// An empty subject means the caller never authenticated.
    pub fn is_authenticated(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub owner: OwnerId,
    pub name: String,
    pub description: Option<String>,
    pub created_unix_time_ms: u64,
    pub updated_unix_time_ms: u64,
    pub bucket: String,
    /// Key prefix the sync worker mirrors, `datasets/<id>/data`.
    pub prefix: String,
    pub object_count: u64,
    pub byte_count: u64,
    pub last_synced_unix_time_ms: Option<u64>,
    pub last_synced_path: Option<String>,
}

impl Dataset {
    pub fn is_owned_by(&self, owner: &OwnerId) -> bool {
        self.owner == *owner
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetImage {
    pub id: ImageId,
    pub dataset_id: DatasetId,
    pub owner: OwnerId,
    pub key: String,
    pub bucket: String,
    pub bytes: u64,
    pub content_type: String,
    pub created_unix_time_ms: u64,
}

impl DatasetImage {
    pub fn is_caption(&self) -> bool {
        self.content_type == "text/plain"
    }
}

/// Status of a training job as last reported by the orchestrator.
///
/// The remote side owns the state machine
/// (`queued -> running -> succeeded | failed | cancelled`); we only observe it. Spellings we do not recognise are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Unknown,
    Queued,
    Running,
    Succeeded,
    Failed,
    /// Stopped before finishing, by the user or the orchestrator.
    Cancelled,
    Other(String),
}

impl JobStatus {
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim();
        if s.is_empty() {
            return JobStatus::Unknown;
        }
        match s.to_ascii_lowercase().as_str() {
            "unknown" => JobStatus::Unknown,
            "queued" | "in_queue" | "pending" => JobStatus::Queued,
            "running" | "in_progress" => JobStatus::Running,
            "succeeded" | "completed" | "complete" | "success" => JobStatus::Succeeded,
            "failed" | "error" | "timed_out" => JobStatus::Failed,
            "cancelled" | "canceled" | "stopped" => JobStatus::Cancelled,
            _ => JobStatus::Other(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Unknown => "unknown",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Other(s) => s.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl From<String> for JobStatus {
    fn from(value: String) -> Self {
        JobStatus::parse(&value)
    }
}

impl From<JobStatus> for String {
    fn from(value: JobStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingJob {
    pub id: TrainingJobId,
    pub dataset_id: DatasetId,
    pub owner: OwnerId,
    pub remote_job_id: Option<RemoteJobId>,
    pub remote_job_name: Option<String>,
    pub status: JobStatus,
    pub gpu_ids: Vec<u32>,
    pub created_unix_time_ms: u64,
    pub updated_unix_time_ms: u64,
    pub last_status_sync_unix_time_ms: Option<u64>,
    pub sample_paths: Vec<String>,
    pub checkpoint_paths: Vec<String>,
}
