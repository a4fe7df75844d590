//! Transfer task types and lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for a transfer task.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidTaskId(e.to_string()))
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transfer task state.
///
/// ```text
/// initialized -> checking -> uploading <-> paused
///                   |            |
///                   |            v
///                   +------> completed <- merging
/// ```
///
/// Every active state may also move to `failed`; every non-terminal state
/// may move to `canceled`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Initialized,
    Checking,
    Uploading,
    Paused,
    Merging,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Initialized,
        TaskStatus::Checking,
        TaskStatus::Uploading,
        TaskStatus::Paused,
        TaskStatus::Merging,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Checking => "checking",
            Self::Uploading => "uploading",
            Self::Paused => "paused",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Check if the task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Check if the task is still in flight.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Check if chunks may be uploaded and recorded in this state.
    ///
    /// Pause is cooperative: chunks already sent while paused are still
    /// accepted, only the merge is held back.
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, Self::Uploading | Self::Paused)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Initialized, Checking) => true,
            (Checking, Uploading) => true,
            // Duplicate content short-circuit.
            (Checking, Completed) => true,
            (Uploading, Merging) => true,
            (Uploading, Paused) | (Paused, Uploading) => true,
            (Merging, Completed) => true,
            (from, Failed) => from.is_active(),
            (from, Canceled) => from.is_active(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownStatus(s.to_string()))
    }
}

/// The fixed chunk layout of a file, declared at init.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
}

impl ChunkPlan {
    /// Build and validate a plan.
    ///
    /// The declared chunk count must equal `ceil(total_size / chunk_size)`.
    pub fn new(
        total_size: u64,
        chunk_size: u64,
        total_chunks: u32,
        max_chunk_size: u64,
    ) -> crate::Result<Self> {
        if total_size == 0 {
            return Err(crate::Error::InvalidPlan("file size must be greater than 0".into()));
        }
        if chunk_size == 0 || chunk_size > max_chunk_size {
            return Err(crate::Error::InvalidChunkSize {
                size: chunk_size,
                max: max_chunk_size,
            });
        }
        let expected = total_size.div_ceil(chunk_size);
        if u64::from(total_chunks) != expected {
            return Err(crate::Error::InvalidPlan(format!(
                "{total_chunks} chunks declared, {total_size} bytes at {chunk_size} per chunk needs {expected}"
            )));
        }
        Ok(Self {
            total_size,
            chunk_size,
            total_chunks,
        })
    }

    /// Expected byte length of chunk `index`, or `None` when out of range.
    ///
    /// Every chunk is `chunk_size` long except the last, which holds the
    /// remainder.
    pub fn expected_len(&self, index: u32) -> Option<u64> {
        if index >= self.total_chunks {
            return None;
        }
        if index + 1 == self.total_chunks {
            Some(self.total_size - self.chunk_size * u64::from(index))
        } else {
            Some(self.chunk_size)
        }
    }

    /// Provider part number (1-based) for a chunk index (0-based).
    pub fn part_number(index: u32) -> u32 {
        index + 1
    }
}

/// A resumable chunked transfer of one file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferTask {
    pub task_id: TaskId,
    pub user_id: String,
    pub file_name: String,
    /// Storage key the merged object will live under.
    pub object_key: String,
    /// Provider multipart handle, set once the task leaves `checking`.
    pub upload_id: Option<String>,
    pub total_size: u64,
    /// SHA-256 of the whole file (lowercase hex).
    pub content_hash: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    /// Last synchronized count of recorded chunks. The ledger is authoritative.
    pub uploaded_chunks: u32,
    pub mime_type: Option<String>,
    pub platform: String,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl TransferTask {
    /// Create a new task in `initialized` state.
    pub fn new(
        user_id: impl Into<String>,
        file_name: impl Into<String>,
        plan: ChunkPlan,
        content_hash: impl Into<String>,
        mime_type: Option<String>,
        platform: impl Into<String>,
        retention: time::Duration,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        let task_id = TaskId::new();
        let user_id = user_id.into();
        let file_name = file_name.into();
        let object_key = object_key_for(&user_id, task_id, &file_name, now);
        Self {
            task_id,
            user_id,
            file_name,
            object_key,
            upload_id: None,
            total_size: plan.total_size,
            content_hash: content_hash.into(),
            chunk_size: plan.chunk_size,
            total_chunks: plan.total_chunks,
            uploaded_chunks: 0,
            mime_type,
            platform: platform.into(),
            status: TaskStatus::Initialized,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            expires_at: now + retention,
        }
    }

    pub fn plan(&self) -> ChunkPlan {
        ChunkPlan {
            total_size: self.total_size,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
        }
    }

    /// Check if the task's retention window has passed.
    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() > self.expires_at
    }
}

/// Build the storage key for a task: `{user}/{YYYY-MM-DD}/{task_id}-{name}`.
///
/// The file name is reduced to a single safe path segment.
pub fn object_key_for(user_id: &str, task_id: TaskId, file_name: &str, at: OffsetDateTime) -> String {
    let date = at.date();
    format!(
        "{}/{:04}-{:02}-{:02}/{}-{}",
        sanitize_segment(user_id),
        date.year(),
        u8::from(date.month()),
        date.day(),
        task_id,
        sanitize_segment(file_name)
    )
}

fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Truncate a failure message to the persisted limit on a char boundary.
pub fn truncate_error_message(message: &str) -> String {
    if message.len() <= crate::MAX_ERROR_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = crate::MAX_ERROR_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
