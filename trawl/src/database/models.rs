//! Row models and status enums for the session store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::post::Post;

/// Lifecycle of a session.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Completed and failed sessions never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

/// Lifecycle of a post within a session.
///
/// Transitions are monotonic: a pending post may become processed, skipped
/// or failed; those states are terminal. Re-marking with the same status is
/// an idempotent no-op.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Pending,
    Processed,
    Skipped,
    Failed,
}

impl PostStatus {
    pub fn can_transition(self, to: PostStatus) -> bool {
        self == to || self == PostStatus::Pending
    }
}

/// Lifecycle of a single media download.
///
/// One-directional: pending -> in_progress -> completed | failed. A retry
/// reuses the row through failed -> in_progress. Completed rows only move
/// again when integrity repair marks a vanished file failed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn can_transition(self, to: DownloadStatus) -> bool {
        match to {
            DownloadStatus::Pending => self == DownloadStatus::Pending,
            DownloadStatus::InProgress => {
                matches!(self, DownloadStatus::Pending | DownloadStatus::Failed)
            }
            DownloadStatus::Completed => self == DownloadStatus::InProgress,
            DownloadStatus::Failed => true,
        }
    }
}

/// Session row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub target_type: String,
    pub target_value: String,
    pub config_hash: String,
    pub status: SessionStatus,
    /// RFC 3339 timestamp.
    pub created_at: String,
    /// RFC 3339 timestamp.
    pub updated_at: String,
    /// RFC 3339 timestamp, set once the session reaches a terminal status.
    pub ended_at: Option<String>,
}

impl SessionRecord {
    pub fn new(
        target_type: impl Into<String>,
        target_value: impl Into<String>,
        config_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target_type: target_type.into(),
            target_value: target_value.into(),
            config_hash: config_hash.into(),
            status: SessionStatus::Active,
            created_at: now.clone(),
            updated_at: now,
            ended_at: None,
        }
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn age_hours(&self) -> Option<f64> {
        self.created_at_utc()
            .map(|t| (Utc::now() - t).num_seconds() as f64 / 3600.0)
    }
}

/// Post row. The work item itself travels as JSON in `payload`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: String,
    pub session_id: String,
    pub status: PostStatus,
    pub attempts: i64,
    pub error: Option<String>,
    pub payload: String,
    pub created_at: String,
    pub updated_at: String,
}

impl PostRecord {
    /// Deserialize the stored work item.
    pub fn post(&self) -> Result<Post> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Download row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: i64,
    pub session_id: String,
    pub post_id: String,
    pub url: String,
    pub path: String,
    pub status: DownloadStatus,
    pub file_size: Option<i64>,
    pub checksum: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// Typed metadata value stored as `(value, value_type)`.
///
/// `Json` must stay the last variant so untagged deserialization only
/// reaches it when nothing simpler matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Boolean(bool),
    Number(f64),
    Text(String),
    Json(serde_json::Value),
}

impl MetadataValue {
    pub fn value_type(&self) -> &'static str {
        match self {
            MetadataValue::Text(_) => "string",
            MetadataValue::Number(_) => "number",
            MetadataValue::Boolean(_) => "boolean",
            MetadataValue::Json(_) => "json",
        }
    }

    /// Storage form of the value.
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            MetadataValue::Text(s) => s.clone(),
            MetadataValue::Number(n) => n.to_string(),
            MetadataValue::Boolean(b) => b.to_string(),
            MetadataValue::Json(v) => serde_json::to_string(v)?,
        })
    }

    /// Rebuild a value from its storage form.
    pub fn decode(value_type: &str, raw: &str) -> Result<Self> {
        match value_type {
            "string" => Ok(MetadataValue::Text(raw.to_string())),
            "number" => raw
                .parse::<f64>()
                .map(MetadataValue::Number)
                .map_err(|_| Error::validation(format!("invalid number metadata: {raw}"))),
            "boolean" => match raw {
                "true" => Ok(MetadataValue::Boolean(true)),
                "false" => Ok(MetadataValue::Boolean(false)),
                other => Err(Error::validation(format!(
                    "invalid boolean metadata: {other}"
                ))),
            },
            "json" => Ok(MetadataValue::Json(serde_json::from_str(raw)?)),
            other => Err(Error::validation(format!(
                "unknown metadata value type: {other}"
            ))),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Number(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Number(value as f64)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Boolean(value)
    }
}

impl From<serde_json::Value> for MetadataValue {
    fn from(value: serde_json::Value) -> Self {
        MetadataValue::Json(value)
    }
}

/// Per-status post counts for one session.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResumeCounts {
    pub total: i64,
    pub pending: i64,
    pub processed: i64,
    pub skipped: i64,
    pub failed: i64,
}

/// Everything needed to decide whether and how a session resumes.
///
/// Derived purely from current row statuses.
#[derive(Debug, Clone, Serialize)]
pub struct ResumeState {
    pub session: SessionRecord,
    pub pending_posts: Vec<PostRecord>,
    pub failed_downloads: Vec<DownloadRecord>,
    pub counts: ResumeCounts,
    pub can_resume: bool,
}

/// Result of a database self-check.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub ok: bool,
    pub issues: Vec<String>,
    pub sessions: i64,
    pub posts: i64,
    pub downloads: i64,
    pub metadata_rows: i64,
}

/// All metadata for a session, keyed by name.
pub type MetadataMap = HashMap<String, MetadataValue>;
