//! Event bus value types.
//!
//! Every event carries a closed `EventKind` discriminant, so subscriptions
//! dispatch on an enum instead of strings and a typo cannot create a new
//! kind silently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Length of the default run identifier attached to events.
const SESSION_ID_LEN: usize = 8;

/// Length of the per-event unique identifier.
const EVENT_ID_LEN: usize = 12;

/// Discriminant of an event. Used as the subscription key.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PostsDiscovered,
    DownloadStarted,
    DownloadProgress,
    DownloadCompleted,
    PostProcessed,
    FilterApplied,
    StageChanged,
    Error,
    Statistics,
}

/// Lifecycle phase reported by `StageChanged` events.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    Started,
    Completed,
    Failed,
}

/// Kind-specific event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    PostsDiscovered {
        post_count: usize,
        source: String,
        target: String,
    },
    DownloadStarted {
        post_id: String,
        url: String,
        filename: String,
    },
    DownloadProgress {
        post_id: String,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },
    DownloadCompleted {
        post_id: String,
        url: String,
        filename: String,
        success: bool,
        file_size: u64,
        duration: Duration,
        error_message: Option<String>,
    },
    PostProcessed {
        post_id: String,
        success: bool,
        downloads_completed: usize,
        downloads_failed: usize,
        processing_time: Duration,
        error_message: Option<String>,
    },
    FilterApplied {
        posts_before: usize,
        posts_after: usize,
        posts_filtered: usize,
        criteria: Vec<String>,
        processing_time: Duration,
    },
    StageChanged {
        stage_name: String,
        phase: StagePhase,
        execution_time: Option<Duration>,
        posts_processed: usize,
        error_message: Option<String>,
    },
    Error {
        error_type: String,
        message: String,
        stage_name: Option<String>,
        post_id: Option<String>,
        recoverable: bool,
    },
    Statistics {
        posts_discovered: u64,
        posts_filtered: u64,
        downloads_completed: u64,
        downloads_failed: u64,
        bytes_downloaded: u64,
        elapsed: Duration,
    },
}

impl EventPayload {
    /// The discriminant this payload belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::PostsDiscovered { .. } => EventKind::PostsDiscovered,
            EventPayload::DownloadStarted { .. } => EventKind::DownloadStarted,
            EventPayload::DownloadProgress { .. } => EventKind::DownloadProgress,
            EventPayload::DownloadCompleted { .. } => EventKind::DownloadCompleted,
            EventPayload::PostProcessed { .. } => EventKind::PostProcessed,
            EventPayload::FilterApplied { .. } => EventKind::FilterApplied,
            EventPayload::StageChanged { .. } => EventKind::StageChanged,
            EventPayload::Error { .. } => EventKind::Error,
            EventPayload::Statistics { .. } => EventKind::Statistics,
        }
    }
}

/// A single event on the bus.
///
/// The serialized form carries the kind under the `"kind"` key via the
/// payload tag, so the discriminant is an accessor rather than a second
/// stored copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    /// Identifies the run this event belongs to. Defaults to a short random
    /// id; the pipeline replaces it with the persisted session id.
    pub session_id: String,
    /// Unique per event.
    pub event_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        Self {
            timestamp: Utc::now(),
            session_id: simple[..SESSION_ID_LEN].to_string(),
            event_id: uuid::Uuid::new_v4().simple().to_string()[..EVENT_ID_LEN].to_string(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Human-readable one-line description.
    pub fn description(&self) -> String {
        match &self.payload {
            EventPayload::PostsDiscovered {
                post_count,
                source,
                target,
            } => format!("Discovered {post_count} posts from {source} for {target}"),
            EventPayload::DownloadStarted { filename, .. } => {
                format!("Downloading {filename}")
            }
            EventPayload::DownloadProgress {
                bytes_downloaded,
                total_bytes,
                ..
            } => match total_bytes {
                Some(total) => format!("Downloaded {bytes_downloaded}/{total} bytes"),
                None => format!("Downloaded {bytes_downloaded} bytes"),
            },
            EventPayload::DownloadCompleted {
                filename,
                success,
                file_size,
                ..
            } => {
                if *success {
                    format!("Finished {filename} ({file_size} bytes)")
                } else {
                    format!("Failed to download {filename}")
                }
            }
            EventPayload::PostProcessed {
                post_id, success, ..
            } => {
                if *success {
                    format!("Processed post {post_id}")
                } else {
                    format!("Failed to process post {post_id}")
                }
            }
            EventPayload::FilterApplied {
                posts_before,
                posts_after,
                ..
            } => format!("Filtered posts {posts_before} -> {posts_after}"),
            EventPayload::StageChanged {
                stage_name, phase, ..
            } => format!("Stage {stage_name} {phase}"),
            EventPayload::Error {
                error_type, message, ..
            } => format!("{error_type}: {message}"),
            EventPayload::Statistics {
                downloads_completed,
                downloads_failed,
                ..
            } => format!(
                "Run statistics: {downloads_completed} downloads completed, {downloads_failed} failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn payload_kind_matches_event_kind() {
        let event = Event::new(EventPayload::PostsDiscovered {
            post_count: 3,
            source: "json".into(),
            target: "spez".into(),
        });
        assert_eq!(event.kind(), EventKind::PostsDiscovered);
        assert_eq!(event.session_id.len(), 8);
        assert_eq!(event.event_id.len(), 12);
    }

    #[test]
    fn serialized_form_tags_the_kind_once() {
        let event = Event::new(EventPayload::DownloadStarted {
            post_id: "p1".into(),
            url: "https://example.com/a.jpg".into(),
            filename: "a.jpg".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "download_started");
        assert_eq!(json["post_id"], "p1");
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), EventKind::DownloadStarted);
    }

    #[test]
    fn kind_names_round_trip_through_strum() {
        for kind in EventKind::iter() {
            let name = kind.to_string();
            assert_eq!(name.parse::<EventKind>().unwrap(), kind);
        }
        assert_eq!(EventKind::PostsDiscovered.to_string(), "posts_discovered");
    }

    #[test]
    fn event_ids_are_unique() {
        let a = Event::new(EventPayload::Error {
            error_type: "io".into(),
            message: "boom".into(),
            stage_name: None,
            post_id: None,
            recoverable: true,
        });
        let b = Event::new(EventPayload::Error {
            error_type: "io".into(),
            message: "boom".into(),
            stage_name: None,
            post_id: None,
            recoverable: true,
        });
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn with_session_overrides_the_run_id() {
        let event = Event::new(EventPayload::FilterApplied {
            posts_before: 10,
            posts_after: 4,
            posts_filtered: 6,
            criteria: vec!["min_score>=5".into()],
            processing_time: Duration::from_millis(3),
        })
        .with_session("abc123");
        assert_eq!(event.session_id, "abc123");
    }
}
