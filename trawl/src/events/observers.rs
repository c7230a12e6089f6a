//! Event observers.
//!
//! Observers receive events from the emitter on their own tasks. A failing
//! observer never affects delivery to the others; its error is counted by
//! the emitter and logged.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::events::types::{Event, EventPayload, StagePhase};

/// A consumer of bus events.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Stable name used in logs and diagnostics.
    fn name(&self) -> &str;

    async fn handle_event(&self, event: &Event) -> Result<()>;
}

/// Prints human-readable progress lines to stdout.
#[derive(Debug, Default)]
pub struct ConsoleObserver {
    quiet: bool,
    verbose: bool,
}

impl ConsoleObserver {
    pub fn new(quiet: bool, verbose: bool) -> Self {
        Self { quiet, verbose }
    }

    fn should_print(&self, event: &Event) -> bool {
        match &event.payload {
            EventPayload::Error { .. } => true,
            _ if self.quiet => false,
            EventPayload::DownloadProgress { .. } => self.verbose,
            EventPayload::DownloadStarted { .. } => self.verbose,
            EventPayload::StageChanged { phase, .. } => {
                self.verbose || !matches!(phase, StagePhase::Started)
            }
            _ => true,
        }
    }
}

#[async_trait]
impl Observer for ConsoleObserver {
    fn name(&self) -> &str {
        "console"
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        if self.should_print(event) {
            println!(
                "[{}] {}",
                event.timestamp.format("%H:%M:%S"),
                event.description()
            );
        }
        Ok(())
    }
}

/// Mirrors events into the `tracing` log stream at kind-appropriate levels.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl TracingObserver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Observer for TracingObserver {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        let description = event.description();
        match &event.payload {
            EventPayload::Error { recoverable, .. } => {
                if *recoverable {
                    warn!(session_id = %event.session_id, "{description}");
                } else {
                    error!(session_id = %event.session_id, "{description}");
                }
            }
            EventPayload::DownloadCompleted { success: false, .. } => {
                warn!(session_id = %event.session_id, "{description}");
            }
            EventPayload::DownloadProgress { .. } => {
                debug!(session_id = %event.session_id, "{description}");
            }
            _ => {
                info!(session_id = %event.session_id, "{description}");
            }
        }
        Ok(())
    }
}

/// Appends one JSON object per event to a file.
///
/// Lines are flushed as they are written so a crash loses at most the
/// event being serialized.
pub struct JsonlObserver {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlObserver {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

#[async_trait]
impl Observer for JsonlObserver {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlObserver {
    fn drop(&mut self) {
        let _ = self.writer.lock().flush();
    }
}

/// End-of-run totals gathered by [`StatisticsObserver`].
#[derive(Debug, Clone, Serialize)]
pub struct RunTotals {
    pub posts_discovered: u64,
    pub posts_filtered: u64,
    pub downloads_completed: u64,
    pub downloads_failed: u64,
    pub bytes_downloaded: u64,
    pub events_received: u64,
    pub elapsed: Duration,
}

/// Tallies run totals from the event stream.
pub struct StatisticsObserver {
    posts_discovered: AtomicU64,
    posts_filtered: AtomicU64,
    downloads_completed: AtomicU64,
    downloads_failed: AtomicU64,
    bytes_downloaded: AtomicU64,
    events_received: AtomicU64,
    started_at: Instant,
}

impl StatisticsObserver {
    pub fn new() -> Self {
        Self {
            posts_discovered: AtomicU64::new(0),
            posts_filtered: AtomicU64::new(0),
            downloads_completed: AtomicU64::new(0),
            downloads_failed: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> RunTotals {
        RunTotals {
            posts_discovered: self.posts_discovered.load(Ordering::Relaxed),
            posts_filtered: self.posts_filtered.load(Ordering::Relaxed),
            downloads_completed: self.downloads_completed.load(Ordering::Relaxed),
            downloads_failed: self.downloads_failed.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            elapsed: self.started_at.elapsed(),
        }
    }

    /// Final statistics event for the bus.
    pub fn to_payload(&self) -> EventPayload {
        let totals = self.snapshot();
        EventPayload::Statistics {
            posts_discovered: totals.posts_discovered,
            posts_filtered: totals.posts_filtered,
            downloads_completed: totals.downloads_completed,
            downloads_failed: totals.downloads_failed,
            bytes_downloaded: totals.bytes_downloaded,
            elapsed: totals.elapsed,
        }
    }
}

impl Default for StatisticsObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Observer for StatisticsObserver {
    fn name(&self) -> &str {
        "statistics"
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        match &event.payload {
            EventPayload::PostsDiscovered { post_count, .. } => {
                self.posts_discovered
                    .fetch_add(*post_count as u64, Ordering::Relaxed);
            }
            EventPayload::FilterApplied { posts_filtered, .. } => {
                self.posts_filtered
                    .fetch_add(*posts_filtered as u64, Ordering::Relaxed);
            }
            EventPayload::DownloadCompleted {
                success, file_size, ..
            } => {
                if *success {
                    self.downloads_completed.fetch_add(1, Ordering::Relaxed);
                    self.bytes_downloaded.fetch_add(*file_size, Ordering::Relaxed);
                } else {
                    self.downloads_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::EventKind;

    fn completed_event(success: bool, file_size: u64) -> Event {
        Event::new(EventPayload::DownloadCompleted {
            post_id: "p1".into(),
            url: "https://example.com/a.jpg".into(),
            filename: "a.jpg".into(),
            success,
            file_size,
            duration: Duration::from_millis(10),
            error_message: if success { None } else { Some("http 500".into()) },
        })
    }

    #[tokio::test]
    async fn statistics_observer_tallies_downloads() {
        let stats = StatisticsObserver::new();
        stats.handle_event(&completed_event(true, 100)).await.unwrap();
        stats.handle_event(&completed_event(true, 50)).await.unwrap();
        stats.handle_event(&completed_event(false, 0)).await.unwrap();

        let totals = stats.snapshot();
        assert_eq!(totals.downloads_completed, 2);
        assert_eq!(totals.downloads_failed, 1);
        assert_eq!(totals.bytes_downloaded, 150);
        assert_eq!(totals.events_received, 3);
    }

    #[tokio::test]
    async fn jsonl_observer_writes_parseable_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let observer = JsonlObserver::new(&path).unwrap();

        observer.handle_event(&completed_event(true, 42)).await.unwrap();
        observer.handle_event(&completed_event(false, 0)).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let event: Event = serde_json::from_str(line).unwrap();
            assert_eq!(event.kind(), EventKind::DownloadCompleted);
        }
    }

    #[tokio::test]
    async fn console_observer_respects_quiet_mode() {
        let quiet = ConsoleObserver::new(true, false);
        assert!(!quiet.should_print(&completed_event(true, 1)));
        let error = Event::new(EventPayload::Error {
            error_type: "io".into(),
            message: "disk full".into(),
            stage_name: None,
            post_id: None,
            recoverable: false,
        });
        assert!(quiet.should_print(&error));
    }
}
