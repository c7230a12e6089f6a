//! Operations on interrupted or finished sessions.
//!
//! Everything here goes through the store's public operations, never raw
//! SQL, so the repair and resume logic stays valid however the schema is
//! reached.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::database::{
    DownloadStatus, PostStatus, ResumeState, SessionRecord, SessionStatus, StateManager,
};
use crate::error::{Error, Result};

/// Sessions older than this are not offered for resume.
pub const DEFAULT_RESUME_MAX_AGE_DAYS: i64 = 7;

/// Terminal sessions older than this are eligible for cleanup.
pub const DEFAULT_CLEANUP_MAX_AGE_DAYS: i64 = 30;

/// The single issue string a clean repair reports.
pub const NO_ISSUES: &str = "No issues found";

/// A session with pending work, as offered by
/// [`SessionRecovery::find_resumable_sessions`].
#[derive(Debug)]
pub struct ResumableSession {
    pub state: ResumeState,
    pub age_hours: f64,
}

impl ResumableSession {
    pub fn session(&self) -> &SessionRecord {
        &self.state.session
    }
}

/// Outcome of a resume request.
#[derive(Debug, Serialize)]
pub struct ResumeReport {
    pub session_id: String,
    pub pending_posts: usize,
    pub failed_downloads: usize,
    /// True when the session status was flipped back to active.
    pub reactivated: bool,
}

/// What a repair found and did.
#[derive(Debug, Serialize)]
pub struct RepairReport {
    pub session_id: String,
    pub issues_found: Vec<String>,
    pub repairs_performed: Vec<String>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.repairs_performed.is_empty() && self.issues_found == [NO_ISSUES.to_string()]
    }
}

/// Result of a checksum sweep over completed downloads.
#[derive(Debug, Serialize)]
pub struct FileCheckReport {
    pub session_id: String,
    pub checked: usize,
    pub valid: usize,
    pub missing: usize,
    pub corrupted: usize,
    pub issues: Vec<String>,
}

/// Sessions deleted by a cleanup pass.
#[derive(Debug, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
}

/// Outcome of a session export.
#[derive(Debug, Serialize)]
pub struct ExportReport {
    pub session_id: String,
    pub path: PathBuf,
    pub posts_exported: usize,
    pub downloads_exported: usize,
    pub metadata_keys: usize,
}

/// Resume, repair and housekeeping over persisted sessions.
pub struct SessionRecovery {
    state: Arc<StateManager>,
}

impl SessionRecovery {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self { state }
    }

    /// Active and paused sessions with pending work, newest first.
    ///
    /// Sessions older than the cutoff are skipped, as is anything whose
    /// timestamps cannot be parsed.
    pub async fn find_resumable_sessions(
        &self,
        max_age_days: Option<i64>,
    ) -> Result<Vec<ResumableSession>> {
        let max_age_hours = max_age_days.unwrap_or(DEFAULT_RESUME_MAX_AGE_DAYS) as f64 * 24.0;
        let mut found = Vec::new();
        for status in [SessionStatus::Active, SessionStatus::Paused] {
            for session in self
                .state
                .list_sessions(Some(status), None, i64::MAX)
                .await?
            {
                let Some(age_hours) = session.age_hours() else {
                    warn!(session_id = %session.id, "unparseable created_at, skipping");
                    continue;
                };
                if age_hours > max_age_hours {
                    continue;
                }
                let state = self.state.resume_state(&session.id).await?;
                if state.can_resume {
                    found.push(ResumableSession { state, age_hours });
                }
            }
        }
        // RFC 3339 strings sort chronologically.
        found.sort_by(|a, b| b.state.session.created_at.cmp(&a.state.session.created_at));
        Ok(found)
    }

    /// Flip a session back to active and report what is left to do.
    pub async fn resume_session(&self, session_id: &str) -> Result<ResumeReport> {
        let resume = self.state.resume_state(session_id).await?;
        if !resume.can_resume {
            return Err(Error::NoPendingWork {
                session_id: session_id.to_string(),
            });
        }
        let reactivated = resume.session.status != SessionStatus::Active;
        if reactivated {
            self.state
                .update_session_status(session_id, SessionStatus::Active)
                .await?;
            info!(
                session_id,
                from = %resume.session.status,
                pending = resume.counts.pending,
                "session reactivated"
            );
        }
        Ok(ResumeReport {
            session_id: session_id.to_string(),
            pending_posts: resume.counts.pending as usize,
            failed_downloads: resume.failed_downloads.len(),
            reactivated,
        })
    }

    /// Make stored download state match the filesystem.
    ///
    /// Completed downloads whose file is gone are marked failed so a
    /// resumed run fetches them again. Posts stuck in limbo (processed
    /// while every download failed) are reported but left alone.
    pub async fn repair_session(&self, session_id: &str) -> Result<RepairReport> {
        self.state.get_session(session_id).await?;
        let mut issues = Vec::new();
        let mut repairs = Vec::new();

        let completed = self
            .state
            .get_downloads(session_id, Some(DownloadStatus::Completed))
            .await?;
        for row in completed {
            if !file_exists(&row.path).await {
                issues.push(format!("File missing for completed download: {}", row.path));
                self.state
                    .mark_download_failed(
                        row.id,
                        &format!("File missing during repair: {}", row.path),
                    )
                    .await?;
                repairs.push(format!("Marked download {} failed (missing file)", row.id));
            }
        }

        for issue in self.limbo_posts(session_id).await? {
            issues.push(issue);
        }

        if issues.is_empty() {
            issues.push(NO_ISSUES.to_string());
        } else {
            info!(
                session_id,
                issues = issues.len(),
                repairs = repairs.len(),
                "session repaired"
            );
        }
        Ok(RepairReport {
            session_id: session_id.to_string(),
            issues_found: issues,
            repairs_performed: repairs,
        })
    }

    /// Posts marked processed although every one of their downloads failed.
    async fn limbo_posts(&self, session_id: &str) -> Result<Vec<String>> {
        let processed = self
            .state
            .get_posts(session_id, Some(PostStatus::Processed))
            .await?;
        if processed.is_empty() {
            return Ok(Vec::new());
        }
        let mut by_post: HashMap<String, (usize, usize)> = HashMap::new();
        for row in self.state.get_downloads(session_id, None).await? {
            let entry = by_post.entry(row.post_id.clone()).or_default();
            entry.0 += 1;
            if row.status == DownloadStatus::Failed {
                entry.1 += 1;
            }
        }
        let mut issues = Vec::new();
        for post in processed {
            if let Some((total, failed)) = by_post.get(&post.id)
                && *total > 0
                && total == failed
            {
                issues.push(format!(
                    "Post {} is marked processed but every download failed",
                    post.id
                ));
            }
        }
        Ok(issues)
    }

    /// Recompute checksums for completed downloads.
    ///
    /// Missing files are marked failed like repair does; corrupted files
    /// are reported but the row is kept, the operator decides what to do.
    pub async fn validate_file_integrity(&self, session_id: &str) -> Result<FileCheckReport> {
        self.state.get_session(session_id).await?;
        let mut report = FileCheckReport {
            session_id: session_id.to_string(),
            checked: 0,
            valid: 0,
            missing: 0,
            corrupted: 0,
            issues: Vec::new(),
        };

        let completed = self
            .state
            .get_downloads(session_id, Some(DownloadStatus::Completed))
            .await?;
        for row in completed {
            let Some(expected) = row.checksum.as_deref() else {
                continue;
            };
            report.checked += 1;
            match tokio::fs::read(&row.path).await {
                Ok(bytes) => {
                    let actual = hex::encode(Sha256::digest(&bytes));
                    if actual == expected {
                        report.valid += 1;
                    } else {
                        report.corrupted += 1;
                        report
                            .issues
                            .push(format!("Checksum mismatch for {}", row.path));
                    }
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    report.missing += 1;
                    report.issues.push(format!("File missing: {}", row.path));
                    self.state
                        .mark_download_failed(
                            row.id,
                            &format!("File missing during integrity check: {}", row.path),
                        )
                        .await?;
                }
                Err(error) => {
                    report
                        .issues
                        .push(format!("Could not read {}: {error}", row.path));
                }
            }
        }
        Ok(report)
    }

    /// Delete terminal sessions older than the cutoff.
    ///
    /// Active and paused sessions are never touched regardless of age.
    pub async fn cleanup_abandoned_sessions(
        &self,
        max_age_days: Option<i64>,
    ) -> Result<CleanupReport> {
        let max_age_hours = max_age_days.unwrap_or(DEFAULT_CLEANUP_MAX_AGE_DAYS) as f64 * 24.0;
        let mut removed = Vec::new();
        for status in [SessionStatus::Completed, SessionStatus::Failed] {
            for session in self
                .state
                .list_sessions(Some(status), None, i64::MAX)
                .await?
            {
                match session.age_hours() {
                    Some(age_hours) if age_hours > max_age_hours => {
                        self.state.delete_session(&session.id).await?;
                        info!(session_id = %session.id, age_hours, "abandoned session removed");
                        removed.push(session.id);
                    }
                    _ => {}
                }
            }
        }
        Ok(CleanupReport { removed })
    }

    /// Write one session and all of its rows to a JSON file.
    pub async fn export_session_data(
        &self,
        session_id: &str,
        path: &Path,
    ) -> Result<ExportReport> {
        let session = self.state.get_session(session_id).await?;
        let posts = self.state.get_posts(session_id, None).await?;
        let downloads = self.state.get_downloads(session_id, None).await?;
        let metadata = self.state.get_all_metadata(session_id).await?;

        let document = json!({
            "exported_at": Utc::now().to_rfc3339(),
            "tool": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "session": session,
            "posts": posts,
            "downloads": downloads,
            "metadata": metadata,
        });
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(&document)?).await?;
        info!(session_id, path = %path.display(), posts = posts.len(), "session exported");

        Ok(ExportReport {
            session_id: session_id.to_string(),
            path: path.to_path_buf(),
            posts_exported: posts.len(),
            downloads_exported: downloads.len(),
            metadata_keys: metadata.len(),
        })
    }
}

async fn file_exists(path: &str) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
