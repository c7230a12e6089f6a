//! Integration tests for the trawl pipeline and session store.
//!
//! These tests drive complete pipelines against a real SQLite database
//! (in-memory) through the public crate API, the same surface the CLI
//! uses.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use trawl::config::RunConfig;
use trawl::database::{DownloadStatus, PostStatus, SessionStatus, StateManager};
use trawl::events::{
    EmitterConfig, EventEmitter, EventKind, EventSelector, Observer, StatisticsObserver,
};
use trawl::pipeline::stages::{
    AcquisitionStage, FetchedFile, FilterStage, MediaFetcher, PostSource, ProcessingStage,
};
use trawl::pipeline::{Pipeline, PipelineContext};
use trawl::post::Post;
use trawl::recovery::SessionRecovery;
use trawl::{Error, Result};

/// Helper to create a session store backed by an in-memory database
/// with migrations applied.
async fn setup_store() -> Arc<StateManager> {
    Arc::new(
        StateManager::open_in_memory()
            .await
            .expect("Failed to open in-memory store"),
    )
}

fn media_post(id: &str, score: i64, urls: &[&str]) -> Post {
    let mut post = Post::new(id, format!("post {id}"))
        .with_author("integration")
        .with_score(score);
    for url in urls {
        post = post.with_media_url(*url);
    }
    post
}

/// Source returning a fixed batch, standing in for a network API.
struct FixedSource(Vec<Post>);

#[async_trait]
impl PostSource for FixedSource {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn discover(
        &self,
        _target_type: &str,
        _target_value: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Post>> {
        let mut posts = self.0.clone();
        if let Some(limit) = limit {
            posts.truncate(limit);
        }
        Ok(posts)
    }
}

/// Fetcher that writes deterministic bytes instead of talking to a
/// server. URLs containing "unreachable" fail with a download error.
struct ScriptedFetcher;

#[async_trait]
impl MediaFetcher for ScriptedFetcher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchedFile> {
        if url.contains("unreachable") {
            return Err(Error::download(format!("connection refused: {url}")));
        }
        let body = format!("payload for {url}");
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, body.as_bytes()).await?;
        Ok(FetchedFile {
            bytes: body.len() as u64,
            checksum: hex::encode(Sha256::digest(body.as_bytes())),
        })
    }
}

mod pipeline_tests {
    use super::*;

    #[tokio::test]
    async fn test_full_run_persists_posts_and_downloads() {
        let store = setup_store().await;
        let emitter = Arc::new(EventEmitter::new(EmitterConfig::default()));
        let stats = Arc::new(StatisticsObserver::new());
        let observer: Arc<dyn Observer> = stats.clone();
        emitter.subscribe(EventSelector::All, &observer, false);

        let dir = TempDir::new().expect("tempdir");
        let mut config = RunConfig::new("user", "demo", dir.path().to_string_lossy());
        config.filters.min_score = Some(10);
        let config_hash = config.config_hash().expect("config hash");

        let session_id = store
            .create_session("user", "demo", &config_hash)
            .await
            .expect("create session");

        let posts = vec![
            media_post("p1", 50, &["https://cdn.example/p1.jpg"]),
            media_post("p2", 3, &["https://cdn.example/p2.jpg"]),
            media_post(
                "p3",
                20,
                &["https://cdn.example/p3a.jpg", "https://cdn.example/p3b.mp4"],
            ),
        ];

        let pipeline = Pipeline::new()
            .add_stage(AcquisitionStage::new(Arc::new(FixedSource(posts))))
            .add_stage(FilterStage::new(config.filters.clone()))
            .add_stage(ProcessingStage::new(Arc::new(ScriptedFetcher), 2));

        let mut ctx = PipelineContext::new(config, emitter.clone())
            .attach_state(store.clone(), session_id.as_str());
        let metrics = pipeline.execute(&mut ctx).await.expect("pipeline run");

        assert!(metrics.success());
        assert_eq!(metrics.total_stages, 3);
        assert_eq!(metrics.failed_stages, 0);
        assert!(!metrics.halted);

        // Post rows reflect the filter decision and the downloads.
        let p1 = store.get_post(&session_id, "p1").await.expect("p1 row");
        let p2 = store.get_post(&session_id, "p2").await.expect("p2 row");
        let p3 = store.get_post(&session_id, "p3").await.expect("p3 row");
        assert_eq!(p1.status, PostStatus::Processed);
        assert_eq!(p2.status, PostStatus::Skipped);
        assert_eq!(p3.status, PostStatus::Processed);

        let completed = store
            .get_downloads(&session_id, Some(DownloadStatus::Completed))
            .await
            .expect("completed downloads");
        assert_eq!(completed.len(), 3);
        for row in &completed {
            let bytes = std::fs::read(&row.path).expect("downloaded file on disk");
            assert_eq!(row.file_size, Some(bytes.len() as i64));
            assert_eq!(
                row.checksum.as_deref(),
                Some(hex::encode(Sha256::digest(&bytes)).as_str())
            );
        }

        let resume = store.resume_state(&session_id).await.expect("resume state");
        assert!(!resume.can_resume);
        assert_eq!(resume.counts.processed, 2);
        assert_eq!(resume.counts.skipped, 1);
        assert_eq!(resume.counts.pending, 0);

        // History is recorded at emit time, so it is already complete
        // even though observer delivery is asynchronous.
        let history = |kind| emitter.history(Some(kind), None).len();
        assert_eq!(history(EventKind::PostsDiscovered), 1);
        assert_eq!(history(EventKind::FilterApplied), 1);
        assert_eq!(history(EventKind::DownloadStarted), 3);
        assert_eq!(history(EventKind::DownloadCompleted), 3);
        assert_eq!(history(EventKind::PostProcessed), 2);
        assert_eq!(history(EventKind::StageChanged), 6);
        for event in emitter.history(None, None) {
            assert_eq!(event.session_id, session_id);
        }

        // Wait for the dispatcher to drain before reading observer totals.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let totals = stats.snapshot();
            if totals.posts_discovered == 3 && totals.downloads_completed == 3 {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "observer never saw the full run: {totals:?}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let totals = stats.snapshot();
        assert_eq!(totals.posts_filtered, 1);
        assert_eq!(totals.downloads_failed, 0);
        assert!(totals.bytes_downloaded > 0);

        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_media_fails_post_only_when_nothing_lands() {
        let store = setup_store().await;
        let emitter = Arc::new(EventEmitter::new(EmitterConfig::default()));
        let dir = TempDir::new().expect("tempdir");
        let config = RunConfig::new("user", "demo", dir.path().to_string_lossy());

        let session_id = store
            .create_session("user", "demo", "0ddba11deadbeef0")
            .await
            .expect("create session");

        let posts = vec![
            media_post("f1", 10, &["https://cdn.example/unreachable/a.jpg"]),
            media_post(
                "f2",
                10,
                &[
                    "https://cdn.example/ok.jpg",
                    "https://cdn.example/unreachable/b.jpg",
                ],
            ),
        ];

        let pipeline = Pipeline::new()
            .add_stage(AcquisitionStage::new(Arc::new(FixedSource(posts))))
            .add_stage(ProcessingStage::new(Arc::new(ScriptedFetcher), 2));

        let mut ctx = PipelineContext::new(config, emitter.clone())
            .attach_state(store.clone(), session_id.as_str());
        let metrics = pipeline.execute(&mut ctx).await.expect("pipeline run");

        // Download failures are recorded per row and per post; the stage
        // itself still completes.
        assert!(metrics.success());

        let f1 = store.get_post(&session_id, "f1").await.expect("f1 row");
        assert_eq!(f1.status, PostStatus::Failed);
        assert_eq!(f1.error.as_deref(), Some("all 1 downloads failed"));

        let f2 = store.get_post(&session_id, "f2").await.expect("f2 row");
        assert_eq!(f2.status, PostStatus::Processed);

        let failed = store
            .get_downloads(&session_id, Some(DownloadStatus::Failed))
            .await
            .expect("failed downloads");
        assert_eq!(failed.len(), 2);
        for row in &failed {
            let error = row.error.as_deref().unwrap_or_default();
            assert!(
                error.contains("connection refused"),
                "unexpected error: {error}"
            );
        }
        let completed = store
            .get_downloads(&session_id, Some(DownloadStatus::Completed))
            .await
            .expect("completed downloads");
        assert_eq!(completed.len(), 1);

        let resume = store.resume_state(&session_id).await.expect("resume state");
        assert_eq!(resume.counts.failed, 1);
        assert_eq!(resume.counts.pending, 0);
        assert_eq!(resume.failed_downloads.len(), 2);
        assert!(!resume.can_resume);

        emitter.shutdown().await;
    }
}

mod recovery_tests {
    use super::*;

    #[tokio::test]
    async fn test_interrupted_run_resumes_to_completion() {
        let store = setup_store().await;
        let emitter = Arc::new(EventEmitter::new(EmitterConfig::default()));
        let dir = TempDir::new().expect("tempdir");
        let config = RunConfig::new("user", "demo", dir.path().to_string_lossy());

        let session_id = store
            .create_session("user", "demo", "cafe0123456789ab")
            .await
            .expect("create session");

        // First run stops after discovery, as if the process died before
        // any download started.
        let discovery_only =
            Pipeline::new().add_stage(AcquisitionStage::new(Arc::new(FixedSource(vec![
                media_post("p1", 10, &["https://cdn.example/p1.jpg"]),
                media_post("p2", 10, &["https://cdn.example/p2.jpg"]),
            ]))));
        let mut ctx = PipelineContext::new(config.clone(), emitter.clone())
            .attach_state(store.clone(), session_id.as_str());
        let metrics = discovery_only.execute(&mut ctx).await.expect("first run");
        assert!(metrics.success());

        let recovery = SessionRecovery::new(store.clone());
        let resumable = recovery
            .find_resumable_sessions(None)
            .await
            .expect("find resumable");
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].session().id, session_id);
        assert_eq!(resumable[0].state.counts.pending, 2);

        let report = recovery
            .resume_session(&session_id)
            .await
            .expect("resume session");
        assert_eq!(report.pending_posts, 2);
        assert!(!report.reactivated, "session was never paused");

        // Second run feeds the stored pending posts straight into the
        // processing stage.
        let pending: Vec<Post> = store
            .get_posts(&session_id, Some(PostStatus::Pending))
            .await
            .expect("pending posts")
            .iter()
            .map(|record| record.post().expect("stored payload"))
            .collect();
        assert_eq!(pending.len(), 2);

        let resume_run =
            Pipeline::new().add_stage(ProcessingStage::new(Arc::new(ScriptedFetcher), 2));
        let mut ctx = PipelineContext::new(config, emitter.clone())
            .attach_state(store.clone(), session_id.as_str());
        ctx.posts = pending;
        let metrics = resume_run.execute(&mut ctx).await.expect("second run");
        assert!(metrics.success());

        let resume = store.resume_state(&session_id).await.expect("resume state");
        assert_eq!(resume.counts.processed, 2);
        assert!(!resume.can_resume);

        store
            .update_session_status(&session_id, SessionStatus::Completed)
            .await
            .expect("complete session");
        let resumable = recovery
            .find_resumable_sessions(None)
            .await
            .expect("find again");
        assert!(resumable.is_empty());

        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn test_integrity_check_flags_tampered_run_artifacts() {
        let store = setup_store().await;
        let emitter = Arc::new(EventEmitter::new(EmitterConfig::default()));
        let dir = TempDir::new().expect("tempdir");
        let config = RunConfig::new("user", "demo", dir.path().to_string_lossy());

        let session_id = store
            .create_session("user", "demo", "feedc0de12345678")
            .await
            .expect("create session");

        let pipeline = Pipeline::new()
            .add_stage(AcquisitionStage::new(Arc::new(FixedSource(vec![
                media_post(
                    "p1",
                    10,
                    &["https://cdn.example/one.jpg", "https://cdn.example/two.jpg"],
                ),
            ]))))
            .add_stage(ProcessingStage::new(Arc::new(ScriptedFetcher), 2));
        let mut ctx = PipelineContext::new(config, emitter.clone())
            .attach_state(store.clone(), session_id.as_str());
        let metrics = pipeline.execute(&mut ctx).await.expect("pipeline run");
        assert!(metrics.success());

        let completed = store
            .get_downloads(&session_id, Some(DownloadStatus::Completed))
            .await
            .expect("completed downloads");
        assert_eq!(completed.len(), 2);

        // Damage the artifacts behind the store's back.
        std::fs::remove_file(&completed[0].path).expect("remove artifact");
        std::fs::write(&completed[1].path, b"tampered").expect("overwrite artifact");

        let recovery = SessionRecovery::new(store.clone());
        let report = recovery
            .validate_file_integrity(&session_id)
            .await
            .expect("file check");
        assert_eq!(report.checked, 2);
        assert_eq!(report.valid, 0);
        assert_eq!(report.missing, 1);
        assert_eq!(report.corrupted, 1);
        assert_eq!(report.issues.len(), 2);

        // The missing row flips to failed so a later run can refetch it;
        // the corrupted one keeps its row until repaired by hand.
        let row = store
            .get_download(completed[0].id)
            .await
            .expect("missing row");
        assert_eq!(row.status, DownloadStatus::Failed);
        let row = store
            .get_download(completed[1].id)
            .await
            .expect("corrupted row");
        assert_eq!(row.status, DownloadStatus::Completed);

        emitter.shutdown().await;
    }
}
