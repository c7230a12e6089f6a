use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use trawl::Result;
use trawl::config::RunConfig;
use trawl::database::{DownloadStatus, PostStatus, SessionStatus, StateManager};
use trawl::events::{EmitterConfig, EventEmitter};
use trawl::pipeline::stages::{FetchedFile, MediaFetcher, ProcessingStage};
use trawl::pipeline::{Pipeline, PipelineContext};
use trawl::post::Post;
use trawl::recovery::SessionRecovery;

fn file_db_url(dir: &TempDir, name: &str) -> String {
    let db_path = dir.path().join(name);
    format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    )
}

/// Fetcher standing in for the HTTP client; writes the URL back as the
/// file body.
struct RestartFetcher;

#[async_trait]
impl MediaFetcher for RestartFetcher {
    fn name(&self) -> &str {
        "restart"
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchedFile> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, url.as_bytes()).await?;
        Ok(FetchedFile {
            bytes: url.len() as u64,
            checksum: hex::encode(Sha256::digest(url.as_bytes())),
        })
    }
}

#[tokio::test]
async fn resumable_work_survives_process_restart() {
    let dir = TempDir::new().unwrap();
    let db_url = file_db_url(&dir, "sessions.db");

    // First process: discover three posts, finish one, download media for
    // another, then stop without closing the session.
    let store = StateManager::open(&db_url).await.unwrap();
    let session_id = store
        .create_session("user", "demo", "cafe0123456789ab")
        .await
        .unwrap();
    let posts = vec![
        Post::new("p1", "first"),
        Post::new("p2", "second").with_media_url("https://cdn.example/p2.jpg"),
        Post::new("p3", "third"),
    ];
    store.save_posts(&session_id, &posts).await.unwrap();
    store
        .mark_post_processed(&session_id, "p1", PostStatus::Processed, None)
        .await
        .unwrap();
    let download_id = store
        .add_download(
            &session_id,
            "p2",
            "https://cdn.example/p2.jpg",
            "downloads/p2.jpg",
        )
        .await
        .unwrap();
    store.mark_download_started(download_id).await.unwrap();
    store
        .mark_download_completed(download_id, 4096, "ab12cd34ef56")
        .await
        .unwrap();
    store.close().await;
    drop(store);

    // Second process: same database file, fresh manager.
    let store = Arc::new(StateManager::open(&db_url).await.unwrap());
    let recovery = SessionRecovery::new(store.clone());
    let resumable = recovery.find_resumable_sessions(None).await.unwrap();
    assert_eq!(resumable.len(), 1);
    assert_eq!(resumable[0].session().id, session_id);
    assert_eq!(resumable[0].state.counts.total, 3);
    assert_eq!(resumable[0].state.counts.pending, 2);
    assert_eq!(resumable[0].state.counts.processed, 1);

    let report = recovery.resume_session(&session_id).await.unwrap();
    assert_eq!(report.pending_posts, 2);
    assert!(!report.reactivated, "session was still active");

    // The finished download survived intact.
    let row = store.get_download(download_id).await.unwrap();
    assert_eq!(row.status, DownloadStatus::Completed);
    assert_eq!(row.file_size, Some(4096));
    assert_eq!(row.checksum.as_deref(), Some("ab12cd34ef56"));

    store.close().await;
}

#[tokio::test]
async fn paused_session_reactivates_after_restart() {
    let dir = TempDir::new().unwrap();
    let db_url = file_db_url(&dir, "paused.db");

    let store = StateManager::open(&db_url).await.unwrap();
    let session_id = store
        .create_session("feed", "front", "beef456789abcdef")
        .await
        .unwrap();
    store
        .save_posts(&session_id, &[Post::new("p1", "only")])
        .await
        .unwrap();
    store
        .update_session_status(&session_id, SessionStatus::Paused)
        .await
        .unwrap();
    store.close().await;
    drop(store);

    let store = Arc::new(StateManager::open(&db_url).await.unwrap());
    let recovery = SessionRecovery::new(store.clone());
    let report = recovery.resume_session(&session_id).await.unwrap();
    assert!(report.reactivated);

    let session = store.get_session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);

    store.close().await;
}

#[tokio::test]
async fn interrupted_download_is_retried_on_next_run() {
    let dir = TempDir::new().unwrap();
    let db_url = file_db_url(&dir, "retry.db");
    let media_url = "https://cdn.example/clip.mp4";

    // The first process died mid-download, leaving the row in progress.
    let store = StateManager::open(&db_url).await.unwrap();
    let session_id = store
        .create_session("user", "demo", "f00d89abcdef0123")
        .await
        .unwrap();
    let post = Post::new("p1", "clip").with_media_url(media_url);
    store.save_posts(&session_id, &[post.clone()]).await.unwrap();
    let dest = dir.path().join("clip.mp4");
    let download_id = store
        .add_download(&session_id, "p1", media_url, &dest.to_string_lossy())
        .await
        .unwrap();
    store.mark_download_started(download_id).await.unwrap();
    store.close().await;
    drop(store);

    let store = Arc::new(StateManager::open(&db_url).await.unwrap());
    let row = store.get_download(download_id).await.unwrap();
    assert_eq!(row.status, DownloadStatus::InProgress);

    // Rerunning the processing stage resets the stale row and fetches it
    // again instead of inserting a duplicate.
    let emitter = Arc::new(EventEmitter::new(EmitterConfig::default()));
    let config = RunConfig::new("user", "demo", dir.path().to_string_lossy());
    let mut ctx = PipelineContext::new(config, emitter.clone())
        .attach_state(store.clone(), session_id.as_str());
    ctx.posts = vec![post];
    let pipeline = Pipeline::new().add_stage(ProcessingStage::new(Arc::new(RestartFetcher), 1));
    let metrics = pipeline.execute(&mut ctx).await.unwrap();
    assert!(metrics.success());

    let rows = store.get_downloads(&session_id, None).await.unwrap();
    assert_eq!(rows.len(), 1, "retry must reuse the existing row");
    assert_eq!(rows[0].status, DownloadStatus::Completed);
    assert!(dest.exists());

    let post_row = store.get_post(&session_id, "p1").await.unwrap();
    assert_eq!(post_row.status, PostStatus::Processed);

    emitter.shutdown().await;
    store.close().await;
}
