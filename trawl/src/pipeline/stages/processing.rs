//! Final stage: download media and finalize each post.
//!
//! Downloads run concurrently under a semaphore. Every fetch walks its
//! download row through `pending -> in_progress -> completed | failed`,
//! so a crash at any point leaves rows a resumed run can pick up.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::database::{DownloadStatus, PostStatus, StateManager};
use crate::error::{Error, Result};
use crate::events::{Event, EventEmitter, EventPayload};
use crate::pipeline::context::PipelineContext;
use crate::pipeline::stage::{Stage, StageResult};

/// Outcome of one successful fetch.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub bytes: u64,
    /// Hex SHA-256 of the bytes written.
    pub checksum: String,
}

/// Downloads one media URL to a local path.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchedFile>;
}

/// Streaming HTTP fetcher hashing as it writes.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|error| Error::download(format!("failed to build HTTP client: {error}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchedFile> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| Error::download(format!("request to {url} failed: {error}")))?
            .error_for_status()
            .map_err(|error| Error::download(format!("{url}: {error}")))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut bytes: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|error| Error::download(format!("reading {url} failed: {error}")))?;
            hasher.update(&chunk);
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!(url, bytes, "fetched media");
        Ok(FetchedFile {
            bytes,
            checksum: hex::encode(hasher.finalize()),
        })
    }
}

/// Destination filename: post id, attachment index and the sanitized last
/// URL path segment.
fn derive_filename(post_id: &str, index: usize, media_url: &str) -> String {
    let segment = url::Url::parse(media_url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| "file".to_string());
    let safe: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{post_id}_{index}_{safe}")
}

struct DownloadJob {
    download_id: i64,
    post_id: String,
    url: String,
    dest: PathBuf,
}

struct DownloadOutcome {
    post_id: String,
    success: bool,
    bytes: u64,
}

/// Fetches media for every post in the working set.
pub struct ProcessingStage {
    fetcher: Arc<dyn MediaFetcher>,
    concurrency: usize,
}

impl ProcessingStage {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, concurrency: usize) -> Self {
        Self {
            fetcher,
            concurrency,
        }
    }

    /// One bounded-concurrency fetch, bracketed by row transitions.
    async fn run_job(
        job: DownloadJob,
        state: Arc<StateManager>,
        fetcher: Arc<dyn MediaFetcher>,
        emitter: Arc<EventEmitter>,
        session_id: String,
        semaphore: Arc<Semaphore>,
    ) -> Result<DownloadOutcome> {
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::download("download scheduler stopped"))?;

        let filename = job
            .dest
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        state.mark_download_started(job.download_id).await?;
        emitter.emit(
            Event::new(EventPayload::DownloadStarted {
                post_id: job.post_id.clone(),
                url: job.url.clone(),
                filename: filename.clone(),
            })
            .with_session(session_id.as_str()),
        );

        let timer = Instant::now();
        match fetcher.fetch(&job.url, &job.dest).await {
            Ok(file) => {
                state
                    .mark_download_completed(job.download_id, file.bytes, &file.checksum)
                    .await?;
                emitter.emit(
                    Event::new(EventPayload::DownloadCompleted {
                        post_id: job.post_id.clone(),
                        url: job.url,
                        filename,
                        success: true,
                        file_size: file.bytes,
                        duration: timer.elapsed(),
                        error_message: None,
                    })
                    .with_session(session_id.as_str()),
                );
                Ok(DownloadOutcome {
                    post_id: job.post_id,
                    success: true,
                    bytes: file.bytes,
                })
            }
            Err(error) => {
                let message = error.to_string();
                state.mark_download_failed(job.download_id, &message).await?;
                warn!(url = %job.url, error = %message, "download failed");
                emitter.emit(
                    Event::new(EventPayload::DownloadCompleted {
                        post_id: job.post_id.clone(),
                        url: job.url,
                        filename,
                        success: false,
                        file_size: 0,
                        duration: timer.elapsed(),
                        error_message: Some(message),
                    })
                    .with_session(session_id.as_str()),
                );
                Ok(DownloadOutcome {
                    post_id: job.post_id,
                    success: false,
                    bytes: 0,
                })
            }
        }
    }
}

#[async_trait]
impl Stage for ProcessingStage {
    fn name(&self) -> &str {
        "processing"
    }

    fn validate_config(&self) -> Vec<String> {
        if self.concurrency == 0 {
            vec!["concurrency must be at least 1".to_string()]
        } else {
            Vec::new()
        }
    }

    async fn pre_process(&self, ctx: &mut PipelineContext) -> Result<()> {
        if ctx.state.is_none() {
            return Err(Error::validation(
                "processing stage requires a session store",
            ));
        }
        Ok(())
    }

    async fn process(&self, ctx: &mut PipelineContext) -> StageResult {
        let mut result = StageResult::new(self.name());
        let Some(state) = ctx.state.clone() else {
            result.add_error("processing stage requires a session store");
            return result;
        };
        if ctx.posts.is_empty() {
            result.add_warning("no posts to process");
            return result;
        }

        let stage_timer = Instant::now();
        let output_dir = PathBuf::from(&ctx.config.output_dir);

        // Download rows from an earlier attempt, keyed by (post, url).
        let existing: HashMap<(String, String), _> =
            match state.get_downloads(&ctx.session_id, None).await {
                Ok(rows) => rows
                    .into_iter()
                    .map(|row| ((row.post_id.clone(), row.url.clone()), row))
                    .collect(),
                Err(error) => {
                    result.add_error(format!("failed to load download rows: {error}"));
                    return result;
                }
            };

        let mut jobs = Vec::new();
        let mut reused_by_post: HashMap<String, usize> = HashMap::new();
        for post in &ctx.posts {
            for (index, media_url) in post.media_urls.iter().enumerate() {
                match existing.get(&(post.id.clone(), media_url.clone())) {
                    Some(row) if row.status == DownloadStatus::Completed => {
                        *reused_by_post.entry(post.id.clone()).or_default() += 1;
                    }
                    Some(row) => {
                        if row.status == DownloadStatus::InProgress {
                            // Left over from an interrupted run; reset so the
                            // state machine allows a restart.
                            if let Err(error) = state
                                .mark_download_failed(row.id, "interrupted before completion")
                                .await
                            {
                                result.add_error(format!(
                                    "failed to reset stale download {}: {error}",
                                    row.id
                                ));
                                return result;
                            }
                        }
                        jobs.push(DownloadJob {
                            download_id: row.id,
                            post_id: post.id.clone(),
                            url: media_url.clone(),
                            dest: PathBuf::from(&row.path),
                        });
                    }
                    None => {
                        let dest = output_dir.join(derive_filename(&post.id, index, media_url));
                        let download_id = match state
                            .add_download(
                                &ctx.session_id,
                                &post.id,
                                media_url,
                                &dest.to_string_lossy(),
                            )
                            .await
                        {
                            Ok(id) => id,
                            Err(error) => {
                                result.add_error(format!(
                                    "failed to record download for post {}: {error}",
                                    post.id
                                ));
                                return result;
                            }
                        };
                        jobs.push(DownloadJob {
                            download_id,
                            post_id: post.id.clone(),
                            url: media_url.clone(),
                            dest,
                        });
                    }
                }
            }
        }

        let reused: usize = reused_by_post.values().sum();
        let job_count = jobs.len();
        debug!(jobs = job_count, reused, "processing downloads");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<Result<DownloadOutcome>> = JoinSet::new();
        for job in jobs {
            tasks.spawn(Self::run_job(
                job,
                Arc::clone(&state),
                Arc::clone(&self.fetcher),
                Arc::clone(&ctx.emitter),
                ctx.session_id.clone(),
                Arc::clone(&semaphore),
            ));
        }

        let mut completed_by_post = reused_by_post;
        let mut failed_by_post: HashMap<String, usize> = HashMap::new();
        let mut new_completed = 0usize;
        let mut new_failed = 0usize;
        let mut bytes_total = 0u64;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => {
                    if outcome.success {
                        new_completed += 1;
                        bytes_total += outcome.bytes;
                        *completed_by_post.entry(outcome.post_id).or_default() += 1;
                    } else {
                        new_failed += 1;
                        *failed_by_post.entry(outcome.post_id).or_default() += 1;
                    }
                }
                Ok(Err(error)) => {
                    result.add_error(format!("download bookkeeping failed: {error}"));
                }
                Err(join_error) => {
                    result.add_error(format!("download task panicked: {join_error}"));
                }
            }
        }

        let mut posts_processed = 0usize;
        let mut posts_failed = 0usize;
        for post in &ctx.posts {
            let total = post.media_urls.len();
            let completed = completed_by_post.get(&post.id).copied().unwrap_or(0);
            let failed = failed_by_post.get(&post.id).copied().unwrap_or(0);
            let (status, error_message) = if total == 0 || completed > 0 {
                (PostStatus::Processed, None)
            } else if failed > 0 {
                (
                    PostStatus::Failed,
                    Some(format!("all {failed} downloads failed")),
                )
            } else {
                // No fetch resolved for this post; leave it pending for a
                // later resume.
                continue;
            };

            if let Err(error) = state
                .mark_post_processed(&ctx.session_id, &post.id, status, error_message.as_deref())
                .await
            {
                result.add_error(format!("failed to finalize post {}: {error}", post.id));
                continue;
            }
            if status == PostStatus::Processed {
                posts_processed += 1;
            } else {
                posts_failed += 1;
            }
            ctx.emit(EventPayload::PostProcessed {
                post_id: post.id.clone(),
                success: status == PostStatus::Processed,
                downloads_completed: completed,
                downloads_failed: failed,
                processing_time: stage_timer.elapsed(),
                error_message,
            });
        }

        info!(
            posts = ctx.posts.len(),
            posts_processed,
            posts_failed,
            downloads = new_completed,
            failed = new_failed,
            reused,
            bytes = bytes_total,
            "processing finished"
        );
        result.processed_count = ctx.posts.len();
        result.set_data("downloads_completed", json!(new_completed));
        result.set_data("downloads_failed", json!(new_failed));
        result.set_data("downloads_reused", json!(reused));
        result.set_data("bytes_downloaded", json!(bytes_total));
        result.set_data("posts_processed", json!(posts_processed));
        result.set_data("posts_failed", json!(posts_failed));
        result
    }
}
