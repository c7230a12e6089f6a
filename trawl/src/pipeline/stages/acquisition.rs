//! First stage: discover posts and persist them as pending work.

use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::events::EventPayload;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::stage::{Stage, StageResult};
use crate::post::Post;

/// Where posts come from.
///
/// Implementations fetch or read the raw post list for a target; the
/// acquisition stage owns persistence and events.
#[async_trait]
pub trait PostSource: Send + Sync {
    fn name(&self) -> &str;

    /// Return up to `limit` posts for the target, source order preserved.
    async fn discover(
        &self,
        target_type: &str,
        target_value: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Post>>;
}

/// Reads posts from a file with one JSON object per line.
///
/// Blank lines are skipped; a malformed line fails the whole read so a
/// truncated dump cannot silently shrink a run.
pub struct JsonLinesSource {
    path: PathBuf,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PostSource for JsonLinesSource {
    fn name(&self) -> &str {
        "json_lines"
    }

    async fn discover(
        &self,
        _target_type: &str,
        _target_value: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Post>> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let mut posts = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let post: Post = serde_json::from_str(line).map_err(|error| {
                Error::validation(format!(
                    "{}:{}: invalid post record: {error}",
                    self.path.display(),
                    index + 1
                ))
            })?;
            posts.push(post);
            if let Some(limit) = limit
                && posts.len() >= limit
            {
                break;
            }
        }
        debug!(path = %self.path.display(), count = posts.len(), "read post dump");
        Ok(posts)
    }
}

/// Discovers posts via a [`PostSource`] and records them as pending.
///
/// Halts the pipeline when the source returns nothing, since the later
/// stages would have no work.
pub struct AcquisitionStage {
    source: Arc<dyn PostSource>,
}

impl AcquisitionStage {
    pub fn new(source: Arc<dyn PostSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Stage for AcquisitionStage {
    fn name(&self) -> &str {
        "acquisition"
    }

    async fn process(&self, ctx: &mut PipelineContext) -> StageResult {
        let mut result = StageResult::new(self.name());

        let discovered = self
            .source
            .discover(
                &ctx.config.target_type,
                &ctx.config.target_value,
                ctx.config.limit,
            )
            .await;
        let posts = match discovered {
            Ok(posts) => posts,
            Err(error) => {
                ctx.emit(EventPayload::Error {
                    error_type: "acquisition".into(),
                    message: error.to_string(),
                    stage_name: Some(self.name().into()),
                    post_id: None,
                    recoverable: false,
                });
                result.add_error(format!(
                    "source {} failed: {error}",
                    self.source.name()
                ));
                return result;
            }
        };

        if let Some(state) = ctx.state.clone()
            && let Err(error) = state.save_posts(&ctx.session_id, &posts).await
        {
            result.add_error(format!("failed to persist discovered posts: {error}"));
            return result;
        }

        ctx.emit(EventPayload::PostsDiscovered {
            post_count: posts.len(),
            source: self.source.name().into(),
            target: ctx.config.target_value.clone(),
        });
        info!(
            source = self.source.name(),
            count = posts.len(),
            "acquired posts"
        );

        result.processed_count = posts.len();
        result.set_data("post_count", json!(posts.len()));
        result.set_data("source", json!(self.source.name()));
        if posts.is_empty() {
            result.add_warning("source returned no posts");
            result.halt_pipeline();
        }
        ctx.posts = posts;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::database::{PostStatus, StateManager};
    use crate::events::{EmitterConfig, EventEmitter, EventKind};
    use std::io::Write;

    /// Source with a fixed post list.
    struct FixedSource {
        posts: Vec<Post>,
    }

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
            let mut posts = self.posts.clone();
            if let Some(limit) = limit {
                posts.truncate(limit);
            }
            Ok(posts)
        }
    }

    async fn ctx_with_state() -> (PipelineContext, Arc<StateManager>) {
        let state = Arc::new(StateManager::open_in_memory().await.unwrap());
        let config = RunConfig::new("user", "spez", "out");
        let session_id = state
            .create_session("user", "spez", &config.config_hash().unwrap())
            .await
            .unwrap();
        let emitter = Arc::new(EventEmitter::new(EmitterConfig::default()));
        let ctx = PipelineContext::new(config, emitter).attach_state(Arc::clone(&state), session_id);
        (ctx, state)
    }

    #[tokio::test]
    async fn discovered_posts_are_persisted_as_pending() {
        let (mut ctx, state) = ctx_with_state().await;
        let stage = AcquisitionStage::new(Arc::new(FixedSource {
            posts: vec![Post::new("p1", "one"), Post::new("p2", "two")],
        }));

        let result = stage.process(&mut ctx).await;

        assert!(result.success);
        assert!(!result.halt);
        assert_eq!(ctx.posts.len(), 2);
        let records = state
            .get_posts(&ctx.session_id, Some(PostStatus::Pending))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        let history = ctx.emitter.history(Some(EventKind::PostsDiscovered), None);
        assert_eq!(history.len(), 1);
        ctx.emitter.shutdown().await;
    }

    #[tokio::test]
    async fn empty_source_halts_with_a_warning() {
        let (mut ctx, _state) = ctx_with_state().await;
        let stage = AcquisitionStage::new(Arc::new(FixedSource { posts: Vec::new() }));

        let result = stage.process(&mut ctx).await;

        assert!(result.success);
        assert!(result.halt);
        assert_eq!(result.warnings, vec!["source returned no posts".to_string()]);
        ctx.emitter.shutdown().await;
    }

    #[tokio::test]
    async fn json_lines_source_reads_a_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posts.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, r#"{{"id":"p1","title":"one"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"id":"p2","title":"two","score":5}}"#).unwrap();
        drop(file);

        let source = JsonLinesSource::new(&path);
        let posts = source.discover("user", "spez", None).await.unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[1].score, 5);

        let limited = source.discover("user", "spez", Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "p1");
    }

    #[tokio::test]
    async fn json_lines_source_rejects_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posts.jsonl");
        std::fs::write(&path, "{\"id\":\"p1\",\"title\":\"one\"}\nnot json\n").unwrap();

        let error = JsonLinesSource::new(&path)
            .discover("user", "spez", None)
            .await
            .unwrap_err();
        assert!(error.to_string().contains(":2:"), "error names the line: {error}");
    }
}
