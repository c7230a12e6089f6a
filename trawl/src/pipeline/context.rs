//! Shared state flowing through a pipeline run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RunConfig;
use crate::database::StateManager;
use crate::error::Result;
use crate::events::{Event, EventEmitter, EventPayload};
use crate::post::Post;

/// Mutable context handed to each stage in order.
///
/// Stages mutate the working set and metadata in place; the context is
/// never cloned per stage.
pub struct PipelineContext {
    /// Current working set. Stages replace or shrink it.
    pub posts: Vec<Post>,
    pub config: RunConfig,
    /// Free-form run-scoped values stages leave for one another.
    pub run_metadata: HashMap<String, serde_json::Value>,
    pub emitter: Arc<EventEmitter>,
    /// Session store; stages that persist progress require it.
    pub state: Option<Arc<StateManager>>,
    /// Run identifier stamped on every emitted event. A short random id
    /// until [`attach_state`](Self::attach_state) supplies the persisted
    /// session id.
    pub session_id: String,
    /// When this run was prepared. Covers setup work the per-stage
    /// durations do not.
    pub started_at: DateTime<Utc>,
}

impl PipelineContext {
    pub fn new(config: RunConfig, emitter: Arc<EventEmitter>) -> Self {
        let session_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            posts: Vec::new(),
            config,
            run_metadata: HashMap::new(),
            emitter,
            state: None,
            session_id,
            started_at: Utc::now(),
        }
    }

    /// Wire the context to a persisted session.
    pub fn attach_state(mut self, state: Arc<StateManager>, session_id: impl Into<String>) -> Self {
        self.state = Some(state);
        self.session_id = session_id.into();
        self
    }

    /// Emit a fire-and-forget event stamped with this run's id.
    pub fn emit(&self, payload: EventPayload) -> bool {
        self.emitter
            .emit(Event::new(payload).with_session(self.session_id.as_str()))
    }

    /// Emit and wait for every observer.
    pub async fn emit_sync(&self, payload: EventPayload) -> Result<()> {
        self.emitter
            .emit_sync(Event::new(payload).with_session(self.session_id.as_str()))
            .await
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        self.run_metadata
            .insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn get_metadata<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.run_metadata
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EmitterConfig;

    #[tokio::test]
    async fn metadata_round_trips_typed_values() {
        let emitter = Arc::new(EventEmitter::new(EmitterConfig::default()));
        let mut ctx = PipelineContext::new(RunConfig::new("user", "spez", "out"), emitter);

        ctx.set_metadata("count", 3usize).unwrap();
        ctx.set_metadata("label", "hello").unwrap();

        assert_eq!(ctx.get_metadata::<usize>("count"), Some(3));
        assert_eq!(ctx.get_metadata::<String>("label"), Some("hello".to_string()));
        assert_eq!(ctx.get_metadata::<usize>("missing"), None);
        ctx.emitter.shutdown().await;
    }

    #[tokio::test]
    async fn emitted_events_carry_the_run_id() {
        let emitter = Arc::new(EventEmitter::new(EmitterConfig::default()));
        let ctx = PipelineContext::new(RunConfig::new("user", "spez", "out"), emitter);
        assert_eq!(ctx.session_id.len(), 8);

        ctx.emit(EventPayload::PostsDiscovered {
            post_count: 1,
            source: "test".into(),
            target: "spez".into(),
        });

        let history = ctx.emitter.history(None, None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].session_id, ctx.session_id);
        ctx.emitter.shutdown().await;
    }
}
