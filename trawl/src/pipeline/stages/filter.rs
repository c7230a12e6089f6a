//! Second stage: drop posts that fail the configured rules.
//!
//! Rejected posts are marked `skipped` in the store with the reason, so a
//! resumed run does not rediscover them as pending work.

use async_trait::async_trait;
use serde_json::json;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::FilterRules;
use crate::database::PostStatus;
use crate::events::EventPayload;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::stage::{Stage, StageResult};
use crate::post::Post;

pub struct FilterStage {
    rules: FilterRules,
}

impl FilterStage {
    pub fn new(rules: FilterRules) -> Self {
        Self { rules }
    }

    /// Why a post is rejected, or `None` when it passes every rule.
    fn rejection(&self, post: &Post) -> Option<String> {
        let rules = &self.rules;
        if let Some(min) = rules.min_score
            && post.score < min
        {
            return Some(format!("score {} below minimum {min}", post.score));
        }
        if let Some(max) = rules.max_score
            && post.score > max
        {
            return Some(format!("score {} above maximum {max}", post.score));
        }
        if let Some(after) = rules.after
            && post.created_at < after
        {
            return Some(format!("created {} before window start", post.created_at));
        }
        if let Some(before) = rules.before
            && post.created_at >= before
        {
            return Some(format!("created {} after window end", post.created_at));
        }
        if !rules.allow_nsfw && post.nsfw {
            return Some("marked nsfw".to_string());
        }
        let title = post.title.to_lowercase();
        if !rules.include_keywords.is_empty()
            && !rules
                .include_keywords
                .iter()
                .any(|keyword| title.contains(&keyword.to_lowercase()))
        {
            return Some("title lacks required keywords".to_string());
        }
        for keyword in &rules.exclude_keywords {
            if title.contains(&keyword.to_lowercase()) {
                return Some(format!("title contains excluded keyword '{keyword}'"));
            }
        }
        None
    }

    /// Human-readable summary of the active rules.
    fn criteria(&self) -> Vec<String> {
        let rules = &self.rules;
        let mut criteria = Vec::new();
        if let Some(min) = rules.min_score {
            criteria.push(format!("min_score>={min}"));
        }
        if let Some(max) = rules.max_score {
            criteria.push(format!("max_score<={max}"));
        }
        if let Some(after) = rules.after {
            criteria.push(format!("after>={}", after.to_rfc3339()));
        }
        if let Some(before) = rules.before {
            criteria.push(format!("before<{}", before.to_rfc3339()));
        }
        if !rules.include_keywords.is_empty() {
            criteria.push(format!("include:{}", rules.include_keywords.join(",")));
        }
        if !rules.exclude_keywords.is_empty() {
            criteria.push(format!("exclude:{}", rules.exclude_keywords.join(",")));
        }
        if !rules.allow_nsfw {
            criteria.push("nsfw_excluded".to_string());
        }
        criteria
    }
}

#[async_trait]
impl Stage for FilterStage {
    fn name(&self) -> &str {
        "filter"
    }

    fn validate_config(&self) -> Vec<String> {
        match self.rules.validate() {
            Ok(()) => Vec::new(),
            Err(error) => vec![error.to_string()],
        }
    }

    async fn process(&self, ctx: &mut PipelineContext) -> StageResult {
        let mut result = StageResult::new(self.name());
        let timer = Instant::now();
        let before = ctx.posts.len();

        let mut kept = Vec::with_capacity(before);
        let mut rejected = Vec::new();
        for post in ctx.posts.drain(..) {
            match self.rejection(&post) {
                Some(reason) => rejected.push((post, reason)),
                None => kept.push(post),
            }
        }

        if let Some(state) = ctx.state.clone() {
            for (post, reason) in &rejected {
                if let Err(error) = state
                    .mark_post_processed(
                        &ctx.session_id,
                        &post.id,
                        PostStatus::Skipped,
                        Some(reason),
                    )
                    .await
                {
                    result.add_error(format!(
                        "failed to mark post {} skipped: {error}",
                        post.id
                    ));
                    ctx.posts = kept;
                    return result;
                }
                debug!(post_id = %post.id, reason = %reason, "post skipped");
            }
        }

        let after = kept.len();
        ctx.posts = kept;
        ctx.emit(EventPayload::FilterApplied {
            posts_before: before,
            posts_after: after,
            posts_filtered: before - after,
            criteria: self.criteria(),
            processing_time: timer.elapsed(),
        });
        info!(before, after, filtered = before - after, "filter applied");

        result.processed_count = before;
        result.set_data("posts_before", json!(before));
        result.set_data("posts_after", json!(after));
        result.set_data("posts_filtered", json!(before - after));
        result
    }
}
