//! The work item flowing through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single item discovered by a source.
///
/// `id` is the source's natural key and must be unique within a session.
/// Everything the core does not interpret travels in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub author: String,
    /// Canonical URL of the item itself.
    #[serde(default)]
    pub url: String,
    /// Media attachments to download.
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl Post {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            author: String::new(),
            url: String::new(),
            media_urls: Vec::new(),
            score: 0,
            created_at: Utc::now(),
            nsfw: false,
            text: None,
            extra: serde_json::Value::Null,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_media_url(mut self, url: impl Into<String>) -> Self {
        self.media_urls.push(url.into());
        self
    }

    pub fn with_score(mut self, score: i64) -> Self {
        self.score = score;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_nsfw(mut self, nsfw: bool) -> Self {
        self.nsfw = nsfw;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_missing_optional_fields() {
        let post: Post = serde_json::from_str(r#"{"id":"abc","title":"hello"}"#).unwrap();
        assert_eq!(post.id, "abc");
        assert_eq!(post.title, "hello");
        assert!(post.media_urls.is_empty());
        assert_eq!(post.score, 0);
        assert!(!post.nsfw);
        assert!(post.text.is_none());
    }

    #[test]
    fn builder_accumulates_media_urls() {
        let post = Post::new("p1", "t")
            .with_media_url("https://example.com/a.jpg")
            .with_media_url("https://example.com/b.jpg");
        assert_eq!(post.media_urls.len(), 2);
    }
}
