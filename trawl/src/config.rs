//! Run configuration.
//!
//! A `RunConfig` describes one harvest run: where items come from, where
//! media lands, and which filters apply. Its deterministic hash identifies
//! "the same run" across restarts and feeds the duplicate-session guard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Number of hex characters kept from the configuration digest.
const CONFIG_HASH_LEN: usize = 16;

fn default_concurrency() -> usize {
    4
}

/// Configuration for a single pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Kind of target this run harvests, e.g. "user" or "feed".
    pub target_type: String,
    /// Target identifier within its kind.
    pub target_value: String,
    /// Path the built-in source reads items from.
    #[serde(default)]
    pub input: Option<String>,
    /// Directory downloaded media is written to.
    pub output_dir: String,
    /// Cap on discovered items; `None` means take everything.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Concurrent downloads inside the processing stage.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub filters: FilterRules,
}

impl RunConfig {
    pub fn new(
        target_type: impl Into<String>,
        target_value: impl Into<String>,
        output_dir: impl Into<String>,
    ) -> Self {
        Self {
            target_type: target_type.into(),
            target_value: target_value.into(),
            input: None,
            output_dir: output_dir.into(),
            limit: None,
            concurrency: default_concurrency(),
            filters: FilterRules::default(),
        }
    }

    /// Deterministic identity of this configuration.
    ///
    /// First 16 hex characters of the SHA-256 over the canonical JSON form.
    /// Struct field order is fixed, so equal configs hash equal.
    pub fn config_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(hex::encode(digest)[..CONFIG_HASH_LEN].to_string())
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_type.trim().is_empty() {
            return Err(Error::config("target_type must not be empty"));
        }
        if self.target_value.trim().is_empty() {
            return Err(Error::config("target_value must not be empty"));
        }
        if self.output_dir.trim().is_empty() {
            return Err(Error::config("output_dir must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(Error::config("concurrency must be at least 1"));
        }
        if self.limit == Some(0) {
            return Err(Error::config("limit must be at least 1 when set"));
        }
        self.filters.validate()
    }
}

/// Predicate set applied by the filter stage.
///
/// Empty rules pass everything through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRules {
    #[serde(default)]
    pub min_score: Option<i64>,
    #[serde(default)]
    pub max_score: Option<i64>,
    /// Keep items created at or after this instant.
    #[serde(default)]
    pub after: Option<DateTime<Utc>>,
    /// Keep items created strictly before this instant.
    #[serde(default)]
    pub before: Option<DateTime<Utc>>,
    /// Title must contain at least one of these (case-insensitive).
    #[serde(default)]
    pub include_keywords: Vec<String>,
    /// Title must contain none of these (case-insensitive).
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    #[serde(default = "FilterRules::default_allow_nsfw")]
    pub allow_nsfw: bool,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            min_score: None,
            max_score: None,
            after: None,
            before: None,
            include_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
            allow_nsfw: true,
        }
    }
}

impl FilterRules {
    fn default_allow_nsfw() -> bool {
        true
    }

    /// True when no predicate is configured at all.
    pub fn is_empty(&self) -> bool {
        self.min_score.is_none()
            && self.max_score.is_none()
            && self.after.is_none()
            && self.before.is_none()
            && self.include_keywords.is_empty()
            && self.exclude_keywords.is_empty()
            && self.allow_nsfw
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min_score, self.max_score)
            && min > max
        {
            return Err(Error::config(format!(
                "min_score {min} is greater than max_score {max}"
            )));
        }
        if let (Some(after), Some(before)) = (self.after, self.before)
            && after >= before
        {
            return Err(Error::config("date window is empty: after >= before"));
        }
        Ok(())
    }
}
