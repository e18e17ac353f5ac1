//! Population engine configuration.
//!
//! Defaults are compiled in, optionally overridden by a JSON file
//! (`POPULATOR_CONFIG`) and then by individual environment variables.

use crate::schema::{LanguageCode, Level};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::info;

/// Tunables for a population run. All of these are engine inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationConfig {
    /// Languages used when a job request does not name any.
    #[serde(default = "default_languages")]
    pub default_languages: Vec<LanguageCode>,
    /// Hard cap on items requested in a single external call.
    #[serde(default = "default_max_items")]
    pub max_items_per_call: usize,
    #[serde(default = "default_max_items")]
    pub max_sub_regions: usize,
    #[serde(default = "default_max_items")]
    pub max_local_areas: usize,
    #[serde(default = "default_max_items")]
    pub max_settlements: usize,
    /// Settlements are only fetched for this many local areas per sub-region.
    #[serde(default = "default_settlement_parent_limit")]
    pub settlement_parent_limit: usize,
    /// Pause before every external call except the first one of a job.
    #[serde(default = "default_call_delay_ms")]
    pub call_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Attempts per level fetch before the branch is given up.
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: usize,
    #[serde(default = "default_max_items")]
    pub translation_batch_size: usize,
}

fn default_languages() -> Vec<LanguageCode> {
    vec!["en".to_string()]
}

fn default_max_items() -> usize {
    40
}

fn default_settlement_parent_limit() -> usize {
    10
}

fn default_call_delay_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_fetch_attempts() -> usize {
    2
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            default_languages: default_languages(),
            max_items_per_call: default_max_items(),
            max_sub_regions: default_max_items(),
            max_local_areas: default_max_items(),
            max_settlements: default_max_items(),
            settlement_parent_limit: default_settlement_parent_limit(),
            call_delay_ms: default_call_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            fetch_attempts: default_fetch_attempts(),
            translation_batch_size: default_max_items(),
        }
    }
}

impl PopulationConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: PopulationConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        info!("Loaded population config from {:?}", path);
        Ok(config)
    }

    /// Build the effective config from `POPULATOR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("POPULATOR_CONFIG") {
            Ok(path) => Self::load_from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Ok(langs) = std::env::var("POPULATOR_DEFAULT_LANGUAGES") {
            let requested: Vec<String> = langs.split(',').map(|s| s.to_string()).collect();
            config.default_languages = normalize_languages(&requested)
                .context("Invalid POPULATOR_DEFAULT_LANGUAGES")?;
        }
        if let Ok(delay) = std::env::var("POPULATOR_CALL_DELAY_MS") {
            config.call_delay_ms = delay
                .trim()
                .parse()
                .context("POPULATOR_CALL_DELAY_MS must be an integer")?;
        }
        if let Ok(timeout) = std::env::var("POPULATOR_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = timeout
                .trim()
                .parse()
                .context("POPULATOR_REQUEST_TIMEOUT_SECS must be an integer")?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_languages.is_empty() {
            anyhow::bail!("default_languages must not be empty");
        }
        normalize_languages(&self.default_languages)?;
        if self.max_items_per_call == 0 {
            anyhow::bail!("max_items_per_call must be at least 1");
        }
        if self.fetch_attempts == 0 {
            anyhow::bail!("fetch_attempts must be at least 1");
        }
        if self.translation_batch_size == 0 {
            anyhow::bail!("translation_batch_size must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Maximum children kept for a level, never above the per-call cap.
    pub fn cap_for(&self, level: Level) -> usize {
        let cap = match level {
            Level::Region => 1,
            Level::SubRegion => self.max_sub_regions,
            Level::LocalArea => self.max_local_areas,
            Level::Settlement => self.max_settlements,
        };
        cap.min(self.max_items_per_call)
    }

    /// How many children of a `level` node are descended into, if bounded.
    pub fn descent_limit(&self, level: Level) -> Option<usize> {
        match level {
            Level::LocalArea => Some(self.settlement_parent_limit),
            _ => None,
        }
    }

    pub fn call_delay(&self) -> Duration {
        Duration::from_millis(self.call_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn language_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z]{2,3}(-[a-z0-9]{2,8})?$").expect("valid language regex"))
}

/// Lowercase, trim and deduplicate language codes, keeping first-seen order.
pub fn normalize_languages(requested: &[String]) -> Result<Vec<LanguageCode>> {
    let mut out: Vec<LanguageCode> = Vec::new();
    for raw in requested {
        let code = raw.trim().to_lowercase().replace('_', "-");
        if code.is_empty() {
            continue;
        }
        if !language_pattern().is_match(&code) {
            anyhow::bail!("Invalid language code: {:?}", raw);
        }
        if !out.contains(&code) {
            out.push(code);
        }
    }
    Ok(out)
}
