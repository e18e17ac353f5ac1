//! External generative data source.
//!
//! Defines the [`CompletionProvider`] trait so the transport (OpenRouter in
//! production, scripted fakes in tests) can be swapped, and the
//! [`DataSourceClient`] that turns a hierarchy question into exactly one
//! deterministic, JSON-only, time-bounded request.

use crate::schema::Level;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Fixed system instruction for every request.
const SYSTEM_INSTRUCTION: &str = "You are a reference-data service for geographic administrative divisions. \
Respond with a single valid JSON value and nothing else: no prose, no Markdown, no code fences. \
Use the official, commonly used canonical names. If you do not know the answer, return an empty list.";

/// Completion budget per request; generous for 40 items with short names.
const MAX_TOKENS: u32 = 4096;

/// Errors returned for a single external request. Never retried here.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DataSourceError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

/// One text-completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Short description used in logs, e.g. `children/local area/Northshire`.
    pub label: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub json_only: bool,
    pub max_tokens: u32,
}

/// Async trait implemented by each text-completion backend.
#[async_trait::async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest) -> Result<String, DataSourceError>;
}

/// Builds requests and enforces the timeout around a [`CompletionProvider`].
#[derive(Clone)]
pub struct DataSourceClient {
    provider: Arc<dyn CompletionProvider>,
    timeout: Duration,
}

impl DataSourceClient {
    pub fn new(provider: Arc<dyn CompletionProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    /// Ask for the children of `parent_name` at `child_level`.
    ///
    /// `parent_path` is the ancestry from the root, e.g. `["Lakeland", "Northshire"]`,
    /// and disambiguates names that repeat across regions.
    pub async fn fetch_children(
        &self,
        parent_name: &str,
        parent_path: &[String],
        child_level: Level,
        max_items: usize,
    ) -> Result<String, DataSourceError> {
        let parent_label = child_level
            .parent()
            .map(|l| l.label())
            .unwrap_or("region");
        let label = format!("children/{}/{}", child_level.label(), parent_name);
        let user = build_children_prompt(parent_name, parent_label, parent_path, child_level, max_items);
        self.complete(&label, user).await
    }

    /// Send an arbitrary user prompt with the standard request discipline.
    pub async fn complete(&self, label: &str, user: String) -> Result<String, DataSourceError> {
        let request = CompletionRequest {
            label: label.to_string(),
            system: SYSTEM_INSTRUCTION.to_string(),
            user,
            temperature: 0.0,
            json_only: true,
            max_tokens: MAX_TOKENS,
        };

        debug!("Data source request via {}: {}", self.provider.name(), label);

        match tokio::time::timeout(self.timeout, self.provider.complete(&request)).await {
            Ok(result) => {
                if let Ok(text) = &result {
                    debug!("Data source response for {}: {} chars", label, text.len());
                }
                result
            }
            Err(_) => Err(DataSourceError::Timeout(self.timeout)),
        }
    }
}

fn build_children_prompt(
    parent_name: &str,
    parent_label: &str,
    parent_path: &[String],
    child_level: Level,
    max_items: usize,
) -> String {
    let context = if parent_path.len() > 1 {
        format!(" (located in: {})", parent_path.join(" > "))
    } else {
        String::new()
    };

    format!(
        r#"List the {plural} of the {parent_label} "{parent_name}"{context}.

Rules:
- Return at most {max_items} items, most significant first.
- Only direct {plural} of "{parent_name}"; do not include "{parent_name}" itself.
- Use the canonical name of each {singular}, without type suffixes or numbering.

Return ONLY valid JSON with this structure:
{{"items": [{{"name": "..."}}]}}"#,
        plural = child_level.plural(),
        singular = child_level.label(),
        parent_label = parent_label,
        parent_name = parent_name,
        context = context,
        max_items = max_items,
    )
}
