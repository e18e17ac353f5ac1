//! Test doubles for the external data source.

use crate::config::PopulationConfig;
use crate::data_source::{CompletionProvider, CompletionRequest, DataSourceClient, DataSourceError};
use crate::populator::HierarchyPopulator;
use crate::store::ReferenceStore;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Config with no inter-call delay and a short timeout.
pub fn fast_config() -> PopulationConfig {
    PopulationConfig {
        call_delay_ms: 0,
        request_timeout_secs: 5,
        ..PopulationConfig::default()
    }
}

pub fn populator_for(
    store: Arc<dyn ReferenceStore>,
    provider: Arc<FakeGeoProvider>,
    config: PopulationConfig,
) -> HierarchyPopulator {
    let client = DataSourceClient::new(provider, config.request_timeout());
    HierarchyPopulator::new(store, client, config)
}

/// Synthesizes a deterministic hierarchy and records every request.
///
/// Children of `P` at level X are named `"P X1".."P Xn"` (S, L, T for
/// sub-regions, local areas and settlements); every name translates to
/// `"<name> (<lang>)"`.
pub struct FakeGeoProvider {
    fan_out: usize,
    calls: Mutex<Vec<CompletionRequest>>,
    failing: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeGeoProvider {
    pub fn new(fan_out: usize) -> Self {
        Self {
            fan_out,
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Hold every request until [`FakeGeoProvider::open_gate`] is called.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Requests whose label contains `pattern` fail with a transport error.
    pub fn fail_labels_containing(&self, pattern: &str) {
        self.failing.lock().unwrap().push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn labels(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|r| r.label.clone()).collect()
    }

    pub fn translation_prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.label.starts_with("translate/"))
            .map(|r| r.user.clone())
            .collect()
    }

    fn children_reply(&self, label: &str) -> String {
        // children/<level label>/<parent name>
        let mut parts = label.splitn(3, '/');
        let _ = parts.next();
        let level = parts.next().unwrap_or_default();
        let parent = parts.next().unwrap_or_default();
        let prefix = match level {
            "sub-region" => "S",
            "local area" => "L",
            _ => "T",
        };
        let items: Vec<_> = (1..=self.fan_out)
            .map(|i| json!({ "name": format!("{} {}{}", parent, prefix, i) }))
            .collect();
        json!({ "items": items }).to_string()
    }

    fn translation_reply(&self, prompt: &str) -> String {
        let names = json_line(prompt, "Names: ");
        let languages = json_line(prompt, "Languages: ");
        let mut translations = serde_json::Map::new();
        for name in &names {
            let per_language: serde_json::Map<String, serde_json::Value> = languages
                .iter()
                .map(|lang| (lang.clone(), json!(format!("{} ({})", name, lang))))
                .collect();
            translations.insert(name.clone(), serde_json::Value::Object(per_language));
        }
        // Wrapped in prose and a fence, as real models sometimes do.
        format!(
            "Here are the translations:\n```json\n{}\n```",
            json!({ "translations": translations })
        )
    }
}

fn json_line(prompt: &str, prefix: &str) -> Vec<String> {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix(prefix))
        .and_then(|rest| serde_json::from_str(rest).ok())
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl CompletionProvider for FakeGeoProvider {
    fn name(&self) -> &str {
        "fake-geo"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, DataSourceError> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        self.calls.lock().unwrap().push(request.clone());

        let fails = self
            .failing
            .lock()
            .unwrap()
            .iter()
            .any(|pattern| request.label.contains(pattern.as_str()));
        if fails {
            return Err(DataSourceError::Transport(format!("injected failure for {}", request.label)));
        }

        if request.label.starts_with("children/") {
            Ok(self.children_reply(&request.label))
        } else if request.label.starts_with("translate/") {
            Ok(self.translation_reply(&request.user))
        } else {
            Err(DataSourceError::Timeout(Duration::from_secs(0)))
        }
    }
}
