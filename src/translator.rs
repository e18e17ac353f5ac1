//! Batched localized-name requests.

use crate::data_source::DataSourceClient;
use crate::response_parser::{self, TranslationMap};
use crate::schema::LanguageCode;
use std::collections::HashMap;
use tracing::{debug, warn};

pub struct Translator {
    client: DataSourceClient,
}

impl Translator {
    pub fn new(client: DataSourceClient) -> Self {
        Self { client }
    }

    /// Localize `names` into `languages` with a single external call.
    ///
    /// Returns `None` when the call fails or nothing usable comes back; the
    /// caller carries on without translations for this batch. The result only
    /// contains requested names (keyed by the requested spelling) and
    /// requested languages.
    pub async fn translate(
        &self,
        names: &[String],
        languages: &[LanguageCode],
    ) -> Option<TranslationMap> {
        if names.is_empty() || languages.is_empty() {
            return Some(TranslationMap::new());
        }

        let label = format!("translate/{}/{}", names.len(), languages.join(","));
        let response = match self.client.complete(&label, build_prompt(names, languages)).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Translation request failed ({} names): {}", names.len(), e);
                return None;
            }
        };

        let Some(parsed) = response_parser::parse_translations(&response) else {
            warn!("Unparseable translation response ({} names)", names.len());
            return None;
        };

        let by_key: HashMap<String, &HashMap<String, String>> = parsed
            .iter()
            .map(|(name, langs)| (name.trim().to_lowercase(), langs))
            .collect();

        let mut out = TranslationMap::new();
        for name in names {
            let Some(found) = by_key.get(&name.trim().to_lowercase()) else {
                continue;
            };
            let wanted: HashMap<String, String> = languages
                .iter()
                .filter_map(|lang| found.get(lang).map(|v| (lang.clone(), v.clone())))
                .collect();
            if !wanted.is_empty() {
                out.insert(name.clone(), wanted);
            }
        }

        debug!(
            "Translated {}/{} names into {:?}",
            out.len(),
            names.len(),
            languages
        );

        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

fn build_prompt(names: &[String], languages: &[LanguageCode]) -> String {
    let names_json = serde_json::to_string(names).unwrap_or_else(|_| "[]".to_string());
    let languages_json = serde_json::to_string(languages).unwrap_or_else(|_| "[]".to_string());

    format!(
        r#"Translate the following geographic place names into each of the requested languages.
Use the established exonym when one exists; otherwise transliterate or keep the original name.

Names: {names_json}
Languages: {languages_json}

Return ONLY valid JSON with this structure, using each name exactly as given as the key
and each language code exactly as given:
{{"translations": {{"<name>": {{"<language>": "<localized name>"}}}}}}"#,
        names_json = names_json,
        languages_json = languages_json,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::{CompletionProvider, CompletionRequest, DataSourceError};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct FixedProvider {
        reply: Result<String, DataSourceError>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl CompletionProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String, DataSourceError> {
            self.prompts.lock().unwrap().push(request.user.clone());
            self.reply.clone()
        }
    }

    fn make_translator(reply: Result<String, DataSourceError>) -> (Translator, Arc<FixedProvider>) {
        let provider = Arc::new(FixedProvider {
            reply,
            prompts: Mutex::new(Vec::new()),
        });
        let client = DataSourceClient::new(provider.clone(), Duration::from_secs(1));
        (Translator::new(client), provider)
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_single_batched_call_filters_to_request() {
        let reply = r#"{"translations": {
            "northshire": {"fr": "Rive-Nord", "es": "Costa Norte", "de": "Nordufer"},
            "Eastvale": {"fr": "Val-de-l'Est"},
            "Unasked": {"fr": "?"}
        }}"#;
        let (translator, provider) = make_translator(Ok(reply.to_string()));

        let names = strings(&["Northshire", "Eastvale", "Southmoor"]);
        let map = translator.translate(&names, &strings(&["fr", "es"])).await.unwrap();

        assert_eq!(provider.prompts.lock().unwrap().len(), 1);
        assert_eq!(map.len(), 2);
        assert_eq!(map["Northshire"].len(), 2);
        assert_eq!(map["Northshire"]["es"], "Costa Norte");
        assert_eq!(map["Eastvale"]["fr"], "Val-de-l'Est");
        assert!(!map.contains_key("Unasked"));

        let prompts = provider.prompts.lock().unwrap();
        let prompt = &prompts[0];
        assert!(prompt.contains(r#"Names: ["Northshire","Eastvale","Southmoor"]"#));
        assert!(prompt.contains(r#"Languages: ["fr","es"]"#));
    }

    #[tokio::test]
    async fn test_failure_degrades_to_none() {
        let (translator, _) = make_translator(Err(DataSourceError::Transport("boom".to_string())));
        assert!(translator
            .translate(&strings(&["A"]), &strings(&["fr"]))
            .await
            .is_none());

        let (translator, _) = make_translator(Ok("no idea".to_string()));
        assert!(translator
            .translate(&strings(&["A"]), &strings(&["fr"]))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_empty_request_makes_no_call() {
        let (translator, provider) = make_translator(Ok("{}".to_string()));
        let map = translator.translate(&[], &strings(&["fr"])).await.unwrap();
        assert!(map.is_empty());
        assert!(provider.prompts.lock().unwrap().is_empty());
    }
}
