//! Defensive parsing of LLM responses.
//!
//! The data source enforces no schema, so every entry point returns `None`
//! instead of an error when the text cannot be understood. Callers treat
//! `None` as "no data".

use serde::Deserialize;
use std::collections::HashMap;

/// name → (language → localized name)
pub type TranslationMap = HashMap<String, HashMap<String, String>>;

/// Parse raw response text into a JSON value.
///
/// Strips Markdown code fences, tries a strict parse, then retries on the
/// first balanced `{...}` or `[...]` substring.
pub fn parse(response: &str) -> Option<serde_json::Value> {
    let json_str = strip_code_fence(response);

    if let Ok(value) = serde_json::from_str(json_str) {
        return Some(value);
    }

    let candidate = first_balanced(json_str).or_else(|| first_balanced(response))?;
    serde_json::from_str(candidate).ok()
}

/// Parse a child-list response into trimmed, de-duplicated names (source order).
pub fn parse_child_names(response: &str) -> Option<Vec<String>> {
    let value = parse(response)?;

    let entries: Vec<ChildEntry> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value).ok()?,
        serde_json::Value::Object(ref map) => {
            match serde_json::from_value::<ChildListResponse>(value.clone()) {
                Ok(list) if list.items.is_some() => list.items.unwrap_or_default(),
                _ => {
                    // Unknown wrapper key: use the first array found.
                    let array = map.values().find(|v| v.is_array())?.clone();
                    serde_json::from_value(array).ok()?
                }
            }
        }
        _ => return None,
    };

    let mut names: Vec<String> = Vec::new();
    for entry in entries {
        let Some(name) = entry.name() else { continue };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let key = name.to_lowercase();
        if names.iter().any(|n| n.to_lowercase() == key) {
            continue;
        }
        names.push(name.to_string());
    }

    Some(names)
}

/// Parse a translation response into a [`TranslationMap`].
///
/// Non-string values are ignored; a response with no usable entries is `None`.
pub fn parse_translations(response: &str) -> Option<TranslationMap> {
    let value = parse(response)?;

    let raw: HashMap<String, serde_json::Value> =
        match serde_json::from_value::<TranslationResponse>(value.clone()) {
            Ok(wrapped) => wrapped.translations,
            Err(_) => serde_json::from_value(value).ok()?,
        };

    let mut out = TranslationMap::new();
    for (name, per_language) in raw {
        let Some(obj) = per_language.as_object() else { continue };
        let languages: HashMap<String, String> = obj
            .iter()
            .filter_map(|(lang, v)| {
                let text = v.as_str()?.trim();
                (!text.is_empty()).then(|| (lang.trim().to_lowercase(), text.to_string()))
            })
            .collect();
        if !languages.is_empty() {
            out.insert(name, languages);
        }
    }

    (!out.is_empty()).then_some(out)
}

// ============================================================================
// Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChildListResponse {
    #[serde(default, alias = "children", alias = "results", alias = "names")]
    items: Option<Vec<ChildEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChildEntry {
    Name(String),
    Object {
        #[serde(default, alias = "canonical_name")]
        name: Option<String>,
    },
    Other(serde::de::IgnoredAny),
}

impl ChildEntry {
    fn name(&self) -> Option<&str> {
        match self {
            ChildEntry::Name(name) => Some(name),
            ChildEntry::Object { name } => name.as_deref(),
            ChildEntry::Other(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TranslationResponse {
    translations: HashMap<String, serde_json::Value>,
}

// ============================================================================
// Helpers
// ============================================================================

fn strip_code_fence(response: &str) -> &str {
    if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    }
}

/// First balanced `{...}` or `[...]` substring, skipping brackets inside strings.
fn first_balanced(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find(|c: char| c == '{' || c == '[') {
        let start = search_from + offset;
        if let Some(end) = balanced_end(bytes, start) {
            return Some(&text[start..=end]);
        }
        search_from = start + 1;
    }

    None
}

fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(b) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}
