//! Supabase (PostgREST) backed reference and job stores.
//!
//! Expected tables in the configured schema (default `reference`):
//! `regions`, `sub_regions(region_id)`, `local_areas(sub_region_id)`,
//! `settlements(local_area_id)`, `localized_names` with a unique
//! `(node_id, language)` constraint, and `population_jobs(id, root_key, status, payload)`.

use crate::jobs::JobStore;
use crate::schema::{HierarchyNode, Job, LanguageCode, Level};
use crate::store::ReferenceStore;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_SCHEMA: &str = "reference";

/// Supabase client configuration.
#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    service_role_key: String,
    schema: String,
}

impl SupabaseClient {
    /// Create a client from `SUPABASE_URL` / `SUPABASE_SERVICE_ROLE_KEY`.
    /// Returns `None` when either is unset, in which case in-memory stores are used.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_role_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY").ok()?;
        let schema = std::env::var("SUPABASE_SCHEMA").unwrap_or_else(|_| DEFAULT_SCHEMA.to_string());

        info!("Supabase persistence enabled (schema: {})", schema);
        Some(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key,
            schema,
        })
    }

    /// Helper: GET from Supabase REST API.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Accept-Profile", &self.schema)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Supabase GET {} failed: {} - {}", table, status, text));
        }

        Ok(resp.json().await?)
    }

    /// Helper: POST rows. Returns the raw response so callers can inspect conflicts.
    async fn post(
        &self,
        table: &str,
        query: &[(&str, String)],
        prefer: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        let resp = self
            .client
            .post(&url)
            .query(query)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
            .header("Content-Profile", &self.schema)
            .header("Prefer", prefer)
            .json(body)
            .send()
            .await?;
        Ok(resp)
    }
}

// ============================================================================
// Reference store
// ============================================================================

fn table(level: Level) -> &'static str {
    match level {
        Level::Region => "regions",
        Level::SubRegion => "sub_regions",
        Level::LocalArea => "local_areas",
        Level::Settlement => "settlements",
    }
}

fn parent_column(level: Level) -> Option<&'static str> {
    match level {
        Level::Region => None,
        Level::SubRegion => Some("region_id"),
        Level::LocalArea => Some("sub_region_id"),
        Level::Settlement => Some("local_area_id"),
    }
}

fn node_select(level: Level) -> String {
    match parent_column(level) {
        Some(col) => format!("id,canonical_name,is_deleted,created_at,parent_id:{}", col),
        None => "id,canonical_name,is_deleted,created_at".to_string(),
    }
}

/// Filter matching `name` exactly, ignoring case.
///
/// PostgREST rewrites every `*` in a like pattern to `%`, which cannot be
/// escaped, so names containing `*` fall back to a case-sensitive `eq`.
fn name_filter(name: &str) -> String {
    let name = name.trim();
    if name.contains('*') {
        return format!("eq.{}", name);
    }
    format!("ilike.{}", ilike_exact(name))
}

/// Escape LIKE wildcards so `ilike` behaves as a case-insensitive equality.
fn ilike_exact(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Deserialize)]
struct NodeRow {
    id: Uuid,
    canonical_name: String,
    #[serde(default)]
    is_deleted: bool,
    created_at: DateTime<Utc>,
    #[serde(default)]
    parent_id: Option<Uuid>,
}

impl NodeRow {
    fn into_node(self, level: Level) -> HierarchyNode {
        HierarchyNode {
            id: self.id,
            level,
            canonical_name: self.canonical_name,
            parent_id: self.parent_id,
            is_deleted: self.is_deleted,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LanguageRow {
    language: LanguageCode,
}

#[derive(Clone)]
pub struct SupabaseReferenceStore {
    client: SupabaseClient,
}

impl SupabaseReferenceStore {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ReferenceStore for SupabaseReferenceStore {
    async fn find_by_name_under_parent(
        &self,
        level: Level,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> Result<Option<HierarchyNode>> {
        let mut query = vec![
            ("select", node_select(level)),
            ("canonical_name", name_filter(name)),
            ("is_deleted", "eq.false".to_string()),
            ("limit", "1".to_string()),
        ];
        if let (Some(col), Some(pid)) = (parent_column(level), parent_id) {
            query.push((col, format!("eq.{}", pid)));
        }

        let rows: Vec<NodeRow> = self.client.get_json(table(level), &query).await?;
        Ok(rows.into_iter().next().map(|r| r.into_node(level)))
    }

    async fn create_node(
        &self,
        level: Level,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> Result<(HierarchyNode, bool)> {
        if let Some(existing) = self.find_by_name_under_parent(level, name, parent_id).await? {
            return Ok((existing, false));
        }

        let node = HierarchyNode::new(level, name, parent_id);
        let mut body = json!({
            "id": node.id,
            "canonical_name": node.canonical_name,
            "is_deleted": false,
            "created_at": node.created_at,
        });
        match (parent_column(level), parent_id) {
            (Some(col), Some(pid)) => body[col] = json!(pid),
            (None, None) => {}
            _ => anyhow::bail!("Invalid parent for {} '{}'", level, name),
        }

        let resp = self
            .client
            .post(table(level), &[], "return=minimal", &body)
            .await?;

        let status = resp.status();
        if status == StatusCode::CONFLICT {
            // Lost a race with another writer; the row exists now.
            debug!("Conflict creating {} '{}', re-reading", level, name);
            return self
                .find_by_name_under_parent(level, name, parent_id)
                .await?
                .map(|n| (n, false))
                .ok_or_else(|| anyhow!("{} '{}' conflicted but could not be read back", level, name));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Failed to insert {} '{}': {} - {}", level, name, status, text));
        }

        debug!("Inserted {}: {}", level, node.canonical_name);
        Ok((node, true))
    }

    async fn list_active_children(&self, level: Level, parent_id: Uuid) -> Result<Vec<HierarchyNode>> {
        let col = parent_column(level).ok_or_else(|| anyhow!("Regions have no parent"))?;
        let query = vec![
            ("select", node_select(level)),
            (col, format!("eq.{}", parent_id)),
            ("is_deleted", "eq.false".to_string()),
            ("order", "created_at.asc,id.asc".to_string()),
        ];
        let rows: Vec<NodeRow> = self.client.get_json(table(level), &query).await?;
        Ok(rows.into_iter().map(|r| r.into_node(level)).collect())
    }

    async fn localized_languages(&self, node_id: Uuid) -> Result<Vec<LanguageCode>> {
        let query = vec![
            ("select", "language".to_string()),
            ("node_id", format!("eq.{}", node_id)),
        ];
        let rows: Vec<LanguageRow> = self.client.get_json("localized_names", &query).await?;
        Ok(rows.into_iter().map(|r| r.language).collect())
    }

    async fn create_localized(&self, node_id: Uuid, language: &str, name: &str) -> Result<bool> {
        let body = json!({
            "node_id": node_id,
            "language": language,
            "name": name,
        });
        let resp = self
            .client
            .post(
                "localized_names",
                &[("on_conflict", "node_id,language".to_string())],
                "resolution=ignore-duplicates,return=representation",
                &body,
            )
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Failed to insert {} name for {}: {} - {}",
                language,
                node_id,
                status,
                text
            ));
        }

        // Ignored duplicates come back as an empty array.
        let rows: Vec<serde_json::Value> = resp
            .json()
            .await
            .with_context(|| format!("Unreadable insert response for {} name of {}", language, node_id))?;
        Ok(!rows.is_empty())
    }
}

// ============================================================================
// Job store
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct JobRow {
    payload: Job,
}

#[derive(Clone)]
pub struct SupabaseJobStore {
    client: SupabaseClient,
}

impl SupabaseJobStore {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }

    async fn select(&self, filter: Option<(&'static str, String)>) -> Result<Vec<Job>> {
        let mut query = vec![("select", "payload".to_string())];
        query.extend(filter);
        let rows: Vec<JobRow> = self.client.get_json("population_jobs", &query).await?;
        Ok(rows.into_iter().map(|r| r.payload).collect())
    }
}

#[async_trait::async_trait]
impl JobStore for SupabaseJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        let body = json!({
            "id": job.id,
            "root_key": job.root_key(),
            "status": job.status,
            "payload": job,
        });
        let resp = self
            .client
            .post(
                "population_jobs",
                &[("on_conflict", "id".to_string())],
                "resolution=merge-duplicates,return=minimal",
                &body,
            )
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Failed to save job {}: {} - {}", job.id, status, text));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self
            .select(Some(("id", format!("eq.{}", id))))
            .await?
            .into_iter()
            .next())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        self.select(None).await
    }

    async fn find_by_root(&self, root_key: &str) -> Result<Vec<Job>> {
        self.select(Some(("root_key", format!("eq.{}", root_key)))).await
    }
}
