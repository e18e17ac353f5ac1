//! Persistence gateway for the reference-data hierarchy.
//!
//! [`ReferenceStore`] is the seam between the population engine and the
//! database. Creation is always create-if-missing: asking for a node or a
//! localized name that already exists returns the existing record.

use crate::schema::{normalize_name, HierarchyNode, LanguageCode, Level, LocalizedName};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[async_trait::async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Active node of `level` named `name` (case-insensitive) under `parent_id`.
    async fn find_by_name_under_parent(
        &self,
        level: Level,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> Result<Option<HierarchyNode>>;

    /// Create the node unless an active sibling with the same name exists.
    /// Returns the stored node and whether it was newly created.
    async fn create_node(
        &self,
        level: Level,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> Result<(HierarchyNode, bool)>;

    /// Active children of `parent_id` at `level`, in insertion order.
    async fn list_active_children(&self, level: Level, parent_id: Uuid) -> Result<Vec<HierarchyNode>>;

    async fn count_active_children(&self, level: Level, parent_id: Uuid) -> Result<usize> {
        Ok(self.list_active_children(level, parent_id).await?.len())
    }

    /// Languages that already have a localized name for `node_id`.
    async fn localized_languages(&self, node_id: Uuid) -> Result<Vec<LanguageCode>>;

    /// Insert unless a row for `(node_id, language)` exists. Returns whether a row was inserted.
    async fn create_localized(&self, node_id: Uuid, language: &str, name: &str) -> Result<bool>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    /// Insertion order is the listing order.
    nodes: Vec<HierarchyNode>,
    localized: HashMap<(Uuid, LanguageCode), LocalizedName>,
}

/// In-memory store, used when no database is configured and in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryReferenceStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Administrative soft delete. Returns false if the node does not exist.
    pub fn soft_delete(&self, node_id: Uuid) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.nodes.iter_mut().find(|n| n.id == node_id) {
            Some(node) => {
                node.is_deleted = true;
                true
            }
            None => false,
        }
    }

    /// All nodes of a level, including soft-deleted ones.
    pub fn nodes_at(&self, level: Level) -> Vec<HierarchyNode> {
        let inner = self.inner.read().unwrap();
        inner.nodes.iter().filter(|n| n.level == level).cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().unwrap().nodes.len()
    }

    pub fn localized_count(&self) -> usize {
        self.inner.read().unwrap().localized.len()
    }

    pub fn localized_name(&self, node_id: Uuid, language: &str) -> Option<String> {
        let inner = self.inner.read().unwrap();
        inner
            .localized
            .get(&(node_id, language.to_string()))
            .map(|l| l.name.clone())
    }

    fn find_active(inner: &MemoryInner, level: Level, name: &str, parent_id: Option<Uuid>) -> Option<HierarchyNode> {
        let key = normalize_name(name);
        inner
            .nodes
            .iter()
            .find(|n| {
                !n.is_deleted
                    && n.level == level
                    && n.parent_id == parent_id
                    && normalize_name(&n.canonical_name) == key
            })
            .cloned()
    }
}

#[async_trait::async_trait]
impl ReferenceStore for MemoryReferenceStore {
    async fn find_by_name_under_parent(
        &self,
        level: Level,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> Result<Option<HierarchyNode>> {
        let inner = self.inner.read().unwrap();
        Ok(Self::find_active(&inner, level, name, parent_id))
    }

    async fn create_node(
        &self,
        level: Level,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> Result<(HierarchyNode, bool)> {
        if name.trim().is_empty() {
            anyhow::bail!("Cannot create {} with an empty name", level);
        }

        // Single write lock: check and insert are atomic.
        let mut inner = self.inner.write().unwrap();

        match (level.parent(), parent_id) {
            (None, None) => {}
            (Some(parent_level), Some(pid)) => {
                let parent_ok = inner
                    .nodes
                    .iter()
                    .any(|n| n.id == pid && n.level == parent_level && !n.is_deleted);
                if !parent_ok {
                    anyhow::bail!("Parent {} of {} '{}' not found", pid, level, name);
                }
            }
            _ => anyhow::bail!("Invalid parent for {} '{}'", level, name),
        }

        if let Some(existing) = Self::find_active(&inner, level, name, parent_id) {
            return Ok((existing, false));
        }

        let node = HierarchyNode::new(level, name, parent_id);
        inner.nodes.push(node.clone());
        tracing::debug!("MemoryReferenceStore: created {} '{}'", level, node.canonical_name);
        Ok((node, true))
    }

    async fn list_active_children(&self, level: Level, parent_id: Uuid) -> Result<Vec<HierarchyNode>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .nodes
            .iter()
            .filter(|n| !n.is_deleted && n.level == level && n.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn localized_languages(&self, node_id: Uuid) -> Result<Vec<LanguageCode>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .localized
            .keys()
            .filter(|(id, _)| *id == node_id)
            .map(|(_, lang)| lang.clone())
            .collect())
    }

    async fn create_localized(&self, node_id: Uuid, language: &str, name: &str) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        if !inner.nodes.iter().any(|n| n.id == node_id) {
            anyhow::bail!("Node {} not found", node_id);
        }

        let key = (node_id, language.to_string());
        if inner.localized.contains_key(&key) {
            return Ok(false);
        }
        inner.localized.insert(
            key,
            LocalizedName {
                node_id,
                language: language.to_string(),
                name: name.to_string(),
            },
        );
        Ok(true)
    }
}
