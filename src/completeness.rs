//! Skip decisions for the population walk.
//!
//! A level whose children all carry every target language is reused as-is,
//! which is what makes a second run of a finished job free of external calls.

use crate::schema::{HierarchyNode, LanguageCode, Level};
use crate::store::ReferenceStore;
use anyhow::Result;
use std::sync::Arc;
use uuid::Uuid;

/// Existing children of a parent and whether they already satisfy the target.
#[derive(Debug, Clone)]
pub struct ChildrenStatus {
    pub children: Vec<HierarchyNode>,
    pub complete: bool,
}

pub struct CompletenessChecker {
    store: Arc<dyn ReferenceStore>,
}

impl CompletenessChecker {
    pub fn new(store: Arc<dyn ReferenceStore>) -> Self {
        Self { store }
    }

    /// Complete when there is at least one active child and every child has
    /// a localized name for every language in `languages`.
    pub async fn children_status(
        &self,
        level: Level,
        parent_id: Uuid,
        languages: &[LanguageCode],
    ) -> Result<ChildrenStatus> {
        let children = self.store.list_active_children(level, parent_id).await?;
        if children.is_empty() {
            return Ok(ChildrenStatus {
                children,
                complete: false,
            });
        }

        for child in &children {
            if !self.missing_languages(child.id, languages).await?.is_empty() {
                return Ok(ChildrenStatus {
                    children,
                    complete: false,
                });
            }
        }

        Ok(ChildrenStatus {
            children,
            complete: true,
        })
    }

    /// Languages of `languages` (in that order) without a localized name for `node_id`.
    pub async fn missing_languages(
        &self,
        node_id: Uuid,
        languages: &[LanguageCode],
    ) -> Result<Vec<LanguageCode>> {
        let existing = self.store.localized_languages(node_id).await?;
        Ok(languages
            .iter()
            .filter(|lang| !existing.contains(lang))
            .cloned()
            .collect())
    }
}
