//! Hierarchy population walk.
//!
//! Starting from a root region, each level is handled by the same routine:
//! check whether the existing children already cover the target languages,
//! otherwise fetch child names, persist them, translate what is missing, and
//! recurse. Everything below the root is isolated per branch: a failure is
//! recorded on the job and the walk moves on to the next sibling.

use crate::completeness::CompletenessChecker;
use crate::config::PopulationConfig;
use crate::data_source::DataSourceClient;
use crate::jobs::JobTracker;
use crate::response_parser;
use crate::schema::{HierarchyNode, LanguageCode, Level};
use crate::store::ReferenceStore;
use crate::translator::Translator;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of a walk that reached the end (possibly with degraded branches).
#[derive(Debug, Clone)]
pub struct PopulationReport {
    pub root_id: Uuid,
    pub languages_completed: Vec<LanguageCode>,
    pub external_calls: usize,
    pub failures: usize,
}

pub struct HierarchyPopulator {
    store: Arc<dyn ReferenceStore>,
    checker: CompletenessChecker,
    data_source: DataSourceClient,
    translator: Translator,
    config: PopulationConfig,
}

/// Mutable state of one walk.
struct Walk {
    tracker: JobTracker,
    languages: Vec<LanguageCode>,
    external_calls: usize,
    failures: usize,
    incomplete_languages: HashSet<LanguageCode>,
}

impl Walk {
    async fn record_call(&mut self) {
        self.external_calls += 1;
        let calls = self.external_calls;
        self.tracker
            .update(move |job| job.progress.external_calls = calls)
            .await;
    }

    async fn record_failure(&mut self, message: String) {
        warn!("{}", message);
        self.failures += 1;
        self.tracker.update(move |job| job.failed_nodes.push(message)).await;
    }

    async fn node_created(&self) {
        self.tracker
            .update(|job| job.progress.nodes_created += 1)
            .await;
    }

    async fn localized_created(&self, count: usize) {
        if count > 0 {
            self.tracker
                .update(move |job| job.progress.localized_names_created += count)
                .await;
        }
    }

    async fn node_processed(&self, level: Level, path: &[String]) {
        let step = format!("Processing {} {}", level, path.join(" > "));
        self.tracker
            .update(move |job| {
                match level {
                    Level::SubRegion => job.progress.level1_processed += 1,
                    Level::LocalArea => job.progress.level2_processed += 1,
                    Level::Settlement => job.progress.level3_processed += 1,
                    Level::Region => {}
                }
                job.progress.current_step = step;
            })
            .await;
    }
}

impl HierarchyPopulator {
    pub fn new(
        store: Arc<dyn ReferenceStore>,
        data_source: DataSourceClient,
        config: PopulationConfig,
    ) -> Self {
        Self {
            checker: CompletenessChecker::new(store.clone()),
            translator: Translator::new(data_source.clone()),
            store,
            data_source,
            config,
        }
    }

    /// Populate the hierarchy for the tracker's job.
    ///
    /// Returns `Err` only when the root region cannot be resolved.
    pub async fn populate(&self, tracker: &JobTracker) -> Result<PopulationReport> {
        let job = tracker.snapshot();
        info!(
            "Populating '{}' for languages {:?}",
            job.root_name, job.target_languages
        );

        let mut walk = Walk {
            tracker: tracker.clone(),
            languages: job.target_languages.clone(),
            external_calls: 0,
            failures: 0,
            incomplete_languages: HashSet::new(),
        };

        tracker
            .set_step(format!("Resolving region {}", job.root_name))
            .await;
        let (region, created) = self
            .store
            .create_node(Level::Region, &job.root_name, None)
            .await
            .with_context(|| format!("Failed to resolve region '{}'", job.root_name))?;
        if created {
            walk.node_created().await;
        }

        let root_path = vec![region.canonical_name.clone()];
        self.ensure_localized(&mut walk, std::slice::from_ref(&region), Level::Region, &root_path)
            .await;
        self.walk_children(&mut walk, &region, &root_path, Level::SubRegion)
            .await;

        let languages_completed: Vec<LanguageCode> = walk
            .languages
            .iter()
            .filter(|lang| !walk.incomplete_languages.contains(*lang))
            .cloned()
            .collect();

        info!(
            "Finished '{}': {} external calls, {} failed branches",
            region.canonical_name, walk.external_calls, walk.failures
        );

        Ok(PopulationReport {
            root_id: region.id,
            languages_completed,
            external_calls: walk.external_calls,
            failures: walk.failures,
        })
    }

    /// Populate the `level` children of `parent` and everything below them.
    fn walk_children<'a>(
        &'a self,
        walk: &'a mut Walk,
        parent: &'a HierarchyNode,
        path: &'a [String],
        level: Level,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let location = path.join(" > ");
            walk.tracker
                .set_step(format!("Checking {} of {}", level.plural(), location))
                .await;

            let status = match self
                .checker
                .children_status(level, parent.id, &walk.languages)
                .await
            {
                Ok(status) => status,
                Err(e) => {
                    walk.record_failure(format!(
                        "{}: could not load {}: {:#}",
                        location,
                        level.plural(),
                        e
                    ))
                    .await;
                    return;
                }
            };

            let children = if status.complete {
                debug!(
                    "{}: {} {} already complete, skipping fetch",
                    location,
                    status.children.len(),
                    level.plural()
                );
                status.children
            } else {
                let mut ordered: Vec<HierarchyNode> = Vec::new();

                match self.fetch_child_names(walk, parent, path, level).await {
                    Some(names) => {
                        for name in names {
                            match self.store.create_node(level, &name, Some(parent.id)).await {
                                Ok((node, created)) => {
                                    if created {
                                        walk.node_created().await;
                                    }
                                    if !ordered.iter().any(|n| n.id == node.id) {
                                        ordered.push(node);
                                    }
                                }
                                Err(e) => {
                                    walk.record_failure(format!(
                                        "{} > {}: could not save {}: {:#}",
                                        location, name, level, e
                                    ))
                                    .await;
                                }
                            }
                        }
                    }
                    None => {
                        walk.record_failure(format!(
                            "{}: could not fetch {}",
                            location,
                            level.plural()
                        ))
                        .await;
                    }
                }

                // Children the source did not return this time are still ours.
                for existing in status.children {
                    if !ordered.iter().any(|n| n.id == existing.id) {
                        ordered.push(existing);
                    }
                }
                let cap = self.config.cap_for(level);
                if ordered.len() > cap {
                    debug!(
                        "{}: keeping {} of {} {}",
                        location,
                        cap,
                        ordered.len(),
                        level.plural()
                    );
                    ordered.truncate(cap);
                }

                self.ensure_localized(walk, &ordered, level, path).await;
                ordered
            };

            if level == Level::SubRegion {
                let total = children.len();
                walk.tracker
                    .update(move |job| job.progress.level1_total = total)
                    .await;
            }

            let descend = self
                .config
                .descent_limit(level)
                .unwrap_or(usize::MAX);

            for (i, child) in children.iter().enumerate() {
                let mut child_path = path.to_vec();
                child_path.push(child.canonical_name.clone());
                walk.node_processed(level, &child_path).await;

                if let Some(next) = level.child() {
                    if i < descend {
                        self.walk_children(walk, child, &child_path, next).await;
                    } else if i == descend {
                        debug!(
                            "{}: descending into the first {} {} only",
                            location,
                            descend,
                            level.plural()
                        );
                    }
                }
            }
        })
    }

    /// Fetch and parse child names, retrying up to `fetch_attempts` times.
    async fn fetch_child_names(
        &self,
        walk: &mut Walk,
        parent: &HierarchyNode,
        path: &[String],
        level: Level,
    ) -> Option<Vec<String>> {
        let cap = self.config.cap_for(level);
        let attempts = self.config.fetch_attempts.max(1);

        for attempt in 1..=attempts {
            self.pace(walk).await;
            walk.tracker
                .set_step(format!(
                    "Fetching {} of {}",
                    level.plural(),
                    path.join(" > ")
                ))
                .await;

            let result = self
                .data_source
                .fetch_children(&parent.canonical_name, path, level, cap)
                .await;
            walk.record_call().await;

            match result {
                Ok(text) => match response_parser::parse_child_names(&text) {
                    Some(mut names) => {
                        names.truncate(cap);
                        debug!(
                            "{}: received {} {}",
                            parent.canonical_name,
                            names.len(),
                            level.plural()
                        );
                        return Some(names);
                    }
                    None => warn!(
                        "Unparseable {} response for {} (attempt {}/{})",
                        level.plural(),
                        parent.canonical_name,
                        attempt,
                        attempts
                    ),
                },
                Err(e) => warn!(
                    "Fetching {} of {} failed (attempt {}/{}): {}",
                    level.plural(),
                    parent.canonical_name,
                    attempt,
                    attempts,
                    e
                ),
            }
        }

        None
    }

    /// Translate and store every language in the walk's target set that `nodes` lack.
    ///
    /// Nodes are grouped by their exact missing-language set so each node is
    /// only ever asked for the languages it is missing.
    async fn ensure_localized(
        &self,
        walk: &mut Walk,
        nodes: &[HierarchyNode],
        level: Level,
        path: &[String],
    ) {
        let mut groups: Vec<(Vec<LanguageCode>, Vec<&HierarchyNode>)> = Vec::new();

        for node in nodes {
            match self.checker.missing_languages(node.id, &walk.languages).await {
                Ok(missing) if missing.is_empty() => {}
                Ok(missing) => match groups.iter_mut().find(|(langs, _)| *langs == missing) {
                    Some((_, members)) => members.push(node),
                    None => groups.push((missing, vec![node])),
                },
                Err(e) => {
                    walk.incomplete_languages.extend(walk.languages.iter().cloned());
                    walk.record_failure(format!(
                        "{}: could not read localized names: {:#}",
                        node.canonical_name, e
                    ))
                    .await;
                }
            }
        }

        let location = path.join(" > ");
        for (languages, members) in groups {
            for batch in members.chunks(self.config.translation_batch_size.max(1)) {
                let names: Vec<String> = batch.iter().map(|n| n.canonical_name.clone()).collect();

                self.pace(walk).await;
                walk.tracker
                    .set_step(format!(
                        "Translating {} {} of {} into {}",
                        names.len(),
                        level.plural(),
                        location,
                        languages.join(", ")
                    ))
                    .await;

                let translated = self.translator.translate(&names, &languages).await;
                walk.record_call().await;

                let Some(translated) = translated else {
                    walk.incomplete_languages.extend(languages.iter().cloned());
                    walk.record_failure(format!(
                        "{}: translation of {} {} failed",
                        location,
                        names.len(),
                        level.plural()
                    ))
                    .await;
                    continue;
                };

                let mut inserted = 0;
                for node in batch {
                    let per_language = translated.get(&node.canonical_name);
                    for lang in &languages {
                        let Some(value) = per_language.and_then(|m| m.get(lang)) else {
                            walk.incomplete_languages.insert(lang.clone());
                            continue;
                        };
                        match self.store.create_localized(node.id, lang, value).await {
                            Ok(true) => inserted += 1,
                            Ok(false) => {}
                            Err(e) => {
                                walk.incomplete_languages.insert(lang.clone());
                                walk.record_failure(format!(
                                    "{}: could not save {} name: {:#}",
                                    node.canonical_name, lang, e
                                ))
                                .await;
                            }
                        }
                    }
                }
                walk.localized_created(inserted).await;
            }
        }
    }

    /// Inter-call delay; the first external call of a walk is not delayed.
    async fn pace(&self, walk: &Walk) {
        let delay = self.config.call_delay();
        if walk.external_calls > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
