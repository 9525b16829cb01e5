//! Versioned result cache
//!
//! Stores [`AnalysisResult`]s keyed by (workspace, project, document, analyzer,
//! kind). Entries carry the solution version they were computed against;
//! readers compare it with the current version to tell whether a result is
//! stale, but stale results stay available until they are replaced or
//! invalidated.
//!
//! The cache also tracks which projects and documents are alive. A store for a
//! removed scope is ignored, so a computation that finishes after its document
//! was deleted can't resurrect it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::analyzer::AnalyzerId;
use crate::config::StoreOrdering;
use crate::ids::{DocumentId, ProjectId, VersionStamp, WorkspaceId};
use crate::result::{AnalysisKind, AnalysisResult};
use crate::workspace::{Project, Solution};

/// Identity of one cached result
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub workspace: WorkspaceId,
    pub project: ProjectId,
    /// `None` for project-level entries
    pub document: Option<DocumentId>,
    pub analyzer: AnalyzerId,
    /// `None` for a whole-project result covering every kind
    pub kind: Option<AnalysisKind>,
}

impl CacheKey {
    pub fn document(
        workspace: WorkspaceId,
        project: ProjectId,
        document: DocumentId,
        analyzer: AnalyzerId,
        kind: AnalysisKind,
    ) -> Self {
        Self {
            workspace,
            project,
            document: Some(document),
            analyzer,
            kind: Some(kind),
        }
    }

    /// Location-less diagnostics of a project
    pub fn project_others(workspace: WorkspaceId, project: ProjectId, analyzer: AnalyzerId) -> Self {
        Self {
            workspace,
            project,
            document: None,
            analyzer,
            kind: Some(AnalysisKind::NonLocal),
        }
    }

    /// The whole-project result of an analyzer
    pub fn project_full(workspace: WorkspaceId, project: ProjectId, analyzer: AnalyzerId) -> Self {
        Self {
            workspace,
            project,
            document: None,
            analyzer,
            kind: None,
        }
    }

    /// Whether the entry holds a slice that is published as a bucket
    pub fn is_slice(&self) -> bool {
        self.kind.is_some()
    }
}

/// A stored result
#[derive(Debug)]
pub struct CacheEntry {
    pub result: Arc<AnalysisResult>,
    pub version: VersionStamp,
    /// Global write order, for diagnosing races
    pub sequence: u64,
}

/// Read view of an entry with its staleness relative to the caller's version
#[derive(Debug, Clone)]
pub struct CachedAnalysis {
    pub result: Arc<AnalysisResult>,
    pub version: VersionStamp,
    /// Advisory: the result was computed for an older solution
    pub is_stale: bool,
}

/// What a store did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The stored diagnostics differ from what was there before
    Changed,
    /// Same diagnostics as before; only the version moved
    Unchanged,
    /// The project or document is not (or no longer) part of the solution
    IgnoredUnknownScope,
    /// A result for a newer version is already stored
    IgnoredOlderVersion,
}

impl StoreOutcome {
    pub fn is_changed(&self) -> bool {
        matches!(self, StoreOutcome::Changed)
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    /// Stores that left the diagnostics as they were
    pub unchanged_stores: u64,
    pub ignored_stores: u64,
    pub invalidations: u64,
}

/// Concurrent cache of analysis results for one workspace
pub struct ResultCache {
    workspace: WorkspaceId,
    ordering: StoreOrdering,
    /// Main storage
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
    /// Keys per project, for project invalidation
    project_index: DashMap<ProjectId, HashSet<CacheKey>>,
    /// Keys per document, for document invalidation
    document_index: DashMap<DocumentId, HashSet<CacheKey>>,
    /// Live projects and their documents
    scopes: DashMap<ProjectId, HashSet<DocumentId>>,
    sequence: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    unchanged_stores: AtomicU64,
    ignored_stores: AtomicU64,
    invalidations: AtomicU64,
}

impl ResultCache {
    pub fn new(workspace: WorkspaceId, ordering: StoreOrdering) -> Self {
        Self {
            workspace,
            ordering,
            entries: DashMap::new(),
            project_index: DashMap::new(),
            document_index: DashMap::new(),
            scopes: DashMap::new(),
            sequence: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            unchanged_stores: AtomicU64::new(0),
            ignored_stores: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn workspace(&self) -> WorkspaceId {
        self.workspace
    }

    /// Register every project and document of a solution as live
    pub fn track_solution(&self, solution: &Solution) {
        for project in solution.projects() {
            self.track_project(project);
        }
    }

    /// Register a project and its current documents as live.
    ///
    /// Documents no longer in the project are forgotten along with their entries.
    pub fn track_project(&self, project: &Project) -> Vec<CacheKey> {
        let current: HashSet<DocumentId> = project.document_ids().collect();
        let previous = self.scopes.insert(project.id(), current.clone());

        let mut removed = Vec::new();
        if let Some(previous) = previous {
            for document in previous.difference(&current) {
                removed.extend(self.invalidate_document(*document));
            }
        }
        removed
    }

    pub fn is_live(&self, project: ProjectId, document: Option<DocumentId>) -> bool {
        match self.scopes.get(&project) {
            Some(documents) => document.is_none_or(|document| documents.contains(&document)),
            None => false,
        }
    }

    /// Store a result.
    ///
    /// Ignored when the key's project or document is not live, or, under
    /// [`StoreOrdering::MonotonicVersion`], when a newer result is stored.
    pub fn store(&self, key: CacheKey, result: Arc<AnalysisResult>, version: VersionStamp) -> StoreOutcome {
        // Holding the scope guard keeps a concurrent removal of this project
        // from interleaving between the liveness check and the insert.
        let Some(scope) = self.scopes.get(&key.project) else {
            return self.ignored(&key, StoreOutcome::IgnoredUnknownScope);
        };
        if let Some(document) = key.document {
            if !scope.contains(&document) {
                drop(scope);
                return self.ignored(&key, StoreOutcome::IgnoredUnknownScope);
            }
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = Arc::new(CacheEntry {
            result,
            version,
            sequence,
        });
        let outcome = match self.entries.entry(key.clone()) {
            Entry::Vacant(slot) => {
                let changed = !entry.result.is_empty();
                slot.insert(entry);
                if changed {
                    StoreOutcome::Changed
                } else {
                    StoreOutcome::Unchanged
                }
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if self.ordering == StoreOrdering::MonotonicVersion && existing.version > version {
                    StoreOutcome::IgnoredOlderVersion
                } else {
                    let changed = !existing.result.same_content(&entry.result);
                    slot.insert(entry);
                    if changed {
                        StoreOutcome::Changed
                    } else {
                        StoreOutcome::Unchanged
                    }
                }
            }
        };

        if outcome == StoreOutcome::IgnoredOlderVersion {
            drop(scope);
            return self.ignored(&key, outcome);
        }

        self.project_index
            .entry(key.project)
            .or_default()
            .insert(key.clone());
        if let Some(document) = key.document {
            self.document_index.entry(document).or_default().insert(key);
        }
        drop(scope);

        self.stores.fetch_add(1, Ordering::Relaxed);
        if outcome == StoreOutcome::Unchanged {
            self.unchanged_stores.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    fn ignored(&self, key: &CacheKey, outcome: StoreOutcome) -> StoreOutcome {
        debug!("Ignoring store for {:?}: {:?}", key, outcome);
        self.ignored_stores.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Read an entry and flag it stale when older than `current`
    pub fn get_with_version(&self, key: &CacheKey, current: VersionStamp) -> Option<CachedAnalysis> {
        self.get(key).map(|entry| CachedAnalysis {
            result: entry.result.clone(),
            version: entry.version,
            is_stale: entry.version < current,
        })
    }

    /// Every entry of a project
    pub fn project_entries(&self, project: ProjectId) -> Vec<(CacheKey, Arc<CacheEntry>)> {
        let keys: Vec<CacheKey> = self
            .project_index
            .get(&project)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        self.collect_entries(keys)
    }

    /// Every entry of a document
    pub fn document_entries(&self, document: DocumentId) -> Vec<(CacheKey, Arc<CacheEntry>)> {
        let keys: Vec<CacheKey> = self
            .document_index
            .get(&document)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        self.collect_entries(keys)
    }

    /// Every entry in the cache
    pub fn all_entries(&self) -> Vec<(CacheKey, Arc<CacheEntry>)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn collect_entries(&self, mut keys: Vec<CacheKey>) -> Vec<(CacheKey, Arc<CacheEntry>)> {
        keys.sort();
        keys.into_iter()
            .filter_map(|key| {
                let entry = self.entries.get(&key)?.clone();
                Some((key, entry))
            })
            .collect()
    }

    /// Drop every entry of a document. Returns the removed keys.
    pub fn invalidate_document(&self, document: DocumentId) -> Vec<CacheKey> {
        let Some((_, keys)) = self.document_index.remove(&document) else {
            return Vec::new();
        };
        let removed = self.remove_keys(keys);
        for key in &removed {
            if let Some(mut project_keys) = self.project_index.get_mut(&key.project) {
                project_keys.remove(key);
            }
        }
        removed
    }

    /// Drop every entry of a project. Returns the removed keys.
    pub fn invalidate_project(&self, project: ProjectId) -> Vec<CacheKey> {
        let Some((_, keys)) = self.project_index.remove(&project) else {
            return Vec::new();
        };
        let removed = self.remove_keys(keys);
        for key in &removed {
            if let Some(document) = key.document {
                if let Some(mut document_keys) = self.document_index.get_mut(&document) {
                    document_keys.remove(key);
                }
            }
        }
        self.document_index.retain(|_, keys| !keys.is_empty());
        removed
    }

    /// Drop every entry. Returns the removed keys.
    pub fn invalidate_all(&self) -> Vec<CacheKey> {
        let keys: Vec<CacheKey> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        let removed = self.remove_keys(keys);
        self.project_index.clear();
        self.document_index.clear();
        removed
    }

    /// Forget a document and drop its entries
    pub fn remove_document(&self, project: ProjectId, document: DocumentId) -> Vec<CacheKey> {
        if let Some(mut documents) = self.scopes.get_mut(&project) {
            documents.remove(&document);
        }
        self.invalidate_document(document)
    }

    /// Forget a project and drop its entries
    pub fn remove_project(&self, project: ProjectId) -> Vec<CacheKey> {
        if let Some((_, documents)) = self.scopes.remove(&project) {
            for document in documents {
                self.document_index.remove(&document);
            }
        }
        self.invalidate_project(project)
    }

    /// Forget every scope and drop every entry
    pub fn clear(&self) -> Vec<CacheKey> {
        self.scopes.clear();
        self.invalidate_all()
    }

    fn remove_keys(&self, keys: impl IntoIterator<Item = CacheKey>) -> Vec<CacheKey> {
        let mut removed: Vec<CacheKey> = keys
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|(key, _)| key))
            .collect();
        removed.sort();
        self.invalidations
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            unchanged_stores: self.unchanged_stores.load(Ordering::Relaxed),
            ignored_stores: self.ignored_stores.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalyzerReferenceId;
    use crate::diagnostic::{
        DiagnosticDescriptor, DiagnosticLocation, DiagnosticRecord, DiagnosticSeverity,
        FileLinePositionSpan, LinePosition,
    };
    use crate::result::AnalysisResultBuilder;
    use crate::workspace::Document;

    struct Fixture {
        cache: ResultCache,
        project: ProjectId,
        document: DocumentId,
        analyzer: AnalyzerId,
    }

    fn fixture(ordering: StoreOrdering) -> Fixture {
        let workspace = WorkspaceId::new();
        let project = Project::new("App", "csharp");
        let document = Document::new(project.id(), "a.cs", "class A {}");
        let document_id = document.id();
        let project = project.with_document(document);
        let cache = ResultCache::new(workspace, ordering);
        cache.track_project(&project);
        Fixture {
            cache,
            project: project.id(),
            document: document_id,
            analyzer: AnalyzerId::derive("A", &AnalyzerReferenceId::new("r"), "1", 0),
        }
    }

    fn result(f: &Fixture, version: u64, ids: &[&str]) -> Arc<AnalysisResult> {
        let mut builder = AnalysisResultBuilder::new(f.project, f.analyzer.clone(), VersionStamp::new(version));
        builder.add_document(f.document);
        builder.add(
            AnalysisKind::Syntax,
            ids.iter().map(|id| {
                DiagnosticRecord::from_descriptor(
                    &DiagnosticDescriptor::new(*id, "t", "m", "c", DiagnosticSeverity::Warning, true),
                    DiagnosticLocation::document(
                        None,
                        f.project,
                        f.document,
                        None,
                        FileLinePositionSpan::new(None, LinePosition::new(0, 0), LinePosition::new(0, 1)),
                    ),
                    &[],
                )
            }),
        );
        Arc::new(builder.build())
    }

    fn key(f: &Fixture) -> CacheKey {
        CacheKey::document(
            f.cache.workspace(),
            f.project,
            f.document,
            f.analyzer.clone(),
            AnalysisKind::Syntax,
        )
    }

    #[test]
    fn test_store_reports_changes() {
        let f = fixture(StoreOrdering::CompletionOrder);
        assert_eq!(
            f.cache.store(key(&f), result(&f, 1, &[]), VersionStamp::new(1)),
            StoreOutcome::Unchanged
        );
        assert_eq!(
            f.cache.store(key(&f), result(&f, 2, &["X"]), VersionStamp::new(2)),
            StoreOutcome::Changed
        );
        assert_eq!(
            f.cache.store(key(&f), result(&f, 3, &["X"]), VersionStamp::new(3)),
            StoreOutcome::Unchanged
        );
        assert_eq!(f.cache.get(&key(&f)).unwrap().version, VersionStamp::new(3));

        let stats = f.cache.stats();
        assert_eq!(stats.stores, 3);
        assert_eq!(stats.unchanged_stores, 2);
    }

    #[test]
    fn test_staleness_is_advisory() {
        let f = fixture(StoreOrdering::CompletionOrder);
        f.cache.store(key(&f), result(&f, 1, &["X"]), VersionStamp::new(1));
        let cached = f.cache.get_with_version(&key(&f), VersionStamp::new(5)).unwrap();
        assert!(cached.is_stale);
        assert_eq!(cached.result.all_diagnostics().len(), 1);
    }

    #[test]
    fn test_completion_order_last_writer_wins() {
        let f = fixture(StoreOrdering::CompletionOrder);
        f.cache.store(key(&f), result(&f, 5, &["NEW"]), VersionStamp::new(5));
        f.cache.store(key(&f), result(&f, 4, &["OLD"]), VersionStamp::new(4));
        assert_eq!(f.cache.get(&key(&f)).unwrap().version, VersionStamp::new(4));
    }

    #[test]
    fn test_monotonic_ordering_rejects_older() {
        let f = fixture(StoreOrdering::MonotonicVersion);
        f.cache.store(key(&f), result(&f, 5, &["NEW"]), VersionStamp::new(5));
        assert_eq!(
            f.cache.store(key(&f), result(&f, 4, &["OLD"]), VersionStamp::new(4)),
            StoreOutcome::IgnoredOlderVersion
        );
        assert_eq!(f.cache.get(&key(&f)).unwrap().version, VersionStamp::new(5));
    }

    #[test]
    fn test_store_for_removed_document_is_ignored() {
        let f = fixture(StoreOrdering::CompletionOrder);
        f.cache.store(key(&f), result(&f, 1, &["X"]), VersionStamp::new(1));
        let removed = f.cache.remove_document(f.project, f.document);
        assert_eq!(removed, vec![key(&f)]);

        assert_eq!(
            f.cache.store(key(&f), result(&f, 2, &["X"]), VersionStamp::new(2)),
            StoreOutcome::IgnoredUnknownScope
        );
        assert!(f.cache.get(&key(&f)).is_none());
        assert_eq!(f.cache.stats().ignored_stores, 1);
    }

    #[test]
    fn test_invalidate_project_and_all() {
        let f = fixture(StoreOrdering::CompletionOrder);
        f.cache.store(key(&f), result(&f, 1, &["X"]), VersionStamp::new(1));
        let full = CacheKey::project_full(f.cache.workspace(), f.project, f.analyzer.clone());
        f.cache.store(full.clone(), result(&f, 1, &["X"]), VersionStamp::new(1));

        assert_eq!(f.cache.project_entries(f.project).len(), 2);
        assert_eq!(f.cache.invalidate_project(f.project).len(), 2);
        assert!(f.cache.is_empty());
        assert!(f.cache.document_entries(f.document).is_empty());

        f.cache.store(key(&f), result(&f, 2, &["X"]), VersionStamp::new(2));
        assert_eq!(f.cache.invalidate_all(), vec![key(&f)]);
        assert_eq!(f.cache.stats().invalidations, 3);
    }

    #[test]
    fn test_track_project_forgets_dropped_documents() {
        let f = fixture(StoreOrdering::CompletionOrder);
        f.cache.store(key(&f), result(&f, 1, &["X"]), VersionStamp::new(1));
        let emptied = Project::new("App", "csharp").with_id(f.project);
        let removed = f.cache.track_project(&emptied);
        assert_eq!(removed.len(), 1);
        assert!(!f.cache.is_live(f.project, Some(f.document)));
        assert!(f.cache.is_live(f.project, None));
    }
}
