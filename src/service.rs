//! Per-workspace diagnostic service
//!
//! [`DiagnosticService`] is the context object for one open workspace. It owns
//! the result cache, analyzer catalog, skipped-analyzer cache, executor, event
//! bus and build merger, and is the only place that ties them together:
//! workspace changes drive invalidation, analysis results are stored and
//! published, and readers get cached diagnostics without recomputation.

use dashmap::DashMap;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analyzer::{AnalyzerDescriptor, AnalyzerId};
use crate::build_sync::BuildSyncMerger;
use crate::cache::{CacheKey, CacheStats, ResultCache, StoreOutcome};
use crate::cancellation::CancellationToken;
use crate::catalog::{AnalyzerCatalog, HostAnalyzers};
use crate::config::EngineConfig;
use crate::diagnostic::{DiagnosticRecord, TextSpan};
use crate::error::{EngineError, EngineResult};
use crate::events::{BucketId, DiagnosticEventBus, DiagnosticsUpdatedHandler, SubscriptionId, UpdateEvent};
use crate::executor::{AnalysisExecutor, AnalyzerDriver, DocumentAnalysisScope, ProjectAnalysisScope};
use crate::ids::{DocumentId, ProjectId, VersionStamp, WorkspaceId};
use crate::isolation::dedupe_exceptions;
use crate::mode::{DiagnosticChannel, DiagnosticMode, ModeSelector};
use crate::remap::SpanMapper;
use crate::result::{AnalysisKind, AnalysisResult, AnalysisResultBuilder};
use crate::skipped::SkippedAnalyzersCache;
use crate::telemetry::{AnalyzerTelemetry, TelemetryCollector};
use crate::workspace::change::{WorkspaceChange, WorkspaceChangeKind};
use crate::workspace::{Document, Project, Solution};

/// Filter for [`DiagnosticService::get_diagnostics`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticsScope {
    pub project: Option<ProjectId>,
    pub document: Option<DocumentId>,
    pub analyzer: Option<AnalyzerId>,
    pub kind: Option<AnalysisKind>,
}

impl DiagnosticsScope {
    pub fn solution() -> Self {
        Self::default()
    }

    pub fn project(project: ProjectId) -> Self {
        Self {
            project: Some(project),
            ..Self::default()
        }
    }

    pub fn document(project: ProjectId, document: DocumentId) -> Self {
        Self {
            project: Some(project),
            document: Some(document),
            ..Self::default()
        }
    }

    pub fn with_analyzer(mut self, analyzer: AnalyzerId) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_kind(mut self, kind: AnalysisKind) -> Self {
        self.kind = Some(kind);
        self
    }

    fn matches(&self, key: &CacheKey) -> bool {
        key.is_slice()
            && self.project.is_none_or(|project| key.project == project)
            && self.document.is_none_or(|document| key.document == Some(document))
            && self.analyzer.as_ref().is_none_or(|analyzer| &key.analyzer == analyzer)
            && self.kind.is_none_or(|kind| key.kind == Some(kind))
    }

    /// Build-only diagnostics belong to no analyzer and no analysis kind
    fn includes_build_only(&self) -> bool {
        self.analyzer.is_none() && self.kind.is_none()
    }
}

/// Snapshot of service counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    pub workspace: WorkspaceId,
    pub solution_version: VersionStamp,
    pub cache: CacheStats,
    pub events_delivered: u64,
    pub inflight_computations: usize,
    pub build_in_progress: bool,
}

/// Analyzer ids and solution version of the last complete document pass
#[derive(Debug, Clone)]
struct CompletedPass {
    version: VersionStamp,
    analyzers: Vec<AnalyzerId>,
}

/// Diagnostic engine context for one workspace
pub struct DiagnosticService {
    workspace: WorkspaceId,
    catalog: Arc<AnalyzerCatalog>,
    skipped: SkippedAnalyzersCache,
    executor: AnalysisExecutor,
    cache: ResultCache,
    bus: DiagnosticEventBus,
    build: BuildSyncMerger,
    modes: ModeSelector,
    telemetry: Arc<TelemetryCollector>,
    solution: RwLock<Arc<Solution>>,
    /// One computation per (document, kind) at a time
    inflight: DashMap<InflightKey, Arc<AsyncMutex<()>>>,
    /// Keeps store and publish of one cache key in the same order
    write_locks: DashMap<CacheKey, Arc<AsyncMutex<()>>>,
    /// Writers share it, workspace changes take it exclusively so
    /// invalidation and its removal events never interleave with a store
    change_gate: AsyncRwLock<()>,
    completed: DashMap<(DocumentId, AnalysisKind), CompletedPass>,
    closed: AtomicBool,
}

impl DiagnosticService {
    /// Create the service for `workspace`. Must be called within a Tokio runtime.
    pub fn new(
        workspace: WorkspaceId,
        host: Arc<HostAnalyzers>,
        driver: Arc<dyn AnalyzerDriver>,
        config: &EngineConfig,
    ) -> Self {
        let catalog = Arc::new(AnalyzerCatalog::new(host));
        let telemetry = Arc::new(TelemetryCollector::new());
        let modes = ModeSelector::new(&config.mode);
        let executor = AnalysisExecutor::new(
            workspace,
            driver,
            catalog.clone(),
            telemetry.clone(),
            config.executor.clone(),
        );

        info!(
            "Opening diagnostic service for {} (document mode: {}, workspace mode: {})",
            workspace,
            modes.mode(DiagnosticChannel::Document),
            modes.mode(DiagnosticChannel::Workspace)
        );

        Self {
            workspace,
            catalog,
            skipped: SkippedAnalyzersCache::new(config.cache.skipped_analyzers_capacity),
            executor,
            cache: ResultCache::new(workspace, config.cache.store_ordering),
            bus: DiagnosticEventBus::new(config.events.queue_capacity, modes.clone()),
            build: BuildSyncMerger::new(workspace),
            modes,
            telemetry,
            solution: RwLock::new(Arc::new(Solution::new(workspace))),
            inflight: DashMap::new(),
            write_locks: DashMap::new(),
            change_gate: AsyncRwLock::new(()),
            completed: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Remap diagnostics reported in generated files
    pub fn with_span_mapper(mut self, mapper: Arc<dyn SpanMapper>) -> Self {
        self.executor = self.executor.with_span_mapper(mapper);
        self
    }

    pub fn workspace(&self) -> WorkspaceId {
        self.workspace
    }

    pub fn catalog(&self) -> &AnalyzerCatalog {
        &self.catalog
    }

    pub fn current_solution(&self) -> Arc<Solution> {
        match self.solution.read() {
            Ok(solution) => solution.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace_solution(&self, solution: Arc<Solution>) -> Arc<Solution> {
        let mut current = match self.solution.write() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *current, solution)
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::WorkspaceClosed(self.workspace));
        }
        Ok(())
    }

    /// Apply a workspace change: adopt the new solution, invalidate what it
    /// made obsolete and publish removals for dropped buckets.
    pub async fn on_workspace_changed(&self, change: WorkspaceChange) -> EngineResult<()> {
        self.ensure_open()?;
        let _exclusive = self.change_gate.write().await;
        let old = self.replace_solution(change.new_solution.clone());
        let new = change.new_solution.clone();
        debug!(
            "Workspace change {} ({} -> {})",
            change.kind,
            old.version(),
            new.version()
        );

        let mut removed: Vec<CacheKey> = Vec::new();
        match change.kind {
            WorkspaceChangeKind::SolutionAdded
            | WorkspaceChangeKind::SolutionCleared
            | WorkspaceChangeKind::SolutionReloaded
            | WorkspaceChangeKind::SolutionRemoved => {
                removed.extend(self.cache.clear());
                self.catalog.clear_projects();
                self.skipped.invalidate_all();
                self.completed.clear();
                self.write_locks.clear();
                self.cache.track_solution(&new);
            }
            WorkspaceChangeKind::SolutionChanged => {
                removed.extend(self.reconcile(&old, &new));
            }
            WorkspaceChangeKind::ProjectAdded | WorkspaceChangeKind::DocumentAdded => {
                if let Some(project) = change.project_id.and_then(|id| new.project(id)) {
                    removed.extend(self.cache.track_project(project));
                }
            }
            WorkspaceChangeKind::ProjectChanged => {
                if let Some(id) = change.project_id {
                    removed.extend(self.reconcile_project(old.project(id), new.project(id)));
                }
            }
            WorkspaceChangeKind::ProjectRemoved => {
                if let Some(id) = change.project_id {
                    removed.extend(self.forget_project(id, old.project(id)));
                }
            }
            WorkspaceChangeKind::ProjectReloaded | WorkspaceChangeKind::AnalyzerReferencesChanged => {
                if let Some(id) = change.project_id {
                    removed.extend(self.reset_project(id, old.project(id)));
                    if let Some(project) = new.project(id) {
                        removed.extend(self.cache.track_project(project));
                    }
                }
            }
            WorkspaceChangeKind::DocumentChanged => {
                // Cached results stay readable and are reported stale
            }
            WorkspaceChangeKind::DocumentRemoved => {
                if let (Some(project), Some(document)) = (change.project_id, change.document_id) {
                    removed.extend(self.cache.remove_document(project, document));
                    self.forget_document(document);
                    if let Some(project) = new.project(project) {
                        removed.extend(self.cache.track_project(project));
                    }
                }
            }
            WorkspaceChangeKind::DocumentReloaded => {
                if let Some(document) = change.document_id {
                    removed.extend(self.cache.invalidate_document(document));
                    self.forget_document(document);
                }
            }
        }

        let build_events = self.build.on_workspace_change(&change);
        self.publish_removals(removed).await?;
        self.publish_all(build_events).await
    }

    /// Bring the cache in line with a new solution snapshot
    fn reconcile(&self, old: &Solution, new: &Solution) -> Vec<CacheKey> {
        let mut removed = Vec::new();
        for project in old.projects() {
            if new.project(project.id()).is_none() {
                removed.extend(self.forget_project(project.id(), Some(project)));
            }
        }
        for project in new.projects() {
            removed.extend(self.reconcile_project(old.project(project.id()), Some(project)));
        }
        removed
    }

    fn reconcile_project(&self, old: Option<&Arc<Project>>, new: Option<&Arc<Project>>) -> Vec<CacheKey> {
        let Some(new) = new else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        if let Some(old) = old {
            if old.reference_set_key() != new.reference_set_key() {
                debug!("Analyzer references of {} changed", new.name());
                removed.extend(self.reset_project(new.id(), Some(old)));
            }
        }
        removed.extend(self.cache.track_project(new));
        removed
    }

    /// Drop cached analyzers and results of a project that stays in the solution
    fn reset_project(&self, id: ProjectId, old: Option<&Arc<Project>>) -> Vec<CacheKey> {
        self.catalog.invalidate_project(id);
        if let Some(old) = old {
            self.skipped.invalidate(old);
            for document in old.document_ids() {
                self.forget_document(document);
            }
        }
        self.cache.invalidate_project(id)
    }

    fn forget_project(&self, id: ProjectId, old: Option<&Arc<Project>>) -> Vec<CacheKey> {
        let removed = self.reset_project(id, old);
        self.write_locks.retain(|key, _| key.project != id);
        let mut removed_all = self.cache.remove_project(id);
        removed_all.extend(removed);
        removed_all
    }

    fn forget_document(&self, document: DocumentId) {
        self.completed.retain(|(id, _), _| *id != document);
        self.write_locks.retain(|key, _| key.document != Some(document));
    }

    /// Compute and cache diagnostics of one document for one kind.
    ///
    /// The compiler analyzer runs first so its diagnostics are published
    /// before slower analyzers finish. With a `span` the result only covers
    /// that span and is returned without being cached. A cancelled call
    /// stores nothing.
    pub async fn analyze_document(
        &self,
        document: DocumentId,
        kind: AnalysisKind,
        span: Option<TextSpan>,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<DiagnosticRecord>> {
        self.ensure_open()?;
        cancel.check()?;

        let solution = self.current_solution();
        let (project, doc) = solution
            .document(document)
            .map(|(project, doc)| (project.clone(), doc.clone()))
            .ok_or(EngineError::UnknownDocument(document))?;
        let version = solution.version();

        let slot = InflightSlot::acquire(&self.inflight, (document, kind));
        let _guard = slot.lock.lock().await;

        self.analyze_document_locked(&project, &doc, kind, span, version, cancel)
            .await
    }

    async fn analyze_document_locked(
        &self,
        project: &Arc<Project>,
        doc: &Arc<Document>,
        kind: AnalysisKind,
        span: Option<TextSpan>,
        version: VersionStamp,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<DiagnosticRecord>> {
        let document = doc.id();
        if span.is_none() {
            if let Some(cached) = self.read_completed(project, document, kind, version) {
                debug!("Reusing {} diagnostics of {} at {}", kind, doc.display_path(), version);
                return Ok(cached);
            }
        }

        let analyzers = self.catalog.get_analyzers_for_project(project);
        let skipped = self.skipped.get_or_compute(&self.catalog, project);
        let (compiler, rest): (Vec<AnalyzerDescriptor>, Vec<AnalyzerDescriptor>) = analyzers
            .into_iter()
            .partition(|analyzer| self.catalog.is_compiler_analyzer(project.language(), analyzer));

        let mut diagnostics = Vec::new();
        let mut ran = Vec::new();
        for phase in [compiler, rest] {
            if phase.is_empty() {
                continue;
            }
            let scope = DocumentAnalysisScope {
                project: project.clone(),
                document: doc.clone(),
                span,
                kind,
                analyzers: phase,
                skipped: skipped.clone(),
            };
            let results = self.executor.compute_document_diagnostics(&scope, cancel).await?;
            cancel.check()?;

            for result in results {
                ran.push(result.analyzer.id().clone());
                if span.is_none() {
                    let mut builder = AnalysisResultBuilder::new(project.id(), result.analyzer.id().clone(), version);
                    builder.add_document(document);
                    builder.add(kind, result.diagnostics.iter().cloned());
                    let cache_key = CacheKey::document(
                        self.workspace,
                        project.id(),
                        document,
                        result.analyzer.id().clone(),
                        kind,
                    );
                    self.store_and_publish(cache_key, Arc::new(builder.build()), version, result.diagnostics.clone())
                        .await?;
                }
                diagnostics.extend(result.diagnostics);
            }
        }

        if span.is_none() && self.cache.is_live(project.id(), Some(document)) {
            self.completed.insert(
                (document, kind),
                CompletedPass {
                    version,
                    analyzers: ran,
                },
            );
        }
        Ok(dedupe_exceptions(diagnostics))
    }

    /// Cached diagnostics of a pass completed at `version`, if every entry is still present
    fn read_completed(
        &self,
        project: &Project,
        document: DocumentId,
        kind: AnalysisKind,
        version: VersionStamp,
    ) -> Option<Vec<DiagnosticRecord>> {
        let pass = self.completed.get(&(document, kind))?.clone();
        if pass.version != version {
            return None;
        }
        let mut diagnostics = Vec::new();
        for analyzer in pass.analyzers {
            let key = CacheKey::document(self.workspace, project.id(), document, analyzer, kind);
            let cached = self.cache.get_with_version(&key, version)?;
            if cached.is_stale {
                return None;
            }
            diagnostics.extend_from_slice(cached.result.document_diagnostics(document, kind));
        }
        Some(dedupe_exceptions(diagnostics))
    }

    /// Run a fresh full analysis of a project and cache every slice of it
    pub async fn force_analyze_project(&self, project: ProjectId, cancel: &CancellationToken) -> EngineResult<()> {
        self.ensure_open()?;
        cancel.check()?;

        let solution = self.current_solution();
        let project = solution
            .project(project)
            .cloned()
            .ok_or(EngineError::UnknownProject(project))?;
        let version = solution.version();

        let scope = ProjectAnalysisScope {
            project: project.clone(),
            analyzers: self.catalog.get_analyzers_for_project(&project),
            skipped: self.skipped.get_or_compute(&self.catalog, &project),
            version,
        };
        info!("Analyzing project {} at {}", project.name(), version);
        let results = self.executor.compute_project_diagnostics(&scope, cancel).await?;
        cancel.check()?;

        for (analyzer, result) in results {
            let result = Arc::new(result);
            self.cache.store(
                CacheKey::project_full(self.workspace, project.id(), analyzer.id().clone()),
                result.clone(),
                version,
            );
            self.store_slices(&project, analyzer.id(), &result, version).await?;
        }
        Ok(())
    }

    /// Analyze every project of the current solution
    pub async fn force_analyze_solution(&self, cancel: &CancellationToken) -> EngineResult<()> {
        let solution = self.current_solution();
        try_join_all(
            solution
                .project_ids()
                .map(|project| self.force_analyze_project(project, cancel)),
        )
        .await?;
        Ok(())
    }

    async fn store_slices(
        &self,
        project: &Project,
        analyzer: &AnalyzerId,
        result: &AnalysisResult,
        version: VersionStamp,
    ) -> EngineResult<()> {
        for document in project.document_ids() {
            for kind in AnalysisKind::ALL {
                let slice = result.document_slice(document, kind);
                let diagnostics = slice.document_diagnostics(document, kind).to_vec();
                let key = CacheKey::document(self.workspace, project.id(), document, analyzer.clone(), kind);
                self.store_and_publish(key, Arc::new(slice), version, diagnostics)
                    .await?;
            }
        }

        let others = result.others_slice();
        let diagnostics = others.others().to_vec();
        let key = CacheKey::project_others(self.workspace, project.id(), analyzer.clone());
        self.store_and_publish(key, Arc::new(others), version, diagnostics)
            .await?;
        Ok(())
    }

    async fn store_and_publish(
        &self,
        key: CacheKey,
        result: Arc<AnalysisResult>,
        version: VersionStamp,
        diagnostics: Vec<DiagnosticRecord>,
    ) -> EngineResult<StoreOutcome> {
        let _shared = self.change_gate.read().await;
        let lock = self
            .write_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _ordered = lock.lock().await;

        let outcome = self.cache.store(key.clone(), result, version);
        if outcome.is_changed() {
            if let Some(bucket) = live_bucket(&key) {
                self.bus
                    .publish(UpdateEvent::created(self.workspace, bucket, diagnostics, Some(version)))
                    .await?;
            }
        }
        Ok(outcome)
    }

    /// Cached diagnostics matching `scope`, merged with build-only ones.
    ///
    /// Never computes anything; results may be stale.
    pub fn get_diagnostics(
        &self,
        scope: &DiagnosticsScope,
        include_suppressed: bool,
    ) -> EngineResult<Vec<DiagnosticRecord>> {
        self.ensure_open()?;
        let entries = match (scope.document, scope.project) {
            (Some(document), _) => self.cache.document_entries(document),
            (None, Some(project)) => self.cache.project_entries(project),
            (None, None) => {
                let mut all = self.cache.all_entries();
                all.sort_by(|a, b| a.0.cmp(&b.0));
                all
            }
        };

        let mut diagnostics = Vec::new();
        for (key, entry) in entries.iter().filter(|(key, _)| scope.matches(key)) {
            let Some(kind) = key.kind else {
                continue;
            };
            match key.document {
                Some(document) => diagnostics.extend_from_slice(entry.result.document_diagnostics(document, kind)),
                None => diagnostics.extend_from_slice(entry.result.others()),
            }
        }

        if scope.includes_build_only() {
            diagnostics.extend(self.build_only_for(scope));
        }
        if !include_suppressed {
            diagnostics.retain(|diagnostic| !diagnostic.is_suppressed);
        }
        Ok(dedupe_exceptions(diagnostics))
    }

    fn build_only_for(&self, scope: &DiagnosticsScope) -> Vec<DiagnosticRecord> {
        let solution = self.current_solution();
        match (scope.project, scope.document) {
            (project, Some(document)) => {
                let project = project.or_else(|| solution.project_of(document).map(|project| project.id()));
                match project {
                    Some(project) => self.build.get_build_only_diagnostics(project, Some(document)),
                    None => Vec::new(),
                }
            }
            (Some(project), None) => self.build.project_diagnostics(project),
            (None, None) => solution
                .project_ids()
                .flat_map(|project| self.build.project_diagnostics(project))
                .collect(),
        }
    }

    pub fn subscribe(&self, mode: DiagnosticMode, handler: Arc<dyn DiagnosticsUpdatedHandler>) -> SubscriptionId {
        self.bus.subscribe(mode, handler)
    }

    pub fn subscribe_channel(
        &self,
        mode: DiagnosticMode,
        capacity: usize,
    ) -> (SubscriptionId, mpsc::Receiver<Arc<UpdateEvent>>) {
        self.bus.subscribe_channel(mode, capacity)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Buckets currently known to the event bus
    pub fn get_current(
        &self,
        project: Option<ProjectId>,
        document: Option<DocumentId>,
        id: Option<&BucketId>,
    ) -> Vec<Arc<UpdateEvent>> {
        self.bus.get_current(self.workspace, project, document, id)
    }

    /// Wait until every event published so far has been delivered
    pub async fn flush_events(&self) -> EngineResult<()> {
        self.bus.flush().await
    }

    /// Merge the diagnostics of a build of `project`
    pub async fn synchronize_with_build(
        &self,
        project: ProjectId,
        diagnostics: Vec<DiagnosticRecord>,
    ) -> EngineResult<()> {
        self.ensure_open()?;
        let solution = self.current_solution();
        let project = solution
            .project(project)
            .ok_or(EngineError::UnknownProject(project))?;
        let live_ids: HashSet<String> = self.catalog.live_diagnostic_ids(project);
        let events = self.build.sync_with_build(project, diagnostics, &live_ids);
        self.publish_all(events).await
    }

    pub fn begin_build(&self) -> Uuid {
        self.build.begin_build()
    }

    pub async fn end_build(&self) -> EngineResult<()> {
        let events = self.build.end_build();
        self.publish_all(events).await
    }

    pub async fn add_build_only_diagnostics(
        &self,
        project: ProjectId,
        document: Option<DocumentId>,
        diagnostics: Vec<DiagnosticRecord>,
    ) -> EngineResult<()> {
        self.ensure_open()?;
        let events = self.build.add_build_only_diagnostics(project, document, diagnostics);
        self.publish_all(events).await
    }

    pub fn get_build_only_diagnostics(&self, project: ProjectId, document: Option<DocumentId>) -> Vec<DiagnosticRecord> {
        self.build.get_build_only_diagnostics(project, document)
    }

    pub async fn clear_build_only(&self, project: ProjectId, document: Option<DocumentId>) -> EngineResult<()> {
        self.ensure_open()?;
        let events = self.build.clear_build_only(project, document);
        self.publish_all(events).await
    }

    pub fn is_pull_mode(&self, channel: DiagnosticChannel) -> bool {
        self.modes.is_pull_mode(channel)
    }

    pub fn is_push_mode(&self, channel: DiagnosticChannel) -> bool {
        self.modes.is_push_mode(channel)
    }

    pub fn telemetry(&self) -> Vec<(AnalyzerId, AnalyzerTelemetry)> {
        self.telemetry.snapshot()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            workspace: self.workspace,
            solution_version: self.current_solution().version(),
            cache: self.cache.stats(),
            events_delivered: self.bus.delivered(),
            inflight_computations: self.inflight.len(),
            build_in_progress: self.build.is_build_in_progress(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release every cached result and stop the event lane.
    ///
    /// Events already queued are still delivered.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed = self.cache.clear();
        self.inflight.clear();
        self.write_locks.clear();
        self.completed.clear();
        self.telemetry.clear();
        self.bus.shutdown().await;
        info!(
            "Closed diagnostic service for {} ({} cached results released)",
            self.workspace,
            removed.len()
        );
    }

    async fn publish_removals(&self, removed: Vec<CacheKey>) -> EngineResult<()> {
        let events = removed
            .iter()
            .filter_map(live_bucket)
            .map(|bucket| UpdateEvent::removed(self.workspace, bucket))
            .collect();
        self.publish_all(events).await
    }

    async fn publish_all(&self, events: Vec<UpdateEvent>) -> EngineResult<()> {
        for event in events {
            if let Err(e) = self.bus.publish(event).await {
                warn!("Dropping diagnostic update for {}: {}", self.workspace, e);
                return Err(e);
            }
        }
        Ok(())
    }
}

type InflightKey = (DocumentId, AnalysisKind);

/// Registration in the in-flight map, dropped with the computation even when
/// the caller's future is cancelled
struct InflightSlot<'a> {
    map: &'a DashMap<InflightKey, Arc<AsyncMutex<()>>>,
    key: InflightKey,
    lock: Arc<AsyncMutex<()>>,
}

impl<'a> InflightSlot<'a> {
    fn acquire(map: &'a DashMap<InflightKey, Arc<AsyncMutex<()>>>, key: InflightKey) -> Self {
        let lock = map
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        Self { map, key, lock }
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        // Waiters still queued on the mutex hold their own clones; the entry
        // stays until the last of them leaves so later callers join the queue
        self.map.remove_if(&self.key, |_, current| {
            Arc::ptr_eq(current, &self.lock) && Arc::strong_count(current) == 2
        });
    }
}

fn live_bucket(key: &CacheKey) -> Option<BucketId> {
    key.kind.map(|kind| BucketId::Live {
        project: key.project,
        document: key.document,
        analyzer: key.analyzer.clone(),
        kind,
    })
}
