//! Build-only diagnostics
//!
//! Diagnostics reported by an explicit build whose ids no live analyzer can
//! produce are kept here, apart from the live result cache. They survive
//! routine edits and are only dropped by a new build, an explicit clear, or a
//! structural change to their document, project or solution.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::diagnostic::DiagnosticRecord;
use crate::events::{BucketId, UpdateEvent};
use crate::ids::{DocumentId, ProjectId, WorkspaceId};
use crate::workspace::change::{WorkspaceChange, WorkspaceChangeKind};
use crate::workspace::Project;

/// Per-scope state of build-only data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildDataState {
    NoData,
    HasData,
}

#[derive(Debug, Clone)]
struct BuildEntry {
    diagnostics: Vec<DiagnosticRecord>,
    synchronized_at: DateTime<Utc>,
}

type ScopeKey = (ProjectId, Option<DocumentId>);

/// Diagnostics synchronized while a build is running
#[derive(Debug)]
struct BuildSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    pending: Vec<(ProjectId, BTreeMap<Option<DocumentId>, Vec<DiagnosticRecord>>)>,
}

/// Tracks build-only diagnostics for one workspace
pub struct BuildSyncMerger {
    workspace: WorkspaceId,
    entries: DashMap<ScopeKey, BuildEntry>,
    session: Mutex<Option<BuildSession>>,
}

impl BuildSyncMerger {
    pub fn new(workspace: WorkspaceId) -> Self {
        Self {
            workspace,
            entries: DashMap::new(),
            session: Mutex::new(None),
        }
    }

    /// Merge the diagnostics of a finished build of `project`.
    ///
    /// Diagnostics whose id is in `live_ids` are dropped since live analysis
    /// reports them. The remainder replaces the project's build-only data.
    /// While a build session is open the replacement is deferred to
    /// [`Self::end_build`].
    pub fn sync_with_build(
        &self,
        project: &Project,
        diagnostics: Vec<DiagnosticRecord>,
        live_ids: &HashSet<String>,
    ) -> Vec<UpdateEvent> {
        let total = diagnostics.len();
        let mut grouped: BTreeMap<Option<DocumentId>, Vec<DiagnosticRecord>> = BTreeMap::new();
        for diagnostic in diagnostics {
            if live_ids.contains(&diagnostic.id) {
                continue;
            }
            let foreign_project = diagnostic.project_id().is_some_and(|owner| owner != project.id());
            let foreign_document = diagnostic
                .document_id()
                .is_some_and(|document| !project.contains_document(document));
            if foreign_project || foreign_document {
                warn!(
                    "Dropping build diagnostic {} outside project {}",
                    diagnostic.id,
                    project.name()
                );
                continue;
            }
            grouped.entry(diagnostic.document_id()).or_default().push(diagnostic);
        }
        let kept: usize = grouped.values().map(Vec::len).sum();
        debug!(
            "Build reported {} diagnostics for {}, {} are build-only",
            total,
            project.name(),
            kept
        );

        {
            let mut session = self.lock_session();
            if let Some(session) = session.as_mut() {
                session.pending.push((project.id(), grouped));
                return Vec::new();
            }
        }
        self.replace_project(project.id(), grouped)
    }

    /// Set the build-only diagnostics of one scope. An empty list clears it.
    pub fn add_build_only_diagnostics(
        &self,
        project: ProjectId,
        document: Option<DocumentId>,
        diagnostics: Vec<DiagnosticRecord>,
    ) -> Vec<UpdateEvent> {
        if diagnostics.is_empty() {
            return self.clear_scope(project, document).into_iter().collect();
        }
        self.entries.insert(
            (project, document),
            BuildEntry {
                diagnostics: diagnostics.clone(),
                synchronized_at: Utc::now(),
            },
        );
        vec![UpdateEvent::created(
            self.workspace,
            BucketId::Build { project, document },
            diagnostics,
            None,
        )]
    }

    /// Build-only diagnostics of one scope; `None` is the project-level scope
    pub fn get_build_only_diagnostics(
        &self,
        project: ProjectId,
        document: Option<DocumentId>,
    ) -> Vec<DiagnosticRecord> {
        self.entries
            .get(&(project, document))
            .map(|entry| entry.diagnostics.clone())
            .unwrap_or_default()
    }

    /// Every build-only diagnostic of a project, documents included
    pub fn project_diagnostics(&self, project: ProjectId) -> Vec<DiagnosticRecord> {
        let mut scopes: Vec<(Option<DocumentId>, Vec<DiagnosticRecord>)> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == project)
            .map(|entry| (entry.key().1, entry.value().diagnostics.clone()))
            .collect();
        scopes.sort_by_key(|(document, _)| *document);
        scopes.into_iter().flat_map(|(_, diagnostics)| diagnostics).collect()
    }

    pub fn last_synchronized(&self, project: ProjectId, document: Option<DocumentId>) -> Option<DateTime<Utc>> {
        self.entries
            .get(&(project, document))
            .map(|entry| entry.synchronized_at)
    }

    pub fn state(&self, project: ProjectId, document: Option<DocumentId>) -> BuildDataState {
        if self.entries.contains_key(&(project, document)) {
            BuildDataState::HasData
        } else {
            BuildDataState::NoData
        }
    }

    /// Clear a document scope, or the whole project when `document` is `None`
    pub fn clear_build_only(&self, project: ProjectId, document: Option<DocumentId>) -> Vec<UpdateEvent> {
        match document {
            Some(document) => self.clear_scope(project, Some(document)).into_iter().collect(),
            None => self.clear_project(project),
        }
    }

    /// Drop everything; used when the solution is reset
    pub fn clear_all(&self) -> Vec<UpdateEvent> {
        let mut keys: Vec<ScopeKey> = self.entries.iter().map(|entry| *entry.key()).collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|(project, document)| self.clear_scope(project, document))
            .collect()
    }

    /// Start a build session. Syncs are held back until it ends.
    pub fn begin_build(&self) -> Uuid {
        let mut session = self.lock_session();
        if let Some(existing) = session.as_ref() {
            debug!("Build {} already in progress", existing.id);
            return existing.id;
        }
        let id = Uuid::new_v4();
        info!("Build {} started", id);
        *session = Some(BuildSession {
            id,
            started_at: Utc::now(),
            pending: Vec::new(),
        });
        id
    }

    /// Finish the build session and apply what it collected
    pub fn end_build(&self) -> Vec<UpdateEvent> {
        let Some(session) = self.lock_session().take() else {
            return Vec::new();
        };
        let elapsed = Utc::now() - session.started_at;
        info!(
            "Build {} finished after {}ms with {} project syncs",
            session.id,
            elapsed.num_milliseconds(),
            session.pending.len()
        );
        session
            .pending
            .into_iter()
            .flat_map(|(project, grouped)| self.replace_project(project, grouped))
            .collect()
    }

    pub fn is_build_in_progress(&self) -> bool {
        self.lock_session().is_some()
    }

    /// Purge data made obsolete by a structural change.
    ///
    /// Edits (`DocumentChanged`, `ProjectChanged`, `SolutionChanged`) keep
    /// build-only diagnostics until the next build.
    /// Data queued by an open build session is pruned the same way, so
    /// ending the session cannot bring back a removed scope.
    pub fn on_workspace_change(&self, change: &WorkspaceChange) -> Vec<UpdateEvent> {
        match change.kind {
            kind if kind.resets_solution() || kind == WorkspaceChangeKind::SolutionAdded => {
                self.prune_pending(|_, _| true);
                self.clear_all()
            }
            WorkspaceChangeKind::ProjectRemoved | WorkspaceChangeKind::ProjectReloaded => match change.project_id {
                Some(project) => {
                    self.prune_pending(|pending, _| pending == project);
                    self.clear_project(project)
                }
                None => Vec::new(),
            },
            WorkspaceChangeKind::DocumentRemoved | WorkspaceChangeKind::DocumentReloaded => {
                match (change.project_id, change.document_id) {
                    (Some(project), Some(document)) => {
                        self.prune_pending(|pending, scope| pending == project && scope == Some(document));
                        self.clear_scope(project, Some(document)).into_iter().collect()
                    }
                    _ => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    fn prune_pending(&self, obsolete: impl Fn(ProjectId, Option<DocumentId>) -> bool) {
        let mut session = self.lock_session();
        let Some(session) = session.as_mut() else {
            return;
        };
        for (project, grouped) in session.pending.iter_mut() {
            let project = *project;
            grouped.retain(|document, _| !obsolete(project, *document));
        }
        // Syncs of a removed project are dropped whole
        session
            .pending
            .retain(|(project, grouped)| !grouped.is_empty() || !obsolete(*project, None));
    }

    fn replace_project(
        &self,
        project: ProjectId,
        grouped: BTreeMap<Option<DocumentId>, Vec<DiagnosticRecord>>,
    ) -> Vec<UpdateEvent> {
        let mut events: Vec<UpdateEvent> = self
            .scopes_of(project)
            .into_iter()
            .filter(|document| !grouped.contains_key(document))
            .filter_map(|document| self.clear_scope(project, document))
            .collect();
        for (document, diagnostics) in grouped {
            events.extend(self.add_build_only_diagnostics(project, document, diagnostics));
        }
        events
    }

    fn clear_project(&self, project: ProjectId) -> Vec<UpdateEvent> {
        self.scopes_of(project)
            .into_iter()
            .filter_map(|document| self.clear_scope(project, document))
            .collect()
    }

    fn clear_scope(&self, project: ProjectId, document: Option<DocumentId>) -> Option<UpdateEvent> {
        self.entries.remove(&(project, document))?;
        Some(UpdateEvent::removed(
            self.workspace,
            BucketId::Build { project, document },
        ))
    }

    fn scopes_of(&self, project: ProjectId) -> Vec<Option<DocumentId>> {
        let mut scopes: Vec<Option<DocumentId>> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == project)
            .map(|entry| entry.key().1)
            .collect();
        scopes.sort();
        scopes
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<BuildSession>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{
        DiagnosticDescriptor, DiagnosticLocation, DiagnosticSeverity, FileLinePositionSpan, LinePosition,
    };
    use crate::events::UpdateKind;
    use crate::workspace::{Document, Solution};
    use std::sync::Arc;

    fn diagnostic(id: &str, project: ProjectId, document: Option<DocumentId>) -> DiagnosticRecord {
        let descriptor = DiagnosticDescriptor::new(id, "t", "m", "Build", DiagnosticSeverity::Error, true);
        let location = match document {
            Some(document) => DiagnosticLocation::document(
                None,
                project,
                document,
                None,
                FileLinePositionSpan::new(None, LinePosition::new(0, 0), LinePosition::new(0, 1)),
            ),
            None => DiagnosticLocation::project(None, project),
        };
        DiagnosticRecord::from_descriptor(&descriptor, location, &[])
    }

    fn project() -> (Project, DocumentId) {
        let project = Project::new("App", "csharp");
        let document = Document::new(project.id(), "a.cs", "class A {}");
        let document_id = document.id();
        (project.with_document(document), document_id)
    }

    #[test]
    fn test_sync_keeps_only_build_only_ids() {
        let merger = BuildSyncMerger::new(WorkspaceId::new());
        let (project, document) = project();
        let live: HashSet<String> = ["CS0001".to_string()].into_iter().collect();

        let events = merger.sync_with_build(
            &project,
            vec![
                diagnostic("CS0001", project.id(), Some(document)),
                diagnostic("MSB3277", project.id(), Some(document)),
                diagnostic("NU1603", project.id(), None),
            ],
            &live,
        );
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.kind() == UpdateKind::Created));

        let ids: Vec<String> = merger
            .get_build_only_diagnostics(project.id(), Some(document))
            .into_iter()
            .map(|diagnostic| diagnostic.id)
            .collect();
        assert_eq!(ids, vec!["MSB3277"]);
        assert_eq!(merger.get_build_only_diagnostics(project.id(), None).len(), 1);
        assert_eq!(merger.project_diagnostics(project.id()).len(), 2);
    }

    #[test]
    fn test_resync_removes_scopes_missing_from_new_build() {
        let merger = BuildSyncMerger::new(WorkspaceId::new());
        let (project, document) = project();
        merger.sync_with_build(
            &project,
            vec![diagnostic("MSB1", project.id(), Some(document))],
            &HashSet::new(),
        );

        let events = merger.sync_with_build(&project, Vec::new(), &HashSet::new());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), UpdateKind::Removed);
        assert!(events[0].diagnostics().is_empty());
        assert_eq!(merger.state(project.id(), Some(document)), BuildDataState::NoData);
    }

    #[test]
    fn test_edits_keep_build_data_and_removal_purges_it() {
        let merger = BuildSyncMerger::new(WorkspaceId::new());
        let (project, document) = project();
        merger.add_build_only_diagnostics(
            project.id(),
            Some(document),
            vec![diagnostic("MSB1", project.id(), Some(document))],
        );

        let solution = Arc::new(Solution::new(WorkspaceId::new()).with_project(project.clone()));
        let edit = WorkspaceChange::document(WorkspaceChangeKind::DocumentChanged, solution.clone(), project.id(), document);
        assert!(merger.on_workspace_change(&edit).is_empty());
        assert_eq!(merger.get_build_only_diagnostics(project.id(), Some(document)).len(), 1);

        let removal = WorkspaceChange::document(WorkspaceChangeKind::DocumentRemoved, solution, project.id(), document);
        let events = merger.on_workspace_change(&removal);
        assert_eq!(events.len(), 1);
        assert!(merger.get_build_only_diagnostics(project.id(), Some(document)).is_empty());
    }

    #[test]
    fn test_solution_reset_clears_everything() {
        let merger = BuildSyncMerger::new(WorkspaceId::new());
        let (project, document) = project();
        merger.add_build_only_diagnostics(
            project.id(),
            Some(document),
            vec![diagnostic("MSB1", project.id(), Some(document))],
        );
        merger.add_build_only_diagnostics(project.id(), None, vec![diagnostic("NU1", project.id(), None)]);

        let solution = Arc::new(Solution::new(WorkspaceId::new()));
        let events = merger.on_workspace_change(&WorkspaceChange::solution(WorkspaceChangeKind::SolutionCleared, solution));
        assert_eq!(events.len(), 2);
        assert_eq!(merger.state(project.id(), None), BuildDataState::NoData);
    }

    #[test]
    fn test_session_defers_sync_until_end() {
        let merger = BuildSyncMerger::new(WorkspaceId::new());
        let (project, document) = project();

        let id = merger.begin_build();
        assert_eq!(merger.begin_build(), id);
        assert!(merger.is_build_in_progress());

        let events = merger.sync_with_build(
            &project,
            vec![diagnostic("MSB1", project.id(), Some(document))],
            &HashSet::new(),
        );
        assert!(events.is_empty());
        assert_eq!(merger.state(project.id(), Some(document)), BuildDataState::NoData);

        let events = merger.end_build();
        assert_eq!(events.len(), 1);
        assert!(!merger.is_build_in_progress());
        assert_eq!(merger.state(project.id(), Some(document)), BuildDataState::HasData);
        assert!(merger.last_synchronized(project.id(), Some(document)).is_some());
    }

    #[test]
    fn test_removal_during_session_prunes_pending_data() {
        let merger = BuildSyncMerger::new(WorkspaceId::new());
        let (project, document) = project();
        let solution = Arc::new(Solution::new(WorkspaceId::new()).with_project(project.clone()));

        merger.begin_build();
        merger.sync_with_build(
            &project,
            vec![
                diagnostic("MSB1", project.id(), Some(document)),
                diagnostic("NU1", project.id(), None),
            ],
            &HashSet::new(),
        );
        let removal = WorkspaceChange::document(WorkspaceChangeKind::DocumentRemoved, solution.clone(), project.id(), document);
        assert!(merger.on_workspace_change(&removal).is_empty());

        let events = merger.end_build();
        assert_eq!(events.len(), 1);
        assert_eq!(merger.state(project.id(), Some(document)), BuildDataState::NoData);
        assert_eq!(merger.state(project.id(), None), BuildDataState::HasData);

        merger.begin_build();
        merger.sync_with_build(&project, vec![diagnostic("MSB1", project.id(), Some(document))], &HashSet::new());
        let removal = WorkspaceChange::project(WorkspaceChangeKind::ProjectRemoved, solution, project.id());
        let removed = merger.on_workspace_change(&removal);
        assert_eq!(removed.len(), 1);
        assert!(merger.end_build().is_empty());
        assert!(merger.project_diagnostics(project.id()).is_empty());
    }

    #[test]
    fn test_diagnostics_of_other_projects_are_dropped() {
        let merger = BuildSyncMerger::new(WorkspaceId::new());
        let (project, document) = project();
        let (other, other_document) = self::project();

        merger.sync_with_build(
            &project,
            vec![
                diagnostic("MSB1", project.id(), Some(document)),
                diagnostic("MSB2", other.id(), Some(other_document)),
                diagnostic("NU1", other.id(), None),
            ],
            &HashSet::new(),
        );
        assert_eq!(merger.project_diagnostics(project.id()).len(), 1);
        assert!(merger.get_build_only_diagnostics(project.id(), None).is_empty());
        assert!(merger.project_diagnostics(other.id()).is_empty());
    }

    #[test]
    fn test_add_empty_list_clears() {
        let merger = BuildSyncMerger::new(WorkspaceId::new());
        let (project, _) = project();
        assert!(merger.add_build_only_diagnostics(project.id(), None, Vec::new()).is_empty());

        merger.add_build_only_diagnostics(project.id(), None, vec![diagnostic("NU1", project.id(), None)]);
        let events = merger.add_build_only_diagnostics(project.id(), None, Vec::new());
        assert_eq!(events[0].kind(), UpdateKind::Removed);
        assert_eq!(merger.state(project.id(), None), BuildDataState::NoData);
    }
}
