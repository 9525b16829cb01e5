//! Workspace change notifications fed into the engine

use std::fmt;
use std::sync::Arc;

use super::Solution;
use crate::ids::{DocumentId, ProjectId};

/// What happened to the workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkspaceChangeKind {
    SolutionAdded,
    SolutionChanged,
    SolutionCleared,
    SolutionReloaded,
    SolutionRemoved,
    ProjectAdded,
    ProjectChanged,
    ProjectRemoved,
    ProjectReloaded,
    AnalyzerReferencesChanged,
    DocumentAdded,
    DocumentChanged,
    DocumentRemoved,
    DocumentReloaded,
}

impl WorkspaceChangeKind {
    /// Changes after which everything known about the old solution is discarded
    pub fn resets_solution(&self) -> bool {
        matches!(
            self,
            WorkspaceChangeKind::SolutionCleared
                | WorkspaceChangeKind::SolutionReloaded
                | WorkspaceChangeKind::SolutionRemoved
        )
    }
}

impl fmt::Display for WorkspaceChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One change, carrying the solution snapshot as it is after the change.
///
/// Removals still name the removed project / document since the new solution
/// no longer contains them.
#[derive(Debug, Clone)]
pub struct WorkspaceChange {
    pub kind: WorkspaceChangeKind,
    pub new_solution: Arc<Solution>,
    pub project_id: Option<ProjectId>,
    pub document_id: Option<DocumentId>,
}

impl WorkspaceChange {
    pub fn solution(kind: WorkspaceChangeKind, new_solution: Arc<Solution>) -> Self {
        Self {
            kind,
            new_solution,
            project_id: None,
            document_id: None,
        }
    }

    pub fn project(kind: WorkspaceChangeKind, new_solution: Arc<Solution>, project_id: ProjectId) -> Self {
        Self {
            kind,
            new_solution,
            project_id: Some(project_id),
            document_id: None,
        }
    }

    pub fn document(
        kind: WorkspaceChangeKind,
        new_solution: Arc<Solution>,
        project_id: ProjectId,
        document_id: DocumentId,
    ) -> Self {
        Self {
            kind,
            new_solution,
            project_id: Some(project_id),
            document_id: Some(document_id),
        }
    }
}
