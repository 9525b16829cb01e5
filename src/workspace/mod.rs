//! Immutable solution snapshots
//!
//! A [`Solution`] is a persistent value: every edit produces a new snapshot with
//! a newer [`VersionStamp`], and snapshots share unchanged projects and
//! documents through `Arc`. Nothing in the engine mutates a snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::analyzer::{AnalyzerReference, ReferenceSetKey};
use crate::diagnostic::{FileLinePositionSpan, LinePosition, TextSpan};
use crate::ids::{DocumentId, Language, ProjectId, VersionStamp, WorkspaceId};

pub mod change;

pub use change::{WorkspaceChange, WorkspaceChangeKind};

/// Compiled form of a project, produced by the host's compiler.
///
/// The engine only needs it to hand to the analyzer driver and to find the
/// member declaration enclosing a position.
pub trait Compilation: Send + Sync + fmt::Debug {
    /// Span of the smallest member declaration containing `position`
    fn enclosing_member_span(&self, document: DocumentId, position: usize) -> Option<TextSpan>;
}

/// Offset to line/column conversion for one text
#[derive(Debug, Clone, Default)]
pub struct LineIndex {
    line_starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            text.char_indices()
                .filter(|(_, c)| *c == '\n')
                .map(|(offset, _)| offset + 1),
        );
        Self {
            line_starts,
            len: text.len(),
        }
    }

    /// Line and column of a byte offset; offsets past the end clamp to the end
    pub fn position(&self, offset: usize) -> LinePosition {
        let offset = offset.min(self.len);
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next.saturating_sub(1),
        };
        let column = offset - self.line_starts[line];
        LinePosition::new(line as u32, column as u32)
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }
}

/// One source document
#[derive(Debug, Clone)]
pub struct Document {
    id: DocumentId,
    project_id: ProjectId,
    name: String,
    file_path: Option<String>,
    text: Arc<str>,
    line_index: Arc<LineIndex>,
    load_failure: Option<String>,
}

impl Document {
    pub fn new(project_id: ProjectId, name: impl Into<String>, text: impl Into<Arc<str>>) -> Self {
        let text = text.into();
        Self {
            id: DocumentId::new(),
            project_id,
            name: name.into(),
            file_path: None,
            line_index: Arc::new(LineIndex::new(&text)),
            text,
            load_failure: None,
        }
    }

    pub fn with_id(mut self, id: DocumentId) -> Self {
        self.id = id;
        self
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Mark the content as unloadable; the text becomes empty
    pub fn with_load_failure(mut self, message: impl Into<String>) -> Self {
        self.load_failure = Some(message.into());
        self.text = Arc::from("");
        self.line_index = Arc::new(LineIndex::new(""));
        self
    }

    /// New snapshot of the same document with different text
    pub fn with_text(&self, text: impl Into<Arc<str>>) -> Self {
        let text = text.into();
        Self {
            line_index: Arc::new(LineIndex::new(&text)),
            text,
            load_failure: None,
            ..self.clone()
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_path(&self) -> Option<&str> {
        self.file_path.as_deref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn text_len(&self) -> usize {
        self.text.len()
    }

    pub fn load_failure(&self) -> Option<&str> {
        self.load_failure.as_deref()
    }

    pub fn line_index(&self) -> &LineIndex {
        &self.line_index
    }

    /// Path used in diagnostic locations: the file path, else the name
    pub fn display_path(&self) -> &str {
        self.file_path.as_deref().unwrap_or(&self.name)
    }

    /// Line span covering a text span of this document
    pub fn line_span(&self, span: TextSpan) -> FileLinePositionSpan {
        FileLinePositionSpan::new(
            Some(self.display_path().to_string()),
            self.line_index.position(span.start),
            self.line_index.position(span.end),
        )
    }

    pub fn full_span(&self) -> TextSpan {
        TextSpan::new(0, self.text.len())
    }
}

/// One project of a solution
#[derive(Debug, Clone)]
pub struct Project {
    id: ProjectId,
    name: String,
    language: Language,
    documents: BTreeMap<DocumentId, Arc<Document>>,
    analyzer_references: Vec<Arc<AnalyzerReference>>,
    compilation: Option<Arc<dyn Compilation>>,
    loaded_successfully: bool,
}

impl Project {
    pub fn new(name: impl Into<String>, language: impl Into<Language>) -> Self {
        Self {
            id: ProjectId::new(),
            name: name.into(),
            language: language.into(),
            documents: BTreeMap::new(),
            analyzer_references: Vec::new(),
            compilation: None,
            loaded_successfully: true,
        }
    }

    pub fn with_id(mut self, id: ProjectId) -> Self {
        self.id = id;
        for document in self.documents.values_mut() {
            let mut updated = (**document).clone();
            updated.project_id = id;
            *document = Arc::new(updated);
        }
        self
    }

    /// Add or replace a document; its project id is rewritten to this project
    pub fn with_document(mut self, mut document: Document) -> Self {
        document.project_id = self.id;
        self.documents.insert(document.id, Arc::new(document));
        self
    }

    pub fn without_document(mut self, document: DocumentId) -> Self {
        self.documents.remove(&document);
        self
    }

    pub fn with_analyzer_reference(mut self, reference: Arc<AnalyzerReference>) -> Self {
        self.analyzer_references.push(reference);
        self
    }

    pub fn with_analyzer_references(mut self, references: Vec<Arc<AnalyzerReference>>) -> Self {
        self.analyzer_references = references;
        self
    }

    pub fn with_compilation(mut self, compilation: Arc<dyn Compilation>) -> Self {
        self.compilation = Some(compilation);
        self
    }

    /// Whether the project system loaded the project without errors
    pub fn with_load_status(mut self, loaded_successfully: bool) -> Self {
        self.loaded_successfully = loaded_successfully;
        self
    }

    pub fn id(&self) -> ProjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn language(&self) -> &Language {
        &self.language
    }

    pub fn document(&self, id: DocumentId) -> Option<&Arc<Document>> {
        self.documents.get(&id)
    }

    pub fn contains_document(&self, id: DocumentId) -> bool {
        self.documents.contains_key(&id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &Arc<Document>> {
        self.documents.values()
    }

    pub fn document_ids(&self) -> impl Iterator<Item = DocumentId> + '_ {
        self.documents.keys().copied()
    }

    pub fn analyzer_references(&self) -> &[Arc<AnalyzerReference>] {
        &self.analyzer_references
    }

    pub fn reference_set_key(&self) -> ReferenceSetKey {
        ReferenceSetKey::compute(self.analyzer_references.iter().map(Arc::as_ref))
    }

    pub fn compilation(&self) -> Option<&Arc<dyn Compilation>> {
        self.compilation.as_ref()
    }

    pub fn has_successfully_loaded(&self) -> bool {
        self.loaded_successfully
    }
}

/// Snapshot of every project in a workspace
#[derive(Debug, Clone)]
pub struct Solution {
    workspace_id: WorkspaceId,
    version: VersionStamp,
    projects: BTreeMap<ProjectId, Arc<Project>>,
}

impl Solution {
    pub fn new(workspace_id: WorkspaceId) -> Self {
        Self {
            workspace_id,
            version: VersionStamp::INITIAL,
            projects: BTreeMap::new(),
        }
    }

    /// Add or replace a project and bump the version
    pub fn with_project(&self, project: Project) -> Self {
        let mut next = self.clone();
        next.projects.insert(project.id, Arc::new(project));
        next.version = self.version.next();
        next
    }

    pub fn without_project(&self, project: ProjectId) -> Self {
        let mut next = self.clone();
        next.projects.remove(&project);
        next.version = self.version.next();
        next
    }

    /// Replace one document's text and bump the version
    pub fn with_document_text(&self, document: DocumentId, text: impl Into<Arc<str>>) -> Option<Self> {
        let project = self.project_of(document)?;
        let updated = project.document(document)?.with_text(text);
        let project = (**project).clone().with_document(updated);
        Some(self.with_project(project))
    }

    pub fn with_version(mut self, version: VersionStamp) -> Self {
        self.version = version;
        self
    }

    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    pub fn version(&self) -> VersionStamp {
        self.version
    }

    pub fn project(&self, id: ProjectId) -> Option<&Arc<Project>> {
        self.projects.get(&id)
    }

    pub fn projects(&self) -> impl Iterator<Item = &Arc<Project>> {
        self.projects.values()
    }

    pub fn project_ids(&self) -> impl Iterator<Item = ProjectId> + '_ {
        self.projects.keys().copied()
    }

    /// The project owning a document
    pub fn project_of(&self, document: DocumentId) -> Option<&Arc<Project>> {
        self.projects
            .values()
            .find(|project| project.contains_document(document))
    }

    pub fn document(&self, id: DocumentId) -> Option<(&Arc<Project>, &Arc<Document>)> {
        let project = self.project_of(id)?;
        project.document(id).map(|document| (project, document))
    }
}
