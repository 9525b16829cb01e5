//! Diagnostic data model
//!
//! [`DiagnosticRecord`] is the unit every component passes around: analyzers
//! produce it, the result cache stores it, the event bus publishes it and the
//! build merger folds external ones into it.
//!
//! Equality is deliberately coarse (id, category, message, severity, warning
//! level, project, document and original start position) so that reruns that
//! produce the same findings compare equal even when spans or property bags
//! differ in detail.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::ids::{DocumentId, ProjectId, WorkspaceId};

/// Well-known custom tags attached to descriptors
pub mod tags {
    /// Diagnostic produced by the compiler analyzer
    pub const COMPILER: &str = "Compiler";
    /// Descriptor whose analyzer may report execution telemetry
    pub const TELEMETRY: &str = "Telemetry";
    /// Severity cannot be changed by configuration
    pub const NOT_CONFIGURABLE: &str = "NotConfigurable";
    /// Synthetic diagnostic describing an analyzer failure
    pub const ANALYZER_EXCEPTION: &str = "AnalyzerException";
    /// Diagnostic that only an explicit build can produce
    pub const BUILD: &str = "Build";
}

/// Ids of diagnostics synthesized by the engine itself
pub mod well_known_ids {
    /// An analyzer threw while analyzing
    pub const ANALYZER_EXCEPTION: &str = "AD0001";
    /// The shared analyzer driver failed for a whole batch
    pub const ANALYZER_DRIVER_EXCEPTION: &str = "AD0002";
    /// A document's content could not be loaded
    pub const DOCUMENT_LOAD_FAILURE: &str = "IDE1100";
}

/// Severity of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Hidden,
    Info,
    Warning,
    Error,
}

impl DiagnosticSeverity {
    /// Warning level implied by a severity when the analyzer does not supply one
    pub fn default_warning_level(&self) -> u8 {
        match self {
            DiagnosticSeverity::Error => 0,
            DiagnosticSeverity::Warning => 1,
            DiagnosticSeverity::Info | DiagnosticSeverity::Hidden => 4,
        }
    }
}

impl fmt::Display for DiagnosticSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagnosticSeverity::Hidden => "hidden",
            DiagnosticSeverity::Info => "info",
            DiagnosticSeverity::Warning => "warning",
            DiagnosticSeverity::Error => "error",
        };
        f.write_str(name)
    }
}

/// Half-open character range `[start, end)` into a document's text
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

impl TextSpan {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "span start must not exceed end");
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `position` lies inside the span (end exclusive)
    pub fn contains(&self, position: usize) -> bool {
        position >= self.start && position < self.end
    }

    pub fn contains_span(&self, other: &TextSpan) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn intersects(&self, other: &TextSpan) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Smallest span covering both
    pub fn union(&self, other: &TextSpan) -> TextSpan {
        TextSpan::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// Zero-based line / column pair
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LinePosition {
    pub line: u32,
    pub column: u32,
}

impl LinePosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Line span inside a file, optionally overriding the file path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileLinePositionSpan {
    pub path: Option<String>,
    pub start: LinePosition,
    pub end: LinePosition,
}

impl FileLinePositionSpan {
    pub fn new(path: Option<String>, start: LinePosition, end: LinePosition) -> Self {
        Self { path, start, end }
    }
}

/// Where a diagnostic was reported.
///
/// A location without a document never carries spans; the constructors are the
/// only way to build one so that invariant always holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiagnosticLocation {
    workspace_id: Option<WorkspaceId>,
    project_id: Option<ProjectId>,
    document_id: Option<DocumentId>,
    original: Option<FileLinePositionSpan>,
    mapped: Option<FileLinePositionSpan>,
    source_span: Option<TextSpan>,
}

impl DiagnosticLocation {
    /// Location-less diagnostic scoped to a workspace
    pub fn workspace(workspace_id: WorkspaceId) -> Self {
        Self {
            workspace_id: Some(workspace_id),
            project_id: None,
            document_id: None,
            original: None,
            mapped: None,
            source_span: None,
        }
    }

    /// Location-less diagnostic scoped to a project
    pub fn project(workspace_id: Option<WorkspaceId>, project_id: ProjectId) -> Self {
        Self {
            workspace_id,
            project_id: Some(project_id),
            document_id: None,
            original: None,
            mapped: None,
            source_span: None,
        }
    }

    /// Diagnostic with a source location inside a document
    pub fn document(
        workspace_id: Option<WorkspaceId>,
        project_id: ProjectId,
        document_id: DocumentId,
        source_span: Option<TextSpan>,
        original: FileLinePositionSpan,
    ) -> Self {
        Self {
            workspace_id,
            project_id: Some(project_id),
            document_id: Some(document_id),
            mapped: Some(original.clone()),
            original: Some(original),
            source_span,
        }
    }

    /// Replace the mapped span; ignored for location-less diagnostics
    pub fn with_mapped(mut self, mapped: FileLinePositionSpan) -> Self {
        if self.document_id.is_some() {
            self.mapped = Some(mapped);
        }
        self
    }

    pub fn with_workspace(mut self, workspace_id: WorkspaceId) -> Self {
        self.workspace_id = Some(workspace_id);
        self
    }

    pub fn workspace_id(&self) -> Option<WorkspaceId> {
        self.workspace_id
    }

    pub fn project_id(&self) -> Option<ProjectId> {
        self.project_id
    }

    pub fn document_id(&self) -> Option<DocumentId> {
        self.document_id
    }

    pub fn original(&self) -> Option<&FileLinePositionSpan> {
        self.original.as_ref()
    }

    pub fn mapped(&self) -> Option<&FileLinePositionSpan> {
        self.mapped.as_ref()
    }

    pub fn source_span(&self) -> Option<TextSpan> {
        self.source_span
    }

    pub fn has_source_location(&self) -> bool {
        self.document_id.is_some()
    }

    pub(crate) fn set_source_span(&mut self, span: Option<TextSpan>) {
        if self.document_id.is_some() {
            self.source_span = span;
        }
    }
}

/// Static description of a diagnostic an analyzer can report
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiagnosticDescriptor {
    pub id: String,
    pub title: String,
    pub message_format: String,
    pub category: String,
    pub default_severity: DiagnosticSeverity,
    pub is_enabled_by_default: bool,
    pub description: String,
    pub help_link: Option<String>,
    pub custom_tags: Vec<String>,
}

impl DiagnosticDescriptor {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        message_format: impl Into<String>,
        category: impl Into<String>,
        default_severity: DiagnosticSeverity,
        is_enabled_by_default: bool,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            message_format: message_format.into(),
            category: category.into(),
            default_severity,
            is_enabled_by_default,
            description: String::new(),
            help_link: None,
            custom_tags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_help_link(mut self, help_link: impl Into<String>) -> Self {
        self.help_link = Some(help_link.into());
        self
    }

    pub fn with_custom_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.custom_tags = dedup_preserving_order(tags.into_iter().map(Into::into));
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.custom_tags.iter().any(|t| t == tag)
    }

    /// Substitute `{0}`, `{1}`, ... placeholders in the message format
    pub fn format_message(&self, args: &[&str]) -> String {
        let mut message = self.message_format.clone();
        for (index, arg) in args.iter().enumerate() {
            message = message.replace(&format!("{{{index}}}"), arg);
        }
        message
    }
}

/// One reported diagnostic instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub id: String,
    pub category: String,
    pub message: String,
    pub title: String,
    pub description: String,
    pub help_link: Option<String>,
    pub severity: DiagnosticSeverity,
    pub default_severity: DiagnosticSeverity,
    pub is_enabled_by_default: bool,
    pub warning_level: u8,
    pub is_suppressed: bool,
    pub custom_tags: Vec<String>,
    pub properties: BTreeMap<String, String>,
    pub location: DiagnosticLocation,
}

impl DiagnosticRecord {
    /// Create a diagnostic from its descriptor with the descriptor's default severity
    pub fn from_descriptor(
        descriptor: &DiagnosticDescriptor,
        location: DiagnosticLocation,
        message_args: &[&str],
    ) -> Self {
        Self {
            id: descriptor.id.clone(),
            category: descriptor.category.clone(),
            message: descriptor.format_message(message_args),
            title: descriptor.title.clone(),
            description: descriptor.description.clone(),
            help_link: descriptor.help_link.clone(),
            severity: descriptor.default_severity,
            default_severity: descriptor.default_severity,
            is_enabled_by_default: descriptor.is_enabled_by_default,
            warning_level: descriptor.default_severity.default_warning_level(),
            is_suppressed: false,
            custom_tags: descriptor.custom_tags.clone(),
            properties: BTreeMap::new(),
            location,
        }
    }

    pub fn with_severity(mut self, severity: DiagnosticSeverity) -> Self {
        self.severity = severity;
        self.warning_level = severity.default_warning_level();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_suppressed(mut self, suppressed: bool) -> Self {
        self.is_suppressed = suppressed;
        self
    }

    pub fn project_id(&self) -> Option<ProjectId> {
        self.location.project_id()
    }

    pub fn document_id(&self) -> Option<DocumentId> {
        self.location.document_id()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.custom_tags.iter().any(|t| t == tag)
    }

    /// Whether this is a synthetic analyzer-failure diagnostic
    pub fn is_analyzer_exception(&self) -> bool {
        (self.id == well_known_ids::ANALYZER_EXCEPTION
            || self.id == well_known_ids::ANALYZER_DRIVER_EXCEPTION)
            && self.has_tag(tags::ANALYZER_EXCEPTION)
    }

    /// Exception diagnostics embed per-instance detail, so they are compared on
    /// id, severity and message only.
    pub fn is_equivalent_exception(&self, other: &DiagnosticRecord) -> bool {
        self.is_analyzer_exception()
            && other.is_analyzer_exception()
            && self.id == other.id
            && self.severity == other.severity
            && self.message == other.message
    }

    fn original_start(&self) -> Option<LinePosition> {
        self.location.original().map(|span| span.start)
    }
}

impl PartialEq for DiagnosticRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.category == other.category
            && self.message == other.message
            && self.severity == other.severity
            && self.warning_level == other.warning_level
            && self.location.project_id() == other.location.project_id()
            && self.location.document_id() == other.location.document_id()
            && self.original_start() == other.original_start()
    }
}

impl Eq for DiagnosticRecord {}

impl Hash for DiagnosticRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.category.hash(state);
        self.message.hash(state);
        self.severity.hash(state);
        self.warning_level.hash(state);
        self.location.project_id().hash(state);
        self.location.document_id().hash(state);
        self.original_start().hash(state);
    }
}

impl fmt::Display for DiagnosticRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location.original() {
            Some(span) => write!(
                f,
                "{}({},{}): {} {}: {}",
                span.path.as_deref().unwrap_or("<unknown>"),
                span.start.line + 1,
                span.start.column + 1,
                self.severity,
                self.id,
                self.message
            ),
            None => write!(f, "{} {}: {}", self.severity, self.id, self.message),
        }
    }
}

/// Set-wise comparison under the coarse equality, ignoring order
pub fn same_diagnostics(left: &[DiagnosticRecord], right: &[DiagnosticRecord]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut remaining: Vec<&DiagnosticRecord> = right.iter().collect();
    for diagnostic in left {
        match remaining.iter().position(|candidate| *candidate == diagnostic) {
            Some(index) => {
                remaining.swap_remove(index);
            }
            None => return false,
        }
    }
    true
}

fn dedup_preserving_order(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.filter(|item| seen.insert(item.clone())).collect()
}
