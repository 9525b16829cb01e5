//! Pluggable analyzer model
//!
//! Analyzers come in three shapes:
//!
//! * **Compilation analyzers** only describe themselves; they are executed by
//!   the external [`AnalyzerDriver`](crate::executor::AnalyzerDriver), many at a
//!   time over one shared compilation.
//! * **Document analyzers** ([`DocumentDiagnosticAnalyzer`]) look at one document
//!   at a time and are invoked directly by the engine.
//! * **Project analyzers** ([`ProjectDiagnosticAnalyzer`]) report project-wide
//!   diagnostics and are invoked directly by the engine.
//!
//! Analyzers are shipped in [`AnalyzerReference`]s (an assembly or package).
//! When an analyzer is registered its capabilities are queried once and frozen
//! into an [`AnalyzerDescriptor`], together with its stable [`AnalyzerId`] and
//! provenance.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::diagnostic::{DiagnosticDescriptor, DiagnosticRecord, TextSpan};
use crate::error::AnalyzerError;
use crate::ids::Language;
use crate::workspace::{Document, Project};

pub mod builtin;

pub use builtin::FileContentLoadAnalyzer;

/// Base trait implemented by every analyzer
pub trait DiagnosticAnalyzer: Send + Sync + 'static {
    /// Fully qualified type name, part of the analyzer identity
    fn type_name(&self) -> &str;

    /// Diagnostics this analyzer can produce. This is user code and may fail.
    fn supported_diagnostics(&self) -> Result<Vec<DiagnosticDescriptor>, AnalyzerError>;

    /// Capability flags; read exactly once at registration
    fn capabilities(&self) -> AnalyzerCapabilities {
        AnalyzerCapabilities::default()
    }
}

/// Analyzer that inspects one document at a time
#[async_trait]
pub trait DocumentDiagnosticAnalyzer: DiagnosticAnalyzer {
    async fn analyze_syntax(
        &self,
        _document: &Document,
        _project: &Project,
        _cancel: &CancellationToken,
    ) -> Result<Vec<DiagnosticRecord>, AnalyzerError> {
        Ok(Vec::new())
    }

    async fn analyze_semantics(
        &self,
        _document: &Document,
        _project: &Project,
        _span: Option<TextSpan>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<DiagnosticRecord>, AnalyzerError> {
        Ok(Vec::new())
    }
}

/// Analyzer that reports project-wide diagnostics
#[async_trait]
pub trait ProjectDiagnosticAnalyzer: DiagnosticAnalyzer {
    async fn analyze_project(
        &self,
        project: &Project,
        cancel: &CancellationToken,
    ) -> Result<Vec<DiagnosticRecord>, AnalyzerError>;
}

/// Capability flags attached to an analyzer at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerCapabilities {
    /// Produces syntax (parse-only) diagnostics
    pub supports_syntax: bool,
    /// Produces semantic diagnostics
    pub supports_semantic: bool,
    /// Produces project-wide / non-local diagnostics
    pub supports_project: bool,
    /// The language's compiler analyzer
    pub is_compiler_analyzer: bool,
    /// Shipped with the tooling itself
    pub is_builtin: bool,
}

impl Default for AnalyzerCapabilities {
    fn default() -> Self {
        Self {
            supports_syntax: true,
            supports_semantic: true,
            supports_project: true,
            is_compiler_analyzer: false,
            is_builtin: false,
        }
    }
}

impl AnalyzerCapabilities {
    /// Capabilities of a compiler analyzer
    pub fn compiler() -> Self {
        Self {
            is_compiler_analyzer: true,
            is_builtin: true,
            ..Default::default()
        }
    }

    pub fn syntax_only() -> Self {
        Self {
            supports_syntax: true,
            supports_semantic: false,
            supports_project: false,
            ..Default::default()
        }
    }

    pub fn semantic_only() -> Self {
        Self {
            supports_syntax: false,
            supports_semantic: true,
            supports_project: false,
            ..Default::default()
        }
    }

    pub fn builtin(mut self) -> Self {
        self.is_builtin = true;
        self
    }
}

/// How the engine invokes an analyzer
#[derive(Clone)]
pub enum AnalyzerHandle {
    Compilation(Arc<dyn DiagnosticAnalyzer>),
    Document(Arc<dyn DocumentDiagnosticAnalyzer>),
    Project(Arc<dyn ProjectDiagnosticAnalyzer>),
}

impl AnalyzerHandle {
    pub fn as_analyzer(&self) -> &dyn DiagnosticAnalyzer {
        match self {
            AnalyzerHandle::Compilation(analyzer) => analyzer.as_ref(),
            AnalyzerHandle::Document(analyzer) => analyzer.as_ref(),
            AnalyzerHandle::Project(analyzer) => analyzer.as_ref(),
        }
    }

    pub fn is_compilation_analyzer(&self) -> bool {
        matches!(self, AnalyzerHandle::Compilation(_))
    }
}

impl fmt::Debug for AnalyzerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            AnalyzerHandle::Compilation(_) => "Compilation",
            AnalyzerHandle::Document(_) => "Document",
            AnalyzerHandle::Project(_) => "Project",
        };
        write!(f, "{}({})", shape, self.as_analyzer().type_name())
    }
}

/// Identity of an analyzer reference (assembly path or package id)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalyzerReferenceId(String);

impl AnalyzerReferenceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnalyzerReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An assembly or package that ships analyzers
#[derive(Debug, Clone)]
pub struct AnalyzerReference {
    id: AnalyzerReferenceId,
    display: String,
    version: String,
    analyzers: HashMap<Language, Vec<AnalyzerHandle>>,
}

impl AnalyzerReference {
    pub fn new(
        id: impl Into<String>,
        display: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: AnalyzerReferenceId::new(id),
            display: display.into(),
            version: version.into(),
            analyzers: HashMap::new(),
        }
    }

    pub fn with_analyzer(mut self, language: impl Into<Language>, handle: AnalyzerHandle) -> Self {
        self.analyzers
            .entry(language.into())
            .or_default()
            .push(handle);
        self
    }

    pub fn id(&self) -> &AnalyzerReferenceId {
        &self.id
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn analyzers_for(&self, language: &Language) -> &[AnalyzerHandle] {
        self.analyzers
            .get(language)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Content hash identifying a set of analyzer references, independent of order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceSetKey([u8; 32]);

impl ReferenceSetKey {
    pub fn compute<'a>(references: impl IntoIterator<Item = &'a AnalyzerReference>) -> Self {
        let mut parts: Vec<(&str, &str)> = references
            .into_iter()
            .map(|reference| (reference.id.as_str(), reference.version.as_str()))
            .collect();
        parts.sort_unstable();
        parts.dedup();

        let mut hasher = blake3::Hasher::new();
        for (id, version) in parts {
            hasher.update(id.as_bytes());
            hasher.update(b"\0");
            hasher.update(version.as_bytes());
            hasher.update(b"\n");
        }
        Self(*hasher.finalize().as_bytes())
    }
}

/// Stable, deterministic identity of an analyzer instance.
///
/// Rendered as `TypeName#<16 hex chars>` so it stays readable in logs and
/// survives serialization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalyzerId(Arc<str>);

impl AnalyzerId {
    /// Derive the id from the analyzer type and the reference that defines it.
    /// `ordinal` separates repeated instances of one type in one reference.
    pub fn derive(
        type_name: &str,
        reference: &AnalyzerReferenceId,
        reference_version: &str,
        ordinal: usize,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(type_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(reference.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(reference_version.as_bytes());
        hasher.update(&(ordinal as u64).to_le_bytes());
        let hex = hasher.finalize().to_hex();
        Self(Arc::from(format!("{}#{}", type_name, &hex[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Type-name portion of the id
    pub fn type_name(&self) -> &str {
        self.0.split('#').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for AnalyzerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether an analyzer came with the tooling or with the project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalyzerOrigin {
    Host,
    Project,
}

/// Assembly / package provenance of a registered analyzer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerProvenance {
    pub reference_id: AnalyzerReferenceId,
    pub reference_display: String,
    pub version: String,
    pub origin: AnalyzerOrigin,
}

#[derive(Debug)]
struct AnalyzerDescriptorInner {
    id: AnalyzerId,
    handle: AnalyzerHandle,
    capabilities: AnalyzerCapabilities,
    provenance: AnalyzerProvenance,
}

/// A registered analyzer: identity, frozen capabilities and provenance.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct AnalyzerDescriptor {
    inner: Arc<AnalyzerDescriptorInner>,
}

impl AnalyzerDescriptor {
    pub fn register(
        handle: AnalyzerHandle,
        reference: &AnalyzerReference,
        origin: AnalyzerOrigin,
        ordinal: usize,
    ) -> Self {
        let analyzer = handle.as_analyzer();
        let id = AnalyzerId::derive(analyzer.type_name(), reference.id(), reference.version(), ordinal);
        let capabilities = analyzer.capabilities();

        Self {
            inner: Arc::new(AnalyzerDescriptorInner {
                id,
                handle,
                capabilities,
                provenance: AnalyzerProvenance {
                    reference_id: reference.id().clone(),
                    reference_display: reference.display().to_string(),
                    version: reference.version().to_string(),
                    origin,
                },
            }),
        }
    }

    pub fn id(&self) -> &AnalyzerId {
        &self.inner.id
    }

    pub fn handle(&self) -> &AnalyzerHandle {
        &self.inner.handle
    }

    pub fn analyzer(&self) -> &dyn DiagnosticAnalyzer {
        self.inner.handle.as_analyzer()
    }

    pub fn capabilities(&self) -> &AnalyzerCapabilities {
        &self.inner.capabilities
    }

    pub fn provenance(&self) -> &AnalyzerProvenance {
        &self.inner.provenance
    }

    pub fn is_compiler_analyzer(&self) -> bool {
        self.inner.capabilities.is_compiler_analyzer
    }

    /// The same registration with the compiler marker removed
    pub(crate) fn without_compiler_marker(&self) -> Self {
        let mut capabilities = self.inner.capabilities;
        capabilities.is_compiler_analyzer = false;
        Self {
            inner: Arc::new(AnalyzerDescriptorInner {
                id: self.inner.id.clone(),
                handle: self.inner.handle.clone(),
                capabilities,
                provenance: self.inner.provenance.clone(),
            }),
        }
    }

    pub fn is_host_analyzer(&self) -> bool {
        self.inner.provenance.origin == AnalyzerOrigin::Host
    }

    pub fn display_name(&self) -> &str {
        self.analyzer().type_name()
    }
}

impl PartialEq for AnalyzerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for AnalyzerDescriptor {}

impl std::hash::Hash for AnalyzerDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}
