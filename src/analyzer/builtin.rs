//! Analyzers shipped with the engine

use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::sync::Arc;

use super::{
    AnalyzerCapabilities, AnalyzerDescriptor, AnalyzerHandle, AnalyzerOrigin, AnalyzerReference,
    DiagnosticAnalyzer, DocumentDiagnosticAnalyzer,
};
use crate::cancellation::CancellationToken;
use crate::diagnostic::{
    well_known_ids, DiagnosticDescriptor, DiagnosticLocation, DiagnosticRecord, DiagnosticSeverity,
    TextSpan,
};
use crate::error::AnalyzerError;
use crate::workspace::{Document, Project};

const BUILTIN_REFERENCE_ID: &str = "builtin:diagnostic-engine";

static LOAD_FAILURE_DESCRIPTOR: Lazy<DiagnosticDescriptor> = Lazy::new(|| {
    DiagnosticDescriptor::new(
        well_known_ids::DOCUMENT_LOAD_FAILURE,
        "Error reading content of source file",
        "Error reading content of source file '{0}' -- '{1}'",
        "Workspace",
        DiagnosticSeverity::Error,
        true,
    )
});

/// Reports a single error on documents whose content could not be loaded
#[derive(Debug, Default)]
pub struct FileContentLoadAnalyzer;

impl FileContentLoadAnalyzer {
    /// Registered descriptor shared by every language
    pub fn descriptor() -> AnalyzerDescriptor {
        static DESCRIPTOR: Lazy<AnalyzerDescriptor> = Lazy::new(|| {
            let reference = AnalyzerReference::new(
                BUILTIN_REFERENCE_ID,
                "Built-in analyzers",
                env!("CARGO_PKG_VERSION"),
            );
            AnalyzerDescriptor::register(
                AnalyzerHandle::Document(Arc::new(FileContentLoadAnalyzer)),
                &reference,
                AnalyzerOrigin::Host,
                0,
            )
        });
        DESCRIPTOR.clone()
    }

    /// The load failure diagnostic for a document, if its content failed to load
    pub fn load_failure_diagnostic(document: &Document) -> Option<DiagnosticRecord> {
        let failure = document.load_failure()?;
        let span = TextSpan::new(0, 0);
        let location = DiagnosticLocation::document(
            None,
            document.project_id(),
            document.id(),
            Some(span),
            document.line_span(span),
        );
        Some(DiagnosticRecord::from_descriptor(
            &LOAD_FAILURE_DESCRIPTOR,
            location,
            &[document.display_path(), failure],
        ))
    }
}

impl DiagnosticAnalyzer for FileContentLoadAnalyzer {
    fn type_name(&self) -> &str {
        "FileContentLoadAnalyzer"
    }

    fn supported_diagnostics(&self) -> Result<Vec<DiagnosticDescriptor>, AnalyzerError> {
        Ok(vec![LOAD_FAILURE_DESCRIPTOR.clone()])
    }

    fn capabilities(&self) -> AnalyzerCapabilities {
        AnalyzerCapabilities::syntax_only().builtin()
    }
}

#[async_trait]
impl DocumentDiagnosticAnalyzer for FileContentLoadAnalyzer {
    async fn analyze_syntax(
        &self,
        document: &Document,
        _project: &Project,
        _cancel: &CancellationToken,
    ) -> Result<Vec<DiagnosticRecord>, AnalyzerError> {
        Ok(Self::load_failure_diagnostic(document).into_iter().collect())
    }
}
