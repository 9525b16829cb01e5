//! Seam to the external analyzer execution driver
//!
//! Compilation analyzers are not invoked by the engine directly. A driver
//! (typically the host compiler's analyzer runtime) receives a batch of
//! analyzers and one compilation, runs them, and reports results per analyzer.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::analyzer::{AnalyzerDescriptor, AnalyzerId};
use crate::cancellation::CancellationToken;
use crate::diagnostic::{DiagnosticRecord, TextSpan};
use crate::error::AnalyzerError;
use crate::ids::DocumentId;
use crate::telemetry::AnalyzerTelemetry;
use crate::workspace::{Compilation, Project};

/// Portion of the compilation a driver call covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverScope {
    /// Syntax diagnostics of one document
    Syntax { document: DocumentId },
    /// Semantic diagnostics of one document, optionally within a span
    Semantic {
        document: DocumentId,
        span: Option<TextSpan>,
    },
    /// Everything the analyzers report over the whole compilation
    All,
    /// Only syntax diagnostics, for every document
    AllSyntax,
}

/// Options passed through to the driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverOptions {
    pub report_suppressed: bool,
    pub log_telemetry: bool,
}

/// One driver invocation
#[derive(Debug, Clone)]
pub struct DriverRequest {
    pub project: Arc<Project>,
    pub compilation: Arc<dyn Compilation>,
    pub analyzers: Vec<AnalyzerDescriptor>,
    pub scope: DriverScope,
    pub options: DriverOptions,
}

/// Diagnostics one analyzer produced within a driver call
#[derive(Debug, Clone, Default)]
pub struct DriverAnalyzerResult {
    pub syntax: Vec<DiagnosticRecord>,
    pub semantic: Vec<DiagnosticRecord>,
    pub non_local: Vec<DiagnosticRecord>,
}

impl DriverAnalyzerResult {
    pub fn len(&self) -> usize {
        self.syntax.len() + self.semantic.len() + self.non_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a driver call that completed
#[derive(Debug, Clone, Default)]
pub struct DriverOutput {
    pub results: HashMap<AnalyzerId, DriverAnalyzerResult>,
    /// Analyzers that failed individually while the batch completed
    pub failures: HashMap<AnalyzerId, AnalyzerError>,
    pub telemetry: HashMap<AnalyzerId, AnalyzerTelemetry>,
}

/// Executes compilation analyzers over a compilation
#[async_trait]
pub trait AnalyzerDriver: Send + Sync {
    /// Run every analyzer in the request.
    ///
    /// An `Err` fails the whole batch. Per-analyzer failures belong in
    /// [`DriverOutput::failures`].
    async fn run_analyzers(
        &self,
        request: DriverRequest,
        cancel: &CancellationToken,
    ) -> Result<DriverOutput, AnalyzerError>;
}
