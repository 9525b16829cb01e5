//! Analysis execution
//!
//! [`AnalysisExecutor`] computes diagnostics for a document or a project:
//!
//! * document and project analyzers are invoked directly
//! * compilation analyzers share one driver invocation per request
//! * the compiler analyzer gets a driver invocation of its own so a slow
//!   third-party analyzer never holds back compiler diagnostics
//!
//! Every analyzer output is validated, filtered for skipped ids, optionally
//! remapped, and failures are isolated into exception diagnostics.

use futures::future::join_all;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::analyzer::{
    AnalyzerDescriptor, AnalyzerHandle, AnalyzerId, DocumentDiagnosticAnalyzer, FileContentLoadAnalyzer,
};
use crate::cancellation::CancellationToken;
use crate::catalog::AnalyzerCatalog;
use crate::config::ExecutorConfig;
use crate::diagnostic::{DiagnosticRecord, TextSpan};
use crate::error::{AnalyzerError, EngineError, EngineResult};
use crate::ids::{DocumentId, VersionStamp, WorkspaceId};
use crate::isolation::{dedupe_exceptions, ExceptionIsolation, ExceptionTarget};
use crate::remap::{remap_diagnostics, SpanMapper};
use crate::result::{AnalysisKind, AnalysisResult, AnalysisResultBuilder};
use crate::skipped::SkippedAnalyzersInfo;
use crate::telemetry::{AnalyzerTelemetry, TelemetryCollector};
use crate::workspace::{Compilation, Document, Project};

pub mod driver;
pub mod span;

pub use driver::{
    AnalyzerDriver, DriverAnalyzerResult, DriverOptions, DriverOutput, DriverRequest, DriverScope,
};

/// A syntax or semantic pass over one document
#[derive(Debug, Clone)]
pub struct DocumentAnalysisScope {
    pub project: Arc<Project>,
    pub document: Arc<Document>,
    /// Restrict semantic analysis to a span
    pub span: Option<TextSpan>,
    pub kind: AnalysisKind,
    pub analyzers: Vec<AnalyzerDescriptor>,
    pub skipped: Arc<SkippedAnalyzersInfo>,
}

/// A full pass over one project
#[derive(Debug, Clone)]
pub struct ProjectAnalysisScope {
    pub project: Arc<Project>,
    pub analyzers: Vec<AnalyzerDescriptor>,
    pub skipped: Arc<SkippedAnalyzersInfo>,
    pub version: VersionStamp,
}

/// Diagnostics one analyzer produced for a document pass
#[derive(Debug, Clone)]
pub struct AnalyzerDiagnostics {
    pub analyzer: AnalyzerDescriptor,
    pub diagnostics: Vec<DiagnosticRecord>,
}

/// Runs analyzers and shapes their output
pub struct AnalysisExecutor {
    driver: Arc<dyn AnalyzerDriver>,
    catalog: Arc<AnalyzerCatalog>,
    span_mapper: Option<Arc<dyn SpanMapper>>,
    telemetry: Arc<TelemetryCollector>,
    isolation: ExceptionIsolation,
    config: ExecutorConfig,
}

impl AnalysisExecutor {
    pub fn new(
        workspace: WorkspaceId,
        driver: Arc<dyn AnalyzerDriver>,
        catalog: Arc<AnalyzerCatalog>,
        telemetry: Arc<TelemetryCollector>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            driver,
            catalog,
            span_mapper: None,
            telemetry,
            isolation: ExceptionIsolation::new(Some(workspace), config.report_analyzer_exceptions),
            config,
        }
    }

    pub fn with_span_mapper(mut self, mapper: Arc<dyn SpanMapper>) -> Self {
        self.span_mapper = Some(mapper);
        self
    }

    /// Diagnostics of a single analyzer for a document pass
    pub async fn compute_diagnostics(
        &self,
        analyzer: &AnalyzerDescriptor,
        scope: &DocumentAnalysisScope,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<DiagnosticRecord>> {
        let single = DocumentAnalysisScope {
            analyzers: vec![analyzer.clone()],
            ..scope.clone()
        };
        let mut results = self.compute_document_diagnostics(&single, cancel).await?;
        Ok(results
            .pop()
            .map(|result| result.diagnostics)
            .unwrap_or_default())
    }

    /// Diagnostics of every analyzer in the scope for one document pass.
    ///
    /// Returns one entry per participating analyzer, in scope order, including
    /// analyzers that reported nothing.
    pub async fn compute_document_diagnostics(
        &self,
        scope: &DocumentAnalysisScope,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<AnalyzerDiagnostics>> {
        cancel.check()?;
        if scope.kind == AnalysisKind::NonLocal {
            debug!("Non-local diagnostics are only produced by project analysis");
            return Ok(Vec::new());
        }

        let project = &scope.project;
        let document = &scope.document;
        let active: Vec<AnalyzerDescriptor> = scope
            .analyzers
            .iter()
            .filter(|analyzer| !scope.skipped.is_fully_skipped(analyzer.id()))
            .filter(|analyzer| !matches!(analyzer.handle(), AnalyzerHandle::Project(_)))
            .filter(|analyzer| self.catalog.supports_kind(analyzer, scope.kind))
            .cloned()
            .collect();

        if let Some(failure) = document.load_failure() {
            debug!(
                "Document {} failed to load ({}), reporting load failure only",
                document.display_path(),
                failure
            );
            return Ok(load_failure_results(active, document, scope.kind));
        }

        let target = ExceptionTarget::Document {
            project: project.id(),
            document: document.id(),
            path: document.display_path().to_string(),
        };

        let mut compiler = None;
        let mut batch = Vec::new();
        let mut direct = Vec::new();
        for analyzer in &active {
            match analyzer.handle() {
                AnalyzerHandle::Compilation(_)
                    if self.config.isolate_compiler_analyzer
                        && self.catalog.is_compiler_analyzer(project.language(), analyzer) =>
                {
                    compiler = Some(analyzer.clone())
                }
                AnalyzerHandle::Compilation(_) => batch.push(analyzer.clone()),
                AnalyzerHandle::Document(handle) => direct.push((analyzer.clone(), handle.clone())),
                AnalyzerHandle::Project(_) => {}
            }
        }

        let compilation = project.compilation().cloned();
        let run_compilation_analyzers = match (&compilation, scope.kind) {
            (None, _) => false,
            (Some(_), AnalysisKind::Semantic) => project.has_successfully_loaded(),
            (Some(_), _) => true,
        };

        let compiler_run = async {
            match (&compiler, &compilation) {
                (Some(analyzer), Some(compilation)) if run_compilation_analyzers => {
                    let driver_scope = self.document_driver_scope(compilation.as_ref(), document.id(), scope, true);
                    self.run_driver(project, compilation, vec![analyzer.clone()], driver_scope, &target, cancel)
                        .await
                }
                _ => Ok(HashMap::new()),
            }
        };
        let batch_run = async {
            match &compilation {
                Some(compilation) if run_compilation_analyzers && !batch.is_empty() => {
                    let driver_scope = self.document_driver_scope(compilation.as_ref(), document.id(), scope, false);
                    self.run_driver(project, compilation, batch.clone(), driver_scope, &target, cancel)
                        .await
                }
                _ => Ok(HashMap::new()),
            }
        };
        let direct_run = join_all(direct.iter().map(|(analyzer, handle)| {
            self.run_document_analyzer(analyzer, handle, project, document, scope.kind, scope.span, &target, cancel)
        }));

        let (compiler_output, batch_output, direct_output) = tokio::join!(compiler_run, batch_run, direct_run);
        let mut driver_output = compiler_output?;
        driver_output.extend(batch_output?);

        let mut direct_results: HashMap<AnalyzerId, Vec<DiagnosticRecord>> = HashMap::new();
        for ((analyzer, _), output) in direct.iter().zip(direct_output) {
            direct_results.insert(analyzer.id().clone(), output?);
        }
        cancel.check()?;

        let mut results = Vec::with_capacity(active.len());
        for analyzer in active {
            let raw = match analyzer.handle() {
                AnalyzerHandle::Compilation(_) => driver_output
                    .remove(analyzer.id())
                    .map(|output| match scope.kind {
                        AnalysisKind::Syntax => output.syntax,
                        _ => output.semantic,
                    })
                    .unwrap_or_default(),
                _ => direct_results.remove(analyzer.id()).unwrap_or_default(),
            };

            let diagnostics = self.finalize(&analyzer, project, &scope.skipped, raw)?;
            let diagnostics = diagnostics
                .into_iter()
                .filter(|diagnostic| diagnostic.document_id() == Some(document.id()))
                .filter(|diagnostic| within_span(diagnostic, scope.span))
                .collect();
            results.push(AnalyzerDiagnostics {
                analyzer,
                diagnostics,
            });
        }
        Ok(results)
    }

    /// Full analysis of a project: every analyzer, every document, every kind
    pub async fn compute_project_diagnostics(
        &self,
        scope: &ProjectAnalysisScope,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<(AnalyzerDescriptor, AnalysisResult)>> {
        cancel.check()?;
        let project = &scope.project;
        let active: Vec<AnalyzerDescriptor> = scope
            .analyzers
            .iter()
            .filter(|analyzer| !scope.skipped.is_fully_skipped(analyzer.id()))
            .cloned()
            .collect();

        let failed_documents: HashSet<DocumentId> = project
            .documents()
            .filter(|document| document.load_failure().is_some())
            .map(|document| document.id())
            .collect();
        let project_target = ExceptionTarget::Project {
            project: project.id(),
        };

        let mut compiler = None;
        let mut batch = Vec::new();
        let mut document_analyzers = Vec::new();
        let mut project_analyzers = Vec::new();
        for analyzer in &active {
            match analyzer.handle() {
                AnalyzerHandle::Compilation(_)
                    if self.config.isolate_compiler_analyzer
                        && self.catalog.is_compiler_analyzer(project.language(), analyzer) =>
                {
                    compiler = Some(analyzer.clone())
                }
                AnalyzerHandle::Compilation(_) => batch.push(analyzer.clone()),
                AnalyzerHandle::Document(handle) => document_analyzers.push((analyzer.clone(), handle.clone())),
                AnalyzerHandle::Project(handle) => project_analyzers.push((analyzer.clone(), handle.clone())),
            }
        }

        // A project that failed to load only gets syntax analysis
        let driver_scope = if project.has_successfully_loaded() {
            DriverScope::All
        } else {
            DriverScope::AllSyntax
        };
        let compilation = project.compilation().cloned();

        let compiler_run = async {
            match (&compiler, &compilation) {
                (Some(analyzer), Some(compilation)) => {
                    self.run_driver(project, compilation, vec![analyzer.clone()], driver_scope, &project_target, cancel)
                        .await
                }
                _ => Ok(HashMap::new()),
            }
        };
        let batch_run = async {
            match &compilation {
                Some(compilation) if !batch.is_empty() => {
                    self.run_driver(project, compilation, batch.clone(), driver_scope, &project_target, cancel)
                        .await
                }
                _ => Ok(HashMap::new()),
            }
        };
        let documents_run = join_all(document_analyzers.iter().map(|(analyzer, handle)| {
            self.run_document_analyzer_over_project(analyzer, handle, project, cancel)
        }));
        let target = &project_target;
        let project_run = join_all(project_analyzers.iter().map(|(analyzer, handle)| async move {
            let started = Instant::now();
            let diagnostics = self
                .isolation
                .run(analyzer, target, cancel, handle.analyze_project(project, cancel))
                .await?;
            self.record_direct_telemetry(analyzer, started.elapsed(), &diagnostics);
            Ok::<_, EngineError>(diagnostics)
        }));

        let (compiler_output, batch_output, documents_output, project_output) =
            tokio::join!(compiler_run, batch_run, documents_run, project_run);

        let mut driver_output = compiler_output?;
        driver_output.extend(batch_output?);
        let mut per_analyzer: HashMap<AnalyzerId, Vec<(AnalysisKind, Vec<DiagnosticRecord>)>> = HashMap::new();
        for ((analyzer, _), output) in document_analyzers.iter().zip(documents_output) {
            per_analyzer.insert(analyzer.id().clone(), output?);
        }
        for ((analyzer, _), output) in project_analyzers.iter().zip(project_output) {
            per_analyzer.insert(analyzer.id().clone(), vec![(AnalysisKind::NonLocal, output?)]);
        }
        for (id, output) in driver_output {
            per_analyzer.insert(
                id,
                vec![
                    (AnalysisKind::Syntax, output.syntax),
                    (AnalysisKind::Semantic, output.semantic),
                    (AnalysisKind::NonLocal, output.non_local),
                ],
            );
        }
        cancel.check()?;

        let load_analyzer = FileContentLoadAnalyzer::descriptor();
        let mut results = Vec::with_capacity(active.len());
        for analyzer in active {
            let mut builder = AnalysisResultBuilder::new(project.id(), analyzer.id().clone(), scope.version);
            for document in project.document_ids() {
                builder.add_document(document);
            }

            for (kind, raw) in per_analyzer.remove(analyzer.id()).unwrap_or_default() {
                let diagnostics = self.finalize(&analyzer, project, &scope.skipped, raw)?;
                builder.add(
                    kind,
                    diagnostics.into_iter().filter(|diagnostic| {
                        diagnostic
                            .document_id()
                            .is_none_or(|document| !failed_documents.contains(&document))
                    }),
                );
            }

            if analyzer.id() == load_analyzer.id() {
                builder.add(
                    AnalysisKind::Syntax,
                    project
                        .documents()
                        .filter_map(|document| FileContentLoadAnalyzer::load_failure_diagnostic(document)),
                );
            }
            results.push((analyzer, builder.build()));
        }
        Ok(results)
    }

    fn document_driver_scope(
        &self,
        compilation: &dyn Compilation,
        document: DocumentId,
        scope: &DocumentAnalysisScope,
        is_compiler: bool,
    ) -> DriverScope {
        match scope.kind {
            AnalysisKind::Syntax => DriverScope::Syntax { document },
            _ => {
                let span = match scope.span {
                    Some(span) if is_compiler && self.config.widen_compiler_spans => {
                        Some(span::widen_to_members(compilation, document, span))
                    }
                    other => other,
                };
                DriverScope::Semantic { document, span }
            }
        }
    }

    /// One driver call for a batch of compilation analyzers
    async fn run_driver(
        &self,
        project: &Arc<Project>,
        compilation: &Arc<dyn Compilation>,
        analyzers: Vec<AnalyzerDescriptor>,
        scope: DriverScope,
        target: &ExceptionTarget,
        cancel: &CancellationToken,
    ) -> EngineResult<HashMap<AnalyzerId, DriverAnalyzerResult>> {
        let log_telemetry = analyzers
            .iter()
            .any(|analyzer| self.catalog.is_telemetry_eligible(analyzer));
        let request = DriverRequest {
            project: project.clone(),
            compilation: compilation.clone(),
            analyzers: analyzers.clone(),
            scope,
            options: DriverOptions {
                report_suppressed: true,
                log_telemetry,
            },
        };

        debug!(
            "Running {} compilation analyzers over {} ({:?})",
            analyzers.len(),
            project.name(),
            scope
        );
        let outcome = AssertUnwindSafe(self.driver.run_analyzers(request, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(AnalyzerError::Panicked {
                    message: "analyzer driver panicked".to_string(),
                })
            });

        let mut output = match outcome {
            Ok(output) => output,
            Err(_) if cancel.is_cancelled() => return Err(EngineError::Cancelled),
            Err(error) => {
                warn!(
                    "Analyzer driver failed for {} analyzers in {}: {}",
                    analyzers.len(),
                    project.name(),
                    error
                );
                let exception = self.isolation.driver_exception(&error, target);
                return Ok(analyzers
                    .iter()
                    .map(|analyzer| {
                        let mut result = DriverAnalyzerResult::default();
                        exception_bucket(&mut result, scope).extend(exception.clone());
                        (analyzer.id().clone(), result)
                    })
                    .collect());
            }
        };
        cancel.check()?;

        let mut results = HashMap::with_capacity(analyzers.len());
        for analyzer in &analyzers {
            let mut result = output.results.remove(analyzer.id()).unwrap_or_default();
            if let Some(error) = output.failures.remove(analyzer.id()) {
                warn!("Analyzer {} failed inside the driver: {}", analyzer.id(), error);
                exception_bucket(&mut result, scope)
                    .extend(self.isolation.analyzer_exception(analyzer, &error, target));
            }
            if let Some(telemetry) = output.telemetry.remove(analyzer.id()) {
                if self.catalog.is_telemetry_eligible(analyzer) {
                    self.telemetry.record(analyzer.id(), &telemetry);
                }
            }
            results.insert(analyzer.id().clone(), result);
        }
        Ok(results)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_document_analyzer(
        &self,
        analyzer: &AnalyzerDescriptor,
        handle: &Arc<dyn DocumentDiagnosticAnalyzer>,
        project: &Project,
        document: &Document,
        kind: AnalysisKind,
        span: Option<TextSpan>,
        target: &ExceptionTarget,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<DiagnosticRecord>> {
        let started = Instant::now();
        let diagnostics = match kind {
            AnalysisKind::Syntax => {
                self.isolation
                    .run(analyzer, target, cancel, handle.analyze_syntax(document, project, cancel))
                    .await?
            }
            _ => {
                self.isolation
                    .run(
                        analyzer,
                        target,
                        cancel,
                        handle.analyze_semantics(document, project, span, cancel),
                    )
                    .await?
            }
        };
        self.record_direct_telemetry(analyzer, started.elapsed(), &diagnostics);
        Ok(diagnostics)
    }

    /// Syntax and semantic passes of a document analyzer over every loadable document
    async fn run_document_analyzer_over_project(
        &self,
        analyzer: &AnalyzerDescriptor,
        handle: &Arc<dyn DocumentDiagnosticAnalyzer>,
        project: &Project,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<(AnalysisKind, Vec<DiagnosticRecord>)>> {
        let mut output = Vec::new();
        for document in project.documents() {
            if document.load_failure().is_some() {
                continue;
            }
            let target = ExceptionTarget::Document {
                project: project.id(),
                document: document.id(),
                path: document.display_path().to_string(),
            };
            for kind in [AnalysisKind::Syntax, AnalysisKind::Semantic] {
                if !self.catalog.supports_kind(analyzer, kind) {
                    continue;
                }
                let diagnostics = self
                    .run_document_analyzer(analyzer, handle, project, document, kind, None, &target, cancel)
                    .await?;
                output.push((kind, diagnostics));
            }
        }
        Ok(output)
    }

    /// Validate, filter skipped ids, remap and dedupe one analyzer's output
    fn finalize(
        &self,
        analyzer: &AnalyzerDescriptor,
        project: &Project,
        skipped: &SkippedAnalyzersInfo,
        diagnostics: Vec<DiagnosticRecord>,
    ) -> EngineResult<Vec<DiagnosticRecord>> {
        let diagnostics = self.validate(analyzer, project, diagnostics)?;
        let diagnostics = skipped.filter(analyzer.id(), diagnostics);
        let diagnostics = match &self.span_mapper {
            Some(mapper) => remap_diagnostics(mapper.as_ref(), project, diagnostics),
            None => diagnostics,
        };
        Ok(dedupe_exceptions(diagnostics))
    }

    /// Enforce that diagnostics stay inside the analyzed project and documents
    fn validate(
        &self,
        analyzer: &AnalyzerDescriptor,
        project: &Project,
        diagnostics: Vec<DiagnosticRecord>,
    ) -> EngineResult<Vec<DiagnosticRecord>> {
        let mut valid = Vec::with_capacity(diagnostics.len());
        for mut diagnostic in diagnostics {
            if let Some(owner) = diagnostic.project_id() {
                if owner != project.id() {
                    self.contract_violation(
                        analyzer,
                        format!(
                            "diagnostic {} belongs to project {} instead of {}",
                            diagnostic.id,
                            owner,
                            project.id()
                        ),
                    )?;
                    continue;
                }
            }

            if let Some(document_id) = diagnostic.document_id() {
                let Some(document) = project.document(document_id) else {
                    self.contract_violation(
                        analyzer,
                        format!(
                            "diagnostic {} is reported in document {} which is not part of project {}",
                            diagnostic.id,
                            document_id,
                            project.name()
                        ),
                    )?;
                    continue;
                };

                if let Some(span) = diagnostic.location.source_span() {
                    let len = document.text_len();
                    if span.start > span.end {
                        self.contract_violation(
                            analyzer,
                            format!(
                                "diagnostic {} has a reversed span {}..{} in {}",
                                diagnostic.id,
                                span.start,
                                span.end,
                                document.display_path()
                            ),
                        )?;
                        continue;
                    }
                    if span.end > len {
                        self.contract_violation(
                            analyzer,
                            format!(
                                "diagnostic {} span {}..{} exceeds the length of {} ({})",
                                diagnostic.id,
                                span.start,
                                span.end,
                                document.display_path(),
                                len
                            ),
                        )?;
                        diagnostic
                            .location
                            .set_source_span(Some(TextSpan::new(span.start.min(len), len)));
                    }
                }
            }
            valid.push(diagnostic);
        }
        Ok(valid)
    }

    fn contract_violation(&self, analyzer: &AnalyzerDescriptor, message: String) -> EngineResult<()> {
        if self.config.fail_fast_on_contract_violation {
            return Err(EngineError::ContractViolation {
                analyzer: analyzer.id().to_string(),
                message,
            });
        }
        warn!("Analyzer {} violated its contract: {}", analyzer.id(), message);
        Ok(())
    }

    fn record_direct_telemetry(
        &self,
        analyzer: &AnalyzerDescriptor,
        elapsed: Duration,
        diagnostics: &[DiagnosticRecord],
    ) {
        if !self.catalog.is_telemetry_eligible(analyzer) {
            return;
        }
        let failed = diagnostics.iter().any(DiagnosticRecord::is_analyzer_exception);
        self.telemetry.record(
            analyzer.id(),
            &AnalyzerTelemetry {
                executions: 1,
                elapsed,
                diagnostics_reported: diagnostics.len() as u64,
                failures: u64::from(failed),
            },
        );
    }
}

fn exception_bucket(result: &mut DriverAnalyzerResult, scope: DriverScope) -> &mut Vec<DiagnosticRecord> {
    match scope {
        DriverScope::Syntax { .. } | DriverScope::AllSyntax => &mut result.syntax,
        DriverScope::Semantic { .. } => &mut result.semantic,
        DriverScope::All => &mut result.non_local,
    }
}

fn within_span(diagnostic: &DiagnosticRecord, span: Option<TextSpan>) -> bool {
    match (span, diagnostic.location.source_span()) {
        (Some(requested), Some(reported)) => requested.intersects(&reported),
        _ => true,
    }
}

/// A document that failed to load only gets the load failure diagnostic
fn load_failure_results(
    active: Vec<AnalyzerDescriptor>,
    document: &Document,
    kind: AnalysisKind,
) -> Vec<AnalyzerDiagnostics> {
    let load_analyzer = FileContentLoadAnalyzer::descriptor();
    active
        .into_iter()
        .map(|analyzer| {
            let diagnostics = if analyzer.id() == load_analyzer.id() && kind == AnalysisKind::Syntax {
                FileContentLoadAnalyzer::load_failure_diagnostic(document)
                    .into_iter()
                    .collect()
            } else {
                Vec::new()
            };
            AnalyzerDiagnostics {
                analyzer,
                diagnostics,
            }
        })
        .collect()
}
