//! Fake collaborators shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use diagnostic_engine::analyzer::AnalyzerCapabilities;
use diagnostic_engine::executor::DriverAnalyzerResult;
use diagnostic_engine::telemetry::AnalyzerTelemetry;
use diagnostic_engine::{
    AnalyzerDriver, AnalyzerError, AnalyzerHandle, AnalyzerReference, CancellationToken, Compilation,
    DiagnosticAnalyzer, DiagnosticDescriptor, DiagnosticLocation, DiagnosticRecord, DiagnosticService,
    DiagnosticSeverity, DiagnosticsUpdatedHandler, Document, DocumentDiagnosticAnalyzer, DocumentId,
    DriverOutput, DriverRequest, DriverScope, EngineConfig, Language, Project, ProjectDiagnosticAnalyzer,
    Solution, TextSpan, UpdateEvent, WorkspaceChange, WorkspaceChangeKind, WorkspaceId,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

pub const LANGUAGE: &str = "csharp";

pub fn descriptor(id: &str) -> DiagnosticDescriptor {
    DiagnosticDescriptor::new(
        id,
        format!("{id} title"),
        format!("{id} reported"),
        "Style",
        DiagnosticSeverity::Warning,
        true,
    )
}

/// A diagnostic at `span` of `document`
pub fn report(document: &Document, descriptor: &DiagnosticDescriptor, span: TextSpan) -> DiagnosticRecord {
    let location = DiagnosticLocation::document(
        None,
        document.project_id(),
        document.id(),
        Some(span),
        document.line_span(span),
    );
    DiagnosticRecord::from_descriptor(descriptor, location, &[])
}

/// Compilation whose members are fixed spans, shared by every document
#[derive(Debug, Default)]
pub struct FakeCompilation {
    pub members: Vec<TextSpan>,
}

impl Compilation for FakeCompilation {
    fn enclosing_member_span(&self, _document: DocumentId, position: usize) -> Option<TextSpan> {
        self.members.iter().copied().find(|member| member.contains(position))
    }
}

/// Compilation analyzer reporting each of its ids once per analyzed document.
///
/// A type name starting with `Throwing` makes the fake driver fail it.
pub struct StaticAnalyzer {
    type_name: String,
    ids: Vec<String>,
    capabilities: AnalyzerCapabilities,
}

impl StaticAnalyzer {
    pub fn new(type_name: &str, ids: &[&str]) -> Self {
        Self {
            type_name: type_name.to_string(),
            ids: ids.iter().map(|id| id.to_string()).collect(),
            capabilities: AnalyzerCapabilities::default(),
        }
    }

    pub fn compiler(type_name: &str, ids: &[&str]) -> Self {
        Self {
            capabilities: AnalyzerCapabilities::compiler(),
            ..Self::new(type_name, ids)
        }
    }

    pub fn handle(self) -> AnalyzerHandle {
        AnalyzerHandle::Compilation(Arc::new(self))
    }
}

impl DiagnosticAnalyzer for StaticAnalyzer {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn supported_diagnostics(&self) -> Result<Vec<DiagnosticDescriptor>, AnalyzerError> {
        Ok(self.ids.iter().map(|id| descriptor(id)).collect())
    }

    fn capabilities(&self) -> AnalyzerCapabilities {
        self.capabilities
    }
}

/// Document analyzer reporting every `TODO` in the text
pub struct TodoAnalyzer;

impl TodoAnalyzer {
    pub fn handle() -> AnalyzerHandle {
        AnalyzerHandle::Document(Arc::new(TodoAnalyzer))
    }
}

impl DiagnosticAnalyzer for TodoAnalyzer {
    fn type_name(&self) -> &str {
        "TodoAnalyzer"
    }

    fn supported_diagnostics(&self) -> Result<Vec<DiagnosticDescriptor>, AnalyzerError> {
        Ok(vec![descriptor("TODO001")])
    }

    fn capabilities(&self) -> AnalyzerCapabilities {
        AnalyzerCapabilities::syntax_only()
    }
}

#[async_trait]
impl DocumentDiagnosticAnalyzer for TodoAnalyzer {
    async fn analyze_syntax(
        &self,
        document: &Document,
        _project: &Project,
        _cancel: &CancellationToken,
    ) -> Result<Vec<DiagnosticRecord>, AnalyzerError> {
        let descriptor = descriptor("TODO001");
        Ok(document
            .text()
            .match_indices("TODO")
            .map(|(start, found)| report(document, &descriptor, TextSpan::new(start, start + found.len())))
            .collect())
    }
}

/// Document analyzer whose syntax pass always fails
pub struct ThrowingDocumentAnalyzer;

impl DiagnosticAnalyzer for ThrowingDocumentAnalyzer {
    fn type_name(&self) -> &str {
        "ThrowingDocumentAnalyzer"
    }

    fn supported_diagnostics(&self) -> Result<Vec<DiagnosticDescriptor>, AnalyzerError> {
        Ok(vec![descriptor("THROW001")])
    }

    fn capabilities(&self) -> AnalyzerCapabilities {
        AnalyzerCapabilities::syntax_only()
    }
}

#[async_trait]
impl DocumentDiagnosticAnalyzer for ThrowingDocumentAnalyzer {
    async fn analyze_syntax(
        &self,
        _document: &Document,
        _project: &Project,
        _cancel: &CancellationToken,
    ) -> Result<Vec<DiagnosticRecord>, AnalyzerError> {
        Err(AnalyzerError::failed("InvalidOperationException: operation is not valid"))
    }
}

/// Project analyzer reporting one location-less diagnostic
pub struct ProjectWideAnalyzer;

impl DiagnosticAnalyzer for ProjectWideAnalyzer {
    fn type_name(&self) -> &str {
        "ProjectWideAnalyzer"
    }

    fn supported_diagnostics(&self) -> Result<Vec<DiagnosticDescriptor>, AnalyzerError> {
        Ok(vec![descriptor("PRJ001")])
    }
}

#[async_trait]
impl ProjectDiagnosticAnalyzer for ProjectWideAnalyzer {
    async fn analyze_project(
        &self,
        project: &Project,
        _cancel: &CancellationToken,
    ) -> Result<Vec<DiagnosticRecord>, AnalyzerError> {
        Ok(vec![DiagnosticRecord::from_descriptor(
            &descriptor("PRJ001"),
            DiagnosticLocation::project(None, project.id()),
            &[],
        )])
    }
}

/// One recorded driver invocation
#[derive(Debug, Clone)]
pub struct DriverCall {
    pub analyzers: Vec<String>,
    pub scope: DriverScope,
}

/// Analyzer driver reporting every supported id of every requested analyzer
#[derive(Default)]
pub struct FakeDriver {
    calls: Mutex<Vec<DriverCall>>,
    fail_batches: AtomicBool,
    delay_ms: AtomicU64,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// Counts one running driver call
struct ActiveCall<'a>(&'a AtomicUsize);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeDriver {
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Fail every call that includes a non-compiler analyzer
    pub fn fail_batches(&self, fail: bool) {
        self.fail_batches.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Highest number of driver calls that were running at the same time
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalyzerDriver for FakeDriver {
    async fn run_analyzers(
        &self,
        request: DriverRequest,
        cancel: &CancellationToken,
    ) -> Result<DriverOutput, AnalyzerError> {
        self.calls.lock().unwrap().push(DriverCall {
            analyzers: request
                .analyzers
                .iter()
                .map(|analyzer| analyzer.analyzer().type_name().to_string())
                .collect(),
            scope: request.scope,
        });

        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(running, Ordering::SeqCst);
        let _active = ActiveCall(&self.active);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                _ = cancel.cancelled() => return Err(AnalyzerError::Cancelled),
            }
        }

        let compiler_only = request.analyzers.iter().all(|analyzer| analyzer.is_compiler_analyzer());
        if self.fail_batches.load(Ordering::SeqCst) && !compiler_only {
            return Err(AnalyzerError::failed("NullReferenceException: driver state corrupted"));
        }

        let documents: Vec<&Arc<Document>> = match request.scope {
            DriverScope::Syntax { document } | DriverScope::Semantic { document, .. } => {
                request.project.document(document).into_iter().collect()
            }
            DriverScope::All | DriverScope::AllSyntax => request.project.documents().collect(),
        };

        let mut output = DriverOutput::default();
        for analyzer in &request.analyzers {
            let id = analyzer.id().clone();
            if analyzer.analyzer().type_name().starts_with("Throwing") {
                output
                    .failures
                    .insert(id, AnalyzerError::failed("InvalidOperationException: operation is not valid"));
                continue;
            }

            let descriptors = analyzer.analyzer().supported_diagnostics().unwrap_or_default();
            let mut result = DriverAnalyzerResult::default();
            for document in &documents {
                if document.text_len() == 0 {
                    continue;
                }
                for descriptor in &descriptors {
                    let diagnostic = report(document, descriptor, TextSpan::new(0, 1));
                    match request.scope {
                        DriverScope::Semantic { .. } => result.semantic.push(diagnostic),
                        _ => result.syntax.push(diagnostic),
                    }
                }
            }
            output.telemetry.insert(
                id.clone(),
                AnalyzerTelemetry {
                    executions: 1,
                    diagnostics_reported: result.len() as u64,
                    ..Default::default()
                },
            );
            output.results.insert(id, result);
        }
        Ok(output)
    }
}

/// Subscriber that records every event after an optional delay
#[derive(Default)]
pub struct RecordingHandler {
    pub events: AsyncMutex<Vec<Arc<UpdateEvent>>>,
    pub delay: Duration,
}

impl RecordingHandler {
    pub fn slow(delay: Duration) -> Self {
        Self {
            events: AsyncMutex::new(Vec::new()),
            delay,
        }
    }

    pub async fn events(&self) -> Vec<Arc<UpdateEvent>> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl DiagnosticsUpdatedHandler for RecordingHandler {
    async fn on_diagnostics_updated(&self, event: Arc<UpdateEvent>) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.events.lock().await.push(event);
    }
}

pub fn host_reference(id: &str, handles: Vec<AnalyzerHandle>) -> Arc<AnalyzerReference> {
    let reference = handles.into_iter().fold(
        AnalyzerReference::new(id, id, "1.0.0"),
        |reference, handle| reference.with_analyzer(LANGUAGE, handle),
    );
    Arc::new(reference)
}

/// Default host analyzers: the compiler plus one style analyzer
pub fn default_host() -> Vec<Arc<AnalyzerReference>> {
    vec![host_reference(
        "host:compiler",
        vec![
            StaticAnalyzer::compiler("CSharpCompilerAnalyzer", &["CS0168"]).handle(),
            StaticAnalyzer::new("NamingStyleAnalyzer", &["IDE1006"]).handle(),
        ],
    )]
}

pub fn service_with(host: Vec<Arc<AnalyzerReference>>, config: EngineConfig) -> (DiagnosticService, Arc<FakeDriver>) {
    let driver = Arc::new(FakeDriver::default());
    let service = DiagnosticService::new(
        WorkspaceId::new(),
        Arc::new(diagnostic_engine::HostAnalyzers::new(host)),
        driver.clone(),
        &config,
    );
    (service, driver)
}

pub fn service(host: Vec<Arc<AnalyzerReference>>) -> (DiagnosticService, Arc<FakeDriver>) {
    service_with(host, EngineConfig::default())
}

/// A project with one document and a compilation
pub fn sample_project(text: &str) -> (Project, DocumentId) {
    let project = Project::new("App", Language::new(LANGUAGE)).with_compilation(Arc::new(FakeCompilation::default()));
    let document = Document::new(project.id(), "Program.cs", text.to_string()).with_file_path("/src/App/Program.cs");
    let document_id = document.id();
    (project.with_document(document), document_id)
}

/// Add a project to the service's solution
pub async fn add_project(service: &DiagnosticService, project: Project) -> Arc<Solution> {
    let id = project.id();
    let solution = Arc::new(service.current_solution().with_project(project));
    service
        .on_workspace_changed(WorkspaceChange::project(WorkspaceChangeKind::ProjectAdded, solution.clone(), id))
        .await
        .unwrap();
    solution
}

/// Replace a document's text
pub async fn edit_document(service: &DiagnosticService, document: DocumentId, text: &str) -> Arc<Solution> {
    let current = service.current_solution();
    let project = current.project_of(document).unwrap().id();
    let solution = Arc::new(current.with_document_text(document, text.to_string()).unwrap());
    service
        .on_workspace_changed(WorkspaceChange::document(
            WorkspaceChangeKind::DocumentChanged,
            solution.clone(),
            project,
            document,
        ))
        .await
        .unwrap();
    solution
}

/// Remove a document from its project
pub async fn remove_document(service: &DiagnosticService, document: DocumentId) -> Arc<Solution> {
    let current = service.current_solution();
    let project = current.project_of(document).unwrap();
    let project_id = project.id();
    let solution = Arc::new(current.with_project((**project).clone().without_document(document)));
    service
        .on_workspace_changed(WorkspaceChange::document(
            WorkspaceChangeKind::DocumentRemoved,
            solution.clone(),
            project_id,
            document,
        ))
        .await
        .unwrap();
    solution
}

/// Id under which the catalog registered an analyzer type
pub fn analyzer_id(service: &DiagnosticService, project: &Project, type_name: &str) -> diagnostic_engine::AnalyzerId {
    service
        .catalog()
        .get_analyzers_for_project(project)
        .iter()
        .find(|analyzer| analyzer.analyzer().type_name() == type_name)
        .map(|analyzer| analyzer.id().clone())
        .unwrap()
}
