//! Incremental diagnostic analysis engine.
//!
//! Runs pluggable analyzers over a changing solution, caches per-document and
//! per-project results keyed by analyzer and analysis kind, serves possibly
//! stale results instantly, and publishes ordered update events to push or
//! pull consumers. Build-only diagnostics from explicit builds are merged with
//! live results.

// Core model
pub mod diagnostic;
pub mod ids;
pub mod result;
pub mod workspace;

// Analyzers and their execution
pub mod analyzer;
pub mod catalog;
pub mod executor;
pub mod isolation;
pub mod remap;
pub mod skipped;

// Caching and delivery
pub mod build_sync;
pub mod cache;
pub mod events;
pub mod mode;

// Service layer
pub mod host;
pub mod service;

// Ambient
pub mod cancellation;
pub mod config;
pub mod error;
pub mod logging;
pub mod telemetry;

// Re-export commonly used types
pub use analyzer::{
    AnalyzerCapabilities, AnalyzerDescriptor, AnalyzerHandle, AnalyzerId, AnalyzerReference,
    AnalyzerReferenceId, DiagnosticAnalyzer, DocumentDiagnosticAnalyzer, FileContentLoadAnalyzer,
    ProjectDiagnosticAnalyzer,
};
pub use build_sync::{BuildDataState, BuildSyncMerger};
pub use cache::{CacheKey, CacheStats, ResultCache, StoreOutcome};
pub use cancellation::CancellationToken;
pub use catalog::{AnalyzerCatalog, HostAnalyzers};
pub use config::{EngineConfig, StoreOrdering};
pub use diagnostic::{
    DiagnosticDescriptor, DiagnosticLocation, DiagnosticRecord, DiagnosticSeverity,
    FileLinePositionSpan, LinePosition, TextSpan,
};
pub use error::{AnalyzerError, EngineError, EngineResult};
pub use events::{
    BucketId, DiagnosticEventBus, DiagnosticsUpdatedHandler, SubscriptionId, UpdateEvent, UpdateKind,
};
pub use executor::{AnalysisExecutor, AnalyzerDriver, DriverOutput, DriverRequest, DriverScope};
pub use host::{EngineHost, WorkspaceHandle};
pub use ids::{DocumentId, Language, ProjectId, VersionStamp, WorkspaceId};
pub use mode::{DiagnosticChannel, DiagnosticMode, ModeSelector};
pub use result::{AnalysisKind, AnalysisResult, AnalysisResultBuilder};
pub use service::{DiagnosticService, DiagnosticsScope, ServiceStats};
pub use skipped::SkippedAnalyzersInfo;
pub use workspace::change::{WorkspaceChange, WorkspaceChangeKind};
pub use workspace::{Compilation, Document, Project, Solution};
