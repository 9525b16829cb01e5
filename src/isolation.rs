//! Analyzer exception isolation
//!
//! Analyzers are third-party code. Any failure they raise, including a panic,
//! becomes a single exception diagnostic attributed to the analyzer instead of
//! failing the surrounding computation. Cancellation requested through the
//! caller's token is the one failure that propagates.

use futures::FutureExt;
use once_cell::sync::Lazy;
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

use crate::analyzer::AnalyzerDescriptor;
use crate::cancellation::CancellationToken;
use crate::diagnostic::{
    tags, well_known_ids, DiagnosticDescriptor, DiagnosticLocation, DiagnosticRecord,
    DiagnosticSeverity, LinePosition, FileLinePositionSpan, TextSpan,
};
use crate::error::{AnalyzerError, EngineError, EngineResult};
use crate::ids::{DocumentId, ProjectId, WorkspaceId};

static ANALYZER_EXCEPTION: Lazy<DiagnosticDescriptor> = Lazy::new(|| {
    DiagnosticDescriptor::new(
        well_known_ids::ANALYZER_EXCEPTION,
        "Analyzer Failure",
        "Analyzer '{0}' threw an exception of type '{1}' with message '{2}'.",
        "Intellisense",
        DiagnosticSeverity::Warning,
        true,
    )
    .with_custom_tags([tags::ANALYZER_EXCEPTION])
});

static DRIVER_EXCEPTION: Lazy<DiagnosticDescriptor> = Lazy::new(|| {
    DiagnosticDescriptor::new(
        well_known_ids::ANALYZER_DRIVER_EXCEPTION,
        "Analyzer Driver Failure",
        "Analyzer driver threw an exception of type '{0}' with message '{1}'.",
        "Intellisense",
        DiagnosticSeverity::Warning,
        true,
    )
    .with_custom_tags([tags::ANALYZER_EXCEPTION])
});

/// Where an exception diagnostic is reported
#[derive(Debug, Clone)]
pub enum ExceptionTarget {
    Document {
        project: ProjectId,
        document: DocumentId,
        path: String,
    },
    Project {
        project: ProjectId,
    },
}

impl ExceptionTarget {
    fn location(&self, workspace: Option<WorkspaceId>) -> DiagnosticLocation {
        match self {
            ExceptionTarget::Document {
                project,
                document,
                path,
            } => DiagnosticLocation::document(
                workspace,
                *project,
                *document,
                Some(TextSpan::new(0, 0)),
                FileLinePositionSpan::new(
                    Some(path.clone()),
                    LinePosition::default(),
                    LinePosition::default(),
                ),
            ),
            ExceptionTarget::Project { project } => DiagnosticLocation::project(workspace, *project),
        }
    }
}

/// Converts analyzer failures into exception diagnostics
#[derive(Debug, Clone)]
pub struct ExceptionIsolation {
    workspace: Option<WorkspaceId>,
    report_exceptions: bool,
}

impl ExceptionIsolation {
    pub fn new(workspace: Option<WorkspaceId>, report_exceptions: bool) -> Self {
        Self {
            workspace,
            report_exceptions,
        }
    }

    /// Run one analyzer invocation, catching errors and panics
    pub async fn run<F>(
        &self,
        analyzer: &AnalyzerDescriptor,
        target: &ExceptionTarget,
        cancel: &CancellationToken,
        invocation: F,
    ) -> EngineResult<Vec<DiagnosticRecord>>
    where
        F: Future<Output = Result<Vec<DiagnosticRecord>, AnalyzerError>>,
    {
        let outcome = AssertUnwindSafe(invocation)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(AnalyzerError::Panicked {
                    message: panic_message(payload.as_ref()),
                })
            });
        self.resolve(analyzer, target, cancel, outcome)
    }

    /// Map an invocation outcome to diagnostics or caller cancellation
    pub fn resolve(
        &self,
        analyzer: &AnalyzerDescriptor,
        target: &ExceptionTarget,
        cancel: &CancellationToken,
        outcome: Result<Vec<DiagnosticRecord>, AnalyzerError>,
    ) -> EngineResult<Vec<DiagnosticRecord>> {
        match outcome {
            Ok(diagnostics) => Ok(diagnostics),
            Err(_) if cancel.is_cancelled() => Err(EngineError::Cancelled),
            Err(error) => {
                warn!(
                    "Analyzer {} failed ({}): {}",
                    analyzer.id(),
                    error.kind_name(),
                    error.message()
                );
                Ok(self.analyzer_exception(analyzer, &error, target).into_iter().collect())
            }
        }
    }

    /// AD0001 for one failed analyzer, unless exception reporting is off
    pub fn analyzer_exception(
        &self,
        analyzer: &AnalyzerDescriptor,
        error: &AnalyzerError,
        target: &ExceptionTarget,
    ) -> Option<DiagnosticRecord> {
        if !self.report_exceptions {
            return None;
        }
        let message = error.message();
        let provenance = analyzer.provenance();
        let record = DiagnosticRecord::from_descriptor(
            &ANALYZER_EXCEPTION,
            target.location(self.workspace),
            &[analyzer.display_name(), error.kind_name(), &message],
        )
        .with_property("AnalyzerId", analyzer.id().as_str())
        .with_property("AnalyzerReference", provenance.reference_display.as_str())
        .with_property("AnalyzerVersion", provenance.version.as_str());
        Some(record)
    }

    /// AD0002 for a failed driver batch
    pub fn driver_exception(
        &self,
        error: &AnalyzerError,
        target: &ExceptionTarget,
    ) -> Option<DiagnosticRecord> {
        if !self.report_exceptions {
            return None;
        }
        let message = error.message();
        Some(DiagnosticRecord::from_descriptor(
            &DRIVER_EXCEPTION,
            target.location(self.workspace),
            &[error.kind_name(), &message],
        ))
    }
}

/// Run synchronous analyzer code, turning panics into [`AnalyzerError::Panicked`]
pub fn guard<T>(call: impl FnOnce() -> Result<T, AnalyzerError>) -> Result<T, AnalyzerError> {
    catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        Err(AnalyzerError::Panicked {
            message: panic_message(payload.as_ref()),
        })
    })
}

/// Drop exception diagnostics equivalent to an earlier one
pub fn dedupe_exceptions(diagnostics: Vec<DiagnosticRecord>) -> Vec<DiagnosticRecord> {
    let mut kept: Vec<DiagnosticRecord> = Vec::with_capacity(diagnostics.len());
    let mut dropped = 0usize;
    for diagnostic in diagnostics {
        if diagnostic.is_analyzer_exception()
            && kept.iter().any(|existing| existing.is_equivalent_exception(&diagnostic))
        {
            dropped += 1;
            continue;
        }
        kept.push(diagnostic);
    }
    if dropped > 0 {
        debug!("Dropped {} duplicate exception diagnostics", dropped);
    }
    kept
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{
        AnalyzerHandle, AnalyzerOrigin, AnalyzerReference, DiagnosticAnalyzer,
    };
    use std::sync::Arc;

    struct Dummy;

    impl DiagnosticAnalyzer for Dummy {
        fn type_name(&self) -> &str {
            "Dummy"
        }

        fn supported_diagnostics(&self) -> Result<Vec<DiagnosticDescriptor>, AnalyzerError> {
            Ok(Vec::new())
        }
    }

    fn descriptor() -> AnalyzerDescriptor {
        AnalyzerDescriptor::register(
            AnalyzerHandle::Compilation(Arc::new(Dummy)),
            &AnalyzerReference::new("dummy.dll", "Dummy", "1.0"),
            AnalyzerOrigin::Project,
            0,
        )
    }

    fn target() -> ExceptionTarget {
        ExceptionTarget::Project {
            project: ProjectId::new(),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_single_exception_diagnostic() {
        let isolation = ExceptionIsolation::new(None, true);
        let cancel = CancellationToken::new();
        let result = isolation
            .run(&descriptor(), &target(), &cancel, async {
                if cancel.id() > 0 {
                    panic!("kaboom");
                }
                Ok(Vec::new())
            })
            .await
            .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "AD0001");
        assert_eq!(result[0].category, "Intellisense");
        assert!(result[0].is_analyzer_exception());
        assert!(result[0].message.contains("kaboom"));
        assert!(result[0].message.contains("'Dummy'"));
    }

    #[tokio::test]
    async fn test_caller_cancellation_propagates() {
        let isolation = ExceptionIsolation::new(None, true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = isolation
            .run(&descriptor(), &target(), &cancel, async {
                Err::<Vec<DiagnosticRecord>, _>(AnalyzerError::Cancelled)
            })
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_self_cancellation_is_an_exception() {
        let isolation = ExceptionIsolation::new(None, true);
        let cancel = CancellationToken::new();
        let result = isolation
            .run(&descriptor(), &target(), &cancel, async {
                Err::<Vec<DiagnosticRecord>, _>(AnalyzerError::Cancelled)
            })
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert!(result[0].message.contains("OperationCanceled"));
    }

    #[test]
    fn test_exception_reporting_can_be_disabled() {
        let isolation = ExceptionIsolation::new(None, false);
        let cancel = CancellationToken::new();
        let result = isolation
            .resolve(&descriptor(), &target(), &cancel, Err(AnalyzerError::failed("x")))
            .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_guard_catches_panics() {
        let result: Result<(), AnalyzerError> = guard(|| panic!("descriptor failure"));
        assert_eq!(
            result,
            Err(AnalyzerError::Panicked {
                message: "descriptor failure".to_string()
            })
        );
    }

    #[test]
    fn test_dedupe_exceptions() {
        let isolation = ExceptionIsolation::new(None, true);
        let analyzer = descriptor();
        let error = AnalyzerError::failed("same");
        let a = isolation.analyzer_exception(&analyzer, &error, &target()).unwrap();
        let b = isolation.analyzer_exception(&analyzer, &error, &target()).unwrap();
        let c = isolation.driver_exception(&error, &target()).unwrap();

        let kept = dedupe_exceptions(vec![a, b, c]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1].id, "AD0002");
    }
}
