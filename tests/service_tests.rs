mod common;

use anyhow::Result;
use common::*;
use diagnostic_engine::config::EventsConfig;
use diagnostic_engine::{
    AnalysisKind, CancellationToken, DiagnosticMode, DiagnosticsScope, EngineConfig, EngineError, TextSpan,
    UpdateKind,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_late_caller_joins_the_queue_of_a_running_computation() -> Result<()> {
    let (service, driver) = service(default_host());
    driver.set_delay(Duration::from_millis(50));
    let (project, document) = sample_project("class Program {}");
    add_project(&service, project).await;

    // Span-limited passes are never reused, so every caller computes
    let span = Some(TextSpan::new(0, 5));
    let cancel = CancellationToken::new();
    let analyze = || service.analyze_document(document, AnalysisKind::Semantic, span, &cancel);
    let (first, second, third) = tokio::join!(analyze(), analyze(), async {
        // Arrives after the first caller is done, while the second computes
        tokio::time::sleep(Duration::from_millis(120)).await;
        analyze().await
    });

    for outcome in [first, second, third] {
        assert_eq!(outcome?.len(), 2);
    }
    assert_eq!(driver.calls().len(), 6);
    assert_eq!(driver.max_concurrent_calls(), 1);
    assert_eq!(service.stats().inflight_computations, 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_callers_compute_once() -> Result<()> {
    let (service, driver) = service(default_host());
    driver.set_delay(Duration::from_millis(20));
    let (project, document) = sample_project("class Program {}");
    add_project(&service, project).await;

    let cancel = CancellationToken::new();
    let analyze = || service.analyze_document(document, AnalysisKind::Syntax, None, &cancel);
    let (first, second, third) = tokio::join!(analyze(), analyze(), analyze());

    let first = first?;
    assert_eq!(first.len(), 2);
    assert_eq!(second?, first);
    assert_eq!(third?, first);
    assert_eq!(driver.calls().len(), 2);
    assert_eq!(service.stats().inflight_computations, 0);
    Ok(())
}

#[tokio::test]
async fn test_abandoned_and_cancelled_calls_release_their_slot() -> Result<()> {
    let (service, driver) = service(default_host());
    driver.set_delay(Duration::from_millis(500));
    let (project, document) = sample_project("class Program {}");
    let project_id = project.id();
    add_project(&service, project).await;

    let never = CancellationToken::new();
    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        service.analyze_document(document, AnalysisKind::Syntax, None, &never),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(service.stats().inflight_computations, 0);

    let cancel = CancellationToken::new();
    let (outcome, _) = tokio::join!(
        service.analyze_document(document, AnalysisKind::Semantic, None, &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        }
    );
    assert!(matches!(outcome, Err(EngineError::Cancelled)));
    assert_eq!(service.stats().inflight_computations, 0);
    assert!(service
        .get_diagnostics(&DiagnosticsScope::document(project_id, document), false)?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn test_removal_racing_a_store_leaves_no_bucket_behind() -> Result<()> {
    let config = EngineConfig {
        events: EventsConfig { queue_capacity: 1 },
        ..EngineConfig::default()
    };
    let host = vec![
        default_host().remove(0),
        host_reference("host:todo", vec![TodoAnalyzer::handle()]),
    ];
    let (service, _driver) = service_with(host, config);
    let handler = Arc::new(RecordingHandler::slow(Duration::from_millis(15)));
    service.subscribe(DiagnosticMode::Push, handler.clone());

    let (project, document) = sample_project("// TODO: race");
    let project_id = project.id();
    add_project(&service, project).await;

    let cancel = CancellationToken::new();
    let (analyzed, _) = tokio::join!(
        service.analyze_document(document, AnalysisKind::Syntax, None, &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            remove_document(&service, document).await;
        }
    );
    analyzed?;
    service.flush_events().await?;

    assert!(service.get_current(Some(project_id), Some(document), None).is_empty());
    assert!(service
        .get_diagnostics(&DiagnosticsScope::document(project_id, document), false)?
        .is_empty());

    // Every bucket of the document ends with its removal
    let mut last: HashMap<String, UpdateKind> = HashMap::new();
    for event in handler.events().await {
        if event.document() == Some(document) {
            last.insert(format!("{:?}", event.id()), event.kind());
        }
    }
    assert!(last.values().all(|kind| *kind == UpdateKind::Removed));
    Ok(())
}
