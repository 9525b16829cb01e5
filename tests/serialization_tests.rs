mod common;

use anyhow::Result;
use common::*;
use diagnostic_engine::remap::SpanMapper;
use diagnostic_engine::{
    AnalysisKind, CancellationToken, DiagnosticDescriptor, DiagnosticLocation, DiagnosticRecord, DiagnosticSeverity,
    DiagnosticsScope, Document, DocumentId, FileLinePositionSpan, LinePosition, ProjectId, TextSpan, WorkspaceId,
};
use proptest::prelude::*;
use std::sync::Arc;

fn severity() -> impl Strategy<Value = DiagnosticSeverity> {
    prop_oneof![
        Just(DiagnosticSeverity::Hidden),
        Just(DiagnosticSeverity::Info),
        Just(DiagnosticSeverity::Warning),
        Just(DiagnosticSeverity::Error),
    ]
}

fn record_strategy() -> impl Strategy<Value = DiagnosticRecord> {
    (
        "[A-Z]{2,4}[0-9]{4}",
        "[a-zA-Z ]{0,40}",
        severity(),
        0u32..500,
        0u32..120,
        0usize..4000,
        0usize..200,
        any::<bool>(),
        proptest::option::of("/src/[a-z]{1,8}\\.cs"),
        proptest::collection::btree_map("[A-Za-z]{1,8}", "[a-z0-9]{0,12}", 0..3),
        proptest::option::of((proptest::option::of("/pages/[a-z]{1,8}\\.razor"), 0u32..500, 0u32..120, 0u32..40)),
    )
        .prop_map(
            |(id, message, severity, line, column, start, len, suppressed, path, properties, mapped)| {
                let descriptor = DiagnosticDescriptor::new(&id, "Title", message, "Style", severity, true);
                let span = TextSpan::new(start, start + len);
                let line_span = FileLinePositionSpan::new(
                    path,
                    LinePosition::new(line, column),
                    LinePosition::new(line, column + len as u32),
                );
                let mut location = DiagnosticLocation::document(
                    Some(WorkspaceId::new()),
                    ProjectId::new(),
                    DocumentId::new(),
                    Some(span),
                    line_span,
                );
                if let Some((mapped_path, mapped_line, mapped_column, width)) = mapped {
                    location = location.with_mapped(FileLinePositionSpan::new(
                        mapped_path,
                        LinePosition::new(mapped_line, mapped_column),
                        LinePosition::new(mapped_line, mapped_column + width),
                    ));
                }
                properties.into_iter().fold(
                    DiagnosticRecord::from_descriptor(&descriptor, location, &[]).with_suppressed(suppressed),
                    |record, (key, value)| record.with_property(key, value),
                )
            },
        )
}

proptest! {
    #[test]
    fn prop_record_survives_json(record in record_strategy()) {
        let json = serde_json::to_string(&record).unwrap();
        let decoded: DiagnosticRecord = serde_json::from_str(&json).unwrap();

        prop_assert_eq!(&decoded, &record);
        prop_assert_eq!(&decoded.location, &record.location);
        prop_assert_eq!(decoded.location.source_span(), record.location.source_span());
        prop_assert_eq!(decoded.location.original(), record.location.original());
        prop_assert_eq!(decoded.location.mapped(), record.location.mapped());
        prop_assert_eq!(decoded.is_suppressed, record.is_suppressed);
        prop_assert_eq!(&decoded.properties, &record.properties);
    }
}

#[test]
fn test_location_less_record_has_no_spans() {
    let project = ProjectId::new();
    let descriptor = DiagnosticDescriptor::new("NU1603", "Title", "Package downgrade", "NuGet", DiagnosticSeverity::Warning, true);
    let record = DiagnosticRecord::from_descriptor(&descriptor, DiagnosticLocation::project(None, project), &[]);

    let json = serde_json::to_value(&record).unwrap();
    let decoded: DiagnosticRecord = serde_json::from_value(json).unwrap();
    assert_eq!(decoded.project_id(), Some(project));
    assert!(decoded.document_id().is_none());
    assert!(decoded.location.source_span().is_none());
    assert!(!decoded.location.has_source_location());
}

/// Maps generated lines back to a markup file, twenty lines further down
struct MarkupMapper;

impl SpanMapper for MarkupMapper {
    fn map_span(&self, _document: &Document, span: &FileLinePositionSpan) -> Option<FileLinePositionSpan> {
        Some(FileLinePositionSpan::new(
            Some("/src/App/Pages/Index.razor".to_string()),
            LinePosition::new(span.start.line + 20, span.start.column + 4),
            LinePosition::new(span.end.line + 20, span.end.column + 4),
        ))
    }
}

#[tokio::test]
async fn test_remapped_diagnostics_survive_json() -> Result<()> {
    let (service, _driver) = service(default_host());
    let service = service.with_span_mapper(Arc::new(MarkupMapper));
    let (project, document) = sample_project("class Index {}");
    let project_id = project.id();
    add_project(&service, project).await;

    service
        .analyze_document(document, AnalysisKind::Syntax, None, &CancellationToken::new())
        .await?;
    let diagnostics = service.get_diagnostics(&DiagnosticsScope::document(project_id, document), false)?;
    assert!(!diagnostics.is_empty());

    let json = serde_json::to_string(&diagnostics)?;
    let decoded: Vec<DiagnosticRecord> = serde_json::from_str(&json)?;
    assert_eq!(decoded, diagnostics);
    for (decoded, record) in decoded.iter().zip(&diagnostics) {
        let mapped = decoded.location.mapped().unwrap();
        let original = decoded.location.original().unwrap();
        assert_eq!(mapped.path.as_deref(), Some("/src/App/Pages/Index.razor"));
        assert_eq!(mapped.start.line, original.start.line + 20);
        assert_eq!(original, record.location.original().unwrap());
        assert_eq!(decoded.location.source_span(), Some(TextSpan::new(0, 1)));
    }
    Ok(())
}
