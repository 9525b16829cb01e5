//! Span remapping for generated and embedded code
//!
//! A [`SpanMapper`] translates a location in a generated document to the file
//! the user actually edits. Remapping only fills the mapped span; the original
//! span and source span are left intact.

use crate::diagnostic::{DiagnosticRecord, FileLinePositionSpan};
use crate::workspace::{Document, Project};

/// Host-provided translation of document spans
pub trait SpanMapper: Send + Sync {
    /// Mapped location for `span` in `document`, or `None` to keep it as is
    fn map_span(&self, document: &Document, span: &FileLinePositionSpan) -> Option<FileLinePositionSpan>;
}

/// Apply a mapper to every diagnostic that has a source location
pub fn remap_diagnostics(
    mapper: &dyn SpanMapper,
    project: &Project,
    diagnostics: Vec<DiagnosticRecord>,
) -> Vec<DiagnosticRecord> {
    diagnostics
        .into_iter()
        .map(|mut diagnostic| {
            let Some(document) = diagnostic.document_id().and_then(|id| project.document(id)) else {
                return diagnostic;
            };
            let Some(original) = diagnostic.location.original().cloned() else {
                return diagnostic;
            };
            if let Some(mapped) = mapper.map_span(document, &original) {
                diagnostic.location = diagnostic.location.with_mapped(mapped);
            }
            diagnostic
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{
        DiagnosticDescriptor, DiagnosticLocation, DiagnosticSeverity, LinePosition, TextSpan,
    };

    struct ShiftLines(u32);

    impl SpanMapper for ShiftLines {
        fn map_span(&self, _document: &Document, span: &FileLinePositionSpan) -> Option<FileLinePositionSpan> {
            Some(FileLinePositionSpan::new(
                Some("page.razor".to_string()),
                LinePosition::new(span.start.line + self.0, span.start.column),
                LinePosition::new(span.end.line + self.0, span.end.column),
            ))
        }
    }

    #[test]
    fn test_remap_keeps_original() {
        let project = crate::workspace::Project::new("App", "csharp");
        let document = Document::new(project.id(), "page.g.cs", "class A {}\n");
        let project = project.with_document(document.clone());

        let span = TextSpan::new(0, 5);
        let diagnostic = DiagnosticRecord::from_descriptor(
            &DiagnosticDescriptor::new("X", "t", "m", "c", DiagnosticSeverity::Info, true),
            DiagnosticLocation::document(None, project.id(), document.id(), Some(span), document.line_span(span)),
            &[],
        );

        let remapped = remap_diagnostics(&ShiftLines(10), &project, vec![diagnostic.clone()]);
        let location = &remapped[0].location;
        assert_eq!(location.original(), diagnostic.location.original());
        assert_eq!(location.source_span(), Some(span));
        assert_eq!(location.mapped().unwrap().start.line, 10);
        assert_eq!(location.mapped().unwrap().path.as_deref(), Some("page.razor"));
    }
}
