//! Span adjustment for the compiler analyzer
//!
//! The compiler can't report semantic diagnostics for a fragment of a member,
//! so a requested span is widened to cover whole member declarations at both
//! ends before the compiler analyzer runs.

use crate::diagnostic::TextSpan;
use crate::ids::DocumentId;
use crate::workspace::Compilation;

/// Widen `span` so that both ends cover their enclosing members.
///
/// An end with no enclosing member is left where it is.
pub fn widen_to_members(compilation: &dyn Compilation, document: DocumentId, span: TextSpan) -> TextSpan {
    let start = compilation
        .enclosing_member_span(document, span.start)
        .map(|member| member.start)
        .unwrap_or(span.start);

    let end = compilation
        .enclosing_member_span(document, span.end)
        .map(|member| member.end)
        .unwrap_or(span.end);

    TextSpan::new(start, end.max(start)).union(&span)
}
