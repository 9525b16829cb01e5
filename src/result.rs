//! Per-analyzer, per-project analysis results
//!
//! A result buckets diagnostics by kind and document:
//!
//! * syntax locals and semantic locals, keyed by the document they were found in
//! * non-locals: diagnostics reported into a document by project-wide analysis
//! * others: diagnostics with no source location

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use crate::analyzer::AnalyzerId;
use crate::diagnostic::{same_diagnostics, DiagnosticRecord};
use crate::ids::{DocumentId, ProjectId, VersionStamp};

/// Granularity of one analysis pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Syntax,
    Semantic,
    NonLocal,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 3] = [
        AnalysisKind::Syntax,
        AnalysisKind::Semantic,
        AnalysisKind::NonLocal,
    ];
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnalysisKind::Syntax => "syntax",
            AnalysisKind::Semantic => "semantic",
            AnalysisKind::NonLocal => "non_local",
        };
        f.write_str(name)
    }
}

/// Diagnostics of one analyzer over one project at one solution version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub project_id: ProjectId,
    pub analyzer_id: AnalyzerId,
    pub version: VersionStamp,
    syntax_locals: BTreeMap<DocumentId, Vec<DiagnosticRecord>>,
    semantic_locals: BTreeMap<DocumentId, Vec<DiagnosticRecord>>,
    non_locals: BTreeMap<DocumentId, Vec<DiagnosticRecord>>,
    others: Vec<DiagnosticRecord>,
    documents: BTreeSet<DocumentId>,
}

impl AnalysisResult {
    pub fn empty(project_id: ProjectId, analyzer_id: AnalyzerId, version: VersionStamp) -> Self {
        Self {
            project_id,
            analyzer_id,
            version,
            syntax_locals: BTreeMap::new(),
            semantic_locals: BTreeMap::new(),
            non_locals: BTreeMap::new(),
            others: Vec::new(),
            documents: BTreeSet::new(),
        }
    }

    /// Diagnostics of one kind in one document
    pub fn document_diagnostics(&self, document: DocumentId, kind: AnalysisKind) -> &[DiagnosticRecord] {
        let bucket = match kind {
            AnalysisKind::Syntax => &self.syntax_locals,
            AnalysisKind::Semantic => &self.semantic_locals,
            AnalysisKind::NonLocal => &self.non_locals,
        };
        bucket.get(&document).map(Vec::as_slice).unwrap_or_default()
    }

    /// Location-less diagnostics
    pub fn others(&self) -> &[DiagnosticRecord] {
        &self.others
    }

    /// Documents covered by this result, including ones with no findings
    pub fn documents(&self) -> impl Iterator<Item = DocumentId> + '_ {
        self.documents.iter().copied()
    }

    pub fn all_diagnostics(&self) -> Vec<DiagnosticRecord> {
        self.syntax_locals
            .values()
            .chain(self.semantic_locals.values())
            .chain(self.non_locals.values())
            .flatten()
            .chain(self.others.iter())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.syntax_locals.values().all(Vec::is_empty)
            && self.semantic_locals.values().all(Vec::is_empty)
            && self.non_locals.values().all(Vec::is_empty)
            && self.others.is_empty()
    }

    /// Result restricted to one document and kind
    pub fn document_slice(&self, document: DocumentId, kind: AnalysisKind) -> AnalysisResult {
        let mut builder = AnalysisResultBuilder::new(self.project_id, self.analyzer_id.clone(), self.version);
        builder.add_document(document);
        builder.add(kind, self.document_diagnostics(document, kind).iter().cloned());
        builder.build()
    }

    /// Result restricted to the location-less diagnostics
    pub fn others_slice(&self) -> AnalysisResult {
        let mut builder = AnalysisResultBuilder::new(self.project_id, self.analyzer_id.clone(), self.version);
        builder.add(AnalysisKind::NonLocal, self.others.iter().cloned());
        builder.build()
    }

    /// Same findings in every bucket, ignoring order and version
    pub fn same_content(&self, other: &AnalysisResult) -> bool {
        fn same_buckets(
            left: &BTreeMap<DocumentId, Vec<DiagnosticRecord>>,
            right: &BTreeMap<DocumentId, Vec<DiagnosticRecord>>,
        ) -> bool {
            let keys: BTreeSet<&DocumentId> = left
                .iter()
                .chain(right.iter())
                .filter(|(_, diagnostics)| !diagnostics.is_empty())
                .map(|(document, _)| document)
                .collect();
            keys.into_iter().all(|document| {
                same_diagnostics(
                    left.get(document).map(Vec::as_slice).unwrap_or_default(),
                    right.get(document).map(Vec::as_slice).unwrap_or_default(),
                )
            })
        }

        same_buckets(&self.syntax_locals, &other.syntax_locals)
            && same_buckets(&self.semantic_locals, &other.semantic_locals)
            && same_buckets(&self.non_locals, &other.non_locals)
            && same_diagnostics(&self.others, &other.others)
    }
}

/// Accumulates diagnostics into an [`AnalysisResult`], dropping duplicates
/// across buckets.
#[derive(Debug)]
pub struct AnalysisResultBuilder {
    result: AnalysisResult,
    seen: HashSet<DiagnosticRecord>,
}

impl AnalysisResultBuilder {
    pub fn new(project_id: ProjectId, analyzer_id: AnalyzerId, version: VersionStamp) -> Self {
        Self {
            result: AnalysisResult::empty(project_id, analyzer_id, version),
            seen: HashSet::new(),
        }
    }

    /// Record that a document was analyzed even if nothing was reported in it
    pub fn add_document(&mut self, document: DocumentId) {
        self.result.documents.insert(document);
    }

    /// Add diagnostics found by a pass of `kind`.
    ///
    /// Diagnostics without a document go to the others bucket.
    pub fn add(&mut self, kind: AnalysisKind, diagnostics: impl IntoIterator<Item = DiagnosticRecord>) {
        for diagnostic in diagnostics {
            if !self.seen.insert(diagnostic.clone()) {
                continue;
            }
            match diagnostic.document_id() {
                Some(document) => {
                    self.result.documents.insert(document);
                    let bucket = match kind {
                        AnalysisKind::Syntax => &mut self.result.syntax_locals,
                        AnalysisKind::Semantic => &mut self.result.semantic_locals,
                        AnalysisKind::NonLocal => &mut self.result.non_locals,
                    };
                    bucket.entry(document).or_default().push(diagnostic);
                }
                None => self.result.others.push(diagnostic),
            }
        }
    }

    pub fn build(self) -> AnalysisResult {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalyzerReferenceId;
    use crate::diagnostic::{
        DiagnosticDescriptor, DiagnosticLocation, DiagnosticSeverity, FileLinePositionSpan,
        LinePosition,
    };

    fn analyzer() -> AnalyzerId {
        AnalyzerId::derive("A", &AnalyzerReferenceId::new("r"), "1", 0)
    }

    fn diagnostic(id: &str, project: ProjectId, document: Option<DocumentId>) -> DiagnosticRecord {
        let descriptor =
            DiagnosticDescriptor::new(id, "t", "m", "c", DiagnosticSeverity::Warning, true);
        let location = match document {
            Some(document) => DiagnosticLocation::document(
                None,
                project,
                document,
                None,
                FileLinePositionSpan::new(None, LinePosition::new(1, 0), LinePosition::new(1, 1)),
            ),
            None => DiagnosticLocation::project(None, project),
        };
        DiagnosticRecord::from_descriptor(&descriptor, location, &[])
    }

    #[test]
    fn test_builder_routes_and_dedupes() {
        let project = ProjectId::new();
        let document = DocumentId::new();
        let mut builder = AnalysisResultBuilder::new(project, analyzer(), VersionStamp::new(1));
        builder.add(
            AnalysisKind::Syntax,
            vec![
                diagnostic("S1", project, Some(document)),
                diagnostic("P1", project, None),
            ],
        );
        builder.add(
            AnalysisKind::Semantic,
            vec![
                diagnostic("S1", project, Some(document)),
                diagnostic("M1", project, Some(document)),
            ],
        );
        let result = builder.build();

        assert_eq!(result.document_diagnostics(document, AnalysisKind::Syntax).len(), 1);
        assert_eq!(result.document_diagnostics(document, AnalysisKind::Semantic).len(), 1);
        assert_eq!(result.others().len(), 1);
        assert_eq!(result.all_diagnostics().len(), 3);
    }

    #[test]
    fn test_same_content_ignores_empty_buckets_and_version() {
        let project = ProjectId::new();
        let document = DocumentId::new();

        let mut a = AnalysisResultBuilder::new(project, analyzer(), VersionStamp::new(1));
        a.add_document(document);
        let a = a.build();
        let b = AnalysisResult::empty(project, analyzer(), VersionStamp::new(2));
        assert!(a.same_content(&b));

        let mut c = AnalysisResultBuilder::new(project, analyzer(), VersionStamp::new(2));
        c.add(AnalysisKind::Syntax, vec![diagnostic("S1", project, Some(document))]);
        assert!(!a.same_content(&c.build()));
    }

    #[test]
    fn test_document_slice() {
        let project = ProjectId::new();
        let document = DocumentId::new();
        let mut builder = AnalysisResultBuilder::new(project, analyzer(), VersionStamp::new(1));
        builder.add(AnalysisKind::Syntax, vec![diagnostic("S1", project, Some(document))]);
        builder.add(AnalysisKind::NonLocal, vec![diagnostic("N1", project, Some(document))]);
        let result = builder.build();

        let slice = result.document_slice(document, AnalysisKind::NonLocal);
        assert_eq!(slice.all_diagnostics().len(), 1);
        assert_eq!(slice.all_diagnostics()[0].id, "N1");
        assert_eq!(slice.documents().collect::<Vec<_>>(), vec![document]);
    }
}
