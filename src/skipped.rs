//! Host analyzers superseded by project analyzers
//!
//! When a project ships its own copy of diagnostics that a host analyzer also
//! reports, the project's version wins. A host analyzer whose every id is
//! covered is skipped entirely; one with partial overlap only has the covered
//! ids filtered out of its output.

use moka::sync::Cache;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::analyzer::{AnalyzerDescriptor, AnalyzerId, ReferenceSetKey};
use crate::catalog::AnalyzerCatalog;
use crate::diagnostic::DiagnosticRecord;
use crate::ids::Language;
use crate::workspace::Project;

/// Which host analyzers to skip or filter for one project
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkippedAnalyzersInfo {
    fully_skipped: HashSet<AnalyzerId>,
    filtered_ids: HashMap<AnalyzerId, HashSet<String>>,
}

impl SkippedAnalyzersInfo {
    /// Decide which host analyzers are superseded by project analyzers.
    ///
    /// Analyzers present in both sets are never skipped, nor is the compiler
    /// analyzer. Host analyzers that declare no diagnostics are kept.
    pub fn compute<F>(
        project_analyzers: &[AnalyzerDescriptor],
        host_analyzers: &[AnalyzerDescriptor],
        supported_ids: F,
    ) -> Self
    where
        F: Fn(&AnalyzerDescriptor) -> HashSet<String>,
    {
        let project_ids: HashSet<String> = project_analyzers
            .iter()
            .flat_map(|analyzer| supported_ids(analyzer))
            .collect();
        if project_ids.is_empty() {
            return Self::default();
        }

        let project_set: HashSet<&AnalyzerId> =
            project_analyzers.iter().map(|analyzer| analyzer.id()).collect();

        let mut info = Self::default();
        for host in host_analyzers {
            if project_set.contains(host.id()) || host.is_compiler_analyzer() {
                continue;
            }
            let host_ids = supported_ids(host);
            if host_ids.is_empty() {
                continue;
            }
            let covered: HashSet<String> = host_ids
                .iter()
                .filter(|id| project_ids.contains(*id))
                .cloned()
                .collect();
            if covered.len() == host_ids.len() {
                info.fully_skipped.insert(host.id().clone());
            } else if !covered.is_empty() {
                info.filtered_ids.insert(host.id().clone(), covered);
            }
        }
        info
    }

    pub fn is_empty(&self) -> bool {
        self.fully_skipped.is_empty() && self.filtered_ids.is_empty()
    }

    pub fn is_fully_skipped(&self, analyzer: &AnalyzerId) -> bool {
        self.fully_skipped.contains(analyzer)
    }

    /// Ids to drop from a partially skipped analyzer's output
    pub fn filtered_ids(&self, analyzer: &AnalyzerId) -> Option<&HashSet<String>> {
        self.filtered_ids.get(analyzer)
    }

    /// Remove diagnostics the project's own analyzers already report
    pub fn filter(&self, analyzer: &AnalyzerId, diagnostics: Vec<DiagnosticRecord>) -> Vec<DiagnosticRecord> {
        match self.filtered_ids.get(analyzer) {
            Some(ids) => diagnostics
                .into_iter()
                .filter(|diagnostic| !ids.contains(&diagnostic.id))
                .collect(),
            None => diagnostics,
        }
    }
}

/// Skip info cached per language and analyzer reference set
pub struct SkippedAnalyzersCache {
    cache: Cache<(Language, ReferenceSetKey), Arc<SkippedAnalyzersInfo>>,
}

impl SkippedAnalyzersCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::new(capacity),
        }
    }

    /// Skip info for a project, computed on first use of its reference set
    pub fn get_or_compute(&self, catalog: &AnalyzerCatalog, project: &Project) -> Arc<SkippedAnalyzersInfo> {
        let key = (project.language().clone(), project.reference_set_key());
        self.cache.get_with(key, || {
            let project_analyzers = catalog.get_project_analyzers(project);
            let host_analyzers = catalog.get_analyzers(project.language());
            Arc::new(SkippedAnalyzersInfo::compute(
                &project_analyzers,
                &host_analyzers,
                |analyzer| catalog.diagnostic_info(analyzer).ids.clone(),
            ))
        })
    }

    /// Forget the skip info computed for the project's current reference set
    pub fn invalidate(&self, project: &Project) {
        self.cache
            .invalidate(&(project.language().clone(), project.reference_set_key()));
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}
