//! Analyzer catalog
//!
//! Resolves the analyzers that apply to a language or project and memoizes
//! everything that is expensive or user-code-backed:
//!
//! * host analyzers per language are built once, lazily
//! * project analyzers are cached per reference set
//! * each analyzer's supported descriptors are queried at most once
//! * the compiler analyzer per language is looked up once

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::analyzer::{
    AnalyzerDescriptor, AnalyzerId, AnalyzerOrigin, AnalyzerReference, AnalyzerReferenceId,
    FileContentLoadAnalyzer, ReferenceSetKey,
};
use crate::diagnostic::{tags, DiagnosticDescriptor};
use crate::ids::{Language, ProjectId};
use crate::isolation;
use crate::result::AnalysisKind;
use crate::workspace::Project;

/// Analyzer references that ship with the tooling, shared by every workspace
#[derive(Debug, Clone, Default)]
pub struct HostAnalyzers {
    references: Vec<Arc<AnalyzerReference>>,
}

impl HostAnalyzers {
    pub fn new(references: Vec<Arc<AnalyzerReference>>) -> Self {
        Self { references }
    }

    pub fn references(&self) -> &[Arc<AnalyzerReference>] {
        &self.references
    }

    fn contains_reference(&self, id: &AnalyzerReferenceId) -> bool {
        self.references.iter().any(|reference| reference.id() == id)
    }
}

/// What an analyzer declared about itself, computed once
#[derive(Debug, Default)]
pub struct AnalyzerDiagnosticInfo {
    pub descriptors: Vec<DiagnosticDescriptor>,
    pub ids: HashSet<String>,
    /// Allowed to report execution telemetry
    pub telemetry_eligible: bool,
}

/// Memoizing registry of analyzers for one workspace
pub struct AnalyzerCatalog {
    /// Process-wide host analyzer references
    host: Arc<HostAnalyzers>,
    /// Host analyzers registered per language
    host_by_language: DashMap<Language, Arc<Vec<AnalyzerDescriptor>>>,
    /// Compiler analyzer per language, `None` when the language has none
    compiler_by_language: DashMap<Language, Option<AnalyzerDescriptor>>,
    /// Project analyzers per (language, reference set)
    project_analyzers: DashMap<(Language, ReferenceSetKey), Arc<Vec<AnalyzerDescriptor>>>,
    /// Reference set last seen for each project
    project_keys: DashMap<ProjectId, (Language, ReferenceSetKey)>,
    /// Supported descriptors per analyzer
    diagnostic_info: DashMap<AnalyzerId, Arc<OnceCell<Arc<AnalyzerDiagnosticInfo>>>>,
}

impl AnalyzerCatalog {
    pub fn new(host: Arc<HostAnalyzers>) -> Self {
        Self {
            host,
            host_by_language: DashMap::new(),
            compiler_by_language: DashMap::new(),
            project_analyzers: DashMap::new(),
            project_keys: DashMap::new(),
            diagnostic_info: DashMap::new(),
        }
    }

    /// Host analyzers for a language, built lazily on first request.
    ///
    /// Concurrent first requests may build the list more than once, but only
    /// one result is retained and every caller observes that one.
    pub fn get_analyzers(&self, language: &Language) -> Arc<Vec<AnalyzerDescriptor>> {
        if let Some(existing) = self.host_by_language.get(language) {
            return existing.clone();
        }

        let built = Arc::new(self.build_host_analyzers(language));
        self.host_by_language
            .entry(language.clone())
            .or_insert(built)
            .clone()
    }

    fn build_host_analyzers(&self, language: &Language) -> Vec<AnalyzerDescriptor> {
        let mut seen = HashSet::new();
        let mut analyzers = Vec::new();
        for reference in self.host.references() {
            register_reference(reference, language, AnalyzerOrigin::Host, &mut seen, &mut analyzers);
        }

        // Only the first flagged host analyzer is the compiler analyzer
        let mut compiler_seen = false;
        for analyzer in analyzers.iter_mut() {
            if analyzer.is_compiler_analyzer() {
                if compiler_seen {
                    warn!(
                        "Ignoring compiler marker of {}, {} already has a compiler analyzer",
                        analyzer.id(),
                        language
                    );
                    *analyzer = analyzer.without_compiler_marker();
                }
                compiler_seen = true;
            }
        }

        let load_analyzer = FileContentLoadAnalyzer::descriptor();
        if seen.insert(load_analyzer.id().clone()) {
            analyzers.push(load_analyzer);
        }

        debug!(
            "Registered {} host analyzers for language {}",
            analyzers.len(),
            language
        );
        analyzers
    }

    /// Analyzers contributed by the project's own references.
    ///
    /// References also present in the host set are left out; the host copy wins.
    pub fn get_project_analyzers(&self, project: &Project) -> Arc<Vec<AnalyzerDescriptor>> {
        let key = (project.language().clone(), project.reference_set_key());
        self.project_keys.insert(project.id(), key.clone());

        if let Some(existing) = self.project_analyzers.get(&key) {
            return existing.clone();
        }

        let mut seen = HashSet::new();
        let mut analyzers = Vec::new();
        for reference in project.analyzer_references() {
            if self.host.contains_reference(reference.id()) {
                debug!(
                    "Reference {} of project {} is already a host reference",
                    reference.id(),
                    project.name()
                );
                continue;
            }
            register_reference(
                reference,
                project.language(),
                AnalyzerOrigin::Project,
                &mut seen,
                &mut analyzers,
            );
        }

        // The compiler analyzer always comes from the host
        for analyzer in analyzers.iter_mut() {
            if analyzer.is_compiler_analyzer() {
                warn!(
                    "Project {} analyzer {} claims to be the compiler analyzer, treating it as a regular one",
                    project.name(),
                    analyzer.id()
                );
                *analyzer = analyzer.without_compiler_marker();
            }
        }

        self.project_analyzers
            .entry(key)
            .or_insert(Arc::new(analyzers))
            .clone()
    }

    /// Host then project analyzers of a project, without duplicates
    pub fn get_analyzers_for_project(&self, project: &Project) -> Vec<AnalyzerDescriptor> {
        let host = self.get_analyzers(project.language());
        let project_analyzers = self.get_project_analyzers(project);

        let mut seen: HashSet<AnalyzerId> = HashSet::new();
        host.iter()
            .chain(project_analyzers.iter())
            .filter(|analyzer| seen.insert(analyzer.id().clone()))
            .cloned()
            .collect()
    }

    /// Forget the project analyzers registered for a project's previous
    /// reference set. Other projects sharing the set keep it.
    pub fn invalidate_project(&self, project: ProjectId) {
        let Some((_, key)) = self.project_keys.remove(&project) else {
            return;
        };
        let still_used = self.project_keys.iter().any(|entry| *entry.value() == key);
        if !still_used {
            self.project_analyzers.remove(&key);
        }
    }

    pub fn clear_projects(&self) {
        self.project_keys.clear();
        self.project_analyzers.clear();
    }

    /// The language's compiler analyzer: the first host analyzer flagged as one
    pub fn compiler_analyzer(&self, language: &Language) -> Option<AnalyzerDescriptor> {
        if let Some(existing) = self.compiler_by_language.get(language) {
            return existing.clone();
        }
        let found = self
            .get_analyzers(language)
            .iter()
            .find(|analyzer| analyzer.is_compiler_analyzer())
            .cloned();
        self.compiler_by_language
            .entry(language.clone())
            .or_insert(found)
            .clone()
    }

    /// Whether `analyzer` is the compiler analyzer of `language`
    pub fn is_compiler_analyzer(&self, language: &Language, analyzer: &AnalyzerDescriptor) -> bool {
        self.compiler_analyzer(language)
            .is_some_and(|compiler| compiler.id() == analyzer.id())
    }

    /// Descriptor information, queried from the analyzer at most once.
    ///
    /// A failing or panicking descriptor query yields an empty set.
    pub fn diagnostic_info(&self, analyzer: &AnalyzerDescriptor) -> Arc<AnalyzerDiagnosticInfo> {
        let cell = self
            .diagnostic_info
            .entry(analyzer.id().clone())
            .or_default()
            .clone();

        cell.get_or_init(|| {
            let descriptors = match isolation::guard(|| analyzer.analyzer().supported_diagnostics()) {
                Ok(descriptors) => descriptors,
                Err(error) => {
                    warn!(
                        "Analyzer {} failed to report its supported diagnostics: {}",
                        analyzer.id(),
                        error
                    );
                    Vec::new()
                }
            };

            // Built-in status only counts for analyzers that ship with the host
            let builtin = analyzer.is_host_analyzer()
                && (analyzer.is_compiler_analyzer() || analyzer.capabilities().is_builtin);
            let telemetry_eligible = builtin
                || descriptors
                    .first()
                    .is_some_and(|descriptor| descriptor.has_tag(tags::TELEMETRY));
            let ids = descriptors.iter().map(|d| d.id.clone()).collect();

            Arc::new(AnalyzerDiagnosticInfo {
                descriptors,
                ids,
                telemetry_eligible,
            })
        })
        .clone()
    }

    pub fn get_descriptors(&self, analyzer: &AnalyzerDescriptor) -> Vec<DiagnosticDescriptor> {
        self.diagnostic_info(analyzer).descriptors.clone()
    }

    pub fn is_telemetry_eligible(&self, analyzer: &AnalyzerDescriptor) -> bool {
        self.diagnostic_info(analyzer).telemetry_eligible
    }

    /// Whether the analyzer takes part in a pass of `kind`.
    ///
    /// The compiler analyzer supports every kind.
    pub fn supports_kind(&self, analyzer: &AnalyzerDescriptor, kind: AnalysisKind) -> bool {
        if analyzer.is_compiler_analyzer() {
            return true;
        }
        let capabilities = analyzer.capabilities();
        match kind {
            AnalysisKind::Syntax => capabilities.supports_syntax,
            AnalysisKind::Semantic => capabilities.supports_semantic,
            AnalysisKind::NonLocal => capabilities.supports_project,
        }
    }

    /// Every diagnostic id that live analysis of the project can produce
    pub fn live_diagnostic_ids(&self, project: &Project) -> HashSet<String> {
        self.get_analyzers_for_project(project)
            .iter()
            .flat_map(|analyzer| self.diagnostic_info(analyzer).ids.clone())
            .collect()
    }
}

fn register_reference(
    reference: &AnalyzerReference,
    language: &Language,
    origin: AnalyzerOrigin,
    seen: &mut HashSet<AnalyzerId>,
    analyzers: &mut Vec<AnalyzerDescriptor>,
) {
    let mut ordinals: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for handle in reference.analyzers_for(language) {
        let type_name = handle.as_analyzer().type_name();
        let ordinal = ordinals.entry(type_name).or_insert(0);
        let descriptor = AnalyzerDescriptor::register(handle.clone(), reference, origin, *ordinal);
        *ordinal += 1;
        if seen.insert(descriptor.id().clone()) {
            analyzers.push(descriptor);
        }
    }
}
