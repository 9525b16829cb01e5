//! Process-level registry of open workspaces
//!
//! [`EngineHost`] owns what is shared by every workspace (host analyzers, the
//! analyzer driver, configuration) and hands out one [`DiagnosticService`] per
//! open workspace. Handles carry a generation; once a workspace is closed its
//! old handles resolve to [`EngineError::WorkspaceClosed`] even if the same
//! workspace id is opened again.

use anyhow::Result;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::analyzer::AnalyzerReference;
use crate::catalog::HostAnalyzers;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::executor::AnalyzerDriver;
use crate::ids::WorkspaceId;
use crate::logging::{init_tracing, LogBuffer, LogRecord};
use crate::service::DiagnosticService;

/// Reference to one opening of a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkspaceHandle {
    pub workspace: WorkspaceId,
    pub generation: u64,
}

struct WorkspaceSlot {
    generation: u64,
    service: Arc<DiagnosticService>,
}

pub struct EngineHost {
    host_analyzers: Arc<HostAnalyzers>,
    driver: Arc<dyn AnalyzerDriver>,
    config: EngineConfig,
    workspaces: DashMap<WorkspaceId, WorkspaceSlot>,
    generation: AtomicU64,
    logs: Option<LogBuffer>,
}

impl EngineHost {
    pub fn new(
        host_analyzers: Vec<Arc<AnalyzerReference>>,
        driver: Arc<dyn AnalyzerDriver>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            host_analyzers: Arc::new(HostAnalyzers::new(host_analyzers)),
            driver,
            config,
            workspaces: DashMap::new(),
            generation: AtomicU64::new(0),
            logs: None,
        })
    }

    /// Load configuration (file plus `DIAGNOSTICS_*` overrides), install
    /// tracing and create the host
    pub fn from_config_file(
        path: &Path,
        host_analyzers: Vec<Arc<AnalyzerReference>>,
        driver: Arc<dyn AnalyzerDriver>,
    ) -> Result<Self> {
        let config = EngineConfig::load_with_env(path)?;
        let logs = init_tracing(&config.logging);
        let host = Self::new(host_analyzers, driver, config)?;
        Ok(host.with_log_buffer(logs))
    }

    pub fn with_log_buffer(mut self, logs: LogBuffer) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a workspace, or return the handle of the current opening.
    /// Must be called within a Tokio runtime.
    pub fn open_workspace(&self, workspace: WorkspaceId) -> WorkspaceHandle {
        let slot = self.workspaces.entry(workspace).or_insert_with(|| {
            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            info!("Opening workspace {} (generation {})", workspace, generation);
            WorkspaceSlot {
                generation,
                service: Arc::new(DiagnosticService::new(
                    workspace,
                    self.host_analyzers.clone(),
                    self.driver.clone(),
                    &self.config,
                )),
            }
        });
        WorkspaceHandle {
            workspace,
            generation: slot.generation,
        }
    }

    /// The service behind a handle, unless that opening was closed
    pub fn workspace(&self, handle: &WorkspaceHandle) -> EngineResult<Arc<DiagnosticService>> {
        match self.workspaces.get(&handle.workspace) {
            Some(slot) if slot.generation == handle.generation => Ok(slot.service.clone()),
            _ => Err(EngineError::WorkspaceClosed(handle.workspace)),
        }
    }

    pub fn generation(&self, workspace: WorkspaceId) -> Option<u64> {
        self.workspaces.get(&workspace).map(|slot| slot.generation)
    }

    pub fn open_workspaces(&self) -> Vec<WorkspaceId> {
        let mut open: Vec<WorkspaceId> = self.workspaces.iter().map(|slot| *slot.key()).collect();
        open.sort();
        open
    }

    /// Close a workspace and release its cached results.
    ///
    /// Returns `false` if the handle is not the current opening.
    pub async fn close_workspace(&self, handle: &WorkspaceHandle) -> bool {
        let Some((_, slot)) = self
            .workspaces
            .remove_if(&handle.workspace, |_, slot| slot.generation == handle.generation)
        else {
            debug!("Workspace {} is not open in generation {}", handle.workspace, handle.generation);
            return false;
        };
        slot.service.shutdown().await;
        info!("Closed workspace {}", handle.workspace);
        true
    }

    pub async fn shutdown_all(&self) {
        let open: Vec<(WorkspaceId, u64)> = self
            .workspaces
            .iter()
            .map(|slot| (*slot.key(), slot.generation))
            .collect();
        for (workspace, generation) in open {
            self.close_workspace(&WorkspaceHandle {
                workspace,
                generation,
            })
            .await;
        }
    }

    /// Status snapshot of every open workspace
    pub fn status(&self) -> Value {
        let mut workspaces: Vec<(WorkspaceId, u64, Arc<DiagnosticService>)> = self
            .workspaces
            .iter()
            .map(|slot| (*slot.key(), slot.generation, slot.service.clone()))
            .collect();
        workspaces.sort_by_key(|(workspace, _, _)| *workspace);

        let workspaces: Vec<Value> = workspaces
            .into_iter()
            .map(|(workspace, generation, service)| {
                json!({
                    "workspace": workspace.to_string(),
                    "generation": generation,
                    "stats": service.stats(),
                })
            })
            .collect();
        json!({
            "open_workspaces": workspaces.len(),
            "host_analyzer_references": self.host_analyzers.references().len(),
            "workspaces": workspaces,
        })
    }

    /// Most recent captured log records, oldest first
    pub fn recent_logs(&self, count: usize) -> Vec<LogRecord> {
        self.logs
            .as_ref()
            .map(|logs| logs.get_last(count))
            .unwrap_or_default()
    }
}
