//! Analyzer execution telemetry
//!
//! Only analyzers the catalog marks as telemetry-eligible are recorded; the
//! rest are dropped so third-party analyzer names never leave the process.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::analyzer::AnalyzerId;

/// Execution counters for one analyzer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerTelemetry {
    pub executions: u64,
    pub elapsed: Duration,
    pub diagnostics_reported: u64,
    pub failures: u64,
}

impl AnalyzerTelemetry {
    pub fn merge(&mut self, other: &AnalyzerTelemetry) {
        self.executions += other.executions;
        self.elapsed += other.elapsed;
        self.diagnostics_reported += other.diagnostics_reported;
        self.failures += other.failures;
    }
}

/// Aggregated telemetry for one workspace
#[derive(Debug, Default)]
pub struct TelemetryCollector {
    per_analyzer: DashMap<AnalyzerId, AnalyzerTelemetry>,
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, analyzer: &AnalyzerId, telemetry: &AnalyzerTelemetry) {
        self.per_analyzer
            .entry(analyzer.clone())
            .or_default()
            .merge(telemetry);
    }

    pub fn get(&self, analyzer: &AnalyzerId) -> Option<AnalyzerTelemetry> {
        self.per_analyzer.get(analyzer).map(|entry| entry.clone())
    }

    pub fn snapshot(&self) -> Vec<(AnalyzerId, AnalyzerTelemetry)> {
        let mut entries: Vec<_> = self
            .per_analyzer
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn clear(&self) {
        self.per_analyzer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalyzerReferenceId;

    #[test]
    fn test_record_merges() {
        let collector = TelemetryCollector::new();
        let id = AnalyzerId::derive("A", &AnalyzerReferenceId::new("r"), "1", 0);
        let sample = AnalyzerTelemetry {
            executions: 1,
            elapsed: Duration::from_millis(5),
            diagnostics_reported: 2,
            failures: 0,
        };
        collector.record(&id, &sample);
        collector.record(&id, &sample);

        let total = collector.get(&id).unwrap();
        assert_eq!(total.executions, 2);
        assert_eq!(total.elapsed, Duration::from_millis(10));
        assert_eq!(collector.snapshot().len(), 1);
    }
}
