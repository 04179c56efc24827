use crate::finding::Finding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Point-in-time throughput snapshot reported by the engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FuzzingMetric {
    pub timestamp: DateTime<Utc>,
    pub executions_per_second: u64,
    pub total_executions: u64,
    pub features: u64,
    pub edges: u64,
    pub corpus_size: u64,
    pub seconds_since_last_feature: u64,
    pub seconds_since_last_edge: u64,
}

/// One event translated from the engine's output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum Report {
    /// The engine started loading `num_seeds` seed inputs.
    Initializing { num_seeds: u64 },
    Running,
    Metric(FuzzingMetric),
    Finding(Box<Finding>),
    /// Corpus locations announced by the engine itself.
    CorpusPaths {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seed_corpus: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generated_corpus: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_serialize_with_tag() {
        let json = serde_json::to_string(&Report::Initializing { num_seeds: 3 }).unwrap();
        assert_eq!(json, r#"{"report":"initializing","num_seeds":3}"#);

        let json = serde_json::to_string(&Report::Running).unwrap();
        assert_eq!(json, r#"{"report":"running"}"#);
    }

    #[test]
    fn finding_report_embeds_finding_fields() {
        let report = Report::Finding(Box::new(Finding {
            name: "brave_otter".to_string(),
            logs: vec!["Oops".to_string()],
            ..Default::default()
        }));

        let value: serde_json::Value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["report"], "finding");
        assert_eq!(value["name"], "brave_otter");
        assert_eq!(value["logs"][0], "Oops");
    }
}
