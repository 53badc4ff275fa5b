//! Configuration values.
//!
//! Nothing in the crate reads global defaults: executors, REW executors and
//! the task graph are built from these values and passed along explicitly.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::{
    EagerRestrictionStrategy, RestrictionStrategyFactory, TaskGraphExecutorProperties,
    WeakLeafsOfEndNodesRestrictingStrategy,
};
use crate::error::ConfigError;
use crate::executor::ThreadPoolExecutor;
use crate::rew::AutoReportRewQueryExecutor;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    pub executor: ExecutorConfig,
    pub rew: RewConfig,
    pub graph: GraphConfig,
}

impl ToolkitConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker count; rayon picks one per core when absent.
    pub threads: Option<usize>,
    pub thread_name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            threads: None,
            thread_name: String::from("jtrim-worker"),
        }
    }
}

impl ExecutorConfig {
    pub fn build(&self) -> Result<ThreadPoolExecutor, ConfigError> {
        ThreadPoolExecutor::new(self)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RewConfig {
    /// How often the state of a running query is forwarded to the task.
    pub report_period_ms: u64,
}

impl Default for RewConfig {
    fn default() -> Self {
        Self {
            report_period_ms: 100,
        }
    }
}

impl RewConfig {
    pub fn report_period(&self) -> Duration {
        Duration::from_millis(self.report_period_ms)
    }

    pub fn build(&self) -> AutoReportRewQueryExecutor {
        AutoReportRewQueryExecutor::new(self.report_period())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub stop_on_failure: bool,
    pub deliver_result_on_failure: bool,
    /// Approximate budget of retained leaf outputs. Unrestricted when absent.
    pub max_retained_leaf_nodes: Option<usize>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            stop_on_failure: false,
            deliver_result_on_failure: false,
            max_retained_leaf_nodes: None,
        }
    }
}

impl GraphConfig {
    pub fn properties(&self) -> TaskGraphExecutorProperties {
        TaskGraphExecutorProperties {
            stop_on_failure: self.stop_on_failure,
            deliver_result_on_failure: self.deliver_result_on_failure,
            ..Default::default()
        }
    }

    pub fn restriction_strategy(&self) -> Box<dyn RestrictionStrategyFactory> {
        match self.max_retained_leaf_nodes {
            Some(max) => Box::new(WeakLeafsOfEndNodesRestrictingStrategy::new(max)),
            None => Box::new(EagerRestrictionStrategy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let config = ToolkitConfig::from_json("{}").unwrap();
        assert_eq!(config.executor.threads, None);
        assert_eq!(config.executor.thread_name, "jtrim-worker");
        assert_eq!(config.rew.report_period(), Duration::from_millis(100));
        assert!(!config.graph.stop_on_failure);
        assert!(config.graph.max_retained_leaf_nodes.is_none());
    }

    #[test]
    fn test_partial_override() {
        let config = ToolkitConfig::from_json(
            r#"{ "executor": { "threads": 3 }, "graph": { "max_retained_leaf_nodes": 8 } }"#,
        )
        .unwrap();
        assert_eq!(config.executor.threads, Some(3));
        assert_eq!(config.executor.thread_name, "jtrim-worker");
        assert_eq!(config.graph.max_retained_leaf_nodes, Some(8));
        assert_eq!(config.executor.build().unwrap().current_num_threads(), 3);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            ToolkitConfig::from_json("{ not json"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ToolkitConfig::from_file("/definitely/not/here.json"),
            Err(ConfigError::FileSystem(_))
        ));
    }
}
