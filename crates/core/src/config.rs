//! # Configuration
//!
//! One process-wide configuration document, persisted as JSON on disk.
//! `${VAR}` references in the raw document are substituted from the
//! environment before parsing. Runtime updates are written back to disk
//! before they are acknowledged.

use anyhow::{bail, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{AgentId, ModelConfig, Role};

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "CONDUCTOR_CONFIG";

/// Resolve the config file path (`config.json` in the working directory by
/// default).
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"))
}

/// Inclusive delay range in seconds, sampled uniformly before provider calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayRange {
    pub fn sample(&self) -> Duration {
        if self.max_secs <= self.min_secs {
            return Duration::from_secs_f64(self.min_secs.max(0.0));
        }
        let secs = rand::thread_rng().gen_range(self.min_secs..=self.max_secs);
        Duration::from_secs_f64(secs)
    }
}

impl Default for DelayRange {
    fn default() -> Self {
        Self {
            min_secs: 1.0,
            max_secs: 5.0,
        }
    }
}

/// Acceptance rule for one role: weighted metrics against a threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceRule {
    pub threshold: f64,
    /// metric name -> weight; weights must sum to 1.0
    pub weights: BTreeMap<String, f64>,
}

impl ConfidenceRule {
    /// Weighted confidence of a report's metrics. Missing metrics count as 0.
    pub fn score(&self, metrics: &BTreeMap<String, f64>) -> f64 {
        self.weights
            .iter()
            .map(|(name, weight)| weight * metrics.get(name).copied().unwrap_or(0.0))
            .sum()
    }

    pub fn passes(&self, metrics: &BTreeMap<String, f64>) -> bool {
        self.score(metrics) >= self.threshold
    }
}

impl Default for ConfidenceRule {
    fn default() -> Self {
        let mut weights = BTreeMap::new();
        weights.insert("tests_passed".to_string(), 0.7);
        weights.insert("coverage".to_string(), 0.3);
        Self {
            threshold: 0.5,
            weights,
        }
    }
}

/// On-disk locations for logs, the working repository and the structure
/// snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoragePaths {
    pub log_file: PathBuf,
    pub repo_dir: PathBuf,
    pub structure_file: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("logs/conductor.log"),
            repo_dir: PathBuf::from("repo"),
            structure_file: PathBuf::from("structure.json"),
        }
    }
}

/// Supervisor restart policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    /// Abnormal exits tolerated inside the window before the agent is failed
    pub max_restarts: u32,
    pub restart_window_secs: u64,
    /// Grace period before a stopping agent is force-terminated
    pub grace_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_window_secs: 300,
            grace_secs: 5,
        }
    }
}

/// The process-wide configuration record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Natural-language project target
    pub target: String,
    pub web_port: u16,
    /// Where agent processes reach the orchestrator
    pub orchestrator_url: String,
    /// Per-agent model assignment, keyed by agent id
    pub agents: BTreeMap<AgentId, ModelConfig>,
    /// Per-agent pre-request delay ranges
    pub request_delays: BTreeMap<AgentId, DelayRange>,
    /// Per-role acceptance thresholds
    pub confidence: BTreeMap<Role, ConfidenceRule>,
    /// System prompt templates, keyed by role or agent purpose
    pub prompts: BTreeMap<String, String>,
    pub paths: StoragePaths,
    /// How long a worker's claim request may park on an empty queue
    pub worker_poll_timeout_secs: u64,
    /// Claim lease; expired claims are re-enqueued
    pub claim_lease_secs: u64,
    /// Provider attempts per subtask before it is failed
    pub max_attempts: u32,
    /// Pending tasks per role before further enqueues are refused
    pub queue_soft_cap: usize,
    /// In-memory log tail replayed to new subscribers
    pub log_tail_lines: usize,
    pub supervisor: SupervisorConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut agents = BTreeMap::new();
        for agent in AgentId::ALL {
            agents.insert(agent, ModelConfig::default());
        }
        let mut request_delays = BTreeMap::new();
        for agent in AgentId::ALL {
            request_delays.insert(agent, DelayRange::default());
        }
        let mut confidence = BTreeMap::new();
        confidence.insert(Role::Tester, ConfidenceRule::default());
        Self {
            target: String::new(),
            web_port: 7860,
            orchestrator_url: "http://127.0.0.1:7860".to_string(),
            agents,
            request_delays,
            confidence,
            prompts: default_prompts(),
            paths: StoragePaths::default(),
            worker_poll_timeout_secs: 20,
            claim_lease_secs: 240,
            max_attempts: 3,
            queue_soft_cap: 200,
            log_tail_lines: 10_000,
            supervisor: SupervisorConfig::default(),
        }
    }
}

fn default_prompts() -> BTreeMap<String, String> {
    let mut prompts = BTreeMap::new();
    prompts.insert(
        "executor".to_string(),
        "You are an expert programmer. Create the content for the file {filename} based on the \
         following task description. Respond ONLY with the raw file content. Do NOT use markdown \
         code blocks."
            .to_string(),
    );
    prompts.insert(
        "tester".to_string(),
        "You are a testing expert. Generate unit tests for the file {filename}. Start your \
         response with a JSON object of metrics, e.g. {\"tests_passed\": 1.0, \"coverage\": 0.8}, \
         followed by the raw test code. Do NOT use markdown code blocks."
            .to_string(),
    );
    prompts.insert(
        "documenter".to_string(),
        "You are a technical writer. Generate markdown documentation for the file {filename}. \
         Respond ONLY with the raw documentation text. Do NOT use markdown code blocks."
            .to_string(),
    );
    prompts.insert(
        "coordinator_alignment".to_string(),
        "You are a software project planner. Given the project target, respond ONLY with a JSON \
         object describing the file tree: directories map to nested objects, files map to null."
            .to_string(),
    );
    prompts.insert(
        "structurer_alignment".to_string(),
        "You are a software repository architect. Given the project target, respond ONLY with a \
         JSON object describing the file tree: directories map to nested objects, files map to \
         null."
            .to_string(),
    );
    prompts
}

impl OrchestratorConfig {
    /// Load and validate the configuration from `path`, substituting
    /// `${VAR}` references from the environment first.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let substituted = substitute_env(&raw);
        let config: OrchestratorConfig = serde_json::from_str(&substituted)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Persist the configuration to `path` as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file {:?}", path))
    }

    /// Update a single dotted key (e.g. `paths.repo_dir`, `target`) and
    /// re-validate the result.
    pub fn set_key(&self, key: &str, value: serde_json::Value) -> Result<Self> {
        let mut doc = serde_json::to_value(self)?;
        let mut cursor = &mut doc;
        let segments: Vec<&str> = key.split('.').collect();
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            bail!("invalid config key: {key:?}");
        }
        for segment in &segments[..segments.len() - 1] {
            cursor = cursor
                .get_mut(segment)
                .with_context(|| format!("unknown config key segment: {segment:?}"))?;
        }
        let last = segments[segments.len() - 1];
        let obj = cursor
            .as_object_mut()
            .with_context(|| format!("config key {key:?} does not address an object"))?;
        if !obj.contains_key(last) {
            bail!("unknown config key: {key:?}");
        }
        obj.insert(last.to_string(), value);
        let updated: OrchestratorConfig =
            serde_json::from_value(doc).context("updated value has the wrong type")?;
        updated.validate()?;
        Ok(updated)
    }

    /// Reject structurally invalid configuration.
    pub fn validate(&self) -> Result<()> {
        for (role, rule) in &self.confidence {
            let sum: f64 = rule.weights.values().sum();
            if (sum - 1.0).abs() > 1e-3 {
                bail!(
                    "confidence weights for role {role} must sum to 1.0 (got {sum:.3})"
                );
            }
            if !(0.0..=1.0).contains(&rule.threshold) {
                bail!("confidence threshold for role {role} must be in [0, 1]");
            }
        }
        for (agent, delay) in &self.request_delays {
            if delay.min_secs < 0.0 || delay.max_secs < delay.min_secs {
                bail!("invalid request delay range for agent {agent}");
            }
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.claim_lease_secs == 0 {
            bail!("claim_lease_secs must be positive");
        }
        Ok(())
    }

    /// System prompt for a purpose key, with `{filename}` substituted.
    pub fn prompt(&self, key: &str, filename: &str) -> String {
        self.prompts
            .get(key)
            .cloned()
            .unwrap_or_default()
            .replace("{filename}", filename)
    }

    pub fn worker_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_poll_timeout_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }
}

/// Replace `${VAR}` references with environment values. Unknown variables
/// are left as-is so parse errors point at the real problem.
fn substitute_env(raw: &str) -> String {
    let mut out = raw.to_string();
    for (key, value) in std::env::vars() {
        let needle = format!("${{{key}}}");
        if out.contains(&needle) {
            out = out.replace(&needle, &value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        OrchestratorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = OrchestratorConfig::default();
        config.target = "Write add(a, b) in add.py".to_string();
        config.save(&path).unwrap();
        let loaded = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("CONDUCTOR_TEST_TARGET", "build a calculator");
        let raw = r#"{"target": "${CONDUCTOR_TEST_TARGET}"}"#;
        let substituted = substitute_env(raw);
        let config: OrchestratorConfig = serde_json::from_str(&substituted).unwrap();
        assert_eq!(config.target, "build a calculator");
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = OrchestratorConfig::default();
        let rule = config.confidence.get_mut(&Role::Tester).unwrap();
        rule.weights.insert("tests_passed".to_string(), 0.9);
        rule.weights.insert("coverage".to_string(), 0.9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_confidence_scoring() {
        let rule = ConfidenceRule::default();
        let mut metrics = BTreeMap::new();
        metrics.insert("tests_passed".to_string(), 1.0);
        metrics.insert("coverage".to_string(), 0.5);
        assert!((rule.score(&metrics) - 0.85).abs() < 1e-9);
        assert!(rule.passes(&metrics));

        metrics.insert("tests_passed".to_string(), 0.1);
        metrics.insert("coverage".to_string(), 0.0);
        assert!(!rule.passes(&metrics));
    }

    #[test]
    fn test_missing_metrics_count_as_zero() {
        let rule = ConfidenceRule::default();
        assert_eq!(rule.score(&BTreeMap::new()), 0.0);
    }

    #[test]
    fn test_set_key_updates_and_validates() {
        let config = OrchestratorConfig::default();
        let updated = config
            .set_key("target", serde_json::json!("new goal"))
            .unwrap();
        assert_eq!(updated.target, "new goal");

        let updated = config
            .set_key("supervisor.max_restarts", serde_json::json!(9))
            .unwrap();
        assert_eq!(updated.supervisor.max_restarts, 9);

        assert!(config.set_key("no_such_key", serde_json::json!(1)).is_err());
        assert!(config
            .set_key("max_attempts", serde_json::json!(0))
            .is_err());
    }

    #[test]
    fn test_delay_sample_within_range() {
        let range = DelayRange {
            min_secs: 0.0,
            max_secs: 0.01,
        };
        for _ in 0..10 {
            let d = range.sample();
            assert!(d <= Duration::from_millis(11));
        }
    }
}
