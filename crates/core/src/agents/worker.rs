//! # Role Worker
//!
//! One loop, parameterized by role: claim a subtask, call the provider,
//! clean the payload, report back. Provider errors are retried locally with
//! doubling backoff; exhausted retries fail the subtask so the claim never
//! dangles.

use anyhow::Result;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::{default_tester_metrics, ApiClient};
use crate::config::{DelayRange, OrchestratorConfig};
use crate::models::{AgentId, Role};
use crate::orchestrator::{ReportSubmission, Subtask};
use crate::providers::{CompletionRequest, ProviderClient, ProviderError};
use crate::text::{looks_binary, strip_code_fences};

const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Backoff before attempt `attempt` (0-based): a uniform sample from the
/// role's delay range, doubled per retry, bounded.
pub fn backoff_delay(range: DelayRange, attempt: u32) -> Duration {
    let base = range.sample();
    let scaled = base * 2u32.pow(attempt.min(6));
    scaled.min(BACKOFF_CAP)
}

/// Split a tester payload into its leading metrics object and the test code
/// that follows. Payloads without metrics fall back to zeroed defaults.
pub fn split_tester_payload(payload: &str) -> (BTreeMap<String, f64>, String) {
    let trimmed = payload.trim_start();
    if trimmed.starts_with('{') {
        let mut depth = 0usize;
        for (i, c) in trimmed.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let (head, rest) = trimmed.split_at(i + 1);
                        if let Ok(value) =
                            serde_json::from_str::<serde_json::Value>(head)
                        {
                            let metrics: BTreeMap<String, f64> = value
                                .as_object()
                                .map(|obj| {
                                    obj.iter()
                                        .filter_map(|(k, v)| {
                                            v.as_f64().map(|f| (k.clone(), f))
                                        })
                                        .collect()
                                })
                                .unwrap_or_default();
                            if !metrics.is_empty() {
                                return (metrics, rest.trim_start().to_string());
                            }
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    (default_tester_metrics(), payload.to_string())
}

/// A worker process for one role.
pub struct WorkerAgent {
    role: Role,
    worker_id: String,
    api: ApiClient,
    provider: Box<dyn ProviderClient>,
    system_prompt: String,
    delay: DelayRange,
    max_attempts: u32,
    idle_sleep: Duration,
}

impl WorkerAgent {
    pub fn new(
        role: Role,
        config: &OrchestratorConfig,
        api: ApiClient,
        provider: Box<dyn ProviderClient>,
    ) -> Self {
        let agent = AgentId::from(role);
        Self {
            role,
            worker_id: format!("{role}-{}", std::process::id()),
            api,
            provider,
            system_prompt: config.prompts.get(role.as_str()).cloned().unwrap_or_default(),
            delay: config.request_delays.get(&agent).copied().unwrap_or_default(),
            max_attempts: config.max_attempts.max(1),
            idle_sleep: Duration::from_secs(2),
        }
    }

    /// Claim/process/report until the process is terminated.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(role = %self.role, worker = %self.worker_id, "worker started");
        self.api.wait_for_service(Duration::from_secs(60)).await?;
        loop {
            let subtask = match self.api.claim_task(self.role, &self.worker_id).await {
                Ok(Some(subtask)) => subtask,
                Ok(None) => continue, // poll window elapsed, re-ask
                Err(e) => {
                    tracing::warn!(role = %self.role, error = %e, "claim failed, backing off");
                    tokio::time::sleep(self.idle_sleep).await;
                    continue;
                }
            };
            let _ = self
                .api
                .heartbeat(AgentId::from(self.role), Some(&subtask.id))
                .await;
            self.process(&subtask).await;
        }
    }

    /// Handle one claimed subtask end to end.
    async fn process(&self, subtask: &Subtask) {
        tracing::info!(
            role = %self.role,
            id = %subtask.id,
            filename = %subtask.filename,
            "processing subtask"
        );
        let started = Instant::now();
        match self.generate(subtask).await {
            Ok(payload) => {
                let cleaned = strip_code_fences(&payload);
                if looks_binary(&cleaned) {
                    tracing::warn!(id = %subtask.id, "provider returned binary payload");
                    let _ = self.api.mark_failed(&subtask.id, "BinaryPayload").await;
                    return;
                }
                let (metrics, payload) = if self.role == Role::Tester {
                    let (metrics, rest) = split_tester_payload(&cleaned);
                    (Some(metrics), rest)
                } else {
                    (None, cleaned)
                };
                let report = ReportSubmission {
                    role: self.role.as_str().to_string(),
                    subtask_id: subtask.id.clone(),
                    filename: subtask.filename.clone(),
                    payload,
                    metrics,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                if let Err(e) = self.api.submit_report(&report).await {
                    tracing::error!(id = %subtask.id, error = %e, "failed to submit report");
                    let _ = self
                        .api
                        .mark_failed(&subtask.id, &format!("report submission failed: {e}"))
                        .await;
                    return;
                }
                let _ = self
                    .api
                    .heartbeat(AgentId::from(self.role), Some(&subtask.id))
                    .await;
            }
            Err(e) => {
                tracing::error!(id = %subtask.id, error = %e, "subtask failed after retries");
                let _ = self.api.mark_failed(&subtask.id, &e.to_string()).await;
            }
        }
    }

    /// Provider call with local retry: transient errors back off and retry
    /// up to the attempt budget, the rest surface immediately.
    async fn generate(&self, subtask: &Subtask) -> Result<String, ProviderError> {
        let request = CompletionRequest {
            system: self.system_prompt.replace("{filename}", &subtask.filename),
            prompt: subtask.text.clone(),
        };
        let mut last_error = ProviderError::Invalid("no attempts made".to_string());
        for attempt in 0..self.max_attempts {
            tokio::time::sleep(backoff_delay(self.delay, attempt)).await;
            match self.provider.complete(&request).await {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        id = %subtask.id,
                        attempt = attempt + 1,
                        error = %e,
                        "provider error, will retry"
                    );
                    let _ = self
                        .api
                        .heartbeat(AgentId::from(self.role), Some(&subtask.id))
                        .await;
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let range = DelayRange {
            min_secs: 2.0,
            max_secs: 2.0,
        };
        assert_eq!(backoff_delay(range, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(range, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(range, 2), Duration::from_secs(8));
        // Bounded regardless of attempt count
        assert_eq!(backoff_delay(range, 12), Duration::from_secs(60));
    }

    #[test]
    fn test_tester_payload_with_metrics() {
        let payload = "{\"tests_passed\": 1.0, \"coverage\": 0.8}\nimport unittest\n";
        let (metrics, rest) = split_tester_payload(payload);
        assert_eq!(metrics["tests_passed"], 1.0);
        assert_eq!(metrics["coverage"], 0.8);
        assert_eq!(rest, "import unittest\n");
    }

    #[test]
    fn test_tester_payload_without_metrics() {
        let payload = "import unittest\n\nclass TestAdd(unittest.TestCase):\n    pass\n";
        let (metrics, rest) = split_tester_payload(payload);
        assert_eq!(metrics["tests_passed"], 0.0);
        assert_eq!(metrics["coverage"], 0.0);
        assert_eq!(rest, payload);
    }

    #[test]
    fn test_tester_payload_with_nested_braces() {
        let payload = "{\"tests_passed\": 0.5}\nfn t() { let x = {}; }";
        let (metrics, rest) = split_tester_payload(payload);
        assert_eq!(metrics["tests_passed"], 0.5);
        assert!(rest.starts_with("fn t()"));
    }

    #[test]
    fn test_non_numeric_metrics_are_skipped() {
        let payload = "{\"note\": \"flaky\", \"tests_passed\": 0.9}\ncode";
        let (metrics, _) = split_tester_payload(payload);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics["tests_passed"], 0.9);
    }
}
