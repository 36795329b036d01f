//! # Agents
//!
//! The long-running processes of the pipeline. Each agent owns one HTTP
//! client to the orchestrator and (except the structurer's gateway) no other
//! shared state.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::models::{AgentId, Role};
use crate::orchestrator::{
    AlignmentState, NewSubtask, Report, ReportSubmission, TreeProposal,
};
use crate::repo::FileTree;

pub mod coordinator;
pub mod structurer;
pub mod worker;

pub use coordinator::CoordinatorAgent;
pub use structurer::StructurerAgent;
pub use worker::WorkerAgent;

/// HTTP client for the orchestrator's agent-facing endpoints.
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

#[derive(Deserialize)]
struct EnqueueAck {
    id: String,
}

#[derive(Deserialize)]
struct ClaimResponse {
    #[serde(default)]
    subtask: Option<crate::orchestrator::Subtask>,
}

#[derive(Deserialize)]
struct StructureResponse {
    #[serde(default)]
    structure: FileTree,
}

impl ApiClient {
    /// `request_timeout` must exceed the orchestrator's worker poll timeout,
    /// otherwise long-polls for work get cut short client-side.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn enqueue_subtask(&self, subtask: &NewSubtask) -> Result<String> {
        let response = self
            .http
            .post(self.url("/subtask"))
            .json(subtask)
            .send()
            .await?
            .error_for_status()?;
        let ack: EnqueueAck = response.json().await?;
        Ok(ack.id)
    }

    /// Long-poll for the next subtask of `role`. `None` when the queue
    /// stayed empty for the orchestrator's poll window.
    pub async fn claim_task(
        &self,
        role: Role,
        worker: &str,
    ) -> Result<Option<crate::orchestrator::Subtask>> {
        let response = self
            .http
            .get(self.url(&format!("/task/{role}")))
            .query(&[("worker", worker)])
            .send()
            .await?
            .error_for_status()?;
        let claim: ClaimResponse = response.json().await?;
        Ok(claim.subtask)
    }

    pub async fn submit_report(&self, report: &ReportSubmission) -> Result<()> {
        self.http
            .post(self.url("/report"))
            .json(report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn mark_accepted(&self, id: &str) -> Result<()> {
        self.http
            .post(self.url("/accept"))
            .json(&json!({ "id": id }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<()> {
        self.http
            .post(self.url("/fail"))
            .json(&json!({ "id": id, "reason": reason }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Reject with refined instructions; the orchestrator re-enqueues or
    /// fails the subtask depending on its attempt budget.
    pub async fn reject_subtask(&self, id: &str, refined_text: &str) -> Result<()> {
        self.http
            .post(self.url("/reject"))
            .json(&json!({ "id": id, "text": refined_text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn heartbeat(&self, agent: AgentId, subtask_id: Option<&str>) -> Result<()> {
        self.http
            .post(self.url(&format!("/heartbeat/{agent}")))
            .json(&json!({ "subtask_id": subtask_id }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn structure(&self) -> Result<FileTree> {
        let response = self
            .http
            .get(self.url("/structure"))
            .send()
            .await?
            .error_for_status()?;
        let body: StructureResponse = response.json().await?;
        Ok(body.structure)
    }

    pub async fn post_structure(&self, tree: &FileTree, commit: Option<&str>) -> Result<()> {
        self.http
            .post(self.url("/structure"))
            .json(&json!({ "structure": tree, "commit": commit }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn alignment(&self) -> Result<AlignmentState> {
        let response = self
            .http
            .get(self.url("/alignment"))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn align_coordinator(&self, proposal: &TreeProposal) -> Result<AlignmentState> {
        let response = self
            .http
            .post(self.url("/alignment/coordinator"))
            .json(proposal)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn align_structurer(&self, proposal: &TreeProposal) -> Result<AlignmentState> {
        let response = self
            .http
            .post(self.url("/alignment/structurer"))
            .json(proposal)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn coordinator_reports(&self) -> Result<Vec<Report>> {
        let response = self
            .http
            .get(self.url("/reports/coordinator"))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn structurer_reports(&self) -> Result<Vec<Report>> {
        let response = self
            .http
            .get(self.url("/reports/structurer"))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn complete_target(&self) -> Result<()> {
        self.http
            .post(self.url("/complete"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Wait for the orchestrator to answer `/health`, with retries; agents
    /// may come up before the service does.
    pub async fn wait_for_service(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.http.get(self.url("/health")).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                _ if tokio::time::Instant::now() >= deadline => {
                    anyhow::bail!("orchestrator did not become healthy in {timeout:?}")
                }
                _ => tokio::time::sleep(Duration::from_secs(2)).await,
            }
        }
    }
}

/// Default metrics when a tester payload carries none, mirroring the
/// "empty metrics" fallback of the report pipeline.
pub fn default_tester_metrics() -> BTreeMap<String, f64> {
    let mut metrics = BTreeMap::new();
    metrics.insert("tests_passed".to_string(), 0.0);
    metrics.insert("coverage".to_string(), 0.0);
    metrics
}
