//! # Structurer
//!
//! Proposes the initial file tree during alignment, then persists every
//! forwarded worker report through the repository gateway and echoes the
//! refreshed snapshot back to the orchestrator. The gateway is exclusively
//! owned here; nothing else writes to the repository.

use anyhow::{Context, Result};
use std::time::Duration;

use super::ApiClient;
use crate::config::{DelayRange, OrchestratorConfig};
use crate::models::AgentId;
use crate::orchestrator::{Report, TreeProposal};
use crate::providers::{CompletionRequest, ProviderClient};
use crate::repo::{FileTree, RepoGateway};
use crate::text::extract_json_object;

pub struct StructurerAgent {
    api: ApiClient,
    provider: Box<dyn ProviderClient>,
    gateway: RepoGateway,
    target: String,
    alignment_prompt: String,
    delay: DelayRange,
    poll_interval: Duration,
}

impl StructurerAgent {
    pub fn new(
        config: &OrchestratorConfig,
        api: ApiClient,
        provider: Box<dyn ProviderClient>,
        gateway: RepoGateway,
    ) -> Self {
        Self {
            api,
            provider,
            gateway,
            target: config.target.clone(),
            alignment_prompt: config
                .prompts
                .get("structurer_alignment")
                .cloned()
                .unwrap_or_default(),
            delay: config
                .request_delays
                .get(&AgentId::Structurer)
                .copied()
                .unwrap_or_default(),
            poll_interval: Duration::from_secs(2),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(target = %self.target, "structurer started");
        self.api.wait_for_service(Duration::from_secs(60)).await?;

        let agreed = self.negotiate().await?;
        self.materialize(&agreed).await?;

        loop {
            let _ = self.api.heartbeat(AgentId::Structurer, None).await;
            match self.api.structurer_reports().await {
                Ok(reports) => {
                    for report in reports {
                        if let Err(e) = self.persist(&report).await {
                            tracing::error!(
                                id = %report.subtask_id,
                                filename = %report.filename,
                                error = %e,
                                "failed to persist report"
                            );
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to fetch reports"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Alignment: propose once, revise at most once on disagreement, then
    /// take the coordinator's tree verbatim.
    async fn negotiate(&mut self) -> Result<FileTree> {
        if let Ok(state) = self.api.alignment().await {
            if let Some(agreed) = state.agreed {
                tracing::info!("alignment already settled");
                return Ok(agreed);
            }
        }

        let own = self.propose_tree(None).await?;
        let state = self
            .api
            .align_structurer(&TreeProposal {
                tree: own.clone(),
                finalize: false,
            })
            .await;
        if let Ok(state) = state {
            if let Some(agreed) = state.agreed {
                return Ok(agreed);
            }
        }

        let mut revised = false;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let state = self.api.alignment().await?;
            if let Some(agreed) = state.agreed {
                // Further disagreement is resolved by adopting this verbatim
                return Ok(agreed);
            }
            if let Some(coordinator_tree) = state.coordinator_tree {
                if coordinator_tree != own && !revised {
                    revised = true;
                    tracing::info!("coordinator disagrees, revising proposal once");
                    let revision = self
                        .propose_tree(Some(&coordinator_tree))
                        .await
                        .unwrap_or(coordinator_tree);
                    if self
                        .api
                        .align_structurer(&TreeProposal {
                            tree: revision,
                            finalize: false,
                        })
                        .await
                        .is_err()
                    {
                        // Alignment settled while we revised; pick it up next tick
                        continue;
                    }
                }
            }
        }
    }

    /// Ask the provider for a tree, optionally revising against the
    /// coordinator's proposal.
    async fn propose_tree(&self, counter: Option<&FileTree>) -> Result<FileTree> {
        tokio::time::sleep(self.delay.sample()).await;
        let prompt = match counter {
            Some(tree) => format!(
                "Project target:\n{target}\n\nThe coordinator proposes this tree:\n{tree}\n\n\
                 Revise your proposal, keeping every file the coordinator needs.",
                target = self.target,
                tree = serde_json::to_string_pretty(tree)?
            ),
            None => format!("Project target:\n{}", self.target),
        };
        let response = self
            .provider
            .complete(&CompletionRequest {
                system: self.alignment_prompt.clone(),
                prompt,
            })
            .await
            .context("structure proposal failed")?;
        let value = extract_json_object(&response)
            .context("provider response contained no JSON tree")?;
        serde_json::from_value(value).context("malformed tree proposal")
    }

    /// Create placeholder files for the agreed tree, commit, and publish the
    /// first snapshot.
    async fn materialize(&mut self, tree: &FileTree) -> Result<()> {
        for filename in tree.files() {
            if self.gateway.read(&filename).is_err() {
                self.gateway.write(&filename, b"")?;
            }
        }
        self.gateway.commit("structurer: initial project structure")?;
        let snapshot = self.gateway.tree()?;
        self.api
            .post_structure(&snapshot, Some("structurer: initial project structure"))
            .await?;
        tracing::info!(files = tree.files().len(), "structure materialized");
        Ok(())
    }

    /// Persist one worker report: write, commit, re-enumerate, publish.
    async fn persist(&mut self, report: &Report) -> Result<()> {
        let message = format!(
            "{role}: update {filename} (subtask {id})",
            role = report.role,
            filename = report.filename,
            id = report.subtask_id
        );
        self.gateway
            .write(&report.filename, report.payload.as_bytes())?;
        self.gateway.commit(&message)?;
        let snapshot = self.gateway.tree()?;
        self.api.post_structure(&snapshot, Some(&message)).await?;
        tracing::info!(filename = %report.filename, "report persisted and committed");
        Ok(())
    }
}
