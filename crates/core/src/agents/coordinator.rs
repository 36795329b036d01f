//! # Coordinator
//!
//! Turns the target plus the agreed structure plus accumulated reports into
//! a stream of subtasks, then decides acceptance. Three phases: alignment,
//! assignment, completion detection.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{default_tester_metrics, ApiClient};
use crate::config::{ConfidenceRule, DelayRange, OrchestratorConfig};
use crate::models::{AgentId, Role};
use crate::orchestrator::{NewSubtask, Report, TreeProposal};
use crate::providers::{CompletionRequest, ProviderClient};
use crate::repo::FileTree;
use crate::text::extract_json_object;

/// File extensions that get a tester subtask.
const TESTABLE_EXTENSIONS: &[&str] = &["py", "js", "ts", "java", "cpp", "go", "rs", "php"];

/// Where a file's generated tests land, mirroring `tests/<stem>_test.<ext>`.
pub fn test_path_for(filename: &str) -> String {
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext),
        None => (filename, ""),
    };
    let base = stem.rsplit('/').next().unwrap_or(stem);
    if ext.is_empty() {
        format!("tests/{base}_test")
    } else {
        format!("tests/{base}_test.{ext}")
    }
}

/// Where a file's documentation lands.
pub fn doc_path_for(filename: &str) -> String {
    format!("docs/{filename}.md")
}

pub fn is_testable(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| TESTABLE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Progress of one file through the pipeline.
#[derive(Debug, Default, Clone)]
struct FileProgress {
    executor_id: Option<String>,
    executor_accepted: bool,
    testable: bool,
    tester_passed: bool,
    documented: bool,
    refinements: u32,
}

impl FileProgress {
    fn is_done(&self) -> bool {
        self.executor_accepted && (!self.testable || self.tester_passed)
    }
}

/// The planning agent.
pub struct CoordinatorAgent {
    api: ApiClient,
    provider: Box<dyn ProviderClient>,
    target: String,
    alignment_prompt: String,
    delay: DelayRange,
    tester_rule: ConfidenceRule,
    files: BTreeMap<String, FileProgress>,
    poll_interval: Duration,
}

impl CoordinatorAgent {
    pub fn new(
        config: &OrchestratorConfig,
        api: ApiClient,
        provider: Box<dyn ProviderClient>,
    ) -> Self {
        Self {
            api,
            provider,
            target: config.target.clone(),
            alignment_prompt: config
                .prompts
                .get("coordinator_alignment")
                .cloned()
                .unwrap_or_default(),
            delay: config
                .request_delays
                .get(&AgentId::Coordinator)
                .copied()
                .unwrap_or_default(),
            tester_rule: config
                .confidence
                .get(&Role::Tester)
                .cloned()
                .unwrap_or_default(),
            files: BTreeMap::new(),
            poll_interval: Duration::from_secs(5),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(target = %self.target, "coordinator started");
        if self.target.is_empty() {
            anyhow::bail!("no target configured");
        }
        self.api.wait_for_service(Duration::from_secs(60)).await?;

        let tree = self.align().await?;
        self.seed_executor_tasks(&tree).await?;

        loop {
            let _ = self.api.heartbeat(AgentId::Coordinator, None).await;
            match self.api.coordinator_reports().await {
                Ok(reports) => {
                    for report in reports {
                        if let Err(e) = self.handle_report(&report).await {
                            tracing::warn!(
                                id = %report.subtask_id,
                                error = %e,
                                "failed to process report"
                            );
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to fetch reports"),
            }

            if !self.files.is_empty() && self.files.values().all(FileProgress::is_done) {
                tracing::info!("all files accepted and tested, declaring completion");
                self.api.complete_target().await?;
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        // Completion declared; stay alive for heartbeats so the supervisor
        // does not treat a finished pipeline as a crash.
        loop {
            let _ = self.api.heartbeat(AgentId::Coordinator, None).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
    }

    /// Alignment phase: propose a tree, negotiate with the structurer,
    /// settle on one. Single-shot per target.
    async fn align(&mut self) -> Result<FileTree> {
        // A restarted coordinator joins an already-settled alignment
        if let Ok(state) = self.api.alignment().await {
            if let Some(agreed) = state.agreed {
                tracing::info!("alignment already settled, reusing agreed tree");
                return Ok(agreed);
            }
        }

        let own = self.propose_tree().await?;
        let state = self
            .api
            .align_coordinator(&TreeProposal {
                tree: own.clone(),
                finalize: false,
            })
            .await?;
        if let Some(agreed) = state.agreed {
            return Ok(agreed);
        }

        // Give the structurer a window to counter or concur
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let state = self.api.alignment().await?;
            if let Some(agreed) = state.agreed {
                return Ok(agreed);
            }
            if let Some(counter) = state.structurer_tree {
                if counter == own {
                    break;
                }
                // Counter-proposal differs; adopt it only if ours is empty,
                // otherwise assert our own tree.
                if own.is_empty() && !counter.is_empty() {
                    tracing::info!("adopting structurer counter-proposal");
                    let state = self
                        .api
                        .align_coordinator(&TreeProposal {
                            tree: counter,
                            finalize: true,
                        })
                        .await?;
                    return Ok(state.agreed.context("alignment did not settle")?);
                }
                break;
            }
        }

        tracing::info!("asserting coordinator tree");
        let state = self
            .api
            .align_coordinator(&TreeProposal {
                tree: own,
                finalize: true,
            })
            .await?;
        state.agreed.context("alignment did not settle")
    }

    /// Ask the provider for a file-tree proposal.
    async fn propose_tree(&self) -> Result<FileTree> {
        tokio::time::sleep(self.delay.sample()).await;
        let response = self
            .provider
            .complete(&CompletionRequest {
                system: self.alignment_prompt.clone(),
                prompt: format!("Project target:\n{}", self.target),
            })
            .await
            .context("alignment proposal failed")?;
        let value = extract_json_object(&response)
            .context("provider response contained no JSON tree")?;
        let tree: FileTree = serde_json::from_value(value).context("malformed tree proposal")?;
        Ok(tree)
    }

    /// Seed one executor subtask per file of the agreed tree.
    async fn seed_executor_tasks(&mut self, tree: &FileTree) -> Result<()> {
        for filename in tree.files() {
            let text = format!(
                "Implement the required functionality in file: {filename} based on the overall \
                 project goal: {target}",
                target = self.target
            );
            let id = self
                .api
                .enqueue_subtask(&NewSubtask {
                    role: Role::Executor.as_str().to_string(),
                    filename: filename.clone(),
                    text,
                    parent: None,
                    id: None,
                })
                .await?;
            self.files.insert(
                filename.clone(),
                FileProgress {
                    executor_id: Some(id),
                    testable: is_testable(&filename),
                    ..FileProgress::default()
                },
            );
        }
        tracing::info!(files = self.files.len(), "executor subtasks seeded");
        Ok(())
    }

    /// Assignment phase: react to one worker report.
    async fn handle_report(&mut self, report: &Report) -> Result<()> {
        match report.role {
            Role::Executor => self.handle_executor_report(report).await,
            Role::Tester => self.handle_tester_report(report).await,
            Role::Documenter => {
                self.api.mark_accepted(&report.subtask_id).await?;
                if let Some(parent) = report_parent(report) {
                    if let Some(progress) = self.file_by_executor(&parent) {
                        progress.documented = true;
                    }
                }
                Ok(())
            }
        }
    }

    async fn handle_executor_report(&mut self, report: &Report) -> Result<()> {
        let filename = report.filename.clone();
        let Some(progress) = self.files.get(&filename).cloned() else {
            tracing::warn!(filename = %filename, "executor report for unknown file");
            return Ok(());
        };

        if report.payload.trim().is_empty() {
            // Empty payload: low confidence, refine immediately
            tracing::warn!(filename = %filename, "empty executor payload, refining");
            let refined = format!(
                "The previous attempt produced an empty file. Implement the required \
                 functionality in file: {filename} based on the overall project goal: {target}",
                target = self.target
            );
            self.api
                .reject_subtask(&report.subtask_id, &refined)
                .await?;
            return Ok(());
        }

        if progress.testable {
            let text = format!(
                "Generate unit tests for the code in file: {filename}\n\nCode:\n{payload}",
                payload = report.payload
            );
            self.api
                .enqueue_subtask(&NewSubtask {
                    role: Role::Tester.as_str().to_string(),
                    filename: test_path_for(&filename),
                    text,
                    parent: Some(report.subtask_id.clone()),
                    id: None,
                })
                .await?;
        } else {
            // Nothing to test; the executor output stands accepted
            self.api.mark_accepted(&report.subtask_id).await?;
            if let Some(progress) = self.files.get_mut(&filename) {
                progress.executor_accepted = true;
            }
        }

        let doc_text = format!(
            "Generate documentation for the code in file: {filename}\n\nCode:\n{payload}",
            payload = report.payload
        );
        self.api
            .enqueue_subtask(&NewSubtask {
                role: Role::Documenter.as_str().to_string(),
                filename: doc_path_for(&filename),
                text: doc_text,
                parent: Some(report.subtask_id.clone()),
                id: None,
            })
            .await?;
        Ok(())
    }

    async fn handle_tester_report(&mut self, report: &Report) -> Result<()> {
        let metrics = report
            .metrics
            .clone()
            .unwrap_or_else(default_tester_metrics);
        let score = self.tester_rule.score(&metrics);
        let Some(parent) = report_parent(report) else {
            tracing::warn!(id = %report.subtask_id, "tester report without parent executor");
            self.api.mark_accepted(&report.subtask_id).await?;
            return Ok(());
        };

        // The tester itself delivered; its subtask is done either way
        self.api.mark_accepted(&report.subtask_id).await?;

        if self.tester_rule.passes(&metrics) {
            tracing::info!(parent = %parent, score, "tests passed, accepting executor output");
            self.api.mark_accepted(&parent).await?;
            if let Some(progress) = self.file_by_executor(&parent) {
                progress.executor_accepted = true;
                progress.tester_passed = true;
            }
        } else {
            let (filename, refinements) = self
                .files
                .iter_mut()
                .find(|(_, p)| p.executor_id.as_deref() == Some(parent.as_str()))
                .map(|(name, p)| {
                    p.refinements += 1;
                    (name.clone(), p.refinements)
                })
                .unwrap_or_default();
            tracing::warn!(
                parent = %parent,
                score,
                threshold = self.tester_rule.threshold,
                refinements,
                "tests below threshold, refining executor subtask"
            );
            let refined = format!(
                "Rework the implementation of file: {filename}. Generated tests reported low \
                 confidence (score {score:.2} below threshold {threshold:.2}). Project goal: \
                 {target}",
                threshold = self.tester_rule.threshold,
                target = self.target
            );
            // The orchestrator fails the subtask once its attempt budget is
            // spent; the refinement loop ends there.
            self.api.reject_subtask(&parent, &refined).await?;
        }
        Ok(())
    }

    fn file_by_executor(&mut self, executor_id: &str) -> Option<&mut FileProgress> {
        self.files
            .values_mut()
            .find(|p| p.executor_id.as_deref() == Some(executor_id))
    }
}

/// Parent executor subtask of a follow-up report, resolved by the
/// orchestrator when the subtask was created.
fn report_parent(report: &Report) -> Option<String> {
    report.parent.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_path_mapping() {
        assert_eq!(test_path_for("add.py"), "tests/add_test.py");
        assert_eq!(test_path_for("src/core/engine.rs"), "tests/engine_test.rs");
        assert_eq!(test_path_for("Makefile"), "tests/Makefile_test");
    }

    #[test]
    fn test_doc_path_mapping() {
        assert_eq!(doc_path_for("src/main.py"), "docs/src/main.py.md");
    }

    #[test]
    fn test_testable_extensions() {
        assert!(is_testable("add.py"));
        assert!(is_testable("lib.RS"));
        assert!(!is_testable("README.md"));
        assert!(!is_testable("Makefile"));
    }

    #[test]
    fn test_file_progress_completion() {
        let mut progress = FileProgress {
            testable: true,
            ..FileProgress::default()
        };
        assert!(!progress.is_done());
        progress.executor_accepted = true;
        assert!(!progress.is_done());
        progress.tester_passed = true;
        assert!(progress.is_done());

        let untestable = FileProgress {
            testable: false,
            executor_accepted: true,
            ..FileProgress::default()
        };
        assert!(untestable.is_done());
    }
}
