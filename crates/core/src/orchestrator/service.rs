//! # Orchestrator Service
//!
//! The single owner of queues, ledger, structure snapshot, subscriber set
//! and agent run-states. Every operation broadcasts the matching delta to
//! push-channel subscribers after its state change commits.
//!
//! Lock order (when more than one is needed): ledger, queues, structure,
//! charts, run_states, logs. Broadcasts happen after all guards are
//! released.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::events::{ChartData, ProgressData, PushMessage, QueueTask, SpecificFields};
use super::ledger::{Ledger, OrchestratorError, Report, Subtask, SubtaskStatus};
use super::queue::QueueSet;
use super::subscribers::{SubscriberHub, Subscription};
use crate::config::OrchestratorConfig;
use crate::models::{AgentId, Role};
use crate::repo::FileTree;

const PROCESSED_HISTORY_LEN: usize = 100;
const GIT_ACTIVITY_LEN: usize = 50;

/// Live view of one agent, as shown in the UI.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentRunState {
    pub running: bool,
    /// Respawn budget exhausted; operator intervention required
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Structure negotiation between coordinator and structurer. Single-shot
/// per target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlignmentState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator_tree: Option<FileTree>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structurer_tree: Option<FileTree>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreed: Option<FileTree>,
    pub structurer_posts: u32,
}

/// Body of `POST /subtask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubtask {
    pub role: String,
    pub filename: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Stable id; assigned if absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Body of `POST /report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSubmission {
    pub role: String,
    pub subtask_id: String,
    pub filename: String,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Body of the alignment endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeProposal {
    pub tree: FileTree,
    #[serde(default)]
    pub finalize: bool,
}

#[derive(Default)]
struct ChartHistory {
    processed_total: u64,
    processed_over_time: VecDeque<u64>,
    git_activity: VecDeque<String>,
}

/// The state of record for the whole pipeline.
pub struct Orchestrator {
    config: RwLock<OrchestratorConfig>,
    config_file: PathBuf,
    ledger: Mutex<Ledger>,
    queues: QueueSet,
    structure: Mutex<FileTree>,
    alignment: Mutex<AlignmentState>,
    run_states: Mutex<BTreeMap<AgentId, AgentRunState>>,
    charts: Mutex<ChartHistory>,
    logs: Mutex<VecDeque<String>>,
    coordinator_feed: Mutex<VecDeque<Report>>,
    structurer_feed: Mutex<VecDeque<Report>>,
    hub: Arc<SubscriberHub>,
    accepting_claims: AtomicBool,
    target_complete: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, config_file: PathBuf) -> Arc<Self> {
        let mut run_states = BTreeMap::new();
        for agent in AgentId::ALL {
            run_states.insert(agent, AgentRunState::default());
        }
        Arc::new(Self {
            config: RwLock::new(config),
            config_file,
            ledger: Mutex::new(Ledger::new()),
            queues: QueueSet::new(),
            structure: Mutex::new(FileTree::new()),
            alignment: Mutex::new(AlignmentState::default()),
            run_states: Mutex::new(run_states),
            charts: Mutex::new(ChartHistory::default()),
            logs: Mutex::new(VecDeque::new()),
            coordinator_feed: Mutex::new(VecDeque::new()),
            structurer_feed: Mutex::new(VecDeque::new()),
            hub: Arc::new(SubscriberHub::new(256)),
            accepting_claims: AtomicBool::new(true),
            target_complete: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> OrchestratorConfig {
        self.config.read().clone()
    }

    /// Replace the whole configuration; persisted before acknowledging.
    pub fn update_config(&self, new: OrchestratorConfig) -> anyhow::Result<()> {
        new.validate()?;
        new.save(&self.config_file)?;
        *self.config.write() = new;
        Ok(())
    }

    /// Update one dotted config key; persisted before acknowledging.
    pub fn update_config_item(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> anyhow::Result<OrchestratorConfig> {
        let updated = self.config.read().set_key(key, value)?;
        updated.save(&self.config_file)?;
        *self.config.write() = updated.clone();
        Ok(updated)
    }

    // === Subscribers ===

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    fn broadcast(&self, message: PushMessage) {
        self.hub.broadcast(&message);
    }

    // === Logging ===

    /// Append a raw log line (ANSI preserved) and fan it out.
    pub fn log_line(&self, line: String) {
        let cap = self.config.read().log_tail_lines;
        {
            let mut logs = self.logs.lock();
            logs.push_back(line.clone());
            while logs.len() > cap {
                logs.pop_front();
            }
        }
        self.broadcast(PushMessage::LogUpdate { line });
    }

    /// Recent log lines for replay to a new subscriber.
    pub fn log_tail(&self, max: usize) -> Vec<String> {
        let logs = self.logs.lock();
        logs.iter()
            .skip(logs.len().saturating_sub(max))
            .cloned()
            .collect()
    }

    // === Subtask lifecycle ===

    /// Enqueue a subtask from the coordinator.
    pub fn enqueue_subtask(&self, req: NewSubtask) -> Result<Subtask, OrchestratorError> {
        let role = Role::parse(&req.role)
            .ok_or_else(|| OrchestratorError::UnknownRole(req.role.clone()))?;
        if !is_safe_filename(&req.filename) {
            return Err(OrchestratorError::UnsafePath(req.filename));
        }
        let soft_cap = self.config.read().queue_soft_cap;
        if self.queues.pending_len(role) >= soft_cap {
            return Err(OrchestratorError::QueueSaturated(role));
        }
        let subtask = Subtask {
            id: req.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            role,
            filename: req.filename,
            text: req.text,
            status: SubtaskStatus::Pending,
            attempts: 0,
            last_error: None,
            parent: req.parent,
            created_at: Utc::now(),
        };
        self.ledger.lock().insert(subtask.clone())?;
        self.queues.push(role, subtask.id.clone());
        tracing::info!(
            id = %subtask.id,
            role = %role,
            filename = %subtask.filename,
            "subtask enqueued"
        );
        self.broadcast_queue_delta(role, Some((&subtask.id, SubtaskStatus::Pending)));
        Ok(subtask)
    }

    /// Claim the next subtask for a role, suspending up to the configured
    /// worker poll timeout when the queue is empty.
    pub async fn claim_next(
        &self,
        role: &str,
        worker: &str,
    ) -> Result<Option<Subtask>, OrchestratorError> {
        let role =
            Role::parse(role).ok_or_else(|| OrchestratorError::UnknownRole(role.to_string()))?;
        if !self.accepting_claims.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let timeout = self.config.read().worker_poll_timeout();
        let Some(id) = self.queues.claim(role, worker, timeout).await else {
            return Ok(None);
        };
        let subtask = {
            let mut ledger = self.ledger.lock();
            match ledger.begin_processing(&id) {
                Ok(task) => task.clone(),
                Err(e) => {
                    // Ledger refused the claim (e.g. failed by the sweeper in
                    // between); drop it rather than hand out stale work.
                    tracing::warn!(id = %id, error = %e, "dropping unclaimable queue entry");
                    self.queues.release(role, &id);
                    return Ok(None);
                }
            }
        };
        self.touch_agent(AgentId::from(role));
        tracing::info!(id = %id, role = %role, worker = %worker, "subtask claimed");
        self.broadcast_queue_delta(role, Some((&id, SubtaskStatus::Processing)));
        Ok(Some(subtask))
    }

    /// Accept a worker report: validates ownership, advances the subtask to
    /// `code_received` and routes the report to structurer and coordinator.
    pub fn submit_report(&self, sub: ReportSubmission) -> Result<(), OrchestratorError> {
        let role = Role::parse(&sub.role)
            .ok_or_else(|| OrchestratorError::UnknownRole(sub.role.clone()))?;
        let report = {
            let mut ledger = self.ledger.lock();
            let parent = ledger.get(&sub.subtask_id).and_then(|t| t.parent.clone());
            let report = Report {
                subtask_id: sub.subtask_id.clone(),
                role,
                filename: sub.filename,
                payload: sub.payload,
                metrics: sub.metrics,
                parent,
                duration_ms: sub.duration_ms,
            };
            ledger.record_report(report.clone())?;
            report
        };
        self.queues.release(role, &report.subtask_id);
        self.structurer_feed.lock().push_back(report.clone());
        self.coordinator_feed.lock().push_back(report.clone());
        self.touch_agent(AgentId::from(role));
        tracing::info!(
            id = %report.subtask_id,
            role = %role,
            filename = %report.filename,
            duration_ms = report.duration_ms,
            "report received"
        );
        self.broadcast_subtask_status(&sub.subtask_id, SubtaskStatus::CodeReceived);
        Ok(())
    }

    /// `code_received -> accepted`, idempotent. Emits a delta only when the
    /// status actually changed.
    pub fn mark_accepted(&self, id: &str) -> Result<bool, OrchestratorError> {
        let changed = self.ledger.lock().accept(id)?;
        if changed {
            let history = {
                let mut charts = self.charts.lock();
                charts.processed_total += 1;
                let processed_total = charts.processed_total;
                charts.processed_over_time.push_back(processed_total);
                while charts.processed_over_time.len() > PROCESSED_HISTORY_LEN {
                    charts.processed_over_time.pop_front();
                }
                charts.processed_over_time.iter().copied().collect()
            };
            tracing::info!(id = %id, "subtask accepted");
            self.broadcast(PushMessage::specific(SpecificFields {
                subtasks: Some(BTreeMap::from([(
                    id.to_string(),
                    SubtaskStatus::Accepted,
                )])),
                processed_over_time: Some(history),
                ..Default::default()
            }));
        }
        Ok(changed)
    }

    /// Terminal failure, from the coordinator or a worker out of retries.
    pub fn mark_failed(&self, id: &str, reason: &str) -> Result<(), OrchestratorError> {
        self.ledger.lock().fail(id, reason)?;
        if let Some(role) = self.ledger.lock().get(id).map(|t| t.role) {
            self.queues.release(role, id);
        }
        tracing::warn!(id = %id, reason = %reason, "subtask failed");
        self.broadcast_subtask_status(id, SubtaskStatus::Failed);
        Ok(())
    }

    /// Coordinator rejection: refine and re-enqueue, or fail once the
    /// attempt budget is spent.
    pub fn reject_subtask(
        &self,
        id: &str,
        refined_text: &str,
    ) -> Result<SubtaskStatus, OrchestratorError> {
        let max_attempts = self.config.read().max_attempts;
        let (status, role) = {
            let mut ledger = self.ledger.lock();
            let status = ledger.reject(id, refined_text, max_attempts)?;
            let role = ledger.get(id).map(|t| t.role);
            (status, role)
        };
        if status == SubtaskStatus::Pending {
            if let Some(role) = role {
                self.queues.push(role, id.to_string());
            }
        }
        tracing::info!(id = %id, status = status.as_str(), "subtask rejected by coordinator");
        self.broadcast_subtask_status(id, status);
        Ok(status)
    }

    pub fn subtask_status(&self, id: &str) -> Option<SubtaskStatus> {
        self.ledger.lock().status_of(id)
    }

    pub fn all_subtask_statuses(&self) -> BTreeMap<String, SubtaskStatus> {
        self.ledger.lock().statuses()
    }

    pub fn subtask(&self, id: &str) -> Option<Subtask> {
        self.ledger.lock().get(id).cloned()
    }

    // === Report feeds ===

    pub fn drain_structurer_reports(&self) -> Vec<Report> {
        self.structurer_feed.lock().drain(..).collect()
    }

    pub fn drain_coordinator_reports(&self) -> Vec<Report> {
        self.coordinator_feed.lock().drain(..).collect()
    }

    // === Structure ===

    /// Replace the structure snapshot (from the structurer).
    pub fn update_structure(
        &self,
        tree: FileTree,
        commit: Option<String>,
    ) -> Result<(), OrchestratorError> {
        if self.target_complete.load(Ordering::SeqCst) {
            // Protocol violation: structure posts after completion change nothing
            tracing::warn!("rejected structure update for completed target");
            return Err(OrchestratorError::TargetComplete);
        }
        *self.structure.lock() = tree.clone();
        let git_activity = commit.map(|message| {
            let mut charts = self.charts.lock();
            charts.git_activity.push_back(message);
            while charts.git_activity.len() > GIT_ACTIVITY_LEN {
                charts.git_activity.pop_front();
            }
            charts.git_activity.iter().cloned().collect::<Vec<_>>()
        });
        self.persist_structure(&tree);
        self.broadcast(PushMessage::StructureUpdate { structure: tree });
        if let Some(git_activity) = git_activity {
            self.broadcast(PushMessage::specific(SpecificFields {
                git_activity: Some(git_activity),
                ..Default::default()
            }));
        }
        Ok(())
    }

    pub fn structure(&self) -> FileTree {
        self.structure.lock().clone()
    }

    fn persist_structure(&self, tree: &FileTree) {
        let path = self.config.read().paths.structure_file.clone();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        match serde_json::to_string_pretty(tree) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::warn!(path = ?path, error = %e, "failed to persist structure snapshot");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize structure snapshot"),
        }
    }

    // === Alignment ===

    /// Coordinator's proposal. Finalizing (or matching the structurer's
    /// proposal) settles the negotiation.
    pub fn align_coordinator(&self, proposal: TreeProposal) -> AlignmentState {
        let mut alignment = self.alignment.lock();
        if alignment.agreed.is_none() {
            if proposal.finalize
                || alignment.structurer_tree.as_ref() == Some(&proposal.tree)
            {
                alignment.agreed = Some(proposal.tree.clone());
            }
            alignment.coordinator_tree = Some(proposal.tree);
        }
        alignment.clone()
    }

    /// Structurer's proposal or single revision. Rejected once settled.
    pub fn align_structurer(
        &self,
        proposal: TreeProposal,
    ) -> Result<AlignmentState, OrchestratorError> {
        let mut alignment = self.alignment.lock();
        if alignment.agreed.is_some() {
            return Err(OrchestratorError::AlignmentClosed);
        }
        alignment.structurer_posts += 1;
        if alignment.coordinator_tree.as_ref() == Some(&proposal.tree) {
            alignment.agreed = Some(proposal.tree.clone());
        }
        alignment.structurer_tree = Some(proposal.tree);
        Ok(alignment.clone())
    }

    pub fn alignment(&self) -> AlignmentState {
        self.alignment.lock().clone()
    }

    // === Agent run-states ===

    /// Heartbeat from an agent; optionally renews a claim lease.
    pub fn heartbeat(
        &self,
        agent: &str,
        subtask_id: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let agent = AgentId::parse(agent)
            .ok_or_else(|| OrchestratorError::UnknownAgent(agent.to_string()))?;
        self.touch_agent(agent);
        if let (Some(role), Some(id)) = (agent.role(), subtask_id) {
            self.queues.renew(role, id);
        }
        Ok(())
    }

    fn touch_agent(&self, agent: AgentId) {
        let mut states = self.run_states.lock();
        let state = states.entry(agent).or_default();
        state.last_heartbeat = Some(Utc::now());
    }

    /// Supervisor updates; broadcast as a `status_update`.
    pub fn set_agent_state(
        &self,
        agent: AgentId,
        running: bool,
        failed: bool,
        error: Option<String>,
    ) {
        {
            let mut states = self.run_states.lock();
            let state = states.entry(agent).or_default();
            state.running = running;
            state.failed = failed;
            if !running {
                state.last_heartbeat = None;
            }
            if running {
                state.failed = false;
            }
            if error.is_some() {
                state.last_error = error;
            }
        }
        self.broadcast(PushMessage::StatusUpdate {
            ai_status: self.agent_states(),
        });
    }

    pub fn record_agent_restart(&self, agent: AgentId) {
        let mut states = self.run_states.lock();
        states.entry(agent).or_default().restarts += 1;
    }

    pub fn agent_states(&self) -> BTreeMap<String, AgentRunState> {
        self.run_states
            .lock()
            .iter()
            .map(|(agent, state)| (agent.as_str().to_string(), state.clone()))
            .collect()
    }

    // === Pipeline controls ===

    pub fn set_accepting_claims(&self, accepting: bool) {
        self.accepting_claims.store(accepting, Ordering::SeqCst);
    }

    /// Coordinator declares the target complete.
    pub fn complete_target(&self) {
        self.target_complete.store(true, Ordering::SeqCst);
        tracing::info!("target complete");
        self.broadcast(PushMessage::specific(SpecificFields {
            target_complete: Some(true),
            ..Default::default()
        }));
    }

    pub fn is_target_complete(&self) -> bool {
        self.target_complete.load(Ordering::SeqCst)
    }

    /// Operator reset: retire the ledger, queues, feeds, charts and logs.
    pub fn reset(&self) {
        self.ledger.lock().clear();
        self.queues.clear();
        self.coordinator_feed.lock().clear();
        self.structurer_feed.lock().clear();
        *self.structure.lock() = FileTree::new();
        *self.alignment.lock() = AlignmentState::default();
        *self.charts.lock() = ChartHistory::default();
        self.logs.lock().clear();
        self.target_complete.store(false, Ordering::SeqCst);
        self.accepting_claims.store(true, Ordering::SeqCst);
        let log_file = self.config.read().paths.log_file.clone();
        if log_file.exists() {
            let _ = std::fs::write(&log_file, b"");
        }
        tracing::warn!("orchestrator state cleared");
        let full = self.full_status();
        self.broadcast(full);
    }

    /// Clear only the structure snapshot (after a repository reset).
    pub fn clear_structure(&self) {
        *self.structure.lock() = FileTree::new();
        self.broadcast(PushMessage::StructureUpdate {
            structure: FileTree::new(),
        });
    }

    // === Snapshots and deltas ===

    fn queue_view(&self, role: Role) -> Vec<QueueTask> {
        let ids = self.queues.pending_ids(role);
        let ledger = self.ledger.lock();
        ids.iter()
            .filter_map(|id| ledger.get(id))
            .map(|task| QueueTask {
                id: task.id.clone(),
                filename: task.filename.clone(),
                text: task.text.clone(),
                status: task.status,
            })
            .collect()
    }

    fn queue_views(&self) -> BTreeMap<String, Vec<QueueTask>> {
        Role::ALL
            .iter()
            .map(|&role| (role.as_str().to_string(), self.queue_view(role)))
            .collect()
    }

    fn broadcast_subtask_status(&self, id: &str, status: SubtaskStatus) {
        self.broadcast(PushMessage::specific(SpecificFields {
            subtasks: Some(BTreeMap::from([(id.to_string(), status)])),
            ..Default::default()
        }));
    }

    fn broadcast_queue_delta(&self, role: Role, subtask: Option<(&str, SubtaskStatus)>) {
        let queues = BTreeMap::from([(role.as_str().to_string(), self.queue_view(role))]);
        self.broadcast(PushMessage::specific(SpecificFields {
            queues: Some(queues),
            subtasks: subtask
                .map(|(id, status)| BTreeMap::from([(id.to_string(), status)])),
            ..Default::default()
        }));
    }

    pub fn chart_data(&self) -> ChartData {
        let statuses = self.all_subtask_statuses();
        let mut distribution: BTreeMap<String, u64> = BTreeMap::new();
        for status in [
            SubtaskStatus::Pending,
            SubtaskStatus::Processing,
            SubtaskStatus::CodeReceived,
            SubtaskStatus::Accepted,
            SubtaskStatus::Failed,
        ] {
            distribution.insert(status.as_str().to_string(), 0);
        }
        for status in statuses.values() {
            *distribution.entry(status.as_str().to_string()).or_insert(0) += 1;
        }
        let total = statuses.len() as u64;
        let done = statuses
            .values()
            .filter(|s| matches!(s, SubtaskStatus::Accepted | SubtaskStatus::Failed))
            .count() as u64;
        let charts = self.charts.lock();
        ChartData {
            processed_over_time: charts.processed_over_time.iter().copied().collect(),
            task_status_distribution: distribution,
            progress_data: ProgressData {
                done,
                total,
                percent: if total == 0 {
                    0.0
                } else {
                    done as f64 * 100.0 / total as f64
                },
            },
            git_activity: charts.git_activity.iter().cloned().collect(),
        }
    }

    /// The full-status snapshot sent to every new subscriber and after
    /// coalescing.
    pub fn full_status(&self) -> PushMessage {
        PushMessage::FullStatusUpdate {
            ai_status: self.agent_states(),
            queues: self.queue_views(),
            subtasks: self.all_subtask_statuses(),
            structure: self.structure(),
            charts: self.chart_data(),
            target_complete: self.is_target_complete(),
        }
    }

    /// Background sweep returning expired claims to their queues.
    pub fn spawn_lease_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let orch = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                orch.sweep_expired_claims();
            }
        })
    }

    /// One sweep pass; factored out for tests.
    pub fn sweep_expired_claims(&self) {
        let lease = self.config.read().claim_lease();
        let max_attempts = self.config.read().max_attempts;
        for (role, id) in self.queues.expired_claims(lease) {
            let status = match self.ledger.lock().requeue_expired(&id, max_attempts) {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "lease sweep skipped subtask");
                    continue;
                }
            };
            tracing::warn!(id = %id, role = %role, status = status.as_str(), "claim lease expired");
            if status == SubtaskStatus::Pending {
                self.queues.push(role, id.clone());
            }
            self.broadcast_subtask_status(&id, status);
        }
    }
}

/// Filenames must stay inside the repository root.
fn is_safe_filename(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.starts_with('/')
        && !filename.split('/').any(|seg| seg == "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_orchestrator() -> Arc<Orchestrator> {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.paths.log_file = dir.path().join("conductor.log");
        config.paths.structure_file = dir.path().join("structure.json");
        config.worker_poll_timeout_secs = 0;
        let config_file = dir.path().join("config.json");
        // Leak the tempdir so paths stay valid for the test duration
        std::mem::forget(dir);
        Orchestrator::new(config, config_file)
    }

    fn new_subtask(id: &str, role: &str, filename: &str) -> NewSubtask {
        NewSubtask {
            role: role.to_string(),
            filename: filename.to_string(),
            text: format!("implement {filename}"),
            parent: None,
            id: Some(id.to_string()),
        }
    }

    fn submission(id: &str, role: &str) -> ReportSubmission {
        ReportSubmission {
            role: role.to_string(),
            subtask_id: id.to_string(),
            filename: "add.py".to_string(),
            payload: "def add(a, b):\n    return a + b".to_string(),
            metrics: None,
            duration_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_enqueue_claim_report_accept() {
        let orch = test_orchestrator();
        orch.enqueue_subtask(new_subtask("t1", "executor", "add.py"))
            .unwrap();

        let claimed = orch.claim_next("executor", "w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, "t1");
        assert_eq!(orch.subtask_status("t1"), Some(SubtaskStatus::Processing));

        orch.submit_report(submission("t1", "executor")).unwrap();
        assert_eq!(orch.subtask_status("t1"), Some(SubtaskStatus::CodeReceived));

        assert!(orch.mark_accepted("t1").unwrap());
        assert!(!orch.mark_accepted("t1").unwrap());
        assert_eq!(orch.subtask_status("t1"), Some(SubtaskStatus::Accepted));

        // Both consumers got the report exactly once
        assert_eq!(orch.drain_structurer_reports().len(), 1);
        assert_eq!(orch.drain_coordinator_reports().len(), 1);
        assert!(orch.drain_coordinator_reports().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_role_and_unsafe_path() {
        let orch = test_orchestrator();
        assert!(matches!(
            orch.enqueue_subtask(new_subtask("t1", "critic", "a.py")),
            Err(OrchestratorError::UnknownRole(_))
        ));
        assert!(matches!(
            orch.enqueue_subtask(new_subtask("t1", "executor", "../a.py")),
            Err(OrchestratorError::UnsafePath(_))
        ));
    }

    #[tokio::test]
    async fn test_report_without_claim_rejected() {
        let orch = test_orchestrator();
        orch.enqueue_subtask(new_subtask("t1", "executor", "add.py"))
            .unwrap();
        assert!(matches!(
            orch.submit_report(submission("t1", "executor")),
            Err(OrchestratorError::NotClaimed(_))
        ));
        assert!(matches!(
            orch.submit_report(submission("ghost", "executor")),
            Err(OrchestratorError::UnknownSubtask(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_then_crash_law() {
        let orch = test_orchestrator();
        {
            let mut config = orch.config();
            config.claim_lease_secs = 1;
            *orch.config.write() = config;
        }
        orch.enqueue_subtask(new_subtask("t1", "executor", "add.py"))
            .unwrap();
        orch.claim_next("executor", "w1").await.unwrap().unwrap();

        // Worker crashes; no sweep yet, nothing happens
        orch.sweep_expired_claims();
        assert_eq!(orch.subtask_status("t1"), Some(SubtaskStatus::Processing));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        orch.sweep_expired_claims();
        assert_eq!(orch.subtask_status("t1"), Some(SubtaskStatus::Pending));
        assert_eq!(orch.subtask("t1").unwrap().attempts, 1);

        // The subtask is claimable again
        let reclaimed = orch.claim_next("executor", "w2").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, "t1");
    }

    #[tokio::test]
    async fn test_heartbeat_renews_lease() {
        let orch = test_orchestrator();
        {
            let mut config = orch.config();
            config.claim_lease_secs = 1;
            *orch.config.write() = config;
        }
        orch.enqueue_subtask(new_subtask("t1", "executor", "add.py"))
            .unwrap();
        orch.claim_next("executor", "w1").await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        orch.heartbeat("executor", Some("t1")).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        orch.sweep_expired_claims();
        // Lease was renewed at ~700ms, so it is not yet expired
        assert_eq!(orch.subtask_status("t1"), Some(SubtaskStatus::Processing));
    }

    #[tokio::test]
    async fn test_rejection_loop_until_failed() {
        let orch = test_orchestrator();
        orch.enqueue_subtask(new_subtask("t1", "executor", "add.py"))
            .unwrap();
        for round in 0..3 {
            let claimed = orch.claim_next("executor", "w1").await.unwrap();
            assert!(claimed.is_some(), "round {round} should be claimable");
            orch.submit_report(submission("t1", "executor")).unwrap();
            orch.reject_subtask("t1", "refined instructions").unwrap();
        }
        assert_eq!(orch.subtask_status("t1"), Some(SubtaskStatus::Failed));
        // Failed tasks are not claimable
        assert!(orch.claim_next("executor", "w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_soft_cap() {
        let orch = test_orchestrator();
        {
            let mut config = orch.config();
            config.queue_soft_cap = 2;
            *orch.config.write() = config;
        }
        orch.enqueue_subtask(new_subtask("a", "executor", "a.py")).unwrap();
        orch.enqueue_subtask(new_subtask("b", "executor", "b.py")).unwrap();
        assert!(matches!(
            orch.enqueue_subtask(new_subtask("c", "executor", "c.py")),
            Err(OrchestratorError::QueueSaturated(Role::Executor))
        ));
        // Other roles are unaffected
        orch.enqueue_subtask(new_subtask("d", "tester", "d.py")).unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_sees_full_snapshot_then_deltas() {
        let orch = test_orchestrator();
        let sub = orch.subscribe();
        sub.send(orch.full_status());
        orch.enqueue_subtask(new_subtask("t1", "executor", "add.py"))
            .unwrap();

        let first = sub.next().await;
        match first {
            super::super::subscribers::OutboundItem::Message(m) => {
                assert!(m.is_full_snapshot())
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_alignment_divergence_scenario() {
        let orch = test_orchestrator();
        let coord_tree = FileTree::from_files(["a.py", "b.py"]);
        let struct_tree = FileTree::from_files(["a.py"]);

        // Coordinator proposes {a.py, b.py}
        let state = orch.align_coordinator(TreeProposal {
            tree: coord_tree.clone(),
            finalize: false,
        });
        assert!(state.agreed.is_none());

        // Structurer counters with {a.py}
        let state = orch
            .align_structurer(TreeProposal {
                tree: struct_tree,
                finalize: false,
            })
            .unwrap();
        assert!(state.agreed.is_none());

        // Coordinator insists
        let state = orch.align_coordinator(TreeProposal {
            tree: coord_tree.clone(),
            finalize: true,
        });
        assert_eq!(state.agreed, Some(coord_tree));

        // Structurer may not reopen a settled alignment
        assert!(matches!(
            orch.align_structurer(TreeProposal {
                tree: FileTree::new(),
                finalize: false,
            }),
            Err(OrchestratorError::AlignmentClosed)
        ));
    }

    #[tokio::test]
    async fn test_structure_update_after_completion_rejected() {
        let orch = test_orchestrator();
        orch.update_structure(FileTree::from_files(["add.py"]), None)
            .unwrap();
        orch.complete_target();
        assert!(matches!(
            orch.update_structure(FileTree::new(), None),
            Err(OrchestratorError::TargetComplete)
        ));
        // Snapshot unchanged
        assert!(orch.structure().contains_file("add.py"));
    }

    #[tokio::test]
    async fn test_chart_distribution_counts_failures() {
        let orch = test_orchestrator();
        orch.enqueue_subtask(new_subtask("t1", "executor", "a.py")).unwrap();
        orch.claim_next("executor", "w1").await.unwrap().unwrap();
        orch.submit_report(submission("t1", "executor")).unwrap();
        orch.mark_failed("t1", "tests kept failing").unwrap();

        let charts = orch.chart_data();
        assert_eq!(charts.task_status_distribution["failed"], 1);
        assert_eq!(charts.progress_data.done, 1);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let orch = test_orchestrator();
        orch.enqueue_subtask(new_subtask("t1", "executor", "a.py")).unwrap();
        orch.update_structure(FileTree::from_files(["a.py"]), Some("init".into()))
            .unwrap();
        orch.log_line("hello".to_string());
        orch.reset();

        assert!(orch.all_subtask_statuses().is_empty());
        assert!(orch.structure().is_empty());
        assert!(orch.log_tail(10).is_empty());
        assert!(!orch.is_target_complete());
    }
}
