//! # Task Ledger
//!
//! Flat tables for subtasks and reports, keyed by stable ids. All status
//! transitions go through here so the state machine stays monotonic:
//!
//! ```text
//! pending -> processing -> code_received -> accepted
//!    ^            |              |
//!    +------------+ (lease expiry)
//!    ^                           |
//!    +---------------------------+ (coordinator reject, refined text)
//! processing | code_received -> failed (attempts exhausted)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::models::Role;

/// Validation and protocol errors surfaced to callers as 4xx.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("duplicate subtask id: {0}")]
    DuplicateId(String),
    #[error("unknown subtask id: {0}")]
    UnknownSubtask(String),
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("role mismatch for subtask {id}: expected {expected}, got {got}")]
    WrongRole {
        id: String,
        expected: Role,
        got: Role,
    },
    #[error("subtask {0} is not claimed")]
    NotClaimed(String),
    #[error("invalid transition for subtask {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: String,
        from: SubtaskStatus,
        to: SubtaskStatus,
    },
    #[error("queue for role {0} is saturated")]
    QueueSaturated(Role),
    #[error("unsafe filename: {0}")]
    UnsafePath(String),
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("target is already complete")]
    TargetComplete,
    #[error("structure alignment is already settled")]
    AlignmentClosed,
}

/// Lifecycle of one subtask.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Processing,
    CodeReceived,
    Accepted,
    Failed,
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::Processing => "processing",
            SubtaskStatus::CodeReceived => "code_received",
            SubtaskStatus::Accepted => "accepted",
            SubtaskStatus::Failed => "failed",
        }
    }
}

/// The atomic unit of work: one filename-scoped instruction to one role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub role: Role,
    pub filename: String,
    pub text: String,
    pub status: SubtaskStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// The coordinator decision (usually an executor subtask) this came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A worker's answer to one subtask. The only vehicle that moves a subtask
/// out of `processing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub subtask_id: String,
    pub role: Role,
    pub filename: String,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, f64>>,
    /// Parent of the reported subtask, resolved from the ledger on submit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub duration_ms: u64,
}

/// Flat subtask and report tables.
#[derive(Default)]
pub struct Ledger {
    tasks: HashMap<String, Subtask>,
    reports: Vec<Report>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, subtask: Subtask) -> Result<(), OrchestratorError> {
        if self.tasks.contains_key(&subtask.id) {
            return Err(OrchestratorError::DuplicateId(subtask.id));
        }
        self.tasks.insert(subtask.id.clone(), subtask);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Subtask> {
        self.tasks.get(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Status of every known subtask, keyed by id.
    pub fn statuses(&self) -> BTreeMap<String, SubtaskStatus> {
        self.tasks
            .iter()
            .map(|(id, task)| (id.clone(), task.status))
            .collect()
    }

    pub fn status_of(&self, id: &str) -> Option<SubtaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    /// `pending -> processing` when a worker claims the subtask.
    pub fn begin_processing(&mut self, id: &str) -> Result<&Subtask, OrchestratorError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::UnknownSubtask(id.to_string()))?;
        match task.status {
            SubtaskStatus::Pending => {
                task.status = SubtaskStatus::Processing;
                Ok(task)
            }
            from => Err(OrchestratorError::InvalidTransition {
                id: id.to_string(),
                from,
                to: SubtaskStatus::Processing,
            }),
        }
    }

    /// Validate and record a worker report; `processing -> code_received`.
    pub fn record_report(&mut self, report: Report) -> Result<(), OrchestratorError> {
        let task = self
            .tasks
            .get_mut(&report.subtask_id)
            .ok_or_else(|| OrchestratorError::UnknownSubtask(report.subtask_id.clone()))?;
        if task.role != report.role {
            return Err(OrchestratorError::WrongRole {
                id: report.subtask_id.clone(),
                expected: task.role,
                got: report.role,
            });
        }
        if task.status != SubtaskStatus::Processing {
            return Err(OrchestratorError::NotClaimed(report.subtask_id.clone()));
        }
        task.status = SubtaskStatus::CodeReceived;
        self.reports.push(report);
        Ok(())
    }

    /// `code_received -> accepted`. Idempotent: accepting an accepted
    /// subtask reports `false` (no state change).
    pub fn accept(&mut self, id: &str) -> Result<bool, OrchestratorError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::UnknownSubtask(id.to_string()))?;
        match task.status {
            SubtaskStatus::Accepted => Ok(false),
            SubtaskStatus::CodeReceived => {
                task.status = SubtaskStatus::Accepted;
                Ok(true)
            }
            from => Err(OrchestratorError::InvalidTransition {
                id: id.to_string(),
                from,
                to: SubtaskStatus::Accepted,
            }),
        }
    }

    /// Terminal failure from any non-terminal state.
    pub fn fail(&mut self, id: &str, reason: &str) -> Result<(), OrchestratorError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::UnknownSubtask(id.to_string()))?;
        if task.status == SubtaskStatus::Accepted {
            return Err(OrchestratorError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to: SubtaskStatus::Failed,
            });
        }
        task.status = SubtaskStatus::Failed;
        task.last_error = Some(reason.to_string());
        Ok(())
    }

    /// Lease-expiry path: `processing -> pending`, attempt counted. Past
    /// `max_attempts` the subtask fails instead. Returns the new status.
    pub fn requeue_expired(
        &mut self,
        id: &str,
        max_attempts: u32,
    ) -> Result<SubtaskStatus, OrchestratorError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::UnknownSubtask(id.to_string()))?;
        if task.status != SubtaskStatus::Processing {
            return Err(OrchestratorError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to: SubtaskStatus::Pending,
            });
        }
        task.attempts += 1;
        if task.attempts >= max_attempts {
            task.status = SubtaskStatus::Failed;
            task.last_error = Some("claim lease expired".to_string());
        } else {
            task.status = SubtaskStatus::Pending;
            task.last_error = Some("claim lease expired, re-enqueued".to_string());
        }
        Ok(task.status)
    }

    /// Coordinator rejection: `code_received -> pending` with refined text.
    /// Past `max_attempts` the subtask fails instead. Returns the new status.
    pub fn reject(
        &mut self,
        id: &str,
        refined_text: &str,
        max_attempts: u32,
    ) -> Result<SubtaskStatus, OrchestratorError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::UnknownSubtask(id.to_string()))?;
        if task.status != SubtaskStatus::CodeReceived {
            return Err(OrchestratorError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to: SubtaskStatus::Pending,
            });
        }
        task.attempts += 1;
        if task.attempts >= max_attempts {
            task.status = SubtaskStatus::Failed;
            task.last_error = Some("rejected: confidence below threshold".to_string());
        } else {
            task.status = SubtaskStatus::Pending;
            task.text = refined_text.to_string();
        }
        Ok(task.status)
    }

    pub fn reports(&self) -> &[Report] {
        &self.reports
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Subtask> {
        self.tasks.values()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.reports.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtask(id: &str, role: Role) -> Subtask {
        Subtask {
            id: id.to_string(),
            role,
            filename: "add.py".to_string(),
            text: "implement add".to_string(),
            status: SubtaskStatus::Pending,
            attempts: 0,
            last_error: None,
            parent: None,
            created_at: Utc::now(),
        }
    }

    fn report(id: &str, role: Role) -> Report {
        Report {
            subtask_id: id.to_string(),
            role,
            filename: "add.py".to_string(),
            payload: "def add(a, b):\n    return a + b".to_string(),
            metrics: None,
            parent: None,
            duration_ms: 42,
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut ledger = Ledger::new();
        ledger.insert(subtask("t1", Role::Executor)).unwrap();
        assert_eq!(
            ledger.insert(subtask("t1", Role::Executor)),
            Err(OrchestratorError::DuplicateId("t1".to_string()))
        );
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut ledger = Ledger::new();
        ledger.insert(subtask("t1", Role::Executor)).unwrap();
        ledger.begin_processing("t1").unwrap();
        ledger.record_report(report("t1", Role::Executor)).unwrap();
        assert!(ledger.accept("t1").unwrap());
        assert_eq!(ledger.status_of("t1"), Some(SubtaskStatus::Accepted));
    }

    #[test]
    fn test_accept_is_idempotent() {
        let mut ledger = Ledger::new();
        ledger.insert(subtask("t1", Role::Executor)).unwrap();
        ledger.begin_processing("t1").unwrap();
        ledger.record_report(report("t1", Role::Executor)).unwrap();
        assert!(ledger.accept("t1").unwrap());
        assert!(!ledger.accept("t1").unwrap());
        assert_eq!(ledger.status_of("t1"), Some(SubtaskStatus::Accepted));
    }

    #[test]
    fn test_report_validation() {
        let mut ledger = Ledger::new();
        assert!(matches!(
            ledger.record_report(report("ghost", Role::Executor)),
            Err(OrchestratorError::UnknownSubtask(_))
        ));

        ledger.insert(subtask("t1", Role::Executor)).unwrap();
        assert!(matches!(
            ledger.record_report(report("t1", Role::Executor)),
            Err(OrchestratorError::NotClaimed(_))
        ));

        ledger.begin_processing("t1").unwrap();
        assert!(matches!(
            ledger.record_report(report("t1", Role::Tester)),
            Err(OrchestratorError::WrongRole { .. })
        ));
    }

    #[test]
    fn test_lease_expiry_requeues_and_counts() {
        let mut ledger = Ledger::new();
        ledger.insert(subtask("t1", Role::Executor)).unwrap();
        ledger.begin_processing("t1").unwrap();
        let status = ledger.requeue_expired("t1", 3).unwrap();
        assert_eq!(status, SubtaskStatus::Pending);
        assert_eq!(ledger.get("t1").unwrap().attempts, 1);
    }

    #[test]
    fn test_lease_expiry_fails_after_max_attempts() {
        let mut ledger = Ledger::new();
        ledger.insert(subtask("t1", Role::Executor)).unwrap();
        for _ in 0..2 {
            ledger.begin_processing("t1").unwrap();
            ledger.requeue_expired("t1", 2).ok();
        }
        assert_eq!(ledger.status_of("t1"), Some(SubtaskStatus::Failed));
    }

    #[test]
    fn test_reject_refines_text() {
        let mut ledger = Ledger::new();
        ledger.insert(subtask("t1", Role::Executor)).unwrap();
        ledger.begin_processing("t1").unwrap();
        ledger.record_report(report("t1", Role::Executor)).unwrap();
        let status = ledger.reject("t1", "implement add, handle floats", 3).unwrap();
        assert_eq!(status, SubtaskStatus::Pending);
        assert_eq!(ledger.get("t1").unwrap().text, "implement add, handle floats");
        assert_eq!(ledger.get("t1").unwrap().attempts, 1);
    }

    #[test]
    fn test_reject_fails_after_max_attempts() {
        let mut ledger = Ledger::new();
        ledger.insert(subtask("t1", Role::Executor)).unwrap();
        for i in 0..3 {
            ledger.begin_processing("t1").unwrap();
            ledger.record_report(report("t1", Role::Executor)).unwrap();
            let status = ledger.reject("t1", "refine again", 3).unwrap();
            if i < 2 {
                assert_eq!(status, SubtaskStatus::Pending);
            } else {
                assert_eq!(status, SubtaskStatus::Failed);
            }
        }
    }

    #[test]
    fn test_accepted_is_terminal() {
        let mut ledger = Ledger::new();
        ledger.insert(subtask("t1", Role::Executor)).unwrap();
        ledger.begin_processing("t1").unwrap();
        ledger.record_report(report("t1", Role::Executor)).unwrap();
        ledger.accept("t1").unwrap();
        assert!(ledger.fail("t1", "too late").is_err());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&SubtaskStatus::CodeReceived).unwrap(),
            "\"code_received\""
        );
    }
}
