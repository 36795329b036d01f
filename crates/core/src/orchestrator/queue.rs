//! # Role Queues
//!
//! One FIFO queue per worker role plus the set of claims currently held by
//! workers. Claims carry a timestamp so the lease sweeper can return crashed
//! workers' subtasks to the queue. A subtask id is handed to at most one
//! worker: `claim` pops under the queue lock.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::models::Role;

/// A worker's temporary exclusive hold on a subtask.
#[derive(Debug, Clone)]
pub struct Claim {
    pub worker: String,
    pub claimed_at: Instant,
}

#[derive(Default)]
struct RoleQueue {
    pending: VecDeque<String>,
    processing: HashMap<String, Claim>,
}

/// All three role queues with their wakeup handles.
pub struct QueueSet {
    queues: [Mutex<RoleQueue>; 3],
    notify: [Notify; 3],
}

impl Default for QueueSet {
    fn default() -> Self {
        Self::new()
    }
}

fn idx(role: Role) -> usize {
    match role {
        Role::Executor => 0,
        Role::Tester => 1,
        Role::Documenter => 2,
    }
}

impl QueueSet {
    pub fn new() -> Self {
        Self {
            queues: Default::default(),
            notify: Default::default(),
        }
    }

    /// Append a pending subtask id (FIFO by insertion).
    pub fn push(&self, role: Role, id: String) {
        self.queues[idx(role)].lock().pending.push_back(id);
        self.notify[idx(role)].notify_one();
    }

    pub fn pending_len(&self, role: Role) -> usize {
        self.queues[idx(role)].lock().pending.len()
    }

    pub fn pending_ids(&self, role: Role) -> Vec<String> {
        self.queues[idx(role)].lock().pending.iter().cloned().collect()
    }

    /// Pop the queue head and record the claim. Returns `None` on empty.
    pub fn try_claim(&self, role: Role, worker: &str) -> Option<String> {
        let mut queue = self.queues[idx(role)].lock();
        let id = queue.pending.pop_front()?;
        queue.processing.insert(
            id.clone(),
            Claim {
                worker: worker.to_string(),
                claimed_at: Instant::now(),
            },
        );
        Some(id)
    }

    /// Claim the next subtask, parking up to `timeout` on an empty queue.
    pub async fn claim(&self, role: Role, worker: &str, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(id) = self.try_claim(role, worker) {
                return Some(id);
            }
            let notified = self.notify[idx(role)].notified();
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    /// Drop the claim when the report lands.
    pub fn release(&self, role: Role, id: &str) -> bool {
        self.queues[idx(role)].lock().processing.remove(id).is_some()
    }

    /// Renew the lease for a claim (worker heartbeat).
    pub fn renew(&self, role: Role, id: &str) -> bool {
        match self.queues[idx(role)].lock().processing.get_mut(id) {
            Some(claim) => {
                claim.claimed_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove and return every claim older than `lease`, per role.
    pub fn expired_claims(&self, lease: Duration) -> Vec<(Role, String)> {
        let mut expired = Vec::new();
        for role in Role::ALL {
            let mut queue = self.queues[idx(role)].lock();
            let stale: Vec<String> = queue
                .processing
                .iter()
                .filter(|(_, claim)| claim.claimed_at.elapsed() >= lease)
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                queue.processing.remove(&id);
                expired.push((role, id));
            }
        }
        expired
    }

    pub fn clear(&self) {
        for role in Role::ALL {
            let mut queue = self.queues[idx(role)].lock();
            queue.pending.clear();
            queue.processing.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queues = QueueSet::new();
        queues.push(Role::Executor, "a".to_string());
        queues.push(Role::Executor, "b".to_string());
        queues.push(Role::Executor, "c".to_string());

        assert_eq!(queues.try_claim(Role::Executor, "w1"), Some("a".to_string()));
        assert_eq!(queues.try_claim(Role::Executor, "w2"), Some("b".to_string()));
        assert_eq!(queues.try_claim(Role::Executor, "w1"), Some("c".to_string()));
        assert_eq!(queues.try_claim(Role::Executor, "w1"), None);
    }

    #[test]
    fn test_roles_are_independent() {
        let queues = QueueSet::new();
        queues.push(Role::Executor, "e1".to_string());
        queues.push(Role::Tester, "t1".to_string());

        assert_eq!(queues.try_claim(Role::Tester, "w"), Some("t1".to_string()));
        assert_eq!(queues.pending_len(Role::Executor), 1);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let queues = QueueSet::new();
        queues.push(Role::Executor, "only".to_string());
        assert!(queues.try_claim(Role::Executor, "w1").is_some());
        // The id lives in processing now, not pending
        assert_eq!(queues.try_claim(Role::Executor, "w2"), None);
        assert!(queues.release(Role::Executor, "only"));
        assert!(!queues.release(Role::Executor, "only"));
    }

    #[test]
    fn test_expired_claims_are_collected() {
        let queues = QueueSet::new();
        queues.push(Role::Executor, "x".to_string());
        queues.try_claim(Role::Executor, "w1").unwrap();

        assert!(queues.expired_claims(Duration::from_secs(60)).is_empty());
        let expired = queues.expired_claims(Duration::ZERO);
        assert_eq!(expired, vec![(Role::Executor, "x".to_string())]);
        // Already removed
        assert!(queues.expired_claims(Duration::ZERO).is_empty());
    }

    #[test]
    fn test_renew_extends_lease() {
        let queues = QueueSet::new();
        queues.push(Role::Tester, "t".to_string());
        queues.try_claim(Role::Tester, "w1").unwrap();
        assert!(queues.renew(Role::Tester, "t"));
        assert!(!queues.renew(Role::Tester, "ghost"));
    }

    #[tokio::test]
    async fn test_claim_waits_for_push() {
        let queues = std::sync::Arc::new(QueueSet::new());
        let waiter = {
            let queues = queues.clone();
            tokio::spawn(async move {
                queues
                    .claim(Role::Executor, "w1", Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queues.push(Role::Executor, "late".to_string());
        assert_eq!(waiter.await.unwrap(), Some("late".to_string()));
    }

    #[tokio::test]
    async fn test_claim_times_out_on_empty_queue() {
        let queues = QueueSet::new();
        let claimed = queues
            .claim(Role::Documenter, "w1", Duration::from_millis(30))
            .await;
        assert_eq!(claimed, None);
    }
}
