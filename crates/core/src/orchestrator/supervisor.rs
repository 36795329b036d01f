//! # Agent Supervisor
//!
//! Spawns every agent as its own OS process (`conductor agent <kind>`),
//! captures its stderr into the log stream, and respawns on abnormal exit
//! with capped exponential backoff. Too many exits inside the restart
//! window flips the agent to `failed` until the operator starts it again.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::service::Orchestrator;
use crate::models::AgentId;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Capped exponential respawn delay: 1s, 2s, 4s ... up to 60s.
pub fn restart_delay(consecutive_failures: u32) -> Duration {
    let exp = consecutive_failures.min(6);
    let delay = BACKOFF_BASE * 2u32.pow(exp);
    delay.min(BACKOFF_CAP)
}

struct AgentEntry {
    desired_running: bool,
    /// Bumped on every start/stop so stale monitor tasks stand down
    generation: u64,
    child: Option<tokio::process::Child>,
    recent_exits: Vec<Instant>,
}

impl Default for AgentEntry {
    fn default() -> Self {
        Self {
            desired_running: false,
            generation: 0,
            child: None,
            recent_exits: Vec::new(),
        }
    }
}

/// Lifecycle manager for the five agent processes.
pub struct Supervisor {
    orch: Arc<Orchestrator>,
    entries: Mutex<HashMap<AgentId, AgentEntry>>,
}

impl Supervisor {
    pub fn new(orch: Arc<Orchestrator>) -> Arc<Self> {
        Arc::new(Self {
            orch,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Start one agent (no-op when already running).
    pub fn start(self: &Arc<Self>, agent: AgentId) {
        let generation = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(agent).or_default();
            if entry.desired_running && entry.child.is_some() {
                return;
            }
            entry.desired_running = true;
            entry.recent_exits.clear();
            entry.generation += 1;
            entry.generation
        };
        self.spawn(agent, generation, 0);
    }

    /// Stop one agent: signal intent, give the grace period for in-flight
    /// reports to land, then force-terminate.
    pub async fn stop(self: &Arc<Self>, agent: AgentId) {
        let child = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(agent).or_default();
            entry.desired_running = false;
            entry.generation += 1;
            entry.child.take()
        };
        if let Some(mut child) = child {
            let grace = Duration::from_secs(self.orch.config().supervisor.grace_secs);
            let waited = tokio::time::timeout(grace, child.wait()).await;
            if waited.is_err() {
                tracing::warn!(agent = %agent, "grace period elapsed, killing agent");
                let _ = child.kill().await;
            }
        }
        self.orch.set_agent_state(agent, false, false, None);
        tracing::info!(agent = %agent, "agent stopped");
    }

    pub fn start_workers(self: &Arc<Self>) {
        for agent in [AgentId::Executor, AgentId::Tester, AgentId::Documenter] {
            self.start(agent);
        }
    }

    pub async fn stop_workers(self: &Arc<Self>) {
        for agent in [AgentId::Executor, AgentId::Tester, AgentId::Documenter] {
            self.stop(agent).await;
        }
    }

    pub fn start_all(self: &Arc<Self>) {
        for agent in AgentId::ALL {
            self.start(agent);
        }
    }

    /// Operator stop: quiesce claims first, then take every agent down.
    pub async fn stop_all(self: &Arc<Self>) {
        self.orch.set_accepting_claims(false);
        for agent in AgentId::ALL {
            self.stop(agent).await;
        }
        self.orch.set_accepting_claims(true);
    }

    fn spawn(self: &Arc<Self>, agent: AgentId, generation: u64, consecutive_failures: u32) {
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                tracing::error!(agent = %agent, error = %e, "cannot resolve current executable");
                self.orch
                    .set_agent_state(agent, false, true, Some(e.to_string()));
                return;
            }
        };

        let mut command = Command::new(exe);
        command.arg("agent");
        // Workers identify their role via the --role flag
        match agent.role() {
            Some(role) => {
                command.arg("worker").arg("--role").arg(role.as_str());
            }
            None => {
                command.arg(agent.as_str());
            }
        }
        command.stdout(Stdio::null()).stderr(Stdio::piped());
        command.kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(agent = %agent, error = %e, "failed to spawn agent");
                self.orch
                    .set_agent_state(agent, false, true, Some(e.to_string()));
                return;
            }
        };
        tracing::info!(agent = %agent, pid = child.id(), "agent started");

        // Forward the agent's stderr into the shared log stream
        if let Some(stderr) = child.stderr.take() {
            let orch = Arc::clone(&self.orch);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    orch.log_line(format!("[{agent}] {line}"));
                }
            });
        }

        {
            let mut entries = self.entries.lock();
            let entry = entries.entry(agent).or_default();
            if entry.generation != generation {
                // A stop raced the spawn; undo it
                drop(entries);
                tokio::spawn(async move {
                    let _ = child.kill().await;
                });
                return;
            }
            entry.child = Some(child);
        }
        self.orch.set_agent_state(agent, true, false, None);
        if consecutive_failures > 0 {
            self.orch.record_agent_restart(agent);
        }

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor
                .monitor(agent, generation, consecutive_failures)
                .await;
        });
    }

    /// Wait for the child's exit and decide whether to respawn.
    async fn monitor(self: Arc<Self>, agent: AgentId, generation: u64, consecutive_failures: u32) {
        // Poll rather than hold the child across the await: stop() needs it
        let status = loop {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&agent) else {
                return;
            };
            if entry.generation != generation {
                return; // superseded by a newer start/stop
            }
            let Some(child) = entry.child.as_mut() else {
                return; // stop() already reaped it
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    entry.child = None;
                    entry.recent_exits.push(Instant::now());
                    break status;
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(agent = %agent, error = %e, "failed to poll agent process");
                    entry.child = None;
                    return;
                }
            }
        };

        let config = self.orch.config().supervisor;
        let (desired, exits_in_window) = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(agent).or_default();
            let window = Duration::from_secs(config.restart_window_secs);
            entry.recent_exits.retain(|t| t.elapsed() < window);
            (entry.desired_running, entry.recent_exits.len() as u32)
        };

        if !desired {
            return;
        }

        tracing::warn!(agent = %agent, status = ?status.code(), "agent exited abnormally");

        if exits_in_window > config.max_restarts {
            tracing::error!(
                agent = %agent,
                exits = exits_in_window,
                window_secs = config.restart_window_secs,
                "respawn budget exhausted, marking agent failed"
            );
            self.entries.lock().entry(agent).or_default().desired_running = false;
            self.orch.set_agent_state(
                agent,
                false,
                true,
                Some(format!("exited {exits_in_window} times, respawn suspended")),
            );
            return;
        }

        let failures = consecutive_failures + 1;
        let delay = restart_delay(failures);
        tracing::info!(agent = %agent, delay_secs = delay.as_secs(), "respawning agent");
        tokio::time::sleep(delay).await;

        let still_wanted = {
            let entries = self.entries.lock();
            entries
                .get(&agent)
                .map(|e| e.desired_running && e.generation == generation)
                .unwrap_or(false)
        };
        if still_wanted {
            self.spawn(agent, generation, failures);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(restart_delay(0), Duration::from_secs(1));
        assert_eq!(restart_delay(1), Duration::from_secs(2));
        assert_eq!(restart_delay(2), Duration::from_secs(4));
        assert_eq!(restart_delay(5), Duration::from_secs(32));
        // Capped
        assert_eq!(restart_delay(6), Duration::from_secs(60));
        assert_eq!(restart_delay(30), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_is_monotonic_until_cap() {
        let mut last = Duration::ZERO;
        for n in 0..10 {
            let delay = restart_delay(n);
            assert!(delay >= last);
            last = delay;
        }
    }
}
