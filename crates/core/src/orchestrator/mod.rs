//! # Orchestrator
//!
//! The state of record for the pipeline: task ledger, per-role queues,
//! structure snapshot, subscriber fan-out, agent run-states and the
//! supervisor. Nothing outside this module mutates any of it; agents reach
//! it through the server's endpoints only.

pub mod events;
pub mod ledger;
pub mod queue;
pub mod service;
pub mod subscribers;
pub mod supervisor;

pub use events::{ChartData, ClientRequest, PushMessage, QueueTask, SpecificFields};
pub use ledger::{OrchestratorError, Report, Subtask, SubtaskStatus};
pub use service::{
    AgentRunState, AlignmentState, NewSubtask, Orchestrator, ReportSubmission, TreeProposal,
};
pub use subscribers::{OutboundItem, Subscription};
pub use supervisor::Supervisor;
