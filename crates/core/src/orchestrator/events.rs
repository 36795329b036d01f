//! # Push-Channel Messages
//!
//! Everything the orchestrator sends to UI subscribers. Each outbound
//! message carries a `type` tag; a `full_status_update` replaces the
//! subscriber's view, every other message merges into it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ledger::SubtaskStatus;
use super::service::AgentRunState;
use crate::repo::FileTree;

/// A queue entry as delivered to the UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueTask {
    pub id: String,
    pub filename: String,
    pub text: String,
    pub status: SubtaskStatus,
}

/// Aggregates for the operator charts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChartData {
    /// Accepted-task counter sampled after every acceptance
    pub processed_over_time: Vec<u64>,
    /// Status -> count, for the status pie chart
    pub task_status_distribution: BTreeMap<String, u64>,
    pub progress_data: ProgressData,
    /// Recent commit messages from the structurer
    pub git_activity: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressData {
    pub done: u64,
    pub total: u64,
    pub percent: f64,
}

/// Partial-state delta; the recipient merges present fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpecificFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_status: Option<BTreeMap<String, AgentRunState>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queues: Option<BTreeMap<String, Vec<QueueTask>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtasks: Option<BTreeMap<String, SubtaskStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure: Option<FileTree>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_over_time: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_activity: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_complete: Option<bool>,
}

/// One outbound push-channel message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    FullStatusUpdate {
        ai_status: BTreeMap<String, AgentRunState>,
        queues: BTreeMap<String, Vec<QueueTask>>,
        subtasks: BTreeMap<String, SubtaskStatus>,
        structure: FileTree,
        #[serde(flatten)]
        charts: ChartData,
        target_complete: bool,
    },
    StatusUpdate {
        ai_status: BTreeMap<String, AgentRunState>,
    },
    LogUpdate {
        /// Raw line, ANSI colors preserved for the UI parser
        line: String,
    },
    StructureUpdate {
        structure: FileTree,
    },
    QueueUpdate {
        queues: BTreeMap<String, Vec<QueueTask>>,
    },
    SpecificUpdate(SpecificFields),
    Ping,
}

impl PushMessage {
    pub fn specific(fields: SpecificFields) -> Self {
        PushMessage::SpecificUpdate(fields)
    }

    pub fn is_full_snapshot(&self) -> bool {
        matches!(self, PushMessage::FullStatusUpdate { .. })
    }
}

/// Inbound requests from a push-channel client.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    GetFullStatus,
    GetChartUpdates,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags() {
        let json = serde_json::to_value(&PushMessage::Ping).unwrap();
        assert_eq!(json["type"], "ping");

        let json = serde_json::to_value(&PushMessage::LogUpdate {
            line: "\u{1b}[32mok\u{1b}[0m".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "log_update");
        // ANSI escapes survive serialization untouched
        assert!(json["line"].as_str().unwrap().contains('\u{1b}'));
    }

    #[test]
    fn test_specific_update_omits_absent_fields() {
        let msg = PushMessage::specific(SpecificFields {
            target_complete: Some(true),
            ..Default::default()
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "specific_update");
        assert_eq!(json["target_complete"], true);
        assert!(json.get("queues").is_none());
    }

    #[test]
    fn test_client_request_parsing() {
        let req: ClientRequest =
            serde_json::from_str(r#"{"action": "get_full_status"}"#).unwrap();
        assert_eq!(req, ClientRequest::GetFullStatus);
        // Untyped messages are rejected, no heuristic routing
        assert!(serde_json::from_str::<ClientRequest>(r#"{"hello": 1}"#).is_err());
    }
}
