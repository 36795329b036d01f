//! # Conductor Core
//!
//! Business logic for the Conductor multi-agent code-generation pipeline.
//!
//! ## Architecture
//!
//! - `orchestrator/` - state of record: task ledger, role queues, subscriber
//!   fan-out, agent supervisor
//! - `agents/` - coordinator, role workers and structurer loops (run as
//!   separate processes, speak HTTP to the orchestrator)
//! - `providers/` - chat-completion adapter boundary for LLM vendors
//! - `repo/` - file tree snapshot and the git-backed repository gateway
//! - `models` / `config` - centralized provider and process configuration

pub mod agents;
pub mod config;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod repo;
pub mod text;
