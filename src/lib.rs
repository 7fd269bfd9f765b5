//! Cosmos forge library crate
//!
//! Budgeted context selection, a strict edit protocol, compile-gated
//! application and a bounded self-heal loop for LLM-driven code changes.
//! The binary is a thin driver over [`orchestrator::ExecutionOrchestrator`].

pub mod budget;
pub mod collab;
pub mod config;
pub mod edit;
pub mod failure;
pub mod heal;
pub mod index;
pub mod logging;
pub mod oracle;
pub mod orchestrator;
pub mod util;
pub mod validate;

pub use orchestrator::{ExecutionOrchestrator, ExecutionResult, TaskContext};
