//! Shared domain types for Studio.
//!
//! Pure data: workflow definitions and per-thread state, condition trees,
//! approvals, agent configuration, LLM request/stream shapes, progress events,
//! and engine configuration. No I/O lives here -- `studio-core` defines the
//! behavior, `studio-infra` the adapters.

pub mod agent;
pub mod approval;
pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod llm;
pub mod workflow;
