//! Workflow engine core: validation, scheduling, and durable checkpointing.
//!
//! This module contains the "brain" of the orchestrator:
//! - `definition` -- request validation (DAG shape, agent bindings)
//! - `dag` -- cycle detection, dependency adjacency, descendant closure
//! - `template` -- `{stepId.output}` variable resolution
//! - `condition` -- legacy expression parser and structured rule-tree evaluator
//! - `operator` -- context-aware success/blocked/failed classification
//! - `step_runner` -- executor registry and the six step executors
//! - `executor` -- ready-frontier scheduler with checkpointing
//! - `checkpoint` -- durable state persistence wrapper
//! - `orchestrator` -- entry-point facade (validate, resolve, run, resume)
//! - `monitor` -- heartbeat watchdog with auto-resume
//! - `registry` -- live/historical thread index and graph projection

pub mod checkpoint;
pub mod condition;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod monitor;
pub mod operator;
pub mod orchestrator;
pub mod registry;
pub mod step_runner;
pub mod template;
