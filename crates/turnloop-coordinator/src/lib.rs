//! Thin composition layer over N independent `turnloop_agent` sessions:
//! spawns bounded sub-sessions and aggregates their typed results (§4.6).
//! Internal scheduling beyond per-lane caps is intentionally out of scope,
//! per §1 — this crate composes cores, it does not reimplement one.

mod catalog;
mod coordinator;
mod lanes;
mod naming;

pub use catalog::{SubagentCatalog, SubagentTypeConfig};
pub use coordinator::{
    Coordinator, CoordinatorConfig, RunOptions, SubagentResult, SubagentRunStatus, SubagentSpec,
};
