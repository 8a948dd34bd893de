//! Policy and runtime layer for the heron task orchestrator.
//!
//! Builds on `heron-db`: the [`service::TaskService`] owns lifecycle policy
//! (creation, retry, cancellation, batching, lineage), the [`dispatch`]
//! module is the broker seam, the [`worker`] module runs dispatched jobs,
//! the [`llm`] module talks to the model provider, and [`template`] holds
//! the static prompt catalog.

pub mod dispatch;
pub mod llm;
pub mod service;
pub mod template;
pub mod worker;
