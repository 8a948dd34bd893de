//! Worker runtime: the handler registry, the LLM execution handler, and
//! the pool that runs dispatched jobs.

pub mod execute_llm;
pub mod pool;
pub mod registry;

pub use execute_llm::ExecuteLlmHandler;
pub use pool::{WorkerPoolConfig, run_worker_pool};
pub use registry::{JobContext, JobHandler, WorkerRegistry};
