//! Graph execution: node dispatch, attempt-scoped memory and traversal.
//!
//! A workflow is a `GraphSpec` of nodes joined by conditional edges. The
//! `GraphExecutor` walks it from the entry node, running each node through
//! the executor registered for it, retrying failed attempts, and following
//! the first edge whose condition holds. Every attempt is recorded in the
//! Run Ledger as one decision with exactly one outcome.

pub mod executor;
pub mod memory;
pub mod node;
pub mod output;
pub mod registry;

pub use executor::{ExecutionResult, ExecutionStatus, GraphExecutor, RunRequest, APPROVAL_KEY};
pub use memory::{AttemptMemory, SharedMemory};
pub use node::{NodeContext, NodeExecutor, NodeResult, Redelivery};
pub use output::OutputValidator;
pub use registry::NodeRegistry;
