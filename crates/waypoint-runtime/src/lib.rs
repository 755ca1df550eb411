pub mod context;
pub mod evolution;
pub mod graph;
pub mod ledger;
pub mod run_log;
pub mod runtime;
pub mod wait;

pub use context::ExecutionContext;
pub use evolution::{EvolutionGuard, ExecutorProbation, ProbationRunner};
pub use graph::{
    ExecutionResult, ExecutionStatus, GraphExecutor, NodeContext, NodeExecutor, NodeRegistry,
    NodeResult, RunRequest,
};
pub use ledger::RunLedger;
pub use run_log::EventJournal;
pub use runtime::WorkflowRuntime;
pub use wait::DurableWaitRuntime;
