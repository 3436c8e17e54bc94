pub mod adaptive;
pub mod bus;
pub mod journal;
pub mod multi;
pub mod pipeline;
pub mod worker;
pub mod workers;
pub mod workflow;

pub use adaptive::{AdaptiveController, AdaptiveReport, CachedController, WorkflowRunner};
pub use bus::{BusStats, MessageBus};
pub use journal::RunJournal;
pub use multi::{FinalResult, MultiWorkerWorkflow, RunParams, RunState, WorkflowReport};
pub use pipeline::{Collaborators, Pipeline, PipelineOutcome, PipelineState};
pub use worker::{request, Worker, WorkerHost, WorkerReport};
pub use workers::{Supervisor, SupervisorReport, WorkerPool};
pub use workflow::{build_engine, WorkflowEngine, WorkflowGraph};
