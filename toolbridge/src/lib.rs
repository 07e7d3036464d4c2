//! Toolbridge core: a JSON-RPC 2.0 tool gateway and an agent task
//! supervisor.
//!
//! The gateway side exposes a small closed set of tools (calculator,
//! database, completion) through [`rpc::Dispatcher`]; the supervisor side
//! launches one external worker per task and reports its output and the
//! files it produced. The worker itself is opaque beyond its
//! stdin/output/exit-code contract.

pub mod completion;
pub mod errors;
pub mod eval;
pub mod query;
pub mod rpc;
pub mod supervisor;
pub mod tools;

pub use completion::{CompletionBackend, CompletionOutput, CompletionRequest, HttpCompletionClient};
pub use errors::{Result, ToolbridgeError};
pub use query::{QueryBuilder, QueryRequest, Statement};
pub use rpc::Dispatcher;
pub use supervisor::{SupervisorConfig, TaskOutcome, TaskRun, TaskSupervisor};
pub use tools::{ExecutionSink, ToolExecutionRecord, ToolKind, ToolRegistry, TracingSink};
