//! # xworkflow-engine: graph execution core for Dify-compatible workflows
//!
//! The engine turns a declarative node/edge graph into a running computation.
//! It decides *when* a node runs, *what* it may see, *how* failures and pauses
//! propagate and *how fairly* concurrent runs share execution slots. What a
//! node computes is up to its [`NodeExecutor`](nodes::NodeExecutor); model and
//! tool calls go through the [`ModelRuntime`](nodes::ModelRuntime) and
//! [`ToolRuntime`](nodes::ToolRuntime) traits.
//!
//! - **Routing**: edges carry a source handle or a run condition; fan-out,
//!   joins and skip propagation follow per-edge `Taken`/`Skipped` states.
//! - **Streaming**: node events are mapped onto an external event vocabulary
//!   and delivered through a bounded queue that ends on a terminal event.
//! - **Pause/resume**: human-input nodes and time-slice yields persist a
//!   checkpoint; a resume consumes it exactly once and continues the walk.
//! - **Error strategies**: retries with backoff, then fail-branch or
//!   default-value routing for the node types that support it.
//! - **Fair admission**: a tiered run queue with time slicing and aging.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use xworkflow_engine::{parse_dsl, DslFormat, RunRequest, WorkflowRunner};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let yaml = std::fs::read_to_string("workflow.yaml")?;
//!     let schema = parse_dsl(&yaml, DslFormat::Yaml)?;
//!     let runner = WorkflowRunner::builder(schema).build()?;
//!     let handle = runner.run(RunRequest::new(HashMap::new())).await?;
//!     println!("{:?}", handle.wait().await);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod core;
pub mod dsl;
pub mod error;
pub mod evaluator;
pub mod graph;
pub mod nodes;
pub mod repository;
pub mod scheduler;
pub mod template;

pub use crate::api::{ExecutionStatus, RunRequest, WorkflowHandle, WorkflowRunner, WorkflowRunnerBuilder};
pub use crate::config::{ConfigFormat, EngineConfig, FairnessConfig};
pub use crate::core::{
    AppMode, DefaultSubGraphRunner, ExecutionContext, FakeIdGenerator, FakeTimeProvider,
    GraphEngine, GraphEngineEvent, IdGenerator, PauseReason, QueueEvent, QueueListener,
    QueueManager, QueueMessage, RealIdGenerator, RealTimeProvider, ResumeRequest, RunOutcome,
    RuntimeContext, Segment, StopSignal, SubGraphRunner, TimeProvider, VariablePool,
    WorkflowDispatcher,
};
pub use crate::dsl::{parse_dsl, DslFormat, WorkflowSchema};
pub use crate::error::{NodeError, RepositoryError, WorkflowError};
pub use crate::graph::{build_graph, Graph};
pub use crate::nodes::{NodeExecutor, NodeExecutorRegistry};
pub use crate::repository::{
    FilePauseStore, InMemoryConversationVariableUpdater, InMemoryExecutionRepository,
    InMemoryPauseStore, WorkflowExecution, WorkflowExecutionStatus,
};
pub use crate::scheduler::{FairnessScheduler, QueueTier, RunQueue, RunTicket};
