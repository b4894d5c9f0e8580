//! Execution core: the variable pool, the node-level dispatcher, the run-level
//! engine and the event queue that connects them to consumers.

pub mod dispatcher;
pub mod event_bus;
pub mod executing_nodes;
pub mod execution_context;
pub mod graph_engine;
pub mod pause;
pub mod queue_manager;
pub mod runtime_context;
pub mod runtime_state;
pub mod stop_signal;
pub mod sub_graph_runner;
pub mod variable_pool;

pub use dispatcher::{DispatchOutcome, WorkflowDispatcher};
pub use event_bus::{EventEmitter, GraphEngineEvent};
pub use executing_nodes::ExecutingNodesManager;
pub use execution_context::{ExecutionContext, InvokeFrom};
pub use graph_engine::{GraphEngine, ResumeTarget, RunOutcome};
pub use pause::{
    PauseReason, PauseReasonType, PausedNode, ResumeRequest, RunCheckpoint, WorkflowPause,
    WorkflowPauseReason,
};
pub use queue_manager::{
    AppMode, PublishFrom, QueueEvent, QueueListener, QueueManager, QueueMessage, StopReason,
};
pub use runtime_context::{
    FakeIdGenerator, FakeTimeProvider, IdGenerator, RealIdGenerator, RealTimeProvider,
    RuntimeContext, TimeProvider,
};
pub use runtime_state::GraphRuntimeState;
pub use stop_signal::StopSignal;
pub use sub_graph_runner::{DefaultSubGraphRunner, SubGraphOutput, SubGraphRunner};
pub use variable_pool::{Segment, Selector, VariablePool};
