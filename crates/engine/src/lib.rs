//! `engine` crate: notification workflow models, graph validation, template
//! rendering and the trigger instance scheduler.

pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod render;
pub mod delay;
pub mod condition;
pub mod graph;
pub mod store;
pub mod memory;
pub mod postgres;
pub mod manager;
pub mod scheduler;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use error::{EngineError, GraphError, RenderError, StoreError};
pub use models::{
    Edge, EdgeCondition, ExecutionOutcome, InstanceStatus, NodeExecutionRecord, NodeTemplate,
    NodeType, TriggerInstance, Workflow, WorkflowDefinition,
};
pub use graph::{validate, validate_definition, ValidatedGraph};
pub use manager::{DeletionKind, TriggerInstanceManager};
pub use store::{DefinitionStore, InstanceStore, WorkflowRemover};
pub use scheduler::{
    channel_registry, ChannelRegistry, ClaimedInstance, ExecutionScheduler, RunOutcome, StepOutcome,
    StepReport,
};
pub use worker::{Reaper, Worker};

#[cfg(test)]
mod scheduler_tests;
