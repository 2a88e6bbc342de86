//! procflow-core: a process orchestrator for BPMN-style graphs.
//!
//! Instances move token by token through a validated [`ProcessGraph`].
//! Gateways pick branches with the [`GatewayResolver`], wait events park
//! until the [`TriggerRegistry`] reports a timer, message or signal, and the
//! [`Orchestrator`] commits every step to a [`ProcessStore`] before any
//! trigger is registered.

pub mod auth;
pub mod condition;
pub mod config;
pub mod definition;
pub mod error;
pub mod gateway;
pub mod graph;
pub mod orchestrator;
pub mod provider;
pub mod store;
pub mod store_memory;
pub mod timer;
pub mod triggers;
pub mod types;

pub use auth::{AllowAll, AuthorizationCheck, TaskAccessPolicy, TaskAccessRule};
pub use condition::{ConditionError, ConditionEvaluator};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use gateway::{GatewayResolver, Resolution};
pub use graph::{validate_graph, ProcessGraph, ValidationError};
pub use orchestrator::Orchestrator;
pub use provider::{DirectoryGraphProvider, GraphProvider, MemoryGraphProvider};
pub use store::{ProcessStore, VersionConflict};
pub use store_memory::MemoryStore;
pub use timer::TimerSpec;
pub use triggers::{Subscription, SubscriptionKind, TimerHandle, TriggerRegistry, TriggerSink};
pub use types::*;
