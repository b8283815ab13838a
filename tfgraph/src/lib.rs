//! tfgraph - Infrastructure graph planning and apply engine for Rust
//!
//! Takes a configuration, a prior state and a set of provider factories,
//! and produces either a plan of proposed resource-instance changes or, given
//! a plan, the state resulting from applying it through the providers.

// Core modules
pub mod addrs;
pub mod context;
pub mod error;
pub mod schema;
pub mod types;

// Inputs and state
pub mod config;
pub mod eval;
pub mod state;

// Provider seam
pub mod mock;
pub mod provider;
pub mod schema_cache;

// Graph construction
pub mod graph;
pub mod resolver;
pub mod transform;
pub mod transform_close;
pub mod transform_provider;
pub mod transform_reference;

// Planning and execution
mod exec;
pub mod hook;
pub mod plan;
pub mod planner;
pub mod upgrade;
pub mod walk;

// Re-exports for convenience
pub use addrs::{AbsProviderConfig, AbsResourceInstance, InstanceKey, ModuleInstance, ModulePath,
    Resource, ResourceMode};
pub use context::Context;
pub use error::{EngineError, Result};
pub use hook::{Hook, HookAction, HookMux};
pub use plan::{Changes, Plan, ResourceInstanceChange};
pub use planner::{ChangeAction, PlanMode};
pub use provider::{ProviderFactories, ProviderFactory, ProviderHandle};
pub use schema_cache::SchemaCache;
pub use state::{DeposedKey, ObjectStatus, ResourceInstanceObject, State, SyncState};
pub use types::{Diagnostic, DiagnosticSeverity, Diagnostics, Dynamic, DynamicValue};
pub use walk::{apply, import, plan, refresh, validate, ImportTarget, WalkOperation, WalkRequest};
