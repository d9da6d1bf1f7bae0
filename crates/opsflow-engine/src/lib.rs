//! # Workflow Execution Engine
//!
//! A persistent, distributed, multi-worker runtime that interprets
//! directed-acyclic process definitions and drives them across remote plugin
//! services.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ProcessService                        │
//! │   (start instances, route operations, build previews)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Workflow (one per instance)                │
//! │  single-writer event loop: node completions + operations   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Scheduler (per worker process)               │
//! │   operation scanner · takeover scanner · registry          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every node-status transition is written through the repository before the
//! engine treats it as observable; worker failure is recovered through the
//! heartbeat/takeover CAS protocol.

pub mod error;
pub mod invoker;
pub mod node;
pub mod preview;
pub mod recovery;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod workflow;

pub use error::EngineError;
pub use invoker::{CorrelationIndex, ExecOutcome, HttpPluginInvoker, InvokeError, PluginInvoker};
pub use registry::{WorkflowHandle, WorkflowRegistry};
pub use resolver::{EntityFilter, EntityResolver, ExpressionHop, HttpEntityResolver, ResolveError};
pub use retry::RetryPolicy;
pub use scheduler::Scheduler;
pub use service::{EngineDeps, OperationRequest, ProcessService};
pub use workflow::{LoopMsg, Workflow, WorkflowCommand};
