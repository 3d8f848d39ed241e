//! Worker Pool: job handlers and the execution slots that run them.

pub mod builtin;
mod handler;
mod pool;

pub use builtin::{Capability, CapabilityHandler, EchoCapability, WorkflowGraph, WorkflowGraphHandler};
pub use handler::{FnHandler, HandlerError, HandlerRegistry, JobContext, JobHandler, RegistryHandler, handler_fn};
pub use pool::{ProcessOutcome, WorkerConfig, WorkerPool, WorkerStats};
