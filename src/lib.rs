/// Error types for the monitoring engine
pub mod error;

/// Observations, verdicts and alarm statuses
pub mod model;

/// Configuration management
pub mod config;

/// Probe engine, health classifier and observation sources
pub mod probe;

/// Cross-invocation state store
pub mod state;

/// Credentials, remote execution and the remediation dispatcher
pub mod remediation;

/// Deferred post-remediation verification
pub mod recovery;

/// Alert router and messaging backends
pub mod alerts;

/// Per-invocation control flow
pub mod orchestrator;

/// Watch-mode scheduling loop
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by the engine's async trait seams
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// Re-export commonly used types
pub use error::{AlertError, ConfigError, CredentialError, ExecError, RemediationError, StateError};
pub use orchestrator::{CycleReport, Orchestrator};
