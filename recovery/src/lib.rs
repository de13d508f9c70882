//! Error recovery for helpdesk backend calls.
//!
//! Wraps data calls against the hosted backend (auth, Postgres, storage, RPC)
//! with error classification, exponential backoff, session refresh on
//! authentication failures, and a bounded in-process error trail.
//!
//! The entry point is [`ErrorRecoveryService`]; construct one per diagnostic
//! trail and hand clones to the callers that need it.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod auth;
pub mod classifier;
pub mod config;
pub mod context;
pub mod error;
pub mod log;
pub mod policy;
pub mod probe;
pub mod service;

pub use auth::{HttpSessionRefresher, Session, SessionRefresher, SessionStore};
pub use classifier::{
    ErrorClassification, ErrorClassifier, ErrorDescriptor, ErrorShape, KeywordTable,
    OperationError,
};
pub use context::OperationContext;
pub use error::{RecoveryError, Result};
pub use log::{ErrorLog, ErrorLogEntry, ErrorStats, SessionId};
pub use policy::RetryPolicy;
pub use probe::{ConnectivityProbe, HttpConnectivityProbe};
pub use service::{
    ClientEnvironment, ErrorRecoveryService, RecoveryAction, RecoveryFailure, RecoveryResult,
};

/// Crate version, stamped into the default user agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
