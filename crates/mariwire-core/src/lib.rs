//! Core types for the mariwire MariaDB/MySQL driver.
//!
//! This crate provides the foundational pieces shared by the driver:
//!
//! - `Error` taxonomy distinguishing connectivity, server, protocol,
//!   configuration and cache-consistency failures
//! - `Value` for positional prepared-statement parameters
//! - `IsolationLevel` for session initialisation
//! - `Outcome` and `Cx` re-exports from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod error;
pub mod isolation;
pub mod value;

pub use error::{Error, Result};
pub use isolation::IsolationLevel;
pub use value::Value;
