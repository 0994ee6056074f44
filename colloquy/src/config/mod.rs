//! Configuration module for the gateway runtime
//!
//! Typed configuration for the connection registry, the background monitor
//! and the external orchestrator/auth seams. Secrets are never stored in the
//! config itself; the config carries the *names* of the environment variables
//! that hold them.

pub mod types;

pub use types::*;
