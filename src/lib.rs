//! opsguard library crate
//!
//! Verification-gated remediation: reproduce a reported failure in a
//! sandbox, ask a generation backend for a full-file fix, and keep it only
//! if the sandbox says it works. The CLI in `main.rs` is a thin shell over
//! [`orchestrator::Orchestrator`].

pub mod classify;
pub mod config;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod patch;
pub mod report;
pub mod sandbox;
pub mod util;
pub mod workspace;
