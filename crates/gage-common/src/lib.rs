//! # gage-common
//!
//! Configuration and error handling shared by the gage call crates.
//! This is the foundation layer — no call logic, just primitives and contracts.

pub mod config;
pub mod error;

pub use error::{CallError, CallResult};
