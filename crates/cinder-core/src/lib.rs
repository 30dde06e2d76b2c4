//! Cinder CI Core
//!
//! Core domain types, traits, and error handling for Cinder CI.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod error;
pub mod events;
pub mod gate;
pub mod ids;
pub mod interpolation;
pub mod pipeline;
pub mod ports;
pub mod run;
pub mod secrets;

pub use error::{Error, Result};
pub use ids::*;
