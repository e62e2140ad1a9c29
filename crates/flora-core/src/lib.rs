//! Core types and configuration for flora.
//!
//! This crate provides the foundational pieces shared by the rest of the
//! workspace:
//!
//! - Network configuration (rank, alpha, dropout, block selection, LoRA+ ratios)
//! - Common type definitions (Dtype, Device, TrainBlocks)
//! - Error handling infrastructure

#![warn(missing_docs)]

mod config;
mod error;
mod types;

pub use config::*;
pub use error::*;
pub use types::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{FloraError, Result};
    pub use crate::types::*;
}
