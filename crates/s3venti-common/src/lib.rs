//! s3venti Common - Shared types and utilities
//!
//! This crate provides the content-addressing primitives, block and chunk
//! types, error definitions and configuration used across all s3venti
//! components.

pub mod config;
pub mod error;
pub mod score;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use score::{ContentAddresser, SCORE_SIZE, Score, ScoreError};
pub use types::*;
