//! # Crescendo Common Library
//!
//! Shared code for the Crescendo backend services including:
//! - Database initialization, models and typed status enums
//! - Configuration loading
//! - Common error type
//! - Invitation token generation

pub mod config;
pub mod db;
pub mod error;
pub mod token;

pub use error::{Error, Result};
