//! # X-ray Core
//!
//! Shared types for the hand X-ray bone segmentation pipeline: the error
//! type every crate reports through, the annotated bone classes, and the
//! serde-backed pipeline configuration.

pub mod classes;
pub mod config;
pub mod error;

pub use classes::*;
pub use config::*;
pub use error::{Error, Result};
