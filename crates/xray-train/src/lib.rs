//! # X-ray Train
//!
//! Optimization pieces for the segmentation network: the combined
//! deep-supervision loss, pluggable learning-rate schedules and a trainer
//! that runs single training and validation steps. Iterating epochs and
//! recording metrics is left to the caller.

pub mod loss;
pub mod scheduler;
pub mod trainer;

pub use loss::*;
pub use scheduler::*;
pub use trainer::*;
