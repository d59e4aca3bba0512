//! # X-ray Segment
//!
//! Hand X-ray bone segmentation network: a UNet3+ dense fusion decoder over
//! an HRNet encoder, with deep supervision and a classification gate.
//!
//! ## Architecture Overview
//!
//! 1. **Multi-Resolution Encoder**: full-resolution stem plus HRNet-W64,
//!    merged into five levels at strides 1, 4, 8, 16 and 32
//! 2. **Dense Fusion Decoder**: every decoder stage resamples all levels to
//!    its resolution, projects and concatenates them
//! 3. **Deep Supervision**: one class map per decoder level, resized to the
//!    output resolution
//! 4. **Classification Gate**: per-class presence scores from the coarsest
//!    level scale every class map
//!
//! Training mode stacks the five outputs along the batch axis; inference
//! mode returns the finest one.

pub mod decoder;
pub mod encoder;
pub mod heads;
pub mod hrnet;
pub mod inference;
pub mod init;
pub mod layers;
pub mod model;
pub mod residual;

pub use decoder::*;
pub use encoder::*;
pub use heads::*;
pub use hrnet::*;
pub use inference::*;
pub use model::*;
pub use residual::*;
