//! # X-ray Data
//!
//! Everything between the files on disk and a stacked training batch:
//! image/annotation pairing, polygon rasterization into per-class masks,
//! joint augmentation, group k-fold splitting and a rayon-backed loader.

pub mod annotation;
pub mod augment;
pub mod dataset;
pub mod loader;
pub mod split;

pub use annotation::*;
pub use augment::*;
pub use dataset::*;
pub use loader::*;
pub use split::*;
