#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Pinhole camera model and rigid poses.
pub mod camera;

/// wgpu compute backend.
#[cfg(feature = "gpu")]
pub mod gpu;

/// Flat parallel kernel launches.
pub mod parallel;

/// Point cloud type.
pub mod pointcloud;

/// Depth image unprojection.
pub mod unproject;
