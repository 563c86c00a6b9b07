#![doc = include_str!("../README.md")]

#[doc(inline)]
pub use depthcloud_tensor as tensor;

#[doc(inline)]
pub use depthcloud_3d as k3d;
