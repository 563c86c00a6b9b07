#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Overview
//!
//! `depthcloud-tensor` provides the owned, allocator-backed [`Tensor`] used by the
//! depthcloud kernels and the strided views the kernels address it through.
//!
//! - **Tensor**: row-major multi-dimensional array with const-generic rank
//! - **TensorStorage**: allocator-backed buffer that can shrink in place
//! - **StridedView / StridedViewMut**: unchecked coordinate addressing with a rank-0
//!   "absent" state
//! - **Device**: memory space tag used to reject mixed-device kernel inputs
//!
//! ```rust
//! use depthcloud_tensor::{CpuAllocator, Tensor2};
//!
//! let depth = Tensor2::<u16, _>::from_shape_vec([2, 2], vec![0, 500, 1000, 20000], CpuAllocator)
//!     .unwrap();
//! assert_eq!(depth.get([1, 0]), Some(&1000));
//! ```

/// Allocator module containing memory management utilities.
pub mod allocator;

/// Device module containing the memory space tag.
pub mod device;

/// Storage module containing the low-level memory buffer.
pub mod storage;

/// Tensor module containing the main tensor implementation and error types.
pub mod tensor;

/// View module containing the strided element views.
pub mod view;

pub use crate::allocator::{CpuAllocator, TensorAllocator, TensorAllocatorError};
pub use crate::device::Device;
pub use crate::tensor::{Tensor, TensorError};
pub use crate::view::{StridedView, StridedViewMut};

/// Type alias for a 1-dimensional tensor.
pub type Tensor1<T, A = CpuAllocator> = Tensor<T, 1, A>;

/// Type alias for a 2-dimensional tensor.
pub type Tensor2<T, A = CpuAllocator> = Tensor<T, 2, A>;

/// Type alias for a 3-dimensional tensor.
pub type Tensor3<T, A = CpuAllocator> = Tensor<T, 3, A>;

/// Type alias for a 4-dimensional tensor.
pub type Tensor4<T, A = CpuAllocator> = Tensor<T, 4, A>;
