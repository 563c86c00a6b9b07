use thiserror::Error;

use crate::{
    allocator::{CpuAllocator, TensorAllocator, TensorAllocatorError},
    device::Device,
    storage::TensorStorage,
};

/// Failures raised while building or reshaping a [`Tensor`].
#[derive(Error, Debug, PartialEq)]
pub enum TensorError {
    /// The buffer length disagrees with the product of the shape.
    #[error("shape holds {numel} elements but the buffer has {len}")]
    ElementCount {
        /// Product of the requested shape.
        numel: usize,
        /// Length of the supplied buffer.
        len: usize,
    },

    /// A new leading length is larger than the current one.
    #[error("cannot grow the leading dimension from {rows} to {len}")]
    LengthOutOfRange {
        /// Requested leading length.
        len: usize,
        /// Current leading length.
        rows: usize,
    },

    /// The allocator refused the request.
    #[error(transparent)]
    Storage(#[from] TensorAllocatorError),

    /// The tensor has the wrong dimensions for the operation.
    #[error("{message}: wanted {expected}, found {actual}")]
    DimensionMismatch {
        /// What was being checked.
        message: String,
        /// Wanted dimensions, debug formatted.
        expected: String,
        /// Dimensions that were found, debug formatted.
        actual: String,
    },
}

impl TensorError {
    /// Builds a [`TensorError::DimensionMismatch`] from two shapes.
    pub fn dimension_mismatch(
        message: impl Into<String>,
        expected: &[usize],
        actual: &[usize],
    ) -> Self {
        let (expected, actual) = (format!("{expected:?}"), format!("{actual:?}"));
        Self::DimensionMismatch {
            message: message.into(),
            expected,
            actual,
        }
    }
}

/// Row-major strides for `shape`: the last axis is contiguous.
///
/// ```rust
/// use depthcloud_tensor::tensor::row_major_strides;
///
/// assert_eq!(row_major_strides([480, 640, 3]), [1920, 3, 1]);
/// assert_eq!(row_major_strides([5]), [1]);
/// ```
pub fn row_major_strides<const N: usize>(shape: [usize; N]) -> [usize; N] {
    let mut out = [1usize; N];
    for axis in (0..N.saturating_sub(1)).rev() {
        out[axis] = out[axis + 1].saturating_mul(shape[axis + 1]);
    }
    out
}

/// Dense, row-major, N-dimensional buffer owned through an allocator `A`.
///
/// The element buffer lives in a [`TensorStorage`]; `shape` and `strides`
/// describe how a multi-index maps onto it. Depth images are `Tensor2<u16>`
/// or `Tensor3<f32>` with a trailing unit axis, colors are `(h, w, 3)` and
/// point lists are `(n, 3)`.
///
/// ```rust
/// use depthcloud_tensor::{CpuAllocator, Tensor2};
///
/// let depth = Tensor2::<u16, _>::from_shape_vec([2, 3], vec![0, 1, 2, 3, 4, 5], CpuAllocator).unwrap();
/// assert_eq!(depth.get([1, 2]), Some(&5));
/// assert_eq!(depth.get([2, 0]), None);
/// ```
pub struct Tensor<T, const N: usize, A: TensorAllocator = CpuAllocator> {
    /// Backing elements.
    pub storage: TensorStorage<T, A>,
    /// Extent along each axis.
    pub shape: [usize; N],
    /// Elements skipped per unit step along each axis.
    pub strides: [usize; N],
}

impl<T, const N: usize, A: TensorAllocator> Tensor<T, N, A> {
    fn with_storage(shape: [usize; N], storage: TensorStorage<T, A>) -> Self {
        Self {
            strides: row_major_strides(shape),
            shape,
            storage,
        }
    }

    /// Wraps `data`, laid out row-major, as a tensor of the given `shape`.
    ///
    /// Fails with [`TensorError::ElementCount`] when `data.len()` is not the
    /// product of `shape`.
    pub fn from_shape_vec(shape: [usize; N], data: Vec<T>, alloc: A) -> Result<Self, TensorError> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(TensorError::ElementCount {
                numel,
                len: data.len(),
            });
        }
        Ok(Self::with_storage(shape, TensorStorage::from_vec(data, alloc)?))
    }

    /// A tensor with every element set to `value`.
    pub fn from_shape_val(shape: [usize; N], value: T, alloc: A) -> Result<Self, TensorError>
    where
        T: Clone,
    {
        let storage = TensorStorage::from_fn(shape.iter().product(), alloc, |_| value.clone())?;
        Ok(Self::with_storage(shape, storage))
    }

    /// Shorthand for [`Tensor::from_shape_val`] with `T::default()`.
    pub fn zeros(shape: [usize; N], alloc: A) -> Result<Self, TensorError>
    where
        T: Clone + Default,
    {
        Self::from_shape_val(shape, T::default(), alloc)
    }

    /// Fills the tensor by calling `f` with the multi-index of each element,
    /// visited in storage order.
    ///
    /// ```rust
    /// use depthcloud_tensor::{CpuAllocator, Tensor2};
    ///
    /// let eye = Tensor2::<f32, _>::from_shape_fn([2, 2], CpuAllocator, |[i, j]| {
    ///     if i == j { 1.0 } else { 0.0 }
    /// })
    /// .unwrap();
    /// assert_eq!(eye.as_slice(), &[1.0, 0.0, 0.0, 1.0]);
    /// ```
    pub fn from_shape_fn<F>(shape: [usize; N], alloc: A, f: F) -> Result<Self, TensorError>
    where
        F: Fn([usize; N]) -> T,
    {
        let strides = row_major_strides(shape);
        let storage = TensorStorage::from_fn(shape.iter().product(), alloc, |linear| {
            let mut rem = linear;
            f(strides.map(|step| {
                let coord = rem / step;
                rem %= step;
                coord
            }))
        })?;
        Ok(Self::with_storage(shape, storage))
    }

    /// Number of axes, always `N`.
    #[inline]
    pub fn rank(&self) -> usize {
        N
    }

    /// Total element count.
    #[inline]
    pub fn numel(&self) -> usize {
        self.storage.len()
    }

    /// Elements in storage order.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        self.storage.as_slice()
    }

    /// Mutable elements in storage order.
    #[inline]
    pub fn as_slice_mut(&mut self) -> &mut [T] {
        self.storage.as_mut_slice()
    }

    /// Address of the first element.
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.storage.as_ptr()
    }

    /// Mutable address of the first element.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.storage.as_mut_ptr()
    }

    /// Where the allocator placed the elements.
    #[inline]
    pub fn device(&self) -> Device {
        self.storage.device()
    }

    /// Checks that `shape` and `strides` still describe the storage: the shape
    /// holds exactly [`Tensor::numel`] elements and the strides are row-major.
    ///
    /// Both fields are public, so code that addresses the buffer through them
    /// without bounds checks must call this first.
    ///
    /// ```rust
    /// use depthcloud_tensor::{CpuAllocator, Tensor2};
    ///
    /// let mut t = Tensor2::<u16, _>::zeros([2, 2], CpuAllocator).unwrap();
    /// assert!(t.check_layout().is_ok());
    /// t.shape = [4, 4];
    /// assert!(t.check_layout().is_err());
    /// ```
    pub fn check_layout(&self) -> Result<(), TensorError> {
        let covered = self
            .shape
            .iter()
            .try_fold(1usize, |acc, &extent| acc.checked_mul(extent));
        if covered != Some(self.numel()) {
            return Err(TensorError::dimension_mismatch(
                "shape does not cover the storage",
                &[self.numel()],
                &self.shape,
            ));
        }
        let expected = row_major_strides(self.shape);
        if self.strides != expected {
            return Err(TensorError::dimension_mismatch(
                "strides are not row-major",
                &expected,
                &self.strides,
            ));
        }
        Ok(())
    }

    /// Consumes the tensor and returns its elements in row-major order.
    pub fn into_vec(self) -> Vec<T>
    where
        T: Clone,
    {
        self.storage.into_vec()
    }

    fn offset(&self, index: [usize; N]) -> usize {
        (0..N).map(|axis| index[axis] * self.strides[axis]).sum()
    }

    /// The element at `index`, or `None` when any coordinate is past its axis.
    pub fn get(&self, index: [usize; N]) -> Option<&T> {
        let inside = (0..N).all(|axis| index[axis] < self.shape[axis]);
        inside.then(|| self.as_slice().get(self.offset(index)))?
    }

    /// Returns a reference to the element at `index` without bounds checking.
    ///
    /// # Safety
    ///
    /// Every coordinate of `index` must be smaller than the matching dimension.
    #[inline]
    pub unsafe fn get_unchecked(&self, index: [usize; N]) -> &T {
        self.as_slice().get_unchecked(self.offset(index))
    }

    /// Shrinks the leading dimension to `len`, keeping the allocation.
    ///
    /// This is a constant-time view operation: no element is copied.
    ///
    /// Fails with [`TensorError::LengthOutOfRange`] if `len` is larger than
    /// the leading dimension and with [`TensorError::DimensionMismatch`] on a
    /// rank-0 tensor.
    ///
    /// ```rust
    /// use depthcloud_tensor::{CpuAllocator, Tensor2};
    ///
    /// let t = Tensor2::<f32, _>::zeros([4, 3], CpuAllocator).unwrap();
    /// let t = t.truncate(1).unwrap();
    /// assert_eq!(t.shape, [1, 3]);
    /// assert_eq!(t.numel(), 3);
    /// ```
    pub fn truncate(mut self, len: usize) -> Result<Self, TensorError> {
        let (Some(rows), Some(&row_stride)) = (self.shape.first_mut(), self.strides.first()) else {
            return Err(TensorError::dimension_mismatch(
                "cannot truncate a scalar tensor",
                &[1],
                &[],
            ));
        };
        if len > *rows {
            return Err(TensorError::LengthOutOfRange { len, rows: *rows });
        }
        *rows = len;
        self.storage.truncate(len * row_stride);
        Ok(self)
    }
}

impl<T: Clone, const N: usize, A: TensorAllocator> Clone for Tensor<T, N, A> {
    fn clone(&self) -> Self {
        Self::with_storage(self.shape, self.storage.clone())
    }
}

impl<T: std::fmt::Debug, const N: usize, A: TensorAllocator> std::fmt::Debug for Tensor<T, N, A> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("device", &self.device())
            .field("data", &self.as_slice())
            .finish()
    }
}

impl<T: PartialEq, const N: usize, A: TensorAllocator> PartialEq for Tensor<T, N, A> {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.as_slice() == other.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Tensor1, Tensor2, Tensor3};

    #[test]
    fn test_single_element_vector() -> Result<(), TensorError> {
        let t = Tensor1::<u8, _>::from_shape_vec([1], vec![9], CpuAllocator)?;
        assert_eq!((t.shape, t.strides), ([1], [1]));
        assert_eq!((t.rank(), t.numel()), (1, 1));
        assert_eq!(t.as_slice(), &[9]);
        Ok(())
    }

    #[test]
    fn test_buffer_length_must_match_shape() {
        let res = Tensor2::<u8, _>::from_shape_vec([2, 2], vec![1, 2, 3], CpuAllocator);
        assert_eq!(res.err(), Some(TensorError::ElementCount { numel: 4, len: 3 }));
    }

    #[test]
    fn test_index_fn_sees_every_coordinate() -> Result<(), TensorError> {
        let t = Tensor3::<usize, _>::from_shape_fn([2, 3, 2], CpuAllocator, |[i, j, k]| {
            i * 100 + j * 10 + k
        })?;
        assert_eq!(t.strides, [6, 2, 1]);
        assert_eq!(t.get([1, 2, 1]), Some(&121));
        assert_eq!(t.get([0, 1, 0]), Some(&10));
        assert_eq!(t.get([2, 0, 0]), None);
        assert_eq!(unsafe { *t.get_unchecked([1, 0, 1]) }, 101);
        Ok(())
    }

    #[test]
    fn test_truncate_leading_dim() -> Result<(), TensorError> {
        let t = Tensor2::<f32, _>::from_shape_fn([4, 3], CpuAllocator, |[i, j]| {
            (i * 3 + j) as f32
        })?;
        let ptr = t.as_ptr();
        let t = t.truncate(2)?;
        assert_eq!(t.shape, [2, 3]);
        assert_eq!(t.as_slice(), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(t.as_ptr(), ptr);

        let t = t.truncate(0)?;
        assert_eq!(t.numel(), 0);
        assert!(t.as_slice().is_empty());
        Ok(())
    }

    #[test]
    fn test_truncate_out_of_bounds() -> Result<(), TensorError> {
        let t = Tensor2::<f32, _>::zeros([2, 3], CpuAllocator)?;
        assert_eq!(
            t.truncate(3).err(),
            Some(TensorError::LengthOutOfRange { len: 3, rows: 2 })
        );
        Ok(())
    }

    #[test]
    fn test_check_layout_rejects_edited_fields() -> Result<(), TensorError> {
        let mut t = Tensor2::<u16, _>::zeros([2, 3], CpuAllocator)?;
        t.check_layout()?;

        t.shape = [4096, 4096];
        t.strides = [4096, 1];
        assert!(matches!(
            t.check_layout(),
            Err(TensorError::DimensionMismatch { .. })
        ));

        t.shape = [3, 2];
        t.strides = [3, 1];
        assert!(matches!(
            t.check_layout(),
            Err(TensorError::DimensionMismatch { .. })
        ));

        t.shape = [usize::MAX, 2];
        assert!(t.check_layout().is_err());
        Ok(())
    }

    #[test]
    fn test_strides_with_zero_extent() {
        assert_eq!(row_major_strides([0, 4, 3]), [12, 3, 1]);
        assert_eq!(row_major_strides([7]), [1]);
    }

    #[test]
    fn test_empty_tensor() -> Result<(), TensorError> {
        let t = Tensor3::<f32, _>::from_shape_vec([0, 0, 3], vec![], CpuAllocator)?;
        assert_eq!(t.numel(), 0);
        assert_eq!(t.device(), Device::Cpu);
        Ok(())
    }

    #[test]
    fn test_cloned_depth_is_independent() -> Result<(), TensorError> {
        let mut depth = Tensor2::<u16, _>::from_shape_vec([1, 2], vec![7, 8], CpuAllocator)?;
        let copy = depth.clone();
        assert_eq!(depth, copy);
        depth.as_slice_mut()[0] = 0;
        assert_ne!(depth, copy);
        assert_eq!(copy.into_vec(), vec![7, 8]);
        Ok(())
    }
}
