use std::{marker::PhantomData, ptr::NonNull};

use crate::{allocator::TensorAllocator, tensor::TensorError, Tensor};

/// Maximum number of axes a strided view can address.
pub const MAX_RANK: usize = 5;

/// Shape and stride bookkeeping shared by the read and write views.
///
/// The first `active_dims` axes are addressed by coordinates; the remaining
/// trailing axes are contiguous and form one element of `element_len` scalars.
#[derive(Clone, Copy, Debug, PartialEq)]
struct StridedLayout {
    shape: [usize; MAX_RANK],
    strides: [usize; MAX_RANK],
    active_dims: usize,
    element_len: usize,
}

impl StridedLayout {
    const EMPTY: Self = Self {
        shape: [0; MAX_RANK],
        strides: [0; MAX_RANK],
        active_dims: 0,
        element_len: 0,
    };

    fn new<const N: usize>(
        shape: &[usize; N],
        strides: &[usize; N],
        active_dims: usize,
    ) -> Result<Self, TensorError> {
        if active_dims == 0 || active_dims > N || active_dims > MAX_RANK {
            return Err(TensorError::dimension_mismatch(
                "active dims must be in 1..=min(rank, MAX_RANK)",
                &[N.min(MAX_RANK)],
                &[active_dims],
            ));
        }

        let mut layout = Self {
            element_len: shape[active_dims..].iter().product(),
            active_dims,
            ..Self::EMPTY
        };
        layout.shape[..active_dims].copy_from_slice(&shape[..active_dims]);
        layout.strides[..active_dims].copy_from_slice(&strides[..active_dims]);
        Ok(layout)
    }

    #[inline(always)]
    fn offset(&self, coord: &[usize]) -> usize {
        debug_assert_eq!(coord.len(), self.active_dims);
        coord
            .iter()
            .zip(self.strides.iter())
            .fold(0, |acc, (c, s)| acc + c * s)
    }

    fn contains(&self, coord: &[usize]) -> bool {
        self.active_dims != 0
            && coord.len() == self.active_dims
            && coord.iter().zip(self.shape.iter()).all(|(c, s)| c < s)
    }
}

/// A read-only strided view into a tensor.
///
/// A view built with [`StridedView::empty`] has rank 0 and stands for a tensor
/// that does not exist; consumers must check [`StridedView::exists`] before
/// dereferencing it.
///
/// # Examples
///
/// ```rust
/// use depthcloud_tensor::{view::StridedView, CpuAllocator, Tensor3};
///
/// let rgb = Tensor3::<f32, _>::from_shape_fn([2, 2, 3], CpuAllocator, |[r, c, ch]| {
///     (r * 100 + c * 10 + ch) as f32
/// })
/// .unwrap();
///
/// let view = StridedView::new(&rgb, 2).unwrap();
/// assert_eq!(view.element_len(), 3);
/// assert_eq!(view.get(&[1, 0]), Some(&[100.0, 101.0, 102.0][..]));
/// ```
pub struct StridedView<'a, T> {
    ptr: NonNull<T>,
    layout: StridedLayout,
    _marker: PhantomData<&'a T>,
}

impl<T> Clone for StridedView<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StridedView<'_, T> {}

impl<'a, T> StridedView<'a, T> {
    /// Creates a view over `tensor` addressing its first `active_dims` axes.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::DimensionMismatch`] if `active_dims` is zero or
    /// larger than the tensor rank, or if the tensor fails
    /// [`Tensor::check_layout`].
    pub fn new<const N: usize, A: TensorAllocator>(
        tensor: &'a Tensor<T, N, A>,
        active_dims: usize,
    ) -> Result<Self, TensorError> {
        tensor.check_layout()?;
        let layout = StridedLayout::new(&tensor.shape, &tensor.strides, active_dims)?;
        let ptr = NonNull::new(tensor.as_ptr() as *mut T).unwrap_or(NonNull::dangling());
        Ok(Self {
            ptr,
            layout,
            _marker: PhantomData,
        })
    }

    /// Creates the rank-0 view standing for an absent tensor.
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            layout: StridedLayout::EMPTY,
            _marker: PhantomData,
        }
    }

    /// Number of addressable axes; 0 for an absent view.
    #[inline]
    pub fn rank(&self) -> usize {
        self.layout.active_dims
    }

    /// Returns false for the rank-0 view.
    #[inline]
    pub fn exists(&self) -> bool {
        self.layout.active_dims != 0
    }

    /// Sizes of the addressable axes.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.layout.shape[..self.layout.active_dims]
    }

    /// Number of scalars making up one element.
    #[inline]
    pub fn element_len(&self) -> usize {
        self.layout.element_len
    }

    /// Linear offset, in scalars, of the element at `coord`.
    #[inline(always)]
    pub fn offset(&self, coord: &[usize]) -> usize {
        self.layout.offset(coord)
    }

    /// Returns the element at `coord` without bounds checking.
    ///
    /// # Safety
    ///
    /// The view must exist and every coordinate must be inside its shape.
    #[inline(always)]
    pub unsafe fn get_unchecked(&self, coord: &[usize]) -> &'a [T] {
        std::slice::from_raw_parts(
            self.ptr.as_ptr().add(self.layout.offset(coord)),
            self.layout.element_len,
        )
    }

    /// Returns the element at `coord`, or `None` if the view is absent or the
    /// coordinate is out of bounds.
    pub fn get(&self, coord: &[usize]) -> Option<&'a [T]> {
        if !self.layout.contains(coord) {
            return None;
        }
        // SAFETY: the view exists and the coordinate was bounds checked
        Some(unsafe { self.get_unchecked(coord) })
    }
}

// SAFETY: the view only hands out shared references to `T`.
unsafe impl<T: Sync> Send for StridedView<'_, T> {}
// SAFETY: the view only hands out shared references to `T`.
unsafe impl<T: Sync> Sync for StridedView<'_, T> {}

/// A writable strided view into a tensor that can be shared between workers.
///
/// All write methods are `unsafe`: concurrent callers must target disjoint
/// coordinates, which is what lets the view be `Sync` while it mutably
/// borrows the tensor.
pub struct StridedViewMut<'a, T> {
    ptr: NonNull<T>,
    layout: StridedLayout,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T> StridedViewMut<'a, T> {
    /// Creates a writable view over `tensor` addressing its first `active_dims` axes.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::DimensionMismatch`] if `active_dims` is zero or
    /// larger than the tensor rank, or if the tensor fails
    /// [`Tensor::check_layout`].
    pub fn new<const N: usize, A: TensorAllocator>(
        tensor: &'a mut Tensor<T, N, A>,
        active_dims: usize,
    ) -> Result<Self, TensorError> {
        tensor.check_layout()?;
        let layout = StridedLayout::new(&tensor.shape, &tensor.strides, active_dims)?;
        let ptr = NonNull::new(tensor.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Ok(Self {
            ptr,
            layout,
            _marker: PhantomData,
        })
    }

    /// Creates the rank-0 view standing for an absent tensor.
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            layout: StridedLayout::EMPTY,
            _marker: PhantomData,
        }
    }

    /// Number of addressable axes; 0 for an absent view.
    #[inline]
    pub fn rank(&self) -> usize {
        self.layout.active_dims
    }

    /// Returns false for the rank-0 view.
    #[inline]
    pub fn exists(&self) -> bool {
        self.layout.active_dims != 0
    }

    /// Sizes of the addressable axes.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.layout.shape[..self.layout.active_dims]
    }

    /// Number of scalars making up one element.
    #[inline]
    pub fn element_len(&self) -> usize {
        self.layout.element_len
    }

    /// Linear offset, in scalars, of the element at `coord`.
    #[inline(always)]
    pub fn offset(&self, coord: &[usize]) -> usize {
        self.layout.offset(coord)
    }

    /// Returns a pointer to the first scalar of the element at `coord`.
    ///
    /// # Safety
    ///
    /// The view must exist and every coordinate must be inside its shape.
    #[inline(always)]
    pub unsafe fn ptr_unchecked(&self, coord: &[usize]) -> *mut T {
        self.ptr.as_ptr().add(self.layout.offset(coord))
    }

    /// Copies `values` into the element at `coord` without bounds checking.
    ///
    /// # Safety
    ///
    /// The view must exist, every coordinate must be inside its shape,
    /// `values.len()` must not exceed [`Self::element_len`], and no other
    /// thread may access the same element concurrently.
    #[inline(always)]
    pub unsafe fn write_unchecked(&self, coord: &[usize], values: &[T])
    where
        T: Copy,
    {
        debug_assert!(values.len() <= self.layout.element_len);
        std::ptr::copy_nonoverlapping(values.as_ptr(), self.ptr_unchecked(coord), values.len());
    }
}

// SAFETY: the view stands for a unique borrow of the tensor.
unsafe impl<T: Send> Send for StridedViewMut<'_, T> {}
// SAFETY: shared use only goes through the unsafe write methods whose callers
// guarantee disjoint elements per thread.
unsafe impl<T: Send> Sync for StridedViewMut<'_, T> {}
