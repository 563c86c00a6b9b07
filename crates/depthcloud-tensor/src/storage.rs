use std::{alloc::Layout, ptr::NonNull};

use crate::{
    allocator::{TensorAllocator, TensorAllocatorError},
    device::Device,
};

/// Owned, allocator-backed buffer holding the elements of a tensor.
///
/// The buffer keeps the layout it was allocated with, so the visible length can
/// shrink in place with [`TensorStorage::truncate`] without reallocating.
///
/// Memory comes from `A` and goes back to `A` on drop. Zero-length buffers
/// never touch the allocator.
pub struct TensorStorage<T, A: TensorAllocator> {
    /// Start of the allocation, dangling when the layout is empty.
    ptr: NonNull<T>,
    /// Number of initialized elements visible through this storage.
    len: usize,
    /// Layout handed to the allocator, kept for `dealloc`.
    layout: Layout,
    alloc: A,
}

impl<T, A: TensorAllocator> TensorStorage<T, A> {
    fn allocate(len: usize, alloc: &A) -> Result<(NonNull<T>, Layout), TensorAllocatorError> {
        let layout = Layout::array::<T>(len)?;
        if layout.size() == 0 {
            return Ok((NonNull::dangling(), layout));
        }
        let raw_ptr = alloc.alloc(layout)?;
        let ptr = NonNull::new(raw_ptr as *mut T)
            .ok_or(TensorAllocatorError::OutOfMemory(layout.size()))?;
        Ok((ptr, layout))
    }

    /// Allocates `len` elements and initializes slot `i` with `f(i)`.
    pub fn from_fn<F>(len: usize, alloc: A, mut f: F) -> Result<Self, TensorAllocatorError>
    where
        F: FnMut(usize) -> T,
    {
        let (ptr, layout) = Self::allocate(len, &alloc)?;
        for i in 0..len {
            // SAFETY: ptr is valid for `len` writes of T
            unsafe { ptr.as_ptr().add(i).write(f(i)) };
        }
        Ok(Self {
            ptr,
            len,
            layout,
            alloc,
        })
    }

    /// Moves the elements of `value` into memory obtained from `alloc`.
    pub fn from_vec(mut value: Vec<T>, alloc: A) -> Result<Self, TensorAllocatorError> {
        let len = value.len();
        let (ptr, layout) = Self::allocate(len, &alloc)?;

        // SAFETY: both regions hold `len` elements and don't overlap; the vector
        // gives up ownership of the moved elements before it is dropped.
        unsafe {
            std::ptr::copy_nonoverlapping(value.as_ptr(), ptr.as_ptr(), len);
            value.set_len(0);
        }

        Ok(Self {
            ptr,
            len,
            layout,
            alloc,
        })
    }

    /// Raw start of the elements.
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    /// Raw mutable start of the elements.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// The visible elements.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: ptr is valid and initialized for `len` elements
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The visible elements, mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: ptr is valid, initialized for `len` elements and exclusively borrowed
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Returns the number of visible elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the storage holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the memory layout of the allocation.
    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Returns the allocator of the storage.
    #[inline]
    pub fn alloc(&self) -> &A {
        &self.alloc
    }

    /// Returns the device where the storage lives.
    #[inline]
    pub fn device(&self) -> Device {
        self.alloc.device()
    }

    /// Shortens the visible length to `len` elements, keeping the allocation.
    ///
    /// Has no effect if `len` is greater than or equal to the current length.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        let tail = std::ptr::slice_from_raw_parts_mut(
            // SAFETY: len < self.len so the offset stays inside the allocation
            unsafe { self.ptr.as_ptr().add(len) },
            self.len - len,
        );
        self.len = len;
        // SAFETY: the tail elements are initialized and no longer reachable
        unsafe { std::ptr::drop_in_place(tail) };
    }

    /// Consumes the storage and returns the visible elements as a vector.
    pub fn into_vec(self) -> Vec<T>
    where
        T: Clone,
    {
        self.as_slice().to_vec()
    }
}

// SAFETY: the storage exclusively owns its buffer, so moving it across threads
// moves the elements with it.
unsafe impl<T: Send, A: TensorAllocator> Send for TensorStorage<T, A> {}

// SAFETY: shared access only hands out `&[T]`.
unsafe impl<T: Sync, A: TensorAllocator> Sync for TensorStorage<T, A> {}

impl<T, A: TensorAllocator> Drop for TensorStorage<T, A> {
    fn drop(&mut self) {
        // SAFETY: the visible elements are initialized and owned by the storage
        unsafe {
            std::ptr::drop_in_place(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            ))
        };
        if self.layout.size() != 0 {
            self.alloc
                .dealloc(self.ptr.as_ptr() as *mut u8, self.layout);
        }
    }
}

impl<T: Clone, A: TensorAllocator> Clone for TensorStorage<T, A> {
    /// Deep copies the visible elements. Panics if the allocator fails.
    fn clone(&self) -> Self {
        let src = self.as_slice();
        match Self::from_fn(self.len, self.alloc.clone(), |i| src[i].clone()) {
            Ok(storage) => storage,
            Err(e) => panic!("failed to clone tensor storage: {e}"),
        }
    }
}

impl<T, A: TensorAllocator> std::fmt::Debug for TensorStorage<T, A> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("TensorStorage")
            .field("len", &self.len)
            .field("capacity", &self.layout.size())
            .field("device", &self.device())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::CpuAllocator;

    #[test]
    fn test_tensor_buffer_create_f32() -> Result<(), TensorAllocatorError> {
        let data = vec![0.0_f32; 10];
        let buffer = TensorStorage::<f32, _>::from_vec(data, CpuAllocator)?;
        assert_eq!(buffer.len(), 10);
        assert!(!buffer.is_empty());
        assert_eq!(buffer.device(), Device::Cpu);
        Ok(())
    }

    #[test]
    fn test_tensor_buffer_from_vec() -> Result<(), TensorAllocatorError> {
        let data = vec![1, 2, 3, 4, 5];
        let buffer = TensorStorage::<i32, _>::from_vec(data, CpuAllocator)?;
        assert_eq!(buffer.as_slice(), &[1, 2, 3, 4, 5]);
        assert_eq!(buffer.into_vec(), vec![1, 2, 3, 4, 5]);
        Ok(())
    }

    #[test]
    fn test_tensor_buffer_empty() -> Result<(), TensorAllocatorError> {
        let buffer = TensorStorage::<u16, _>::from_vec(Vec::new(), CpuAllocator)?;
        assert!(buffer.is_empty());
        assert_eq!(buffer.layout().size(), 0);
        assert_eq!(buffer.as_slice(), &[] as &[u16]);
        Ok(())
    }

    #[test]
    fn test_tensor_buffer_truncate_keeps_allocation() -> Result<(), TensorAllocatorError> {
        let mut buffer = TensorStorage::<f32, _>::from_fn(8, CpuAllocator, |i| i as f32)?;
        let ptr = buffer.as_ptr();
        buffer.truncate(3);
        assert_eq!(buffer.as_slice(), &[0.0, 1.0, 2.0]);
        assert_eq!(buffer.as_ptr(), ptr);
        assert_eq!(buffer.layout().size(), 8 * std::mem::size_of::<f32>());

        buffer.truncate(10);
        assert_eq!(buffer.len(), 3);
        Ok(())
    }

    #[test]
    fn test_tensor_buffer_drops_owned_elements() -> Result<(), TensorAllocatorError> {
        let data = vec![String::from("a"), String::from("b"), String::from("c")];
        let mut buffer = TensorStorage::from_vec(data, CpuAllocator)?;
        buffer.truncate(1);
        assert_eq!(buffer.as_slice(), &[String::from("a")]);
        Ok(())
    }

    #[test]
    fn test_tensor_mutability() -> Result<(), TensorAllocatorError> {
        let data = vec![1, 2, 3, 4];
        let mut buffer = TensorStorage::<i32, _>::from_vec(data, CpuAllocator)?;
        buffer.as_mut_slice()[0] = 10;
        assert_eq!(buffer.as_slice()[0], 10);
        let copy = buffer.clone();
        assert_eq!(copy.as_slice(), &[10, 2, 3, 4]);
        assert_ne!(copy.as_ptr(), buffer.as_ptr());
        Ok(())
    }
}
