use std::alloc::{self, Layout, LayoutError};

use thiserror::Error;

use crate::device::Device;

/// Errors raised while obtaining tensor memory.
#[derive(Debug, Error, PartialEq)]
pub enum TensorAllocatorError {
    /// The element count does not fit a valid layout.
    #[error("invalid tensor layout: {0}")]
    LayoutError(#[from] LayoutError),

    /// The allocator returned no memory.
    #[error("allocator returned no memory for {0} bytes")]
    OutOfMemory(usize),
}

/// Source of the memory backing tensor storage.
///
/// Allocators are cloned into every tensor they back and shared with kernel
/// worker threads. Storage never asks for a zero-sized layout.
pub trait TensorAllocator: Clone + Send + Sync {
    /// Returns a block of memory fitting `layout`.
    fn alloc(&self, layout: Layout) -> Result<*mut u8, TensorAllocatorError>;

    /// Releases a block returned by [`TensorAllocator::alloc`] for the same layout.
    fn dealloc(&self, ptr: *mut u8, layout: Layout);

    /// Memory space of the blocks handed out by this allocator.
    fn device(&self) -> Device {
        Device::Cpu
    }
}

/// Host allocator backed by the global Rust allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuAllocator;

impl TensorAllocator for CpuAllocator {
    fn alloc(&self, layout: Layout) -> Result<*mut u8, TensorAllocatorError> {
        // SAFETY: storage only requests layouts with a non-zero size
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(TensorAllocatorError::OutOfMemory(layout.size()));
        }
        Ok(ptr)
    }

    #[allow(clippy::not_unsafe_ptr_arg_deref)]
    fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: ptr was returned by `alloc` with this layout
        unsafe { alloc::dealloc(ptr, layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_allocator_roundtrip() -> Result<(), TensorAllocatorError> {
        let layout = Layout::array::<u16>(64)?;
        let ptr = CpuAllocator.alloc(layout)?;
        // SAFETY: the block holds 64 u16 values
        unsafe {
            let values = ptr as *mut u16;
            values.add(63).write(1000);
            assert_eq!(values.add(63).read(), 1000);
        }
        CpuAllocator.dealloc(ptr, layout);
        assert_eq!(CpuAllocator.device(), Device::Cpu);
        Ok(())
    }

    #[test]
    fn test_layout_overflow() {
        let err = Layout::array::<f32>(usize::MAX).map_err(TensorAllocatorError::from);
        assert!(matches!(err, Err(TensorAllocatorError::LayoutError(_))));
    }
}
