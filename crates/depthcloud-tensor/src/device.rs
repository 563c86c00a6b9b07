use std::fmt;

/// Memory space holding a tensor's elements.
///
/// Only [`Device::Cpu`] memory can be dereferenced by host code; the other
/// variants tag memory owned by an accelerator runtime. Kernels check the
/// device of every input up front and never copy between devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Host memory.
    #[default]
    Cpu,
    /// CUDA device memory.
    Cuda {
        /// The CUDA device ordinal
        device_id: usize,
    },
    /// Memory owned by a wgpu adapter.
    Wgpu {
        /// The adapter index
        adapter_id: usize,
    },
}

impl Device {
    /// Whether host code can read the memory directly.
    #[inline]
    pub fn is_host_accessible(self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Short backend name, as used in diagnostics.
    pub fn backend(self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda { .. } => "cuda",
            Device::Wgpu { .. } => "wgpu",
        }
    }

    /// Accelerator index, `None` for host memory.
    pub fn index(self) -> Option<usize> {
        match self {
            Device::Cpu => None,
            Device::Cuda { device_id } => Some(device_id),
            Device::Wgpu { adapter_id } => Some(adapter_id),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index() {
            Some(index) => write!(f, "{}:{index}", self.backend()),
            None => f.write_str(self.backend()),
        }
    }
}
