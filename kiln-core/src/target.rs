/// Instruction-set family of a compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
    Arm,
    Nvgpu,
}

/// Default cap on the extent of a single fused parallel axis.
pub const DEFAULT_MAX_PARALLEL_WIDTH: usize = 1024;

/// The device a graph is compiled for.
///
/// `max_parallel_width` bounds how many iterations a reduction schedule packs
/// into one fused parallel axis before splitting it; on GPUs it matches the
/// thread-block limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub arch: Arch,
    pub bits: u32,
    pub max_parallel_width: usize,
}

impl Target {
    pub fn host() -> Self {
        Self {
            arch: Arch::X86,
            bits: 64,
            max_parallel_width: DEFAULT_MAX_PARALLEL_WIDTH,
        }
    }

    pub fn nvgpu() -> Self {
        Self {
            arch: Arch::Nvgpu,
            bits: 64,
            max_parallel_width: DEFAULT_MAX_PARALLEL_WIDTH,
        }
    }

    pub fn with_max_parallel_width(mut self, width: usize) -> Self {
        self.max_parallel_width = width.max(1);
        self
    }

    /// Whether loops may be bound to block/thread indices.
    pub fn is_device(&self) -> bool {
        self.arch == Arch::Nvgpu
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::host()
    }
}
