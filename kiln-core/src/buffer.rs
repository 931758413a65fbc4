//! Buffer descriptors and the tagged-value calling convention shared by
//! lowering, code generation and the reference executor.

use std::{cell::RefCell, rc::Rc};

use crate::{DType, Result, Target};

/// Alignment, in bytes, requested for every generated buffer.
pub const DEFAULT_ALIGN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceKind {
    Host = 0,
    Gpu = 1,
}

impl DeviceKind {
    pub fn of(target: &Target) -> Self {
        if target.is_device() {
            Self::Gpu
        } else {
            Self::Host
        }
    }
}

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferScope {
    /// Heap resident; temporaries get an explicit allocate/free pair.
    #[default]
    Global,
    /// Function-local scratch, released implicitly at exit.
    Local,
}

/// Storage requirements of one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub name: String,
    pub device: DeviceKind,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub align: usize,
    pub scope: BufferScope,
    /// Memory is attached on first use rather than at declaration.
    pub lazy: bool,
}

impl BufferDesc {
    pub fn new(name: impl Into<String>, dtype: DType, shape: &[usize], target: &Target) -> Self {
        Self {
            name: name.into(),
            device: DeviceKind::of(target),
            dtype,
            shape: shape.to_vec(),
            align: DEFAULT_ALIGN,
            scope: BufferScope::Global,
            lazy: true,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn memory_size(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }
}

/// Host-resident buffer used by the reference executor.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBuffer {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl HostBuffer {
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        Self {
            dtype,
            shape: shape.to_vec(),
            data: vec![0.0; shape.iter().product()],
        }
    }

    pub fn from_vec(dtype: DType, shape: &[usize], data: Vec<f64>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            crate::bail!("{} values do not fill shape {shape:?}", data.len());
        }
        Ok(Self {
            dtype,
            shape: shape.to_vec(),
            data: data.into_iter().map(|v| dtype.quantize(v)).collect(),
        })
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn into_shared(self) -> SharedBuffer {
        Rc::new(RefCell::new(self))
    }
}

/// Buffer handle passed through the argument array.
pub type SharedBuffer = Rc<RefCell<HostBuffer>>;

/// One slot of the argument array: a buffer or a scalar.
#[derive(Debug, Clone)]
pub enum ArgValue {
    Buffer(SharedBuffer),
    Int(i64),
    Float(f64),
}

impl ArgValue {
    pub fn buffer(&self) -> Option<&SharedBuffer> {
        match self {
            Self::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Buffer(_) => "buffer",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
        }
    }
}

impl From<SharedBuffer> for ArgValue {
    fn from(value: SharedBuffer) -> Self {
        Self::Buffer(value)
    }
}
