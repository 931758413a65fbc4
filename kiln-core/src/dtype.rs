use std::fmt::Display;

/// Element type of a tensor or buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    /// Name used in diagnostics.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
        }
    }

    /// C type used for typed buffer pointers.
    pub const fn c_name(&self) -> &'static str {
        match self {
            Self::F32 => "float",
            Self::F64 => "double",
            Self::I32 => "int32_t",
            Self::I64 => "int64_t",
        }
    }

    /// Runtime type-descriptor constructor emitted in buffer declarations.
    pub const fn runtime_ctor(&self) -> &'static str {
        match self {
            Self::F32 => "kiln_float32_t()",
            Self::F64 => "kiln_float64_t()",
            Self::I32 => "kiln_int32_t()",
            Self::I64 => "kiln_int64_t()",
        }
    }

    pub const fn size_in_bytes(&self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Round a host value to what this element type can represent.
    pub fn quantize(&self, v: f64) -> f64 {
        match self {
            Self::F32 => v as f32 as f64,
            Self::F64 => v,
            Self::I32 => (v as i32) as f64,
            Self::I64 => (v as i64) as f64,
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
