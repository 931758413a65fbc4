//! Code generation: lowered functions collected into a [`Module`] and printed
//! as C source for an external backend.

mod c;

pub use c::CodeGenC;

use crate::{buffer::BufferDesc, lower::LoweredFunc, Target};

/// What [`CodeGenC::compile`] emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Implementation file: module buffers and function bodies.
    Source,
    /// Include-guarded prototypes.
    Header,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeGenOptions {
    /// Collapse a float multiply feeding an add into `fma(a, b, c)`.
    pub fuse_multiply_add: bool,
    /// Largest local temporary emitted as a stack array. Bigger ones are
    /// heap allocated like global temporaries.
    pub max_stack_bytes: usize,
}

impl Default for CodeGenOptions {
    fn default() -> Self {
        Self {
            fuse_multiply_add: true,
            max_stack_bytes: 16 * 1024,
        }
    }
}

/// A compilation unit: functions plus the buffers that outlive them.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub target: Target,
    pub functions: Vec<LoweredFunc>,
    /// Module-scope buffers, declared once and never freed by a function.
    pub buffers: Vec<BufferDesc>,
}

impl Module {
    pub fn function(&self, name: &str) -> Option<&LoweredFunc> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>, target: Target) -> Self {
        Self {
            module: Module {
                name: name.into(),
                target,
                functions: Vec::new(),
                buffers: Vec::new(),
            },
        }
    }

    pub fn add_function(&mut self, func: LoweredFunc) -> &mut Self {
        self.module.functions.push(func);
        self
    }

    /// Declare a module-scope buffer; a second buffer of the same name is ignored.
    pub fn add_buffer(&mut self, buffer: BufferDesc) -> &mut Self {
        if !self.module.buffers.iter().any(|b| b.name == buffer.name) {
            self.module.buffers.push(buffer);
        }
        self
    }

    pub fn build(self) -> Module {
        self.module
    }
}
