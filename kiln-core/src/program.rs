use std::collections::BTreeMap;

use log::debug;

use crate::{
    buffer::{ArgValue, HostBuffer, SharedBuffer},
    codegen::Module,
    exec::Executor,
    Error, Result,
};

/// Named buffers a [`Program`] reads its inputs from and writes its outputs to.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: BTreeMap<String, SharedBuffer>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, buffer: HostBuffer) {
        self.vars.insert(name.into(), buffer.into_shared());
    }

    pub fn get(&self, name: &str) -> Option<SharedBuffer> {
        self.vars.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<SharedBuffer> {
        self.vars.remove(name)
    }

    pub fn var_names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }
}

/// One function call of a [`Program`], with the data it reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub function: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// A compiled graph: generated source plus the call sequence that runs it.
#[derive(Debug, Clone)]
pub struct Program {
    pub module: Module,
    pub instructions: Vec<Instruction>,
    pub source: String,
    /// Data produced and consumed inside one function, never seen by a scope.
    pub internal: Vec<String>,
}

impl Program {
    /// Run every instruction in order on the reference executor.
    ///
    /// Inputs must already be in `scope`; missing outputs are created there.
    pub fn execute(&self, scope: &mut Scope) -> Result<()> {
        for instr in &self.instructions {
            let Some(func) = self.module.function(&instr.function) else {
                return Err(Error::runtime(format!(
                    "no function `{}` in module `{}`",
                    instr.function, self.module.name
                )));
            };
            let mut args = Vec::with_capacity(func.args.len());
            for a in &func.args {
                let buf = match (a.is_input(), scope.get(a.name())) {
                    (_, Some(buf)) => buf,
                    (true, None) => {
                        return Err(Error::runtime(format!(
                            "`{}`: input `{}` is not in scope",
                            func.name,
                            a.name()
                        )))
                    }
                    (false, None) => {
                        let buf = HostBuffer::zeros(a.buffer.dtype, &a.buffer.shape).into_shared();
                        scope.vars.insert(a.name().to_string(), buf.clone());
                        buf
                    }
                };
                args.push(ArgValue::Buffer(buf));
            }
            debug!("executing `{}`", func.name);
            Executor::run(func, &mut args)?;
        }
        for name in &self.internal {
            scope.remove(name);
        }
        Ok(())
    }
}
