use std::{env, fs};

use log::{debug, info};
use rayon::prelude::*;

use crate::{
    codegen::{CodeGenC, CodeGenOptions, ModuleBuilder, OutputKind},
    fusion::fuse,
    lower::{LoweredFunc, OpLowerer},
    program::{Instruction, Program},
    Graph, OpRegistry, Result, Target,
};

/// Environment variable that forces [`CompileOptions::dump_source`].
pub const DUMP_SOURCE_ENV: &str = "KILN_DUMP_SOURCE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Remove nodes that do not reach a graph output before grouping.
    pub run_dce: bool,
    pub horizontal_fusion: bool,
    pub fuse_multiply_add: bool,
    /// Write the generated source under `~/.cache/kiln/src/`.
    pub dump_source: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            run_dce: true,
            horizontal_fusion: true,
            fuse_multiply_add: true,
            dump_source: false,
        }
    }
}

/// Drives a graph through grouping, lowering and code generation.
pub struct GraphCompiler<'a> {
    registry: &'a OpRegistry,
    target: Target,
    options: CompileOptions,
}

impl<'a> GraphCompiler<'a> {
    pub fn new(registry: &'a OpRegistry, target: Target, options: CompileOptions) -> Self {
        Self {
            registry,
            target,
            options,
        }
    }

    pub fn build(&self, graph: &mut Graph) -> Result<Program> {
        graph.refresh_links();
        if self.options.run_dce {
            let removed = graph.eliminate_dead_code()?;
            if removed > 0 {
                info!("dce removed {removed} nodes from `{}`", graph.name());
            }
        }
        let graph = &*graph;

        let groups = fuse(graph, self.registry, self.options.horizontal_fusion)?;
        let lowerer = OpLowerer::new(graph, self.registry, &self.target)?;
        let lowered: Vec<Vec<LoweredFunc>> = groups
            .par_iter()
            .map(|g| lowerer.lower(g))
            .collect::<Result<_>>()?;
        info!(
            "lowered {} groups of `{}` into {} functions",
            groups.len(),
            graph.name(),
            lowered.iter().map(Vec::len).sum::<usize>()
        );

        let mut internal = Vec::new();
        for g in &groups {
            for node in &g.internal_nodes {
                for d in graph.outputs_of(*node)? {
                    if let Some(data) = graph.data(*d) {
                        internal.push(data.name.clone());
                    }
                }
            }
        }

        let mut builder = ModuleBuilder::new(graph.name(), self.target.clone());
        let mut instructions = Vec::new();
        for f in lowered.into_iter().flatten() {
            debug!("function `{}`: {} args", f.name, f.args.len());
            instructions.push(Instruction {
                function: f.name.clone(),
                inputs: f.inputs().map(|a| a.name().to_string()).collect(),
                outputs: f.outputs().map(|a| a.name().to_string()).collect(),
            });
            for a in &f.args {
                builder.add_buffer(a.buffer.clone());
            }
            builder.add_function(f);
        }
        let module = builder.build();

        let codegen = CodeGenC::new(CodeGenOptions {
            fuse_multiply_add: self.options.fuse_multiply_add,
            ..Default::default()
        });
        let source = codegen.compile(&module, OutputKind::Source)?;
        if self.options.dump_source || env::var_os(DUMP_SOURCE_ENV).is_some() {
            dump_source(&module.name, &source)?;
        }

        Ok(Program {
            module,
            instructions,
            source,
            internal,
        })
    }
}

fn dump_source(module: &str, source: &str) -> Result<()> {
    let Some(home) = dirs::home_dir() else {
        return Ok(());
    };
    let path = home
        .join(".cache")
        .join("kiln")
        .join("src")
        .join(format!("{module}.cc"));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, source)?;
    info!("wrote `{module}` to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{buffer::HostBuffer, program::Scope, DType, GraphBuilder};

    #[test]
    fn dead_branch_is_not_compiled() {
        let mut b = GraphBuilder::new("dce");
        let x = b.input("x", &[8], DType::F32);
        let e = b.exp(x).unwrap();
        let _unused = b.tanh(x).unwrap();
        b.output(e).unwrap();
        let mut graph = b.build();

        let registry = OpRegistry::with_builtins();
        let program = GraphCompiler::new(&registry, Target::host(), CompileOptions::default())
            .build(&mut graph)
            .unwrap();
        assert_eq!(program.instructions.len(), 1);
        assert!(!program.source.contains("tanhf"));
    }

    #[test]
    fn program_runs_through_scope() {
        let mut b = GraphBuilder::new("chain");
        let x = b.input("x", &[2, 2], DType::F32);
        let y = b.input("y", &[2, 2], DType::F32);
        let s = b.add(x, y).unwrap();
        let r = b.relu(s).unwrap();
        b.output(r).unwrap();
        let mut graph = b.build();
        let out = graph.data(r).unwrap().name.clone();

        let registry = OpRegistry::with_builtins();
        let program = GraphCompiler::new(&registry, Target::host(), CompileOptions::default())
            .build(&mut graph)
            .unwrap();

        let mut scope = Scope::new();
        scope.set("x", HostBuffer::from_vec(DType::F32, &[2, 2], vec![1., -2., 3., -4.]).unwrap());
        scope.set("y", HostBuffer::from_vec(DType::F32, &[2, 2], vec![1., 1., 1., 1.]).unwrap());
        program.execute(&mut scope).unwrap();
        assert_eq!(scope.get(&out).unwrap().borrow().data, vec![2., 0., 4., 0.]);
        assert_eq!(scope.var_names().count(), 3);
    }
}
