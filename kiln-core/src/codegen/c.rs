use std::collections::{HashMap, HashSet};

use log::trace;

use super::{CodeGenOptions, Module, OutputKind};
use crate::{
    buffer::{BufferDesc, BufferScope},
    ir::{ExprPrinter, ForKind, Stmt},
    lower::LoweredFunc,
    Error, Result,
};

const INCLUDES: &str = "#include <kiln_runtime.h>\n#include <stdio.h>\n";

fn line(out: &mut String, depth: usize, text: &str) {
    for _ in 0..depth {
        out.push_str("  ");
    }
    out.push_str(text);
    out.push('\n');
}

fn prototype(f: &LoweredFunc) -> String {
    format!("void {}(void* _args, int32_t num_args)", f.name)
}

/// `kiln_buffer_t::new_(...)` declaration of `b`.
fn buffer_decl(b: &BufferDesc) -> String {
    let dims = b
        .shape
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "kiln_buffer_t* {} = kiln_buffer_t::new_((kiln_device_kind_t)({})/*target*/, {}, {{ {dims} }}, {}/*align*/);",
        b.name,
        b.device as u8,
        b.dtype.runtime_ctor(),
        b.align
    )
}

fn include_guard(module: &str) -> String {
    let name: String = module
        .chars()
        .map(|c| match c.is_ascii_alphanumeric() {
            true => c.to_ascii_uppercase(),
            false => '_',
        })
        .collect();
    format!("_{name}_KILN_H_")
}

/// Prints a [`Module`] as C.
///
/// Functions follow the tagged-value calling convention: one argument array,
/// inputs first, with the count checked on entry. Temporaries with global
/// scope get one `kiln_buffer_malloc` before the body and one
/// `kiln_buffer_free` after it. Local temporaries are stack arrays up to
/// [`CodeGenOptions::max_stack_bytes`] and heap allocated past it.
#[derive(Debug, Clone, Default)]
pub struct CodeGenC {
    options: CodeGenOptions,
}

impl CodeGenC {
    pub fn new(options: CodeGenOptions) -> Self {
        Self { options }
    }

    pub fn compile(&self, module: &Module, kind: OutputKind) -> Result<String> {
        let out = match kind {
            OutputKind::Source => self.source(module)?,
            OutputKind::Header => Self::header(module),
        };
        trace!("generated {kind:?} of `{}`:\n{out}", module.name);
        Ok(out)
    }

    fn header(module: &Module) -> String {
        let guard = include_guard(&module.name);
        let mut out = format!("#ifndef {guard}\n#define {guard}\n\n{INCLUDES}\n");
        for f in &module.functions {
            out.push_str(&prototype(f));
            out.push_str(";\n");
        }
        out.push_str(&format!("\n\n#endif  // {guard}\n"));
        out
    }

    fn source(&self, module: &Module) -> Result<String> {
        let mut out = format!("{INCLUDES}\n");
        for b in &module.buffers {
            line(&mut out, 0, &buffer_decl(b));
        }
        for (i, f) in module.functions.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            self.function(&mut out, f)?;
        }
        Ok(out)
    }

    fn on_stack(&self, b: &BufferDesc) -> bool {
        b.scope == BufferScope::Local && b.memory_size() <= self.options.max_stack_bytes
    }

    fn function(&self, out: &mut String, f: &LoweredFunc) -> Result<()> {
        let known: HashSet<&str> = f
            .args
            .iter()
            .map(|a| a.buffer.name.as_str())
            .chain(f.temp_buffers.iter().map(|b| b.name.as_str()))
            .collect();
        if let Some(v) = f.views.iter().find(|v| !known.contains(v.buffer.as_str())) {
            return Err(Error::msg(format!(
                "`{}`: view `{}` refers to unknown buffer `{}`",
                f.name, v.name, v.buffer
            )));
        }

        line(out, 0, &prototype(f));
        line(out, 0, "{");
        line(out, 1, &format!("KILN_CHECK_EQ(num_args, {});", f.args.len()));
        for (i, a) in f.args.iter().enumerate() {
            let qualifier = if a.is_input() { "const " } else { "" };
            line(
                out,
                1,
                &format!(
                    "{qualifier}kiln_buffer_t* {} = kiln_pod_value_to_buffer_p(&(((kiln_pod_value_t*)(_args))[{i}]));",
                    a.buffer.name
                ),
            );
        }
        let (stacked, heap): (Vec<&BufferDesc>, Vec<&BufferDesc>) =
            f.temp_buffers.iter().partition(|b| self.on_stack(b));
        for b in &heap {
            line(out, 1, &buffer_decl(b));
            line(out, 1, &format!("kiln_buffer_malloc((void*)(0), {});", b.name));
        }
        let mut stack: HashSet<&str> = HashSet::new();
        for b in stacked {
            line(
                out,
                1,
                &format!("{} {}[{}];", b.dtype.c_name(), b.name, b.numel()),
            );
            stack.insert(&b.name);
        }
        for v in &f.views {
            let ty = v.dtype.c_name();
            let text = if stack.contains(v.buffer.as_str()) {
                format!("{ty}* {} = {};", v.name, v.buffer)
            } else if v.read_only {
                format!("const {ty}* {} = ((const {ty}*)({}->memory));", v.name, v.buffer)
            } else {
                format!("{ty}* {} = (({ty}*)({}->memory));", v.name, v.buffer)
            };
            line(out, 1, &text);
        }

        let mut renames = HashMap::new();
        f.body.walk(&mut |s| {
            if let Stmt::For {
                var,
                kind: ForKind::Bound(axis),
                ..
            } = s
            {
                renames.insert(var.clone(), axis.as_str().to_string());
            }
        });
        let printer = ExprPrinter {
            fuse_multiply_add: self.options.fuse_multiply_add,
            renames,
        };
        Self::stmt(out, &f.body, 1, &printer);

        for b in &heap {
            line(out, 1, &format!("kiln_buffer_free((void*)(0), {});", b.name));
        }
        line(out, 0, "}");
        Ok(())
    }

    fn stmt(out: &mut String, s: &Stmt, depth: usize, p: &ExprPrinter) {
        match s {
            Stmt::Block(stmts) => {
                for s in stmts {
                    Self::stmt(out, s, depth, p);
                }
            }
            Stmt::For {
                var,
                extent,
                kind,
                body,
            } => {
                let head = match kind {
                    ForKind::Serial => format!(
                        "for (int32_t {var} = 0; {var} < {}; {var} += 1) {{",
                        p.print(extent)
                    ),
                    // the launch configuration supplies the trip count
                    ForKind::Bound(axis) => {
                        format!("if (({} < {})) {{", axis.as_str(), p.print(extent))
                    }
                };
                line(out, depth, &head);
                Self::stmt(out, body, depth + 1, p);
                line(out, depth, "};");
            }
            Stmt::IfThen { cond, then } => {
                line(out, depth, &format!("if ({}) {{", p.print(cond)));
                Self::stmt(out, then, depth + 1, p);
                line(out, depth, "};");
            }
            Stmt::Store {
                tensor,
                indices,
                value,
            } => {
                let mut lhs = tensor.clone();
                for i in indices {
                    lhs.push_str(&format!("[{}]", p.print(i)));
                }
                line(out, depth, &format!("{lhs} = {};", p.print(value)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codegen::ModuleBuilder, fusion::fuse, lower::OpLowerer, DType, Graph, GraphBuilder,
        OpRegistry, Target,
    };

    fn module_of(graph: &Graph, target: Target) -> Module {
        let registry = OpRegistry::with_builtins();
        let lowerer = OpLowerer::new(graph, &registry, &target).unwrap();
        let mut builder = ModuleBuilder::new("module1", target.clone());
        for g in fuse(graph, &registry, true).unwrap() {
            for f in lowerer.lower(&g).unwrap() {
                builder.add_function(f);
            }
        }
        builder.build()
    }

    fn add_graph() -> Graph {
        let mut b = GraphBuilder::new("add");
        let x = b.input("A", &[100, 20], DType::F32);
        let y = b.input("B", &[100, 20], DType::F32);
        let c = b.add(x, y).unwrap();
        b.output(c).unwrap();
        b.build()
    }

    #[test]
    fn add_source() {
        let module = module_of(&add_graph(), Target::host());
        let out = CodeGenC::default()
            .compile(&module, OutputKind::Source)
            .unwrap();
        let expected = r#"#include <kiln_runtime.h>
#include <stdio.h>

void fn_elementwise_add_0(void* _args, int32_t num_args)
{
  KILN_CHECK_EQ(num_args, 3);
  const kiln_buffer_t* _A = kiln_pod_value_to_buffer_p(&(((kiln_pod_value_t*)(_args))[0]));
  const kiln_buffer_t* _B = kiln_pod_value_to_buffer_p(&(((kiln_pod_value_t*)(_args))[1]));
  kiln_buffer_t* _var_0 = kiln_pod_value_to_buffer_p(&(((kiln_pod_value_t*)(_args))[2]));
  const float* A = ((const float*)(_A->memory));
  const float* B = ((const float*)(_B->memory));
  float* var_0 = ((float*)(_var_0->memory));
  for (int32_t i = 0; i < 100; i += 1) {
    for (int32_t j = 0; j < 20; j += 1) {
      var_0[((20 * i) + j)] = (A[((20 * i) + j)] + B[((20 * i) + j)]);
    };
  };
}
"#;
        assert_eq!(out, expected);
    }

    #[test]
    fn header_has_guards_and_prototypes() {
        let module = module_of(&add_graph(), Target::host());
        let out = CodeGenC::default()
            .compile(&module, OutputKind::Header)
            .unwrap();
        let expected = r#"#ifndef _MODULE1_KILN_H_
#define _MODULE1_KILN_H_

#include <kiln_runtime.h>
#include <stdio.h>

void fn_elementwise_add_0(void* _args, int32_t num_args);


#endif  // _MODULE1_KILN_H_
"#;
        assert_eq!(out, expected);
    }

    #[test]
    fn module_buffers_are_declared_once() {
        let mut module = module_of(&add_graph(), Target::host());
        let c = module.functions[0].args[2].buffer.clone();
        module.buffers.push(c);
        let out = CodeGenC::default()
            .compile(&module, OutputKind::Source)
            .unwrap();
        assert!(out.contains(
            "kiln_buffer_t* _var_0 = kiln_buffer_t::new_((kiln_device_kind_t)(0)/*target*/, kiln_float32_t(), { 100, 20 }, 32/*align*/);\nvoid fn_elementwise_add_0"
        ));
        assert!(!out.contains("kiln_buffer_malloc"));
    }

    #[test]
    fn multiply_add_collapses_to_fma() {
        let mut b = GraphBuilder::new("scale");
        let x = b.input("x", &[8], DType::F32);
        let s = b.scale(x, 3.0, 1.0).unwrap();
        b.output(s).unwrap();
        let module = module_of(&b.build(), Target::host());
        let fused = CodeGenC::default()
            .compile(&module, OutputKind::Source)
            .unwrap();
        assert!(fused.contains("var_0[i] = fma(x[i], 3.0f, 1.0f);"));
        let plain = CodeGenC::new(CodeGenOptions {
            fuse_multiply_add: false,
            ..Default::default()
        })
        .compile(&module, OutputKind::Source)
        .unwrap();
        assert!(plain.contains("var_0[i] = ((x[i] * 3.0f) + 1.0f);"));
    }

    #[test]
    fn oversized_local_temporary_is_heap_allocated() {
        let mut b = GraphBuilder::new("reduce_relu");
        let x = b.input("x", &[4, 8], DType::F32);
        let s = b.reduce_sum(x, &[1], false).unwrap();
        let r = b.relu(s).unwrap();
        b.output(r).unwrap();
        let module = module_of(&b.build(), Target::host());

        let stacked = CodeGenC::default()
            .compile(&module, OutputKind::Source)
            .unwrap();
        assert!(stacked.contains("float _var_0[4];"));
        assert!(!stacked.contains("kiln_buffer_malloc"));

        let capped = CodeGenC::new(CodeGenOptions {
            max_stack_bytes: 8,
            ..Default::default()
        })
        .compile(&module, OutputKind::Source)
        .unwrap();
        assert!(!capped.contains("float _var_0[4];"));
        assert!(capped.contains("kiln_buffer_malloc((void*)(0), _var_0);"));
        assert!(capped.contains("kiln_buffer_free((void*)(0), _var_0);"));
        assert!(capped.contains("float* var_0 = ((float*)(_var_0->memory));"));
    }

    #[test]
    fn device_axes_become_guards() {
        let module = module_of(&add_graph(), Target::nvgpu());
        let out = CodeGenC::default()
            .compile(&module, OutputKind::Source)
            .unwrap();
        assert!(!out.contains("for ("));
        assert!(out.contains("if ((blockIdx.x < 2)) {"));
        assert!(out.contains("if ((threadIdx.x < "));
        let f = &module.functions[0];
        assert_eq!(f.axis_info.grid_dims, [2, 0, 0]);
        assert_eq!(f.axis_info.block_dims, [1024, 0, 0]);
    }

    #[test]
    fn unknown_view_buffer_is_rejected() {
        let mut module = module_of(&add_graph(), Target::host());
        module.functions[0].views[0].buffer = "_missing".to_string();
        assert!(CodeGenC::default()
            .compile(&module, OutputKind::Source)
            .is_err());
    }
}
