//! Kiln is a tensor-program compiler: it takes a dataflow graph of tensor operators and
//! produces fused loop-nest functions as C source for an external backend.
//!
//! Compilation runs in a fixed pipeline. Every operator is classified by its fusibility
//! pattern, neighbouring operators are grouped into fusion groups, each group is lowered
//! through per-tensor loop schedules into one function, and the functions are printed as C.
//!
//! ## A quick guide
//! - Describe the computation with a [`GraphBuilder`] and call [`GraphBuilder::build`] to get
//!   a [`Graph`].
//! - Operator semantics come from an [`OpRegistry`]; [`OpRegistry::with_builtins`] holds the
//!   elementwise, broadcast, transpose, reduction, matmul and cumsum operators.
//! - Compile with [`GraphCompiler::build`], which returns a [`Program`] holding the generated
//!   source and the call sequence.
//! - [`Program::execute`] runs the call sequence on the reference executor over a [`Scope`].
//!
//! ## What can you do with it?
//! ```
//! use kiln_core::{CompileOptions, DType, GraphBuilder, GraphCompiler, HostBuffer, OpRegistry, Scope, Target};
//!
//! let mut b = GraphBuilder::new("add");
//! let x = b.input("A", &[100, 20], DType::F32);
//! let y = b.input("B", &[100, 20], DType::F32);
//! let c = b.add(x, y).unwrap();
//! b.output(c).unwrap();
//! let mut graph = b.build();
//! let out = graph.data(c).unwrap().name.clone();
//!
//! let registry = OpRegistry::with_builtins();
//! let program = GraphCompiler::new(&registry, Target::host(), CompileOptions::default())
//!     .build(&mut graph)
//!     .unwrap();
//! assert!(program.source.contains("for (int32_t i = 0; i < 100; i += 1) {"));
//!
//! let mut scope = Scope::new();
//! scope.set("A", HostBuffer::from_vec(DType::F32, &[100, 20], vec![1.0; 2000]).unwrap());
//! scope.set("B", HostBuffer::from_vec(DType::F32, &[100, 20], vec![2.0; 2000]).unwrap());
//! program.execute(&mut scope).unwrap();
//!
//! assert_eq!(scope.get(&out).unwrap().borrow().data, vec![3.0; 2000]);
//! ```

pub mod buffer;
mod builder;
mod checker;
pub mod codegen;
mod compiler;
mod dtype;
mod error;
pub mod exec;
pub mod fusion;
pub mod graph;
pub mod ir;
pub mod lower;
mod pattern;
mod program;
pub mod registry;
pub mod schedule;
mod target;

pub use buffer::{ArgValue, HostBuffer, SharedBuffer};
pub use builder::{reduced_shape, GraphBuilder};
pub use checker::FusionChecker;
pub use compiler::{CompileOptions, GraphCompiler, DUMP_SOURCE_ENV};
pub use dtype::DType;
pub use error::{Error, Result, StageError};
pub use graph::{DataId, Graph, NodeId};
pub use pattern::{kind_of, OpPatternKind};
pub use program::{Instruction, Program, Scope};
pub use registry::{OpRegistry, RegistryBuilder};
pub use schedule::{Stage, StageMap};
pub use target::{Arch, Target, DEFAULT_MAX_PARALLEL_WIDTH};
