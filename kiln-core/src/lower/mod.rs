//! Lowering of fusion groups into loop-level functions.

mod loops;
mod names;
mod op_lowering;

pub use loops::{flatten, REDUCE_INIT_SUFFIX};
pub use names::NameGenerator;
pub use op_lowering::OpLowerer;

use std::collections::{HashMap, HashSet};

use crate::{
    buffer::{BufferDesc, BufferScope},
    ir::{ParallelAxis, Stmt, Tensor},
    schedule::StageMap,
    DType, Error, Result, Target,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Input,
    Output,
}

/// A function parameter: a tensor and the buffer the caller passes for it.
#[derive(Debug, Clone)]
pub struct Argument {
    pub tensor: Tensor,
    pub buffer: BufferDesc,
    pub kind: ArgKind,
}

impl Argument {
    pub fn is_input(&self) -> bool {
        self.kind == ArgKind::Input
    }

    pub fn name(&self) -> &str {
        self.tensor.name()
    }
}

/// A typed name the function body indexes through, backed by `buffer`.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferView {
    pub name: String,
    pub buffer: String,
    pub dtype: DType,
    pub read_only: bool,
}

/// Launch extents collected from loops bound to device indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxisInfo {
    pub grid_dims: [usize; 3],
    pub block_dims: [usize; 3],
}

impl AxisInfo {
    pub(crate) fn record(&mut self, axis: ParallelAxis, extent: usize) {
        let dims = match axis.is_block() {
            true => &mut self.grid_dims,
            false => &mut self.block_dims,
        };
        dims[axis.dim()] = dims[axis.dim()].max(extent);
    }

    pub fn is_empty(&self) -> bool {
        self.grid_dims == [0; 3] && self.block_dims == [0; 3]
    }
}

/// One lowered function: signature, the storage it owns, and its body.
#[derive(Debug, Clone)]
pub struct LoweredFunc {
    pub name: String,
    pub args: Vec<Argument>,
    /// Buffers created and released inside the function.
    pub temp_buffers: Vec<BufferDesc>,
    pub views: Vec<BufferView>,
    pub body: Stmt,
    pub axis_info: AxisInfo,
}

impl LoweredFunc {
    pub fn inputs(&self) -> impl Iterator<Item = &Argument> {
        self.args.iter().filter(|a| a.is_input())
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Argument> {
        self.args.iter().filter(|a| !a.is_input())
    }

    pub fn local_temps(&self) -> impl Iterator<Item = &BufferDesc> {
        self.temp_buffers
            .iter()
            .filter(|b| b.scope == BufferScope::Local)
    }

    /// The view named `name`.
    pub fn view(&self, name: &str) -> Option<&BufferView> {
        self.views.iter().find(|v| v.name == name)
    }
}

/// `_name` of the buffer `name` ends up stored in, following shared buffers.
pub(crate) fn buffer_of(stages: &StageMap, name: &str) -> Result<String> {
    let mut seen = HashSet::new();
    let mut cur = name;
    while let Some(next) = stages.get(cur).and_then(|s| s.shared_buffer()) {
        if !seen.insert(cur) {
            return Err(Error::msg(format!("buffer sharing of `{name}` forms a cycle")));
        }
        cur = next;
    }
    Ok(format!("_{cur}"))
}

/// Views for every argument, materialized stage and alias of `nest`, plus
/// buffers for the materialized stages that are not arguments.
pub(crate) fn storage(
    args: &[Argument],
    nest: &loops::LoopNest,
    stages: &StageMap,
    tensors: &HashMap<String, Tensor>,
    target: &Target,
) -> Result<(Vec<BufferDesc>, Vec<BufferView>)> {
    let mut views: Vec<BufferView> = args
        .iter()
        .map(|a| BufferView {
            name: a.name().to_string(),
            buffer: a.buffer.name.clone(),
            dtype: a.tensor.dtype(),
            read_only: a.is_input(),
        })
        .collect();
    let mut temps = Vec::new();
    for name in &nest.materialized {
        if args.iter().any(|a| a.name() == name) {
            continue;
        }
        let stage = stages.expect(name)?;
        let t = stage.tensor();
        if stage.shared_buffer().is_none() {
            let mut desc = BufferDesc::new(format!("_{name}"), t.dtype(), t.shape(), target);
            desc.scope = stage.scope();
            temps.push(desc);
        }
        views.push(BufferView {
            name: name.clone(),
            buffer: buffer_of(stages, name)?,
            dtype: t.dtype(),
            read_only: false,
        });
    }
    for (alias, tensor) in &nest.aliases {
        let dtype = tensors
            .get(tensor)
            .map(Tensor::dtype)
            .ok_or_else(|| Error::msg(format!("alias of unknown tensor `{tensor}`")))?;
        views.push(BufferView {
            name: alias.clone(),
            buffer: buffer_of(stages, tensor)?,
            dtype,
            read_only: false,
        });
    }
    Ok((temps, views))
}

/// Lower a hand-scheduled stage map into one function named `name`.
///
/// `args` are the parameters in calling order: placeholders are passed as
/// inputs, computed tensors as outputs. Every other stage the body
/// materializes becomes a temporary.
pub fn lower_stages(
    name: &str,
    args: &[Tensor],
    stages: &StageMap,
    target: &Target,
) -> Result<LoweredFunc> {
    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    let mut pending: Vec<Tensor> = stages
        .iter()
        .map(|s| s.tensor().clone())
        .chain(args.iter().cloned())
        .collect();
    while let Some(t) = pending.pop() {
        if !tensors.contains_key(t.name()) {
            pending.extend(t.inputs().iter().cloned());
            tensors.insert(t.name().to_string(), t);
        }
    }

    let nest = loops::lower_loops(stages, &tensors, target)?;
    let args: Vec<Argument> = args
        .iter()
        .map(|t| Argument {
            tensor: t.clone(),
            buffer: BufferDesc::new(format!("_{}", t.name()), t.dtype(), t.shape(), target),
            kind: match t.is_placeholder() {
                true => ArgKind::Input,
                false => ArgKind::Output,
            },
        })
        .collect();
    let (temp_buffers, views) = storage(&args, &nest, stages, &tensors, target)?;
    Ok(LoweredFunc {
        name: name.to_string(),
        args,
        temp_buffers,
        views,
        body: nest.body,
        axis_info: nest.axis_info,
    })
}
