use std::sync::Arc;

use super::Expr;
use crate::DType;

const SPATIAL_AXIS_NAMES: [&str; 8] = ["i", "j", "k", "a", "b", "c", "d", "e"];

/// Name of the `idx`-th spatial axis of a compute tensor.
pub fn spatial_axis_name(idx: usize) -> String {
    match SPATIAL_AXIS_NAMES.get(idx) {
        Some(name) => name.to_string(),
        None => format!("i{idx}"),
    }
}

/// Name of the `idx`-th reduction axis of a compute tensor.
pub fn reduce_axis_name(idx: usize) -> String {
    if idx == 0 {
        "rk".to_string()
    } else {
        format!("rk{idx}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceKind {
    Sum,
    Max,
}

impl ReduceKind {
    /// Identity element used to initialise the accumulator.
    pub fn init(&self, dtype: DType) -> Expr {
        match self {
            Self::Sum => Expr::zero(dtype),
            Self::Max => match dtype {
                DType::F32 => Expr::Float(f32::MIN as f64),
                DType::F64 => Expr::Float(f64::MIN),
                DType::I32 => Expr::Int(i32::MIN as i64),
                DType::I64 => Expr::Int(i64::MIN),
            },
        }
    }

    /// Fold one more value into the accumulator.
    pub fn combine(&self, acc: Expr, value: Expr) -> Expr {
        match self {
            Self::Sum => acc + value,
            Self::Max => Expr::max(acc, value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReduceAxis {
    pub name: String,
    pub extent: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub kind: ReduceKind,
    pub axes: Vec<ReduceAxis>,
}

#[derive(Debug)]
pub enum TensorOp {
    /// A value supplied from outside the function.
    Placeholder,
    /// `out[axes] = body`, or for reductions `out[axes] = reduce(body)` over
    /// the reduction axes.
    Compute {
        axes: Vec<String>,
        body: Expr,
        reduction: Option<Reduction>,
        inputs: Vec<Tensor>,
    },
}

#[derive(Debug)]
pub struct TensorInner {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub op: TensorOp,
}

/// Cheaply clonable handle to a tensor definition.
#[derive(Debug, Clone)]
pub struct Tensor(Arc<TensorInner>);

impl Tensor {
    pub fn placeholder(name: impl Into<String>, shape: &[usize], dtype: DType) -> Self {
        Self(Arc::new(TensorInner {
            name: name.into(),
            shape: shape.to_vec(),
            dtype,
            op: TensorOp::Placeholder,
        }))
    }

    /// Define `name[i, j, ..] = f([i, j, ..])`.
    pub fn compute(
        name: impl Into<String>,
        shape: &[usize],
        dtype: DType,
        inputs: Vec<Tensor>,
        f: impl FnOnce(&[Expr]) -> Expr,
    ) -> Self {
        let axes: Vec<String> = (0..shape.len()).map(spatial_axis_name).collect();
        let vars: Vec<Expr> = axes.iter().map(Expr::var).collect();
        let body = f(&vars);
        Self(Arc::new(TensorInner {
            name: name.into(),
            shape: shape.to_vec(),
            dtype,
            op: TensorOp::Compute {
                axes,
                body,
                reduction: None,
                inputs,
            },
        }))
    }

    /// Define `name[i, ..] = kind over rk.. of f([i, ..], [rk, ..])`.
    pub fn reduce(
        name: impl Into<String>,
        shape: &[usize],
        dtype: DType,
        inputs: Vec<Tensor>,
        kind: ReduceKind,
        reduce_extents: &[usize],
        f: impl FnOnce(&[Expr], &[Expr]) -> Expr,
    ) -> Self {
        let axes: Vec<String> = (0..shape.len()).map(spatial_axis_name).collect();
        let reduce_axes: Vec<ReduceAxis> = reduce_extents
            .iter()
            .enumerate()
            .map(|(i, extent)| ReduceAxis {
                name: reduce_axis_name(i),
                extent: *extent,
            })
            .collect();
        let vars: Vec<Expr> = axes.iter().map(Expr::var).collect();
        let rvars: Vec<Expr> = reduce_axes.iter().map(|r| Expr::var(&r.name)).collect();
        let body = f(&vars, &rvars);
        Self(Arc::new(TensorInner {
            name: name.into(),
            shape: shape.to_vec(),
            dtype,
            op: TensorOp::Compute {
                axes,
                body,
                reduction: Some(Reduction {
                    kind,
                    axes: reduce_axes,
                }),
                inputs,
            },
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.0.shape
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn op(&self) -> &TensorOp {
        &self.0.op
    }

    pub fn numel(&self) -> usize {
        self.0.shape.iter().product()
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.0.op, TensorOp::Placeholder)
    }

    pub fn reduction(&self) -> Option<&Reduction> {
        match &self.0.op {
            TensorOp::Compute { reduction, .. } => reduction.as_ref(),
            TensorOp::Placeholder => None,
        }
    }

    pub fn is_reduce(&self) -> bool {
        self.reduction().is_some()
    }

    pub fn body(&self) -> Option<&Expr> {
        match &self.0.op {
            TensorOp::Compute { body, .. } => Some(body),
            TensorOp::Placeholder => None,
        }
    }

    pub fn axis_names(&self) -> &[String] {
        match &self.0.op {
            TensorOp::Compute { axes, .. } => axes,
            TensorOp::Placeholder => &[],
        }
    }

    pub fn inputs(&self) -> &[Tensor] {
        match &self.0.op {
            TensorOp::Compute { inputs, .. } => inputs,
            TensorOp::Placeholder => &[],
        }
    }

    /// `self[indices]` as an expression.
    pub fn at(&self, indices: Vec<Expr>) -> Expr {
        Expr::Load {
            tensor: self.0.name.clone(),
            dtype: self.0.dtype,
            indices,
        }
    }

    pub fn same_as(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other) || self.0.name == other.0.name
    }
}
