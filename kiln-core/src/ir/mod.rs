//! Tensor expressions and the loop-level statement tree they lower to.

mod expr;
mod stmt;
mod tensor;

pub use expr::{BinOp, Expr, ExprPrinter, UnaryOp};
pub use stmt::{ForKind, ParallelAxis, Stmt};
pub use tensor::{
    reduce_axis_name, spatial_axis_name, ReduceAxis, ReduceKind, Reduction, Tensor, TensorOp,
};
