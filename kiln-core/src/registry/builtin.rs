//! Compute and schedule rules of the builtin operator set.

use log::trace;

use super::{ComputeContext, ComputeOutput, OpEntry, RegistryBuilder, ScheduleContext};
use crate::{
    graph::AttrValue,
    ir::{BinOp, Expr, ParallelAxis, ReduceKind, Tensor, UnaryOp},
    schedule::{Stage, StageMap},
    Error, OpPatternKind, Result,
};

/// Register every builtin operator into `builder`.
pub fn register_builtins(builder: &mut RegistryBuilder) {
    for (name, op) in [
        ("elementwise_add", BinOp::Add),
        ("elementwise_sub", BinOp::Sub),
        ("elementwise_mul", BinOp::Mul),
        ("elementwise_div", BinOp::Div),
    ] {
        builder.register(
            OpEntry::new(name, OpPatternKind::ElemWise, move |ctx| binary(ctx, op))
                .with_schedule(injective_schedule),
        );
    }
    for (name, op) in [("exp", UnaryOp::Exp), ("tanh", UnaryOp::Tanh)] {
        builder.register(
            OpEntry::new(name, OpPatternKind::ElemWise, move |ctx| {
                unary(ctx, |x| Expr::unary(op, x))
            })
            .with_schedule(injective_schedule),
        );
    }
    builder
        .register(
            OpEntry::new("relu", OpPatternKind::ElemWise, |ctx| {
                let zero = Expr::zero(ctx.out_dtype(0)?);
                unary(ctx, |x| Expr::max(x, zero))
            })
            .with_schedule(injective_schedule),
        )
        .register(OpEntry::new("scale", OpPatternKind::ElemWise, scale).with_schedule(injective_schedule))
        .register(
            OpEntry::new("broadcast_to", OpPatternKind::Broadcast, broadcast_to)
                .with_schedule(injective_schedule),
        )
        .register(
            OpEntry::new("transpose", OpPatternKind::Injective, transpose)
                .with_schedule(injective_schedule),
        )
        .register(
            OpEntry::new("reshape", OpPatternKind::Injective, reshape)
                .with_schedule(injective_schedule),
        )
        .register(
            OpEntry::new("reduce_sum", OpPatternKind::CommReduce, |ctx| {
                reduce(ctx, ReduceKind::Sum)
            })
            .with_schedule(reduce_schedule),
        )
        .register(
            OpEntry::new("reduce_max", OpPatternKind::CommReduce, |ctx| {
                reduce(ctx, ReduceKind::Max)
            })
            .with_schedule(reduce_schedule),
        )
        .register(
            OpEntry::new("matmul", OpPatternKind::OutEWiseFusable, matmul)
                .with_schedule(matmul_schedule),
        )
        .register(OpEntry::new("cumsum", OpPatternKind::Opaque, cumsum));
}

fn binary(ctx: &ComputeContext, op: BinOp) -> Result<ComputeOutput> {
    let (a, b) = (ctx.input(0)?.clone(), ctx.input(1)?.clone());
    if a.shape() != b.shape() {
        return Err(Error::import(
            &ctx.node.name,
            format!("operand shapes differ: {:?} vs {:?}", a.shape(), b.shape()),
        ));
    }
    let out = Tensor::compute(
        ctx.out_name(0)?,
        ctx.out_shape(0)?,
        ctx.out_dtype(0)?,
        vec![a.clone(), b.clone()],
        |idx| Expr::binary(op, a.at(idx.to_vec()), b.at(idx.to_vec())),
    );
    Ok(ComputeOutput::single(out))
}

fn unary(ctx: &ComputeContext, f: impl FnOnce(Expr) -> Expr) -> Result<ComputeOutput> {
    let x = ctx.input(0)?.clone();
    let out = Tensor::compute(
        ctx.out_name(0)?,
        ctx.out_shape(0)?,
        ctx.out_dtype(0)?,
        vec![x.clone()],
        |idx| f(x.at(idx.to_vec())),
    );
    Ok(ComputeOutput::single(out))
}

fn scale(ctx: &ComputeContext) -> Result<ComputeOutput> {
    let scale = ctx.node.attr("scale").and_then(AttrValue::as_float).unwrap_or(1.0);
    let bias = ctx.node.attr("bias").and_then(AttrValue::as_float).unwrap_or(0.0);
    unary(ctx, |x| x * Expr::float(scale) + Expr::float(bias))
}

fn broadcast_to(ctx: &ComputeContext) -> Result<ComputeOutput> {
    let x = ctx.input(0)?.clone();
    let axes = ctx.attr_dims("broadcast_axes")?;
    let out_shape = ctx.out_shape(0)?.to_vec();
    if axes.len() != x.shape().len() || axes.iter().any(|a| *a >= out_shape.len()) {
        return Err(Error::import(
            &ctx.node.name,
            format!("bad broadcast axes {axes:?} for {:?} -> {out_shape:?}", x.shape()),
        ));
    }
    let in_shape = x.shape().to_vec();
    let out = Tensor::compute(
        ctx.out_name(0)?,
        &out_shape,
        ctx.out_dtype(0)?,
        vec![x.clone()],
        |idx| {
            let indices = axes
                .iter()
                .zip(&in_shape)
                .map(|(axis, dim)| match dim {
                    1 => Expr::int(0),
                    _ => idx[*axis].clone(),
                })
                .collect();
            x.at(indices)
        },
    );
    Ok(ComputeOutput::single(out))
}

fn transpose(ctx: &ComputeContext) -> Result<ComputeOutput> {
    let x = ctx.input(0)?.clone();
    let perm = ctx.attr_dims("axis")?;
    let rank = x.shape().len();
    let mut sorted = perm.clone();
    sorted.sort_unstable();
    if sorted != (0..rank).collect::<Vec<_>>() {
        return Err(Error::import(
            &ctx.node.name,
            format!("{perm:?} is not a permutation of rank {rank}"),
        ));
    }
    let out = Tensor::compute(
        ctx.out_name(0)?,
        ctx.out_shape(0)?,
        ctx.out_dtype(0)?,
        vec![x.clone()],
        |idx| {
            let mut indices = vec![Expr::int(0); rank];
            for (out_dim, in_dim) in perm.iter().enumerate() {
                indices[*in_dim] = idx[out_dim].clone();
            }
            x.at(indices)
        },
    );
    Ok(ComputeOutput::single(out))
}

fn strides(shape: &[usize]) -> Vec<i64> {
    let mut acc = 1i64;
    let mut out = vec![0; shape.len()];
    for (s, d) in out.iter_mut().zip(shape).rev() {
        *s = acc;
        acc *= *d as i64;
    }
    out
}

fn reshape(ctx: &ComputeContext) -> Result<ComputeOutput> {
    let x = ctx.input(0)?.clone();
    let out_shape = ctx.out_shape(0)?.to_vec();
    if x.numel() != out_shape.iter().product::<usize>() {
        return Err(Error::import(
            &ctx.node.name,
            format!("cannot reshape {:?} into {out_shape:?}", x.shape()),
        ));
    }
    let in_shape = x.shape().to_vec();
    let out = Tensor::compute(
        ctx.out_name(0)?,
        &out_shape,
        ctx.out_dtype(0)?,
        vec![x.clone()],
        |idx| {
            let flat = idx
                .iter()
                .zip(strides(&out_shape))
                .fold(Expr::int(0), |acc, (i, s)| acc + Expr::int(s) * i.clone())
                .simplify();
            let indices = strides(&in_shape)
                .into_iter()
                .zip(&in_shape)
                .map(|(s, d)| ((flat.clone() / s) % (*d as i64)).simplify())
                .collect();
            x.at(indices)
        },
    );
    Ok(ComputeOutput::single(out))
}

/// Index into the reduced input: kept dims read the spatial vars in order,
/// reduced dims read the reduction vars in order.
fn reduce_input_index(
    rank: usize,
    dims: &[usize],
    keep_dim: bool,
    spatial: &[Expr],
    reduce: &[Expr],
) -> Vec<Expr> {
    let (mut s, mut r) = (0, 0);
    let mut out = Vec::with_capacity(rank);
    for d in 0..rank {
        if dims.contains(&d) {
            out.push(reduce[r].clone());
            r += 1;
            if keep_dim {
                s += 1;
            }
        } else {
            out.push(spatial[s].clone());
            s += 1;
        }
    }
    out
}

fn reduce(ctx: &ComputeContext, kind: ReduceKind) -> Result<ComputeOutput> {
    let x = ctx.input(0)?.clone();
    let rank = x.shape().len();
    let mut dims = ctx.attr_dims("dim")?;
    dims.sort_unstable();
    dims.dedup();
    if dims.is_empty() || dims.iter().any(|d| *d >= rank) {
        return Err(Error::import(
            &ctx.node.name,
            format!("invalid reduce dims {dims:?} for rank {rank}"),
        ));
    }
    let keep_dim = ctx.attr_bool_or("keep_dim", false);
    let in_shape = x.shape().to_vec();
    let out_shape = ctx.out_shape(0)?.to_vec();
    let name = ctx.out_name(0)?;
    let dtype = ctx.out_dtype(0)?;
    let extents: Vec<usize> = dims.iter().map(|d| in_shape[*d]).collect();

    let width = ctx.target.max_parallel_width;
    if !(ctx.target.is_device() && extents.len() == 1 && extents[0] > width) {
        let y = Tensor::reduce(name, &out_shape, dtype, vec![x.clone()], kind, &extents, |s, r| {
            x.at(reduce_input_index(rank, &dims, keep_dim, s, r))
        });
        return Ok(ComputeOutput::single(y));
    }

    // Two-level reduction: partial results over chunks of `width`, then the
    // chunks themselves.
    let k = extents[0] as i64;
    let chunks = extents[0].div_ceil(width);
    trace!("{name}: splitting reduction of {k} into {chunks} chunks of {width}");
    let mut helper_shape = out_shape.clone();
    helper_shape.push(chunks);
    let partial = Tensor::reduce(
        format!("{name}_0"),
        &helper_shape,
        dtype,
        vec![x.clone()],
        kind,
        &[width],
        |s, r| {
            let (chunk, spatial) = (s[s.len() - 1].clone(), &s[..s.len() - 1]);
            let pos = Expr::int(width as i64) * chunk + r[0].clone();
            let load = x.at(reduce_input_index(rank, &dims, keep_dim, spatial, &[pos.clone()]));
            Expr::select(Expr::lt(pos, Expr::int(k)), load, kind.init(dtype))
        },
    );
    let y = Tensor::reduce(name, &out_shape, dtype, vec![partial.clone()], kind, &[chunks], |s, r| {
        let mut idx = s.to_vec();
        idx.push(r[0].clone());
        partial.at(idx)
    });
    Ok(ComputeOutput {
        outputs: vec![y],
        helpers: vec![partial],
    })
}

fn matmul(ctx: &ComputeContext) -> Result<ComputeOutput> {
    let (a, b) = (ctx.input(0)?.clone(), ctx.input(1)?.clone());
    let (sa, sb) = (a.shape(), b.shape());
    if sa.len() != 2 || sb.len() != 2 || sa[1] != sb[0] {
        return Err(Error::import(
            &ctx.node.name,
            format!("incompatible matmul operands {sa:?} x {sb:?}"),
        ));
    }
    let c = Tensor::reduce(
        ctx.out_name(0)?,
        ctx.out_shape(0)?,
        ctx.out_dtype(0)?,
        vec![a.clone(), b.clone()],
        ReduceKind::Sum,
        &[sa[1]],
        |s, r| {
            a.at(vec![s[0].clone(), r[0].clone()]) * b.at(vec![r[0].clone(), s[1].clone()])
        },
    );
    Ok(ComputeOutput::single(c))
}

fn cumsum(ctx: &ComputeContext) -> Result<ComputeOutput> {
    let x = ctx.input(0)?.clone();
    let axis = usize::try_from(ctx.attr_int("axis")?)
        .ok()
        .filter(|a| *a < x.shape().len())
        .ok_or_else(|| Error::import(&ctx.node.name, "cumsum axis out of range"))?;
    let dtype = ctx.out_dtype(0)?;
    let extent = x.shape()[axis];
    let out = Tensor::reduce(
        ctx.out_name(0)?,
        ctx.out_shape(0)?,
        dtype,
        vec![x.clone()],
        ReduceKind::Sum,
        &[extent],
        |s, r| {
            let mut idx = s.to_vec();
            idx[axis] = r[0].clone();
            Expr::select(
                Expr::le(r[0].clone(), s[axis].clone()),
                x.at(idx),
                ReduceKind::Sum.init(dtype),
            )
        },
    );
    Ok(ComputeOutput::single(out))
}

/// Fuse every spatial axis, split at `width` when the fused extent is larger,
/// and on devices bind the result to blocks and threads.
pub(crate) fn fuse_and_cap(stage: &mut Stage, width: usize, device: bool) -> Result<()> {
    let Some(axis) = stage.fuse_spatial()? else {
        return Ok(());
    };
    if stage.axes()[axis].extent > width {
        let (outer, inner) = stage.split(axis, width)?;
        if device {
            stage.bind(outer, ParallelAxis::BlockX)?;
            stage.bind(inner, ParallelAxis::ThreadX)?;
        }
    } else if device {
        stage.bind(axis, ParallelAxis::ThreadX)?;
    }
    Ok(())
}

fn injective_schedule(stages: &mut StageMap, ctx: &ScheduleContext) -> Result<()> {
    if !ctx.target.is_device() {
        return Ok(());
    }
    for out in ctx.outputs {
        fuse_and_cap(stages.expect_mut(out.name())?, ctx.target.max_parallel_width, true)?;
    }
    Ok(())
}

fn reduce_schedule(stages: &mut StageMap, ctx: &ScheduleContext) -> Result<()> {
    let width = ctx.target.max_parallel_width;
    for out in ctx.outputs {
        fuse_and_cap(stages.expect_mut(out.name())?, width, ctx.target.is_device())?;
        let level = stages.expect(out.name())?.num_spatial().saturating_sub(1);
        for helper in ctx.helpers {
            stages.copy_transform(helper.name(), out.name())?;
            stages.compute_at(helper.name(), out.name(), level)?;
        }
    }
    Ok(())
}

fn matmul_schedule(stages: &mut StageMap, ctx: &ScheduleContext) -> Result<()> {
    if !ctx.target.is_device() {
        return Ok(());
    }
    for out in ctx.outputs {
        fuse_and_cap(stages.expect_mut(out.name())?, ctx.target.max_parallel_width, true)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{graph::Attrs, graph::Node, DType, NodeId, OpRegistry, Target};

    fn node(op: &str, attrs: Attrs) -> Node {
        Node {
            id: NodeId(0),
            op: Some(op.to_string()),
            name: format!("{op}_0"),
            attrs,
        }
    }

    fn run(
        op: &str,
        attrs: Attrs,
        inputs: Vec<Tensor>,
        out_shape: &[usize],
        target: &Target,
    ) -> ComputeOutput {
        let registry = OpRegistry::with_builtins();
        let node = node(op, attrs);
        let ctx = ComputeContext {
            node: &node,
            inputs,
            out_shapes: vec![out_shape.to_vec()],
            out_dtypes: vec![DType::F32],
            out_names: vec!["Y".to_string()],
            target,
        };
        (registry.get(op).unwrap().compute)(&ctx).unwrap()
    }

    #[test]
    fn relu_clamps_against_a_zero_of_its_dtype() {
        let registry = OpRegistry::with_builtins();
        let node = node("relu", Attrs::new());
        let target = Target::host();
        for (dtype, expected) in [
            (DType::F32, "kiln_max(X[i], 0.0f)"),
            (DType::I32, "kiln_max(X[i], 0)"),
        ] {
            let ctx = ComputeContext {
                node: &node,
                inputs: vec![Tensor::placeholder("X", &[4], dtype)],
                out_shapes: vec![vec![4]],
                out_dtypes: vec![dtype],
                out_names: vec!["Y".to_string()],
                target: &target,
            };
            let out = (registry.get("relu").unwrap().compute)(&ctx).unwrap();
            assert_eq!(out.outputs[0].body().unwrap().to_string(), expected);
        }
    }

    #[test]
    fn transpose_swaps_load_indices() {
        let x = Tensor::placeholder("X", &[2, 3], DType::F32);
        let attrs = Attrs::from([("axis".to_string(), AttrValue::Ints(vec![1, 0]))]);
        let out = run("transpose", attrs, vec![x], &[3, 2], &Target::host());
        assert_eq!(out.outputs[0].body().unwrap().to_string(), "X[j][i]");
    }

    #[test]
    fn reduce_without_keep_dim_skips_reduced_positions() {
        let x = Tensor::placeholder("X", &[4, 8], DType::F32);
        let attrs = Attrs::from([("dim".to_string(), AttrValue::Ints(vec![1]))]);
        let out = run("reduce_sum", attrs, vec![x], &[4], &Target::host());
        let y = &out.outputs[0];
        assert!(y.is_reduce());
        assert_eq!(y.body().unwrap().to_string(), "X[i][rk]");
        assert!(out.helpers.is_empty());
    }

    #[test]
    fn wide_device_reduction_gets_a_partial_stage() {
        let x = Tensor::placeholder("X", &[2, 3000], DType::F32);
        let attrs = Attrs::from([("dim".to_string(), AttrValue::Ints(vec![1]))]);
        let out = run("reduce_sum", attrs, vec![x], &[2], &Target::nvgpu());
        assert_eq!(out.helpers.len(), 1);
        assert_eq!(out.helpers[0].name(), "Y_0");
        assert_eq!(out.helpers[0].shape(), &[2, 3]);
    }
}
