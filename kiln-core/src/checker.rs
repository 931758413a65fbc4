use std::collections::HashMap;

use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    buffer::{ArgValue, HostBuffer, SharedBuffer},
    exec::Executor,
    fusion::Group,
    lower::{LoweredFunc, OpLowerer},
    pattern::kind_of,
    DType, Error, Graph, OpRegistry, Result, Target,
};

/// Verifies that fusing a group does not change what it computes.
///
/// The fused functions and the per-node functions of the same group are run on
/// one set of random inputs; every value the fused functions write must agree
/// with the unfused result within a relative tolerance.
pub struct FusionChecker<'a> {
    graph: &'a Graph,
    registry: &'a OpRegistry,
    target: &'a Target,
    tolerance: f64,
    seed: u64,
}

impl<'a> FusionChecker<'a> {
    pub fn new(graph: &'a Graph, registry: &'a OpRegistry, target: &'a Target) -> Self {
        Self {
            graph,
            registry,
            target,
            tolerance: 1e-4,
            seed: 0,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn check(&self, group: &Group) -> Result<()> {
        let lowerer = OpLowerer::new(self.graph, self.registry, self.target)?;
        let fused = lowerer.lower(group)?;

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut inputs: HashMap<String, SharedBuffer> = HashMap::new();
        for f in &fused {
            for a in f.inputs() {
                if !inputs.contains_key(a.name()) {
                    let buf = random_buffer(&mut rng, a.buffer.dtype, &a.buffer.shape);
                    inputs.insert(a.name().to_string(), buf.into_shared());
                }
            }
        }

        let mut fused_values = inputs.clone();
        for f in &fused {
            run(f, &mut fused_values)?;
        }

        let mut nodes = group.nodes.clone();
        let topo = self.graph.topo_order()?;
        nodes.sort_by_key(|n| topo.iter().position(|t| t == n));
        let mut reference = inputs.clone();
        for node in nodes {
            let Some(n) = self.graph.node(node) else {
                return Err(Error::msg(format!("group {} names a removed node", group.id)));
            };
            let single = Group::single(group.id, node, kind_of(self.registry, n));
            for f in lowerer.lower(&single)? {
                run(&f, &mut reference)?;
            }
        }

        for f in &fused {
            for a in f.outputs() {
                let name = a.name();
                let (Some(got), Some(want)) = (fused_values.get(name), reference.get(name)) else {
                    return Err(Error::msg(format!(
                        "group {}: output `{name}` has no unfused counterpart",
                        group.id
                    )));
                };
                let (got, want) = (got.borrow(), want.borrow());
                for (i, (a, b)) in got.data.iter().zip(&want.data).enumerate() {
                    if (a - b).abs() > self.tolerance * a.abs().max(b.abs()).max(1.0) {
                        return Err(Error::msg(format!(
                            "group {}: `{name}`[{i}] is {a} fused but {b} unfused",
                            group.id
                        )));
                    }
                }
            }
        }
        debug!("group {} matches its unfused lowering", group.id);
        Ok(())
    }
}

fn random_buffer(rng: &mut StdRng, dtype: DType, shape: &[usize]) -> HostBuffer {
    let numel: usize = shape.iter().product();
    let data = (0..numel)
        .map(|_| match dtype.is_float() {
            true => dtype.quantize(rng.gen_range(-1.0..1.0)),
            false => rng.gen_range(-8..8) as f64,
        })
        .collect();
    HostBuffer {
        dtype,
        shape: shape.to_vec(),
        data,
    }
}

/// Run `f`, reading inputs from and writing outputs into `values`.
fn run(f: &LoweredFunc, values: &mut HashMap<String, SharedBuffer>) -> Result<()> {
    let mut args = Vec::with_capacity(f.args.len());
    for a in &f.args {
        let buf = match a.is_input() {
            true => values.get(a.name()).cloned().ok_or_else(|| {
                Error::runtime(format!("`{}`: no value for input `{}`", f.name, a.name()))
            })?,
            false => {
                let buf = HostBuffer::zeros(a.buffer.dtype, &a.buffer.shape).into_shared();
                values.insert(a.name().to_string(), buf.clone());
                buf
            }
        };
        args.push(ArgValue::Buffer(buf));
    }
    Executor::run(f, &mut args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fusion::fuse, GraphBuilder};

    #[test]
    fn reduction_epilogue_matches_unfused() {
        let mut b = GraphBuilder::new("softmax_denominator");
        let x = b.input("x", &[4, 16], DType::F32);
        let e = b.exp(x).unwrap();
        let s = b.reduce_sum(e, &[1], false).unwrap();
        let r = b.relu(s).unwrap();
        b.output(r).unwrap();
        let graph = b.build();

        let registry = OpRegistry::with_builtins();
        let target = Target::host();
        let checker = FusionChecker::new(&graph, &registry, &target).with_seed(7);
        for g in fuse(&graph, &registry, true).unwrap() {
            checker.check(&g).unwrap();
        }
    }
}
