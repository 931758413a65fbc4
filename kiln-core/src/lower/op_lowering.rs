use std::collections::{HashMap, HashSet};

use log::{debug, trace};

use super::{
    loops::{lower_loops, LoopNest},
    storage, ArgKind, Argument, LoweredFunc, NameGenerator,
};
use crate::{
    buffer::{BufferDesc, BufferScope},
    builder::reduced_shape,
    error::StageError,
    fusion::Group,
    graph::{AttrValue, Node},
    ir::Tensor,
    registry::{ComputeContext, ScheduleContext},
    schedule::StageMap,
    DataId, Error, Graph, NodeId, OpPatternKind, OpRegistry, Result, Target,
};

/// Tensors and stages of the group being lowered.
#[derive(Default)]
struct GroupState {
    values: HashMap<DataId, Tensor>,
    /// Every tensor the function touches, by name.
    tensors: HashMap<String, Tensor>,
    /// Tensor name -> name of the node that computes it.
    owners: HashMap<String, String>,
    /// Values produced outside the group, in first-use order.
    inputs: Vec<Tensor>,
    stages: StageMap,
}

/// How a stage takes over another stage's loops before nesting.
#[derive(Debug, Clone)]
enum Loops {
    Own,
    Copy(String),
    AssignReduce(String, Vec<usize>),
}

#[derive(Debug, Clone, Copy)]
enum Depth {
    Innermost,
    LastSpatial,
}

#[derive(Debug, Clone)]
enum Placement {
    Root,
    Inline,
    /// Take over another stage's loops but stay at function level.
    Mirror(String),
    Attach {
        loops: Loops,
        target: String,
        depth: Depth,
        local: bool,
    },
}

/// Shape of the group's first reduction, which every other member's loops
/// are derived from.
struct Reference {
    name: String,
    input: Vec<usize>,
    dims: Option<Vec<usize>>,
}

/// Lowers fusion groups of one graph into [`LoweredFunc`]s.
///
/// One lowerer is shared by every group of a compilation so function names
/// stay unique; [`OpLowerer::lower`] only needs `&self` and may run from
/// several threads at once.
pub struct OpLowerer<'a> {
    graph: &'a Graph,
    registry: &'a OpRegistry,
    target: &'a Target,
    names: NameGenerator,
    topo_pos: HashMap<NodeId, usize>,
}

fn lowering_error(group: &Group, node: &str, source: Error) -> Error {
    Error::Lowering {
        group: group.id,
        node: node.to_string(),
        source: Box::new(source),
    }
}

impl<'a> OpLowerer<'a> {
    pub fn new(graph: &'a Graph, registry: &'a OpRegistry, target: &'a Target) -> Result<Self> {
        let topo_pos = graph
            .topo_order()?
            .into_iter()
            .enumerate()
            .map(|(i, n)| (n, i))
            .collect();
        Ok(Self {
            graph,
            registry,
            target,
            names: NameGenerator::new(),
            topo_pos,
        })
    }

    pub fn target(&self) -> &Target {
        self.target
    }

    /// Lower `group` into the functions computing it.
    ///
    /// A horizontally merged group is computed and scheduled one sub-group
    /// at a time: each sub-group keeps its own master, reduction loops and
    /// local buffers, and all of them share one function.
    pub fn lower(&self, group: &Group) -> Result<Vec<LoweredFunc>> {
        let order = self.topo_sorted(&group.nodes);
        if group.op_pattern_kind == OpPatternKind::Opaque && order.len() != 1 {
            return Err(Error::msg(format!(
                "opaque group {} holds {} nodes",
                group.id,
                order.len()
            )));
        }
        let units: Vec<&Group> = match group.is_horizontal() {
            true => group.fused_sub_groups.iter().collect(),
            false => vec![group],
        };

        let mut state = GroupState::default();
        for unit in &units {
            for id in self.topo_sorted(&unit.nodes) {
                let node = self.graph.expect_node(id)?;
                self.compute(node, &mut state)
                    .map_err(|e| lowering_error(group, &node.name, e))?;
            }
        }
        let mut attached = HashSet::new();
        for (i, unit) in units.iter().enumerate() {
            if units.len() > 1 {
                trace!("group {}: scheduling sub-group {i}", group.id);
            }
            let unit_order = self.topo_sorted(&unit.nodes);
            attached.extend(self.schedule(unit, &unit_order, &mut state)?);
        }
        let nest = self.loop_nest(group, &mut state, attached)?;
        let func = self.assemble(group, &order, &state, nest)?;
        debug!(
            "lowered group {} into `{}`: {} args, {} temps",
            group.id,
            func.name,
            func.args.len(),
            func.temp_buffers.len()
        );
        Ok(vec![func])
    }

    fn topo_sorted(&self, nodes: &[NodeId]) -> Vec<NodeId> {
        let mut order = nodes.to_vec();
        order.sort_by_key(|n| self.topo_pos.get(n).copied().unwrap_or(usize::MAX));
        order
    }

    /// Run `node`'s compute rule, then its registered schedule.
    fn compute(&self, node: &Node, state: &mut GroupState) -> Result<()> {
        let entry = self
            .registry
            .get(node.op_name())
            .ok_or_else(|| Error::UnregisteredOp(node.op_name().to_string()))?;

        let mut inputs = Vec::new();
        for d in self.graph.inputs_of(node.id)? {
            if let Some(t) = state.values.get(d) {
                inputs.push(t.clone());
                continue;
            }
            let data = self.graph.expect_data(*d)?;
            let t = Tensor::placeholder(&data.name, &data.shape, data.dtype);
            state.values.insert(*d, t.clone());
            state.tensors.insert(data.name.clone(), t.clone());
            state.inputs.push(t.clone());
            inputs.push(t);
        }

        let outs = self.graph.outputs_of(node.id)?;
        let mut ctx = ComputeContext {
            node,
            inputs,
            out_shapes: Vec::with_capacity(outs.len()),
            out_dtypes: Vec::with_capacity(outs.len()),
            out_names: Vec::with_capacity(outs.len()),
            target: self.target,
        };
        for d in outs {
            let data = self.graph.expect_data(*d)?;
            ctx.out_shapes.push(data.shape.clone());
            ctx.out_dtypes.push(data.dtype);
            ctx.out_names.push(data.name.clone());
        }
        let computed = (entry.compute)(&ctx)?;
        if computed.outputs.len() != outs.len() {
            return Err(Error::import(
                &node.name,
                format!(
                    "compute rule produced {} tensors for {} outputs",
                    computed.outputs.len(),
                    outs.len()
                ),
            ));
        }

        for t in computed.helpers.iter().chain(&computed.outputs) {
            state.stages.insert_lazily(t)?;
            state.tensors.insert(t.name().to_string(), t.clone());
            state.owners.insert(t.name().to_string(), node.name.clone());
        }
        for (d, t) in outs.iter().zip(&computed.outputs) {
            state.values.insert(*d, t.clone());
        }
        if let Some(schedule) = &entry.schedule {
            let ctx = ScheduleContext {
                node,
                outputs: &computed.outputs,
                helpers: &computed.helpers,
                target: self.target,
            };
            schedule(&mut state.stages, &ctx)?;
        }
        trace!("computed `{}` ({})", node.name, node.op_name());
        Ok(())
    }

    fn tensor_of(&self, node: NodeId, state: &GroupState) -> Result<Tensor> {
        let d = self
            .graph
            .outputs_of(node)?
            .first()
            .copied()
            .ok_or_else(|| Error::import(node, "node produces no value"))?;
        state
            .values
            .get(&d)
            .cloned()
            .ok_or_else(|| Error::msg(format!("{node} was not computed")))
    }

    /// Whether group members read `node`'s values more than once. Every
    /// input edge counts, so `x * x` is two reads.
    fn multi_use(&self, node: NodeId, members: &HashSet<NodeId>) -> Result<bool> {
        let outs = self.graph.outputs_of(node)?;
        let mut reads = 0;
        for c in self.graph.node_consumers(node)? {
            if members.contains(&c) {
                reads += self
                    .graph
                    .inputs_of(c)?
                    .iter()
                    .filter(|d| outs.contains(d))
                    .count();
            }
        }
        Ok(reads > 1)
    }

    /// Derive every member's placement from the master's loops. Returns the
    /// stages nested inside another stage.
    fn schedule(
        &self,
        group: &Group,
        order: &[NodeId],
        state: &mut GroupState,
    ) -> Result<HashSet<String>> {
        let mut attached = HashSet::new();
        if group.op_pattern_kind == OpPatternKind::Opaque {
            return Ok(attached);
        }
        let master = group
            .master()
            .ok_or_else(|| Error::msg(format!("group {} has no master", group.id)))?;
        let m = self.tensor_of(master, state)?;
        let members: HashSet<NodeId> = order.iter().copied().collect();
        let reference = self.reference(order, state)?;

        let mut plan = Vec::with_capacity(order.len());
        for id in order {
            let t = self.tensor_of(*id, state)?;
            let placement = match &reference {
                None => self.place_injective(group, *id, &t, master, &m, &members)?,
                Some(r) => self.place_reduce(group, *id, &t, master, &m, r, &members)?,
            };
            trace!("group {}: `{}` -> {placement:?}", group.id, t.name());
            plan.push((*id, t, placement));
        }
        // The master's own transforms come first, everything else copies them.
        plan.sort_by_key(|(id, _, _)| *id != master);

        for (id, t, placement) in plan {
            let node = self.graph.expect_node(id)?;
            self.apply(&mut state.stages, t.name(), placement, &mut attached)
                .map_err(|e| lowering_error(group, &node.name, e))?;
        }
        Ok(attached)
    }

    /// The first reduction of the group, producer-first.
    fn reference(&self, order: &[NodeId], state: &GroupState) -> Result<Option<Reference>> {
        for id in order {
            let t = self.tensor_of(*id, state)?;
            if !t.is_reduce() {
                continue;
            }
            let node = self.graph.expect_node(*id)?;
            let input = match self.graph.inputs_of(*id)?.first() {
                Some(d) => self.graph.expect_data(*d)?.shape.clone(),
                None => Vec::new(),
            };
            let dims = node.attr("dim").and_then(AttrValue::as_ints).map(|ints| {
                let mut dims: Vec<usize> =
                    ints.iter().filter_map(|d| usize::try_from(*d).ok()).collect();
                dims.sort_unstable();
                dims.dedup();
                dims
            });
            // Producers can only share the reduction's loops when its kept
            // dims are exactly its output dims.
            let dims = dims.filter(|dims| {
                dims.len() < input.len() && reduced_shape(&input, dims, false) == t.shape()
            });
            return Ok(Some(Reference {
                name: t.name().to_string(),
                input,
                dims,
            }));
        }
        Ok(None)
    }

    fn place_injective(
        &self,
        group: &Group,
        id: NodeId,
        t: &Tensor,
        master: NodeId,
        m: &Tensor,
        members: &HashSet<NodeId>,
    ) -> Result<Placement> {
        if id == master {
            return Ok(Placement::Root);
        }
        let output = group.is_output(id);
        if !output && !self.multi_use(id, members)? {
            return Ok(Placement::Inline);
        }
        if t.shape() != m.shape() {
            return Ok(Placement::Root);
        }
        Ok(Placement::Attach {
            loops: Loops::Copy(m.name().to_string()),
            target: m.name().to_string(),
            depth: Depth::Innermost,
            local: !output,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn place_reduce(
        &self,
        group: &Group,
        id: NodeId,
        t: &Tensor,
        master: NodeId,
        m: &Tensor,
        r: &Reference,
        members: &HashSet<NodeId>,
    ) -> Result<Placement> {
        let output = group.is_output(id);
        let master_reduces = m.is_reduce();
        let depth = match master_reduces {
            true => Depth::LastSpatial,
            false => Depth::Innermost,
        };
        if id == master {
            return Ok(match master_reduces {
                true => Placement::Root,
                false => Placement::Mirror(r.name.clone()),
            });
        }
        if t.is_reduce() {
            let loops = match (master_reduces, t.name() == r.name) {
                (true, _) => Loops::Copy(m.name().to_string()),
                (false, true) => Loops::Own,
                (false, false) => Loops::Copy(r.name.clone()),
            };
            return Ok(Placement::Attach {
                loops,
                target: m.name().to_string(),
                depth,
                local: !output,
            });
        }
        if !output && !self.multi_use(id, members)? {
            return Ok(Placement::Inline);
        }
        if t.shape() == m.shape() {
            return Ok(Placement::Attach {
                loops: Loops::Copy(m.name().to_string()),
                target: m.name().to_string(),
                depth,
                local: !output,
            });
        }
        match &r.dims {
            Some(dims) if t.shape() == r.input.as_slice() => Ok(Placement::Attach {
                loops: Loops::AssignReduce(r.name.clone(), dims.clone()),
                target: r.name.clone(),
                depth: Depth::LastSpatial,
                local: !output,
            }),
            _ => Ok(Placement::Root),
        }
    }

    fn apply(
        &self,
        stages: &mut StageMap,
        name: &str,
        placement: Placement,
        attached: &mut HashSet<String>,
    ) -> Result<()> {
        match placement {
            Placement::Root => Ok(()),
            Placement::Inline => stages.compute_inline(name),
            Placement::Mirror(like) => {
                stages.copy_transform(name, &like)?;
                stages.copy_loop_info(name, &like)
            }
            Placement::Attach {
                loops,
                target,
                depth,
                local,
            } => {
                match loops {
                    Loops::Own => {}
                    Loops::Copy(like) => {
                        stages.copy_transform(name, &like)?;
                        stages.copy_loop_info(name, &like)?;
                    }
                    Loops::AssignReduce(reducer, dims) => {
                        stages.assign_reduce(name, &reducer, &dims)?;
                        stages.copy_loop_info(name, &reducer)?;
                    }
                }
                let ts = stages.expect(&target)?;
                let level = match depth {
                    Depth::Innermost => ts.axes().len(),
                    Depth::LastSpatial => ts.num_spatial(),
                };
                let Some(level) = level.checked_sub(1) else {
                    return Ok(());
                };
                stages.compute_at(name, &target, level)?;
                attached.insert(name.to_string());
                if local {
                    stages.set_buffer(name, BufferScope::Local)?;
                }
                Ok(())
            }
        }
    }

    /// Lower the stage map, moving a nested stage back to function level when
    /// its consumers cannot read it from inside the shared loops.
    fn loop_nest(
        &self,
        group: &Group,
        state: &mut GroupState,
        mut attached: HashSet<String>,
    ) -> Result<LoopNest> {
        loop {
            let err = match lower_loops(&state.stages, &state.tensors, self.target) {
                Ok(nest) => return Ok(nest),
                Err(e) => e,
            };
            match err.stage_error() {
                Some(StageError::IllegalComputeAt { stage, .. }) if attached.contains(stage) => {
                    let stage = stage.clone();
                    debug!("group {}: `{stage}` cannot share its reader's loops", group.id);
                    attached.remove(&stage);
                    let s = state.stages.expect_mut(&stage)?;
                    s.detach();
                    s.set_buffer(BufferScope::Global);
                }
                Some(e) => {
                    let node = state
                        .owners
                        .get(e.stage())
                        .cloned()
                        .unwrap_or_else(|| e.stage().to_string());
                    return Err(lowering_error(group, &node, err));
                }
                None => {
                    let node = match group.master() {
                        Some(m) => self.graph.expect_node(m)?.name.clone(),
                        None => String::new(),
                    };
                    return Err(lowering_error(group, &node, err));
                }
            }
        }
    }

    fn assemble(
        &self,
        group: &Group,
        order: &[NodeId],
        state: &GroupState,
        nest: LoopNest,
    ) -> Result<LoweredFunc> {
        let mut args: Vec<Argument> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut push_arg = |t: &Tensor, kind: ArgKind| {
            if seen.insert(t.name().to_string()) {
                args.push(Argument {
                    tensor: t.clone(),
                    buffer: BufferDesc::new(
                        format!("_{}", t.name()),
                        t.dtype(),
                        t.shape(),
                        self.target,
                    ),
                    kind,
                });
            }
        };
        for t in &state.inputs {
            push_arg(t, ArgKind::Input);
        }
        for id in order.iter().filter(|id| group.is_output(**id)) {
            for d in self.graph.outputs_of(*id)? {
                if let Some(t) = state.values.get(d) {
                    push_arg(t, ArgKind::Output);
                }
            }
        }

        let (temp_buffers, views) =
            storage(&args, &nest, &state.stages, &state.tensors, self.target)?;

        let node_names = order
            .iter()
            .map(|id| self.graph.expect_node(*id).map(|n| n.name.clone()))
            .collect::<Result<Vec<_>>>()?;
        let hint = match node_names.len() {
            1 => format!("fn_{}", node_names[0]),
            _ => format!("fn_{}_fused", node_names.join("_")),
        };
        Ok(LoweredFunc {
            name: self.names.new_name(&hint),
            args,
            temp_buffers,
            views,
            body: nest.body,
            axis_info: nest.axis_info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fusion::fuse, ir::Stmt, DType, GraphBuilder};

    fn lower_all(graph: &Graph, target: &Target) -> Vec<LoweredFunc> {
        let registry = OpRegistry::with_builtins();
        let lowerer = OpLowerer::new(graph, &registry, target).unwrap();
        fuse(graph, &registry, true)
            .unwrap()
            .iter()
            .flat_map(|g| lowerer.lower(g).unwrap())
            .collect()
    }

    #[test]
    fn elementwise_chain_keeps_only_the_output() {
        let mut b = GraphBuilder::new("chain");
        let x = b.input("x", &[4, 8], DType::F32);
        let e = b.exp(x).unwrap();
        let r = b.relu(e).unwrap();
        b.output(r).unwrap();
        let funcs = lower_all(&b.build(), &Target::host());
        assert_eq!(funcs.len(), 1);
        let f = &funcs[0];
        assert_eq!(f.name, "fn_exp_0_relu_1_fused");
        assert!(f.temp_buffers.is_empty());
        assert_eq!(f.body.stored_tensors(), vec!["var_1"]);
        let args: Vec<_> = f.args.iter().map(|a| (a.name(), a.kind)).collect();
        assert_eq!(args, vec![("x", ArgKind::Input), ("var_1", ArgKind::Output)]);
    }

    #[test]
    fn reduction_nests_inside_its_epilogue() {
        let mut b = GraphBuilder::new("reduce_relu");
        let x = b.input("x", &[4, 8], DType::F32);
        let s = b.reduce_sum(x, &[1], false).unwrap();
        let r = b.relu(s).unwrap();
        b.output(r).unwrap();
        let funcs = lower_all(&b.build(), &Target::host());
        assert_eq!(funcs.len(), 1);
        let f = &funcs[0];
        assert_eq!(
            f.body.stored_tensors(),
            vec!["var_0__reduce_init", "var_0", "var_1"]
        );
        assert_eq!(f.local_temps().count(), 1);
        assert!(f.view("var_0__reduce_init").is_some());
    }

    #[test]
    fn producer_read_twice_is_computed_once() {
        let mut b = GraphBuilder::new("square");
        let x = b.input("x", &[4, 8], DType::F32);
        let e = b.exp(x).unwrap();
        let sq = b.mul(e, e).unwrap();
        b.output(sq).unwrap();
        let funcs = lower_all(&b.build(), &Target::host());
        assert_eq!(funcs.len(), 1);
        let f = &funcs[0];
        assert_eq!(f.body.stored_tensors(), vec!["var_0", "var_1"]);
        assert_eq!(f.local_temps().count(), 1);
    }

    #[test]
    fn sibling_reductions_keep_their_own_loops() {
        let mut b = GraphBuilder::new("two_sums");
        let x = b.input("x", &[4, 8], DType::F32);
        let e = b.exp(x).unwrap();
        let se = b.reduce_sum(e, &[1], false).unwrap();
        let r = b.relu(x).unwrap();
        let sr = b.reduce_sum(r, &[1], false).unwrap();
        for d in [e, se, r, sr] {
            b.output(d).unwrap();
        }
        let graph = b.build();
        let registry = OpRegistry::with_builtins();
        let groups = fuse(&graph, &registry, true).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].fused_sub_groups.len(), 2);

        let target = Target::host();
        let lowerer = OpLowerer::new(&graph, &registry, &target).unwrap();
        let funcs = lowerer.lower(&groups[0]).unwrap();
        let Stmt::Block(roots) = &funcs[0].body else {
            panic!("expected a block of loop nests");
        };
        let nest_of = |name: &str| {
            roots
                .iter()
                .map(Stmt::stored_tensors)
                .find(|stores| stores.contains(&name))
                .unwrap()
        };
        // each producer sits inside the loop of the reduction it feeds
        let exp_nest = nest_of("var_0");
        assert!(exp_nest.contains(&"var_1"));
        assert!(!exp_nest.contains(&"var_2") && !exp_nest.contains(&"var_3"));
        let relu_nest = nest_of("var_2");
        assert!(relu_nest.contains(&"var_3"));
        assert!(!relu_nest.contains(&"var_0") && !relu_nest.contains(&"var_1"));
    }

    #[test]
    fn unregistered_operator_is_reported_with_its_node() {
        let mut graph = Graph::new("custom");
        let x = graph.add_input("x", &[4], DType::F32);
        let n = graph.add_node(Some("softplus"), "softplus_0", Default::default());
        graph.link(x, n).unwrap();
        let y = graph.add_output(n, "y", &[4], DType::F32).unwrap();
        graph.mark_output(y).unwrap();
        graph.refresh_links();
        let registry = OpRegistry::with_builtins();
        let target = Target::host();
        let lowerer = OpLowerer::new(&graph, &registry, &target).unwrap();
        let group = Group::single(0, n, OpPatternKind::Opaque);
        let err = lowerer.lower(&group).unwrap_err();
        match err {
            Error::Lowering { node, source, .. } => {
                assert_eq!(node, "softplus_0");
                assert!(matches!(*source, Error::UnregisteredOp(ref op) if op == "softplus"));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
