//! Partitioning of a classified graph into fusible groups.
//!
//! Grouping runs in two passes:
//! 1. **Vertical**: consumers first, every producer joins the first consumer
//!    group it may legally fuse into.
//! 2. **Horizontal**: independent sibling groups reading the same input and
//!    iterating the same space are merged under one parent.
//!
//! Every merge keeps the group-level graph acyclic.

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, info};
use petgraph::graphmap::DiGraphMap;

use crate::{
    graph::AttrValue, pattern::kind_of, DataId, Error, Graph, NodeId, OpPatternKind, OpRegistry,
    Result,
};

mod group;
mod grouper;
mod horizontal;

pub use group::Group;

/// Partition `graph` into groups in dependency order.
///
/// The graph's in-order links must be fresh. Variable nodes are not grouped;
/// their values reach groups as function inputs.
pub fn fuse(graph: &Graph, registry: &OpRegistry, horizontal: bool) -> Result<Vec<Group>> {
    let ctx = FusionContext::new(graph, registry)?;
    let mut drafts = grouper::vertical(&ctx)?;
    if horizontal {
        drafts = horizontal::merge(&ctx, drafts)?;
    }
    let groups = ctx.finalize(drafts)?;
    let stats = FusionStats::of(&groups);
    info!(
        "fused {} nodes of `{}` into {} groups ({} multi-node, {} horizontal)",
        stats.total_nodes,
        graph.name(),
        stats.total_groups,
        stats.fused_groups,
        stats.horizontal_groups
    );
    Ok(groups)
}

/// Statistics about a grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FusionStats {
    pub total_nodes: usize,
    pub total_groups: usize,
    /// Groups with more than one node.
    pub fused_groups: usize,
    pub horizontal_groups: usize,
    pub largest_group: usize,
}

impl FusionStats {
    pub fn of(groups: &[Group]) -> Self {
        let mut stats = Self {
            total_groups: groups.len(),
            ..Default::default()
        };
        for g in groups {
            stats.total_nodes += g.len();
            stats.largest_group = stats.largest_group.max(g.len());
            if g.len() > 1 {
                stats.fused_groups += 1;
            }
            if g.is_horizontal() {
                stats.horizontal_groups += 1;
            }
        }
        stats
    }
}

/// Input shape, reduced dims and output shape of a reduction. Reductions
/// only share a group when these agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReduceSignature {
    pub input: Vec<usize>,
    pub dims: Vec<usize>,
    pub output: Vec<usize>,
}

/// Group under construction: member nodes consumer-first, and the members of
/// every horizontally merged sibling.
#[derive(Debug, Clone)]
pub(crate) struct Draft {
    pub kind: OpPatternKind,
    pub nodes: Vec<NodeId>,
    pub subs: Vec<Vec<NodeId>>,
}

impl Draft {
    fn new(node: NodeId, kind: OpPatternKind) -> Self {
        Self {
            kind,
            nodes: vec![node],
            subs: Vec::new(),
        }
    }
}

/// Per-node facts the grouping passes consult.
pub(crate) struct FusionContext<'a> {
    pub graph: &'a Graph,
    kinds: HashMap<NodeId, OpPatternKind>,
    shapes: HashMap<NodeId, Vec<usize>>,
    /// Operator nodes in topological order.
    pub topo: Vec<NodeId>,
    topo_pos: HashMap<NodeId, usize>,
}

impl<'a> FusionContext<'a> {
    fn new(graph: &'a Graph, registry: &OpRegistry) -> Result<Self> {
        let topo: Vec<NodeId> = graph
            .topo_order()?
            .into_iter()
            .filter(|n| graph.node(*n).is_some_and(|n| !n.is_variable()))
            .collect();
        let mut kinds = HashMap::new();
        let mut shapes = HashMap::new();
        for id in &topo {
            let node = graph.expect_node(*id)?;
            let kind = kind_of(registry, node);
            let out = graph
                .outputs_of(*id)?
                .first()
                .ok_or_else(|| Error::import(&node.name, "node produces no value"))?;
            shapes.insert(*id, graph.expect_data(*out)?.shape.clone());
            kinds.insert(*id, kind);
            debug!("classify `{}` as {kind}", node.name);
        }
        let topo_pos = topo.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        Ok(Self {
            graph,
            kinds,
            shapes,
            topo,
            topo_pos,
        })
    }

    pub fn kind(&self, node: NodeId) -> OpPatternKind {
        self.kinds
            .get(&node)
            .copied()
            .unwrap_or(OpPatternKind::Opaque)
    }

    pub fn shape(&self, node: NodeId) -> &[usize] {
        self.shapes.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn topo_pos(&self, node: NodeId) -> usize {
        self.topo_pos.get(&node).copied().unwrap_or(usize::MAX)
    }

    fn is_op(&self, node: NodeId) -> bool {
        self.kinds.contains_key(&node)
    }

    /// Operator nodes reading any output of `node`, in declaration order.
    pub fn consumers(&self, node: NodeId) -> Result<Vec<NodeId>> {
        Ok(self
            .graph
            .node_consumers(node)?
            .into_iter()
            .filter(|n| self.is_op(*n))
            .collect())
    }

    /// Operator nodes producing any input of `node`.
    pub fn producers(&self, node: NodeId) -> Result<Vec<NodeId>> {
        Ok(self
            .graph
            .node_producers(node)?
            .into_iter()
            .filter(|n| self.is_op(*n))
            .collect())
    }

    pub fn reduce_signature(&self, node: NodeId) -> Result<Option<ReduceSignature>> {
        if self.kind(node) != OpPatternKind::CommReduce {
            return Ok(None);
        }
        let Some(input) = self.graph.inputs_of(node)?.first() else {
            return Ok(None);
        };
        let n = self.graph.expect_node(node)?;
        let mut dims: Vec<usize> = n
            .attr("dim")
            .and_then(AttrValue::as_ints)
            .unwrap_or(&[])
            .iter()
            .filter_map(|d| usize::try_from(*d).ok())
            .collect();
        dims.sort_unstable();
        dims.dedup();
        Ok(Some(ReduceSignature {
            input: self.graph.expect_data(*input)?.shape.clone(),
            dims,
            output: self.shape(node).to_vec(),
        }))
    }

    /// Group-level dependency graph. `assignment` maps nodes to group
    /// indices; unassigned nodes are ignored.
    pub fn group_graph(&self, assignment: &HashMap<NodeId, usize>) -> Result<DiGraphMap<usize, ()>> {
        let mut g = DiGraphMap::new();
        for (node, group) in assignment {
            g.add_node(*group);
            for consumer in self.consumers(*node)? {
                match assignment.get(&consumer) {
                    Some(other) if other != group => {
                        g.add_edge(*group, *other, ());
                    }
                    _ => {}
                }
            }
        }
        Ok(g)
    }

    /// Whether any member of `nodes` reads a reduction in `nodes`, directly
    /// or through other members.
    fn consumes_reduction(&self, node: NodeId, members: &HashSet<NodeId>) -> Result<bool> {
        let mut stack = vec![node];
        let mut seen = HashSet::new();
        while let Some(n) = stack.pop() {
            for p in self.producers(n)? {
                if !members.contains(&p) || !seen.insert(p) {
                    continue;
                }
                if self.kind(p) == OpPatternKind::CommReduce {
                    return Ok(true);
                }
                stack.push(p);
            }
        }
        Ok(false)
    }

    /// Master election.
    ///
    /// In a group holding reductions the master is the first non-reduction
    /// member that both has the reduction's output shape and reads a
    /// reduction of the group, directly or through other members. A
    /// same-shaped member independent of every reduction is skipped. Without
    /// such a member the first reduction is the master. Groups without
    /// reductions elect their first member of the dominant kind.
    pub fn elect_master(&self, nodes: &[NodeId]) -> Result<NodeId> {
        let first = *nodes
            .first()
            .ok_or_else(|| Error::msg("cannot elect the master of an empty group"))?;
        let members: HashSet<NodeId> = nodes.iter().copied().collect();
        if let Some(reduce) = nodes
            .iter()
            .copied()
            .find(|n| self.kind(*n) == OpPatternKind::CommReduce)
        {
            let out_shape = self.shape(reduce);
            for n in nodes {
                if self.kind(*n) != OpPatternKind::CommReduce
                    && self.shape(*n) == out_shape
                    && self.consumes_reduction(*n, &members)?
                {
                    return Ok(*n);
                }
            }
            return Ok(reduce);
        }
        let dominant = nodes
            .iter()
            .map(|n| self.kind(*n))
            .max()
            .unwrap_or(OpPatternKind::Opaque);
        Ok(nodes
            .iter()
            .copied()
            .find(|n| self.kind(*n) == dominant)
            .unwrap_or(first))
    }

    fn build_group(&self, id: usize, kind: OpPatternKind, nodes: Vec<NodeId>) -> Result<Group> {
        let members: HashSet<NodeId> = nodes.iter().copied().collect();
        let mut output_nodes = Vec::new();
        let mut internal_nodes = Vec::new();
        for n in &nodes {
            let mut escapes = false;
            for d in self.graph.outputs_of(*n)? {
                if self.graph.is_output(*d) || self.read_outside(*d, &members)? {
                    escapes = true;
                }
            }
            if escapes {
                output_nodes.push(*n);
            } else {
                internal_nodes.push(*n);
            }
        }
        let master = self.elect_master(&nodes)?;
        Ok(Group {
            id,
            op_pattern_kind: kind,
            master_nodes: vec![master],
            nodes,
            output_nodes,
            internal_nodes,
            fused_sub_groups: Vec::new(),
        })
    }

    fn read_outside(&self, data: DataId, members: &HashSet<NodeId>) -> Result<bool> {
        Ok(self
            .graph
            .consumers_of(data)?
            .iter()
            .any(|c| !members.contains(c)))
    }

    /// Order drafts by dependency (ties by earliest member) and turn them
    /// into groups.
    fn finalize(&self, drafts: Vec<Draft>) -> Result<Vec<Group>> {
        let mut assignment = HashMap::new();
        for (i, d) in drafts.iter().enumerate() {
            for n in &d.nodes {
                assignment.insert(*n, i);
            }
        }
        let dag = self.group_graph(&assignment)?;
        let key = |i: usize| {
            drafts[i]
                .nodes
                .iter()
                .map(|n| self.topo_pos(*n))
                .min()
                .unwrap_or(usize::MAX)
        };

        let mut pending: HashMap<usize, usize> = HashMap::new();
        let mut ready = BTreeSet::new();
        for i in 0..drafts.len() {
            let deps = dag
                .neighbors_directed(i, petgraph::Direction::Incoming)
                .count();
            if deps == 0 {
                ready.insert((key(i), i));
            } else {
                pending.insert(i, deps);
            }
        }
        let mut order = Vec::with_capacity(drafts.len());
        while let Some((_, next)) = ready.pop_first() {
            order.push(next);
            for user in dag.neighbors_directed(next, petgraph::Direction::Outgoing) {
                if let Some(left) = pending.get_mut(&user) {
                    *left -= 1;
                    if *left == 0 {
                        pending.remove(&user);
                        ready.insert((key(user), user));
                    }
                }
            }
        }
        if !pending.is_empty() {
            return Err(Error::GraphNotDag);
        }

        let mut groups = Vec::with_capacity(order.len());
        for (id, i) in order.into_iter().enumerate() {
            let draft = &drafts[i];
            let mut group = self.build_group(id, draft.kind, draft.nodes.clone())?;
            for sub in &draft.subs {
                let kind = sub
                    .iter()
                    .map(|n| self.kind(*n))
                    .max()
                    .unwrap_or(OpPatternKind::Opaque);
                group
                    .fused_sub_groups
                    .push(self.build_group(id, kind, sub.clone())?);
            }
            debug!(
                "group {id}: {} over {} nodes, master {:?}",
                group.op_pattern_kind,
                group.len(),
                group.master()
            );
            groups.push(group);
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DType, GraphBuilder};

    #[test]
    fn elementwise_chain_is_one_group() {
        let mut b = GraphBuilder::new("chain");
        let x = b.input("x", &[4, 8], DType::F32);
        let y = b.input("y", &[4, 8], DType::F32);
        let s = b.add(x, y).unwrap();
        let r = b.relu(s).unwrap();
        let e = b.exp(r).unwrap();
        b.output(e).unwrap();
        let g = b.build();
        let groups = fuse(&g, &OpRegistry::with_builtins(), true).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].nodes, vec![NodeId(2), NodeId(1), NodeId(0)]);
        assert_eq!(groups[0].master(), Some(NodeId(2)));
        assert_eq!(groups[0].output_nodes, vec![NodeId(2)]);
        assert_eq!(groups[0].internal_nodes, vec![NodeId(1), NodeId(0)]);
    }

    #[test]
    fn master_reads_a_reduction() {
        let mut b = GraphBuilder::new("master");
        let x = b.input("x", &[4, 8], DType::F32);
        let y = b.input("y", &[4], DType::F32);
        let s = b.reduce_sum(x, &[1], false).unwrap();
        let e = b.exp(y).unwrap();
        let r = b.add(s, e).unwrap();
        b.output(r).unwrap();
        let graph = b.build();
        let registry = OpRegistry::with_builtins();
        let ctx = FusionContext::new(&graph, &registry).unwrap();
        // exp comes first and has the reduction's shape but reads no reduction
        let master = ctx
            .elect_master(&[NodeId(1), NodeId(0), NodeId(2)])
            .unwrap();
        assert_eq!(master, NodeId(2));
    }

    #[test]
    fn opaque_nodes_stay_alone() {
        let mut b = GraphBuilder::new("opaque");
        let x = b.input("x", &[4, 8], DType::F32);
        let r = b.relu(x).unwrap();
        let c = b.cumsum(r, 1).unwrap();
        let e = b.exp(c).unwrap();
        b.output(e).unwrap();
        let g = b.build();
        let groups = fuse(&g, &OpRegistry::with_builtins(), true).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1].op_pattern_kind, OpPatternKind::Opaque);
    }

    #[test]
    fn stats_count_multi_node_groups() {
        let groups = vec![
            Group::single(0, NodeId(0), OpPatternKind::ElemWise),
            Group {
                nodes: vec![NodeId(2), NodeId(1)],
                ..Group::single(1, NodeId(2), OpPatternKind::ElemWise)
            },
        ];
        let stats = FusionStats::of(&groups);
        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.fused_groups, 1);
        assert_eq!(stats.largest_group, 2);
    }
}
