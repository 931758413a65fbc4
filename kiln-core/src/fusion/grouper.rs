use std::collections::HashMap;

use log::{debug, trace};
use petgraph::algo::is_cyclic_directed;

use super::{Draft, FusionContext};
use crate::{NodeId, OpPatternKind, Result};

/// Greedy vertical fusion in reverse topological order.
pub(crate) fn vertical(ctx: &FusionContext) -> Result<Vec<Draft>> {
    let mut drafts: Vec<Draft> = Vec::new();
    let mut assignment: HashMap<NodeId, usize> = HashMap::new();

    for node in ctx.topo.iter().rev().copied() {
        let kind = ctx.kind(node);
        let mut joined = None;
        for consumer in ctx.consumers(node)? {
            let Some(group) = assignment.get(&consumer).copied() else {
                continue;
            };
            if !can_fuse(ctx, node, consumer, &drafts[group])? {
                trace!("{node} cannot fuse into group of {consumer}");
                continue;
            }
            assignment.insert(node, group);
            if is_cyclic_directed(&ctx.group_graph(&assignment)?) {
                trace!("{node} joining group of {consumer} would form a cycle");
                assignment.remove(&node);
                continue;
            }
            joined = Some(group);
            break;
        }
        match joined {
            Some(group) => {
                let draft = &mut drafts[group];
                draft.nodes.push(node);
                draft.kind = draft.kind.dominant(kind);
                debug!("fuse {node} ({kind}) into draft {group}");
            }
            None => {
                assignment.insert(node, drafts.len());
                drafts.push(Draft::new(node, kind));
            }
        }
    }
    Ok(drafts)
}

/// Whether `producer` may join `group` through its member `consumer`.
fn can_fuse(
    ctx: &FusionContext,
    producer: NodeId,
    consumer: NodeId,
    group: &Draft,
) -> Result<bool> {
    use OpPatternKind::*;

    let kind = ctx.kind(producer);
    if group.kind == Opaque {
        return Ok(false);
    }
    match kind {
        ElemWise | Broadcast | Injective => Ok(group.kind <= CommReduce),
        CommReduce => {
            let out = ctx.shape(producer);
            if ctx.kind(consumer) != ElemWise || ctx.shape(consumer) != out {
                return Ok(false);
            }
            let Some(sig) = ctx.reduce_signature(producer)? else {
                return Ok(false);
            };
            let has_reduce = group.nodes.iter().any(|n| ctx.kind(*n) == CommReduce);
            for member in &group.nodes {
                let ok = match ctx.kind(*member) {
                    CommReduce => ctx.reduce_signature(*member)?.as_ref() == Some(&sig),
                    ElemWise if ctx.shape(*member) == out => true,
                    k => has_reduce && k.is_injective_like() && ctx.shape(*member) == sig.input,
                };
                if !ok {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        OutEWiseFusable => {
            let out = ctx.shape(producer);
            Ok(group
                .nodes
                .iter()
                .all(|n| ctx.kind(*n) == ElemWise && ctx.shape(*n) == out))
        }
        Opaque => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use crate::{fusion::fuse, DType, GraphBuilder, NodeId, OpPatternKind, OpRegistry};

    #[test]
    fn reduction_fuses_into_same_shaped_epilogue() {
        let mut b = GraphBuilder::new("reduce");
        let x = b.input("x", &[4, 8], DType::F32);
        let e = b.exp(x).unwrap();
        let s = b.reduce_sum(e, &[1], false).unwrap();
        let r = b.relu(s).unwrap();
        b.output(r).unwrap();
        let groups = fuse(&b.build(), &OpRegistry::with_builtins(), true).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].op_pattern_kind, OpPatternKind::CommReduce);
        // relu reads the reduction and has its shape
        assert_eq!(groups[0].master(), Some(NodeId(2)));
    }

    #[test]
    fn reduction_does_not_fuse_into_broadcast() {
        let mut b = GraphBuilder::new("softmax_max");
        let x = b.input("x", &[4, 8], DType::F32);
        let m = b.reduce_max(x, &[1], false).unwrap();
        let bm = b.broadcast_to(m, &[4, 8], &[0]).unwrap();
        let d = b.sub(x, bm).unwrap();
        b.output(d).unwrap();
        let groups = fuse(&b.build(), &OpRegistry::with_builtins(), true).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].nodes, vec![NodeId(0)]);
        assert_eq!(groups[1].nodes, vec![NodeId(2), NodeId(1)]);
    }

    #[test]
    fn matmul_takes_an_elementwise_epilogue() {
        let mut b = GraphBuilder::new("mm_relu");
        let a = b.input("A", &[8, 4], DType::F32);
        let w = b.input("W", &[4, 6], DType::F32);
        let c = b.matmul(a, w).unwrap();
        let r = b.relu(c).unwrap();
        b.output(r).unwrap();
        let groups = fuse(&b.build(), &OpRegistry::with_builtins(), true).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].op_pattern_kind, OpPatternKind::OutEWiseFusable);
        assert_eq!(groups[0].master(), Some(NodeId(0)));
        assert_eq!(groups[0].internal_nodes, vec![NodeId(0)]);
    }

    #[test]
    fn shared_producer_joins_first_consumer_only() {
        let mut b = GraphBuilder::new("diamond");
        let x = b.input("x", &[4], DType::F32);
        let e = b.exp(x).unwrap();
        let c = b.cumsum(e, 0).unwrap();
        let r = b.relu(e).unwrap();
        b.output(c).unwrap();
        b.output(r).unwrap();
        let groups = fuse(&b.build(), &OpRegistry::with_builtins(), true).unwrap();
        // exp cannot join the opaque cumsum, so it joins relu and is an output there
        let with_exp = groups.iter().find(|g| g.contains(NodeId(0))).unwrap();
        assert_eq!(with_exp.nodes, vec![NodeId(2), NodeId(0)]);
        assert!(with_exp.is_output(NodeId(0)));
    }
}
