use std::collections::{BTreeSet, HashMap, HashSet};

use log::debug;
use petgraph::algo::has_path_connecting;

use super::{Draft, FusionContext};
use crate::{DataId, NodeId, OpPatternKind, Result};

/// Merge independent sibling drafts that read a common input and iterate
/// the same space.
pub(crate) fn merge(ctx: &FusionContext, mut drafts: Vec<Draft>) -> Result<Vec<Draft>> {
    let mut i = 0;
    while i < drafts.len() {
        let mut j = i + 1;
        while j < drafts.len() {
            if mergeable(ctx, &drafts, i, j)? {
                let other = drafts.remove(j);
                debug!(
                    "horizontally fuse {:?} into {:?}",
                    other.nodes, drafts[i].nodes
                );
                absorb(&mut drafts[i], other);
            } else {
                j += 1;
            }
        }
        i += 1;
    }
    Ok(drafts)
}

fn absorb(parent: &mut Draft, other: Draft) {
    if parent.subs.is_empty() {
        parent.subs.push(parent.nodes.clone());
    }
    if other.subs.is_empty() {
        parent.subs.push(other.nodes.clone());
    } else {
        parent.subs.extend(other.subs);
    }
    parent.nodes.extend(other.nodes);
    parent.kind = parent.kind.dominant(other.kind);
}

fn external_inputs(ctx: &FusionContext, draft: &Draft) -> Result<BTreeSet<DataId>> {
    let members: HashSet<NodeId> = draft.nodes.iter().copied().collect();
    let mut out = BTreeSet::new();
    for n in &draft.nodes {
        for d in ctx.graph.inputs_of(*n)? {
            match ctx.graph.producer_of(*d) {
                Some(p) if members.contains(&p) => {}
                _ => {
                    out.insert(*d);
                }
            }
        }
    }
    Ok(out)
}

fn compatible(ctx: &FusionContext, a: &Draft, b: &Draft) -> Result<bool> {
    let (ma, mb) = (ctx.elect_master(&a.nodes)?, ctx.elect_master(&b.nodes)?);
    if ctx.shape(ma) != ctx.shape(mb) {
        return Ok(false);
    }
    if a.kind.is_injective_like() && b.kind.is_injective_like() {
        return Ok(true);
    }
    if a.kind == OpPatternKind::CommReduce && b.kind == OpPatternKind::CommReduce {
        let first_reduce = |d: &Draft| {
            d.nodes
                .iter()
                .copied()
                .find(|n| ctx.kind(*n) == OpPatternKind::CommReduce)
        };
        let (Some(ra), Some(rb)) = (first_reduce(a), first_reduce(b)) else {
            return Ok(false);
        };
        return Ok(ctx.reduce_signature(ra)? == ctx.reduce_signature(rb)?);
    }
    Ok(false)
}

fn mergeable(ctx: &FusionContext, drafts: &[Draft], i: usize, j: usize) -> Result<bool> {
    let (a, b) = (&drafts[i], &drafts[j]);
    if external_inputs(ctx, a)?
        .intersection(&external_inputs(ctx, b)?)
        .next()
        .is_none()
    {
        return Ok(false);
    }
    if !compatible(ctx, a, b)? {
        return Ok(false);
    }
    let mut assignment = HashMap::new();
    for (idx, d) in drafts.iter().enumerate() {
        for n in &d.nodes {
            assignment.insert(*n, idx);
        }
    }
    let dag = ctx.group_graph(&assignment)?;
    Ok(!has_path_connecting(&dag, i, j, None) && !has_path_connecting(&dag, j, i, None))
}

#[cfg(test)]
mod tests {
    use crate::{fusion::fuse, DType, GraphBuilder, OpRegistry};

    #[test]
    fn siblings_reading_one_input_are_merged() {
        let mut b = GraphBuilder::new("siblings");
        let x = b.input("x", &[4, 8], DType::F32);
        let e = b.exp(x).unwrap();
        let t = b.tanh(x).unwrap();
        b.output(e).unwrap();
        b.output(t).unwrap();
        let graph = b.build();
        let registry = OpRegistry::with_builtins();

        let groups = fuse(&graph, &registry, true).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].fused_sub_groups.len(), 2);
        assert_eq!(groups[0].output_nodes.len(), 2);

        let unmerged = fuse(&graph, &registry, false).unwrap();
        assert_eq!(unmerged.len(), 2);
    }

    #[test]
    fn different_shapes_are_not_merged() {
        let mut b = GraphBuilder::new("shapes");
        let x = b.input("x", &[4, 8], DType::F32);
        let e = b.exp(x).unwrap();
        let t = b.transpose(x, &[1, 0]).unwrap();
        b.output(e).unwrap();
        b.output(t).unwrap();
        let groups = fuse(&b.build(), &OpRegistry::with_builtins(), true).unwrap();
        assert_eq!(groups.len(), 2);
    }
}
