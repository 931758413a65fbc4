use crate::{NodeId, OpPatternKind};

/// A connected, fusible set of nodes compiled into one function.
///
/// `nodes` is kept consumer-first. A group produced by horizontal fusion
/// carries its members in `fused_sub_groups`; sub-groups share the parent's
/// `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: usize,
    pub op_pattern_kind: OpPatternKind,
    pub nodes: Vec<NodeId>,
    /// The node every other member derives its schedule from.
    pub master_nodes: Vec<NodeId>,
    /// Members whose values are read outside the group or are graph outputs.
    pub output_nodes: Vec<NodeId>,
    pub internal_nodes: Vec<NodeId>,
    pub fused_sub_groups: Vec<Group>,
}

impl Group {
    /// A group holding exactly one node, used for unfused lowering.
    pub fn single(id: usize, node: NodeId, kind: OpPatternKind) -> Self {
        Self {
            id,
            op_pattern_kind: kind,
            nodes: vec![node],
            master_nodes: vec![node],
            output_nodes: vec![node],
            internal_nodes: Vec::new(),
            fused_sub_groups: Vec::new(),
        }
    }

    pub fn master(&self) -> Option<NodeId> {
        self.master_nodes.first().copied()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    pub fn is_output(&self, node: NodeId) -> bool {
        self.output_nodes.contains(&node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether this group was formed by horizontal fusion.
    pub fn is_horizontal(&self) -> bool {
        !self.fused_sub_groups.is_empty()
    }
}
