//! Operator pattern classification for fusion analysis.

use std::fmt::Display;

use crate::{graph::Node, OpRegistry};

/// Coarse fusibility class of an operator.
///
/// The ordering matters: later variants dominate earlier ones, and a group's
/// kind is the maximum over its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum OpPatternKind {
    /// One output element per input element, same shape.
    ElemWise = 0,
    /// Output element reads one input element, input dims may be expanded.
    Broadcast = 1,
    /// Every output element reads exactly one input element.
    Injective = 2,
    /// Commutative reduction over one or more axes.
    CommReduce = 3,
    /// Heavy operator that accepts elementwise epilogues.
    OutEWiseFusable = 4,
    /// Never fused with neighbours.
    Opaque = 5,
}

impl OpPatternKind {
    /// The pattern that decides a group's strategy when two are combined.
    pub fn dominant(self, other: OpPatternKind) -> OpPatternKind {
        std::cmp::max(self, other)
    }

    /// ElemWise, Broadcast or Injective.
    pub fn is_injective_like(&self) -> bool {
        *self <= OpPatternKind::Injective
    }
}

impl Display for OpPatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ElemWise => "elementwise",
            Self::Broadcast => "broadcast",
            Self::Injective => "injective",
            Self::CommReduce => "reduce",
            Self::OutEWiseFusable => "out_ewise_fusable",
            Self::Opaque => "opaque",
        };
        f.write_str(s)
    }
}

/// Registered pattern of `node`; variables and unregistered operators are
/// [`OpPatternKind::Opaque`].
pub fn kind_of(registry: &OpRegistry, node: &Node) -> OpPatternKind {
    node.op
        .as_deref()
        .and_then(|op| registry.get(op))
        .map_or(OpPatternKind::Opaque, |entry| entry.pattern)
}
