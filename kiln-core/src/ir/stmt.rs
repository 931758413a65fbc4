use super::Expr;

/// Hardware index a loop can be bound to on device targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParallelAxis {
    BlockX,
    BlockY,
    BlockZ,
    ThreadX,
    ThreadY,
    ThreadZ,
}

impl ParallelAxis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockX => "blockIdx.x",
            Self::BlockY => "blockIdx.y",
            Self::BlockZ => "blockIdx.z",
            Self::ThreadX => "threadIdx.x",
            Self::ThreadY => "threadIdx.y",
            Self::ThreadZ => "threadIdx.z",
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Self::BlockX | Self::BlockY | Self::BlockZ)
    }

    /// Position within the three-dimensional grid or block.
    pub fn dim(&self) -> usize {
        match self {
            Self::BlockX | Self::ThreadX => 0,
            Self::BlockY | Self::ThreadY => 1,
            Self::BlockZ | Self::ThreadZ => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForKind {
    Serial,
    /// Trip count comes from the launch configuration; the loop becomes a guard.
    Bound(ParallelAxis),
}

/// Loop-level statement tree of a lowered function.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Block(Vec<Stmt>),
    For {
        var: String,
        extent: Expr,
        kind: ForKind,
        body: Box<Stmt>,
    },
    IfThen {
        cond: Expr,
        then: Box<Stmt>,
    },
    Store {
        tensor: String,
        indices: Vec<Expr>,
        value: Expr,
    },
}

impl Stmt {
    /// Visit every statement, parents before children.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Stmt)) {
        f(self);
        match self {
            Self::Block(stmts) => stmts.iter().for_each(|s| s.walk(f)),
            Self::For { body, .. } => body.walk(f),
            Self::IfThen { then, .. } => then.walk(f),
            Self::Store { .. } => {}
        }
    }

    /// Rebuild the tree, passing every expression through `f`.
    pub fn map_exprs(&self, f: &mut impl FnMut(&Expr) -> Expr) -> Stmt {
        match self {
            Self::Block(stmts) => Self::Block(stmts.iter().map(|s| s.map_exprs(f)).collect()),
            Self::For {
                var,
                extent,
                kind,
                body,
            } => Self::For {
                var: var.clone(),
                extent: f(extent),
                kind: *kind,
                body: Box::new(body.map_exprs(f)),
            },
            Self::IfThen { cond, then } => Self::IfThen {
                cond: f(cond),
                then: Box::new(then.map_exprs(f)),
            },
            Self::Store {
                tensor,
                indices,
                value,
            } => Self::Store {
                tensor: tensor.clone(),
                indices: indices.iter().map(|i| f(i)).collect(),
                value: f(value),
            },
        }
    }

    /// Names of the tensors stored to, in program order.
    pub fn stored_tensors(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.walk(&mut |s| {
            if let Stmt::Store { tensor, .. } = s {
                out.push(tensor.as_str());
            }
        });
        out
    }
}
