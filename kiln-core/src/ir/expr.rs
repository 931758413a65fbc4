use std::{
    collections::{BTreeSet, HashMap},
    fmt::{self, Display, Write},
    ops::{Add, Div, Mul, Neg, Rem, Sub},
};

use crate::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Lt,
    Le,
    Eq,
    And,
}

impl BinOp {
    pub fn as_c_op(&self) -> Option<&'static str> {
        match self {
            Self::Add => Some("+"),
            Self::Sub => Some("-"),
            Self::Mul => Some("*"),
            Self::Div => Some("/"),
            Self::Mod => Some("%"),
            Self::Lt => Some("<"),
            Self::Le => Some("<="),
            Self::Eq => Some("=="),
            Self::And => Some("&&"),
            Self::Min | Self::Max => None,
        }
    }

    fn is_comparison(&self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Eq | Self::And)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Exp,
    Tanh,
    Sqrt,
}

impl UnaryOp {
    pub fn fill_in_c_op(&self, val: impl Display) -> String {
        match self {
            Self::Neg => format!("(-{val})"),
            Self::Exp => format!("expf({val})"),
            Self::Tanh => format!("tanhf({val})"),
            Self::Sqrt => format!("sqrtf({val})"),
        }
    }
}

/// Scalar expression over loop variables and tensor loads.
///
/// Index arithmetic is integral; any operand that loads a float tensor or
/// holds a float immediate makes the expression floating point.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Var(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        arg: Box<Expr>,
    },
    Select {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Load {
        tensor: String,
        dtype: DType,
        indices: Vec<Expr>,
    },
}

impl Expr {
    pub fn int(v: i64) -> Self {
        Self::Int(v)
    }

    pub fn float(v: f64) -> Self {
        Self::Float(v)
    }

    /// Zero literal of `dtype`.
    pub fn zero(dtype: DType) -> Self {
        match dtype.is_float() {
            true => Self::Float(0.0),
            false => Self::Int(0),
        }
    }

    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(name.into())
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: UnaryOp, arg: Expr) -> Self {
        Self::Unary {
            op,
            arg: Box::new(arg),
        }
    }

    pub fn min(a: Expr, b: Expr) -> Self {
        Self::binary(BinOp::Min, a, b)
    }

    pub fn max(a: Expr, b: Expr) -> Self {
        Self::binary(BinOp::Max, a, b)
    }

    pub fn lt(a: Expr, b: Expr) -> Self {
        Self::binary(BinOp::Lt, a, b)
    }

    pub fn le(a: Expr, b: Expr) -> Self {
        Self::binary(BinOp::Le, a, b)
    }

    pub fn and(a: Expr, b: Expr) -> Self {
        Self::binary(BinOp::And, a, b)
    }

    pub fn select(cond: Expr, then: Expr, otherwise: Expr) -> Self {
        Self::Select {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_float(&self) -> bool {
        match self {
            Self::Int(_) | Self::Var(_) => false,
            Self::Float(_) => true,
            Self::Load { dtype, .. } => dtype.is_float(),
            Self::Binary { op, lhs, rhs } => {
                !op.is_comparison() && (lhs.is_float() || rhs.is_float())
            }
            Self::Unary { op, arg } => match op {
                UnaryOp::Neg => arg.is_float(),
                _ => true,
            },
            Self::Select {
                then, otherwise, ..
            } => then.is_float() || otherwise.is_float(),
        }
    }

    /// Replace free variables according to `map`.
    pub fn substitute(&self, map: &HashMap<String, Expr>) -> Expr {
        if map.is_empty() {
            return self.clone();
        }
        match self {
            Self::Var(v) => map.get(v).cloned().unwrap_or_else(|| self.clone()),
            Self::Int(_) | Self::Float(_) => self.clone(),
            Self::Binary { op, lhs, rhs } => {
                Self::binary(*op, lhs.substitute(map), rhs.substitute(map))
            }
            Self::Unary { op, arg } => Self::unary(*op, arg.substitute(map)),
            Self::Select {
                cond,
                then,
                otherwise,
            } => Self::select(
                cond.substitute(map),
                then.substitute(map),
                otherwise.substitute(map),
            ),
            Self::Load {
                tensor,
                dtype,
                indices,
            } => Self::Load {
                tensor: tensor.clone(),
                dtype: *dtype,
                indices: indices.iter().map(|i| i.substitute(map)).collect(),
            },
        }
    }

    /// Collect the free variables of this expression.
    pub fn collect_vars(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Var(v) => {
                out.insert(v.clone());
            }
            Self::Int(_) | Self::Float(_) => {}
            Self::Binary { lhs, rhs, .. } => {
                lhs.collect_vars(out);
                rhs.collect_vars(out);
            }
            Self::Unary { arg, .. } => arg.collect_vars(out),
            Self::Select {
                cond,
                then,
                otherwise,
            } => {
                cond.collect_vars(out);
                then.collect_vars(out);
                otherwise.collect_vars(out);
            }
            Self::Load { indices, .. } => indices.iter().for_each(|i| i.collect_vars(out)),
        }
    }

    pub fn vars(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_vars(&mut out);
        out
    }

    /// Visit every tensor load, outermost first.
    pub fn visit_loads(&self, f: &mut impl FnMut(&str, &[Expr])) {
        match self {
            Self::Int(_) | Self::Float(_) | Self::Var(_) => {}
            Self::Binary { lhs, rhs, .. } => {
                lhs.visit_loads(f);
                rhs.visit_loads(f);
            }
            Self::Unary { arg, .. } => arg.visit_loads(f),
            Self::Select {
                cond,
                then,
                otherwise,
            } => {
                cond.visit_loads(f);
                then.visit_loads(f);
                otherwise.visit_loads(f);
            }
            Self::Load {
                tensor, indices, ..
            } => {
                f(tensor, indices);
                indices.iter().for_each(|i| i.visit_loads(f));
            }
        }
    }

    /// Rebuild the expression bottom-up, letting `f` replace any load.
    pub fn rewrite_loads<E>(
        &self,
        f: &mut impl FnMut(&str, DType, Vec<Expr>) -> Result<Option<Expr>, E>,
    ) -> Result<Expr, E> {
        Ok(match self {
            Self::Int(_) | Self::Float(_) | Self::Var(_) => self.clone(),
            Self::Binary { op, lhs, rhs } => {
                Self::binary(*op, lhs.rewrite_loads(f)?, rhs.rewrite_loads(f)?)
            }
            Self::Unary { op, arg } => Self::unary(*op, arg.rewrite_loads(f)?),
            Self::Select {
                cond,
                then,
                otherwise,
            } => Self::select(
                cond.rewrite_loads(f)?,
                then.rewrite_loads(f)?,
                otherwise.rewrite_loads(f)?,
            ),
            Self::Load {
                tensor,
                dtype,
                indices,
            } => {
                let indices = indices
                    .iter()
                    .map(|i| i.rewrite_loads(f))
                    .collect::<Result<Vec<_>, E>>()?;
                match f(tensor, *dtype, indices.clone())? {
                    Some(replacement) => replacement,
                    None => Self::Load {
                        tensor: tensor.clone(),
                        dtype: *dtype,
                        indices,
                    },
                }
            }
        })
    }

    /// Constant-fold integer arithmetic and drop algebraic identities.
    pub fn simplify(&self) -> Expr {
        match self {
            Self::Int(_) | Self::Float(_) | Self::Var(_) => self.clone(),
            Self::Binary { op, lhs, rhs } => simplify_binary(*op, lhs.simplify(), rhs.simplify()),
            Self::Unary { op, arg } => match (op, arg.simplify()) {
                (UnaryOp::Neg, Self::Int(v)) => Self::Int(-v),
                (UnaryOp::Neg, Self::Float(v)) => Self::Float(-v),
                (op, arg) => Self::unary(*op, arg),
            },
            Self::Select {
                cond,
                then,
                otherwise,
            } => match cond.simplify() {
                Self::Int(0) => otherwise.simplify(),
                Self::Int(_) => then.simplify(),
                cond => Self::select(cond, then.simplify(), otherwise.simplify()),
            },
            Self::Load {
                tensor,
                dtype,
                indices,
            } => Self::Load {
                tensor: tensor.clone(),
                dtype: *dtype,
                indices: indices.iter().map(Expr::simplify).collect(),
            },
        }
    }
}

fn simplify_binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    use Expr::Int;
    match (op, &lhs, &rhs) {
        (BinOp::Add, Int(a), Int(b)) => Int(a + b),
        (BinOp::Sub, Int(a), Int(b)) => Int(a - b),
        (BinOp::Mul, Int(a), Int(b)) => Int(a * b),
        (BinOp::Div, Int(a), Int(b)) if *b != 0 => Int(a.div_euclid(*b)),
        (BinOp::Mod, Int(a), Int(b)) if *b != 0 => Int(a.rem_euclid(*b)),
        (BinOp::Min, Int(a), Int(b)) => Int(*a.min(b)),
        (BinOp::Max, Int(a), Int(b)) => Int(*a.max(b)),
        (BinOp::Lt, Int(a), Int(b)) => Int((a < b) as i64),
        (BinOp::Le, Int(a), Int(b)) => Int((a <= b) as i64),
        (BinOp::Eq, Int(a), Int(b)) => Int((a == b) as i64),
        (BinOp::And, Int(a), Int(b)) => Int((*a != 0 && *b != 0) as i64),
        (BinOp::Add, Int(0), _) => rhs,
        (BinOp::Add | BinOp::Sub, _, Int(0)) => lhs,
        (BinOp::Mul, Int(1), _) => rhs,
        (BinOp::Mul | BinOp::Div, _, Int(1)) => lhs,
        (BinOp::Mul, Int(0), e) | (BinOp::Mul, e, Int(0)) if !e.is_float() => Int(0),
        (BinOp::Mod, e, Int(1)) if !e.is_float() => Int(0),
        (BinOp::And, Int(0), _) | (BinOp::And, _, Int(0)) => Int(0),
        (BinOp::And, Int(_), _) => rhs,
        (BinOp::And, _, Int(_)) => lhs,
        _ => Expr::binary(op, lhs, rhs),
    }
}

macro_rules! expr_bin_op {
    ($trait:ident, $fn:ident, $op:expr) => {
        impl $trait for Expr {
            type Output = Expr;
            fn $fn(self, rhs: Expr) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }

        impl $trait<i64> for Expr {
            type Output = Expr;
            fn $fn(self, rhs: i64) -> Expr {
                Expr::binary($op, self, Expr::Int(rhs))
            }
        }
    };
}

expr_bin_op!(Add, add, BinOp::Add);
expr_bin_op!(Sub, sub, BinOp::Sub);
expr_bin_op!(Mul, mul, BinOp::Mul);
expr_bin_op!(Div, div, BinOp::Div);
expr_bin_op!(Rem, rem, BinOp::Mod);

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::unary(UnaryOp::Neg, self)
    }
}

/// Renders expressions as C.
#[derive(Debug, Clone, Default)]
pub struct ExprPrinter {
    /// Emit `fma(a, b, c)` for a float multiply feeding an add.
    pub fuse_multiply_add: bool,
    /// Variables printed under another name, e.g. loop vars bound to `blockIdx.x`.
    pub renames: HashMap<String, String>,
}

impl ExprPrinter {
    pub fn print(&self, e: &Expr) -> String {
        let mut s = String::new();
        // Writing into a String cannot fail.
        let _ = self.write(&mut s, e);
        s
    }

    pub fn write(&self, out: &mut impl Write, e: &Expr) -> fmt::Result {
        match e {
            Expr::Int(v) => write!(out, "{v}"),
            Expr::Float(v) => write!(out, "{}", format_float(*v)),
            Expr::Var(v) => match self.renames.get(v) {
                Some(r) => out.write_str(r),
                None => out.write_str(v),
            },
            Expr::Binary { op, lhs, rhs } => {
                if self.fuse_multiply_add && *op == BinOp::Add && e.is_float() {
                    if let Some((a, b, c)) = fma_operands(lhs, rhs) {
                        out.write_str("fma(")?;
                        self.write(out, a)?;
                        out.write_str(", ")?;
                        self.write(out, b)?;
                        out.write_str(", ")?;
                        self.write(out, c)?;
                        return out.write_str(")");
                    }
                }
                match op.as_c_op() {
                    Some(c_op) => {
                        out.write_char('(')?;
                        self.write(out, lhs)?;
                        write!(out, " {c_op} ")?;
                        self.write(out, rhs)?;
                        out.write_char(')')
                    }
                    None => {
                        let f = if *op == BinOp::Min {
                            "kiln_min"
                        } else {
                            "kiln_max"
                        };
                        write!(out, "{f}(")?;
                        self.write(out, lhs)?;
                        out.write_str(", ")?;
                        self.write(out, rhs)?;
                        out.write_char(')')
                    }
                }
            }
            Expr::Unary { op, arg } => out.write_str(&op.fill_in_c_op(self.print(arg))),
            Expr::Select {
                cond,
                then,
                otherwise,
            } => {
                out.write_char('(')?;
                self.write(out, cond)?;
                out.write_str(" ? ")?;
                self.write(out, then)?;
                out.write_str(" : ")?;
                self.write(out, otherwise)?;
                out.write_char(')')
            }
            Expr::Load {
                tensor, indices, ..
            } => {
                out.write_str(tensor)?;
                for i in indices {
                    out.write_char('[')?;
                    self.write(out, i)?;
                    out.write_char(']')?;
                }
                Ok(())
            }
        }
    }
}

fn fma_operands<'a>(lhs: &'a Expr, rhs: &'a Expr) -> Option<(&'a Expr, &'a Expr, &'a Expr)> {
    match (lhs, rhs) {
        (
            Expr::Binary {
                op: BinOp::Mul,
                lhs: a,
                rhs: b,
            },
            c,
        ) if lhs.is_float() => Some((a.as_ref(), b.as_ref(), c)),
        (
            c,
            Expr::Binary {
                op: BinOp::Mul,
                lhs: a,
                rhs: b,
            },
        ) if rhs.is_float() => Some((a.as_ref(), b.as_ref(), c)),
        _ => None,
    }
}

fn format_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.1}f")
    } else {
        format!("{v:e}f")
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        ExprPrinter::default().write(f, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simplify_folds_index_arithmetic() {
        let e = Expr::var("i") * 1 + (Expr::int(2) * Expr::int(3)) * 0;
        assert_eq!(e.simplify(), Expr::var("i"));
    }

    #[test]
    fn prints_row_major_index() {
        let e = Expr::int(20) * Expr::var("i") + Expr::var("j");
        assert_eq!(e.to_string(), "((20 * i) + j)");
    }

    #[test]
    fn fma_only_folds_float_arithmetic() {
        let a = Expr::Load {
            tensor: "A".into(),
            dtype: DType::F32,
            indices: vec![Expr::var("i")],
        };
        let printer = ExprPrinter {
            fuse_multiply_add: true,
            ..Default::default()
        };
        assert_eq!(
            printer.print(&(a.clone() * Expr::float(2.0) + Expr::float(1.0))),
            "fma(A[i], 2.0f, 1.0f)"
        );
        let idx = Expr::int(20) * Expr::var("i") + Expr::var("j");
        assert_eq!(printer.print(&idx), "((20 * i) + j)");
    }
}
