//! Reference interpreter for [`LoweredFunc`]s.
//!
//! Runs a function body directly over host buffers, following the same
//! calling convention as the generated C: one argument array, inputs first.
//! Used to check that scheduling and fusion preserve results.

use std::collections::HashMap;

use log::trace;

use crate::{
    buffer::ArgValue,
    ir::{BinOp, Expr, Stmt, UnaryOp},
    lower::LoweredFunc,
    DType, Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            Self::Int(v) => v,
            Self::Float(v) => v as i64,
        }
    }

    fn truthy(self) -> bool {
        match self {
            Self::Int(v) => v != 0,
            Self::Float(v) => v != 0.0,
        }
    }

    fn of(dtype: DType, v: f64) -> Self {
        match dtype.is_float() {
            true => Self::Float(v),
            false => Self::Int(v as i64),
        }
    }
}

/// Executes lowered functions on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor;

impl Executor {
    /// Run `func` against `args`. Output buffers are written in place.
    pub fn run(func: &LoweredFunc, args: &mut [ArgValue]) -> Result<()> {
        if args.len() != func.args.len() {
            return Err(Error::runtime(format!(
                "`{}` expects {} arguments, got {}",
                func.name,
                func.args.len(),
                args.len()
            )));
        }

        let mut memory: HashMap<String, (DType, Vec<f64>)> = HashMap::new();
        for (i, (param, value)) in func.args.iter().zip(args.iter()).enumerate() {
            let Some(buf) = value.buffer() else {
                return Err(Error::runtime(format!(
                    "`{}`: argument {i} must be a buffer, got {}",
                    func.name,
                    value.kind()
                )));
            };
            let buf = buf.borrow();
            if buf.dtype != param.buffer.dtype {
                return Err(Error::runtime(format!(
                    "`{}`: argument `{}` expects {}, got {}",
                    func.name,
                    param.name(),
                    param.buffer.dtype,
                    buf.dtype
                )));
            }
            if buf.numel() != param.buffer.numel() {
                return Err(Error::runtime(format!(
                    "`{}`: argument `{}` expects {} elements, got {}",
                    func.name,
                    param.name(),
                    param.buffer.numel(),
                    buf.numel()
                )));
            }
            memory.insert(param.buffer.name.clone(), (buf.dtype, buf.data.clone()));
        }
        for b in &func.temp_buffers {
            trace!("`{}`: allocating `{}` ({} bytes)", func.name, b.name, b.memory_size());
            memory.insert(b.name.clone(), (b.dtype, vec![0.0; b.numel()]));
        }

        let mut frame = Frame {
            func: &func.name,
            views: func
                .views
                .iter()
                .map(|v| (v.name.as_str(), (v.buffer.as_str(), v.dtype)))
                .collect(),
            memory,
            env: HashMap::new(),
        };
        frame.exec(&func.body)?;

        for (param, value) in func.args.iter().zip(args.iter()) {
            if param.is_input() {
                continue;
            }
            let (Some(buf), Some((_, data))) =
                (value.buffer(), frame.memory.remove(&param.buffer.name))
            else {
                continue;
            };
            buf.borrow_mut().data = data;
        }
        Ok(())
    }
}

struct Frame<'a> {
    func: &'a str,
    /// view name -> (backing buffer, element type)
    views: HashMap<&'a str, (&'a str, DType)>,
    memory: HashMap<String, (DType, Vec<f64>)>,
    env: HashMap<String, i64>,
}

impl Frame<'_> {
    fn exec(&mut self, s: &Stmt) -> Result<()> {
        match s {
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.exec(s)?;
                }
            }
            // bound loops run sequentially; every iteration is independent
            Stmt::For {
                var, extent, body, ..
            } => {
                let extent = self.eval(extent)?.as_i64();
                let shadowed = self.env.get(var).copied();
                for v in 0..extent {
                    self.env.insert(var.clone(), v);
                    self.exec(body)?;
                }
                match shadowed {
                    Some(v) => self.env.insert(var.clone(), v),
                    None => self.env.remove(var),
                };
            }
            Stmt::IfThen { cond, then } => {
                if self.eval(cond)?.truthy() {
                    self.exec(then)?;
                }
            }
            Stmt::Store {
                tensor,
                indices,
                value,
            } => {
                let offset = self.offset(tensor, indices)?;
                let value = self.eval(value)?.as_f64();
                let func = self.func;
                let (dtype, data) = self.slot(tensor)?;
                let dtype = *dtype;
                check_bounds(func, tensor, offset, data.len())?;
                data[offset as usize] = dtype.quantize(value);
            }
        }
        Ok(())
    }

    fn offset(&self, tensor: &str, indices: &[Expr]) -> Result<i64> {
        match indices {
            [i] => Ok(self.eval(i)?.as_i64()),
            _ => Err(Error::runtime(format!(
                "`{}`: access to `{tensor}` is not flattened ({} indices)",
                self.func,
                indices.len()
            ))),
        }
    }

    fn buffer_of(&self, view: &str) -> Result<&str> {
        match self.views.get(view) {
            Some((buffer, _)) => Ok(buffer),
            None => Err(Error::runtime(format!(
                "`{}`: no view named `{view}`",
                self.func
            ))),
        }
    }

    fn slot(&mut self, view: &str) -> Result<(&DType, &mut Vec<f64>)> {
        let buffer = self.buffer_of(view)?.to_string();
        let func = self.func;
        match self.memory.get_mut(&buffer) {
            Some((dtype, data)) => Ok((&*dtype, data)),
            None => Err(Error::runtime(format!(
                "`{func}`: buffer `{buffer}` is not allocated"
            ))),
        }
    }

    fn load(&self, view: &str, offset: i64) -> Result<Value> {
        let buffer = self.buffer_of(view)?;
        let Some((dtype, data)) = self.memory.get(buffer) else {
            return Err(Error::runtime(format!(
                "`{}`: buffer `{buffer}` is not allocated",
                self.func
            )));
        };
        check_bounds(self.func, view, offset, data.len())?;
        Ok(Value::of(*dtype, data[offset as usize]))
    }

    fn eval(&self, e: &Expr) -> Result<Value> {
        Ok(match e {
            Expr::Int(v) => Value::Int(*v),
            Expr::Float(v) => Value::Float(*v),
            Expr::Var(name) => match self.env.get(name) {
                Some(v) => Value::Int(*v),
                None => {
                    return Err(Error::runtime(format!(
                        "`{}`: unbound variable `{name}`",
                        self.func
                    )))
                }
            },
            Expr::Unary { op, arg } => {
                let v = self.eval(arg)?;
                match (op, v) {
                    (UnaryOp::Neg, Value::Int(v)) => Value::Int(-v),
                    (UnaryOp::Neg, Value::Float(v)) => Value::Float(-v),
                    (UnaryOp::Exp, v) => Value::Float(v.as_f64().exp()),
                    (UnaryOp::Tanh, v) => Value::Float(v.as_f64().tanh()),
                    (UnaryOp::Sqrt, v) => Value::Float(v.as_f64().sqrt()),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let (a, b) = (self.eval(lhs)?, self.eval(rhs)?);
                self.binary(*op, a, b)?
            }
            Expr::Select {
                cond,
                then,
                otherwise,
            } => match self.eval(cond)?.truthy() {
                true => self.eval(then)?,
                false => self.eval(otherwise)?,
            },
            Expr::Load {
                tensor, indices, ..
            } => {
                let offset = self.offset(tensor, indices)?;
                self.load(tensor, offset)?
            }
        })
    }

    fn binary(&self, op: BinOp, a: Value, b: Value) -> Result<Value> {
        let flag = |c: bool| Value::Int(c as i64);
        if let (Value::Int(a), Value::Int(b)) = (a, b) {
            let checked = |r: Option<i64>| {
                r.map(Value::Int).ok_or_else(|| {
                    Error::runtime(format!("`{}`: integer {op:?} of {a} by {b}", self.func))
                })
            };
            return match op {
                BinOp::Add => Ok(Value::Int(a.wrapping_add(b))),
                BinOp::Sub => Ok(Value::Int(a.wrapping_sub(b))),
                BinOp::Mul => Ok(Value::Int(a.wrapping_mul(b))),
                BinOp::Div => checked(a.checked_div(b)),
                BinOp::Mod => checked(a.checked_rem(b)),
                BinOp::Min => Ok(Value::Int(a.min(b))),
                BinOp::Max => Ok(Value::Int(a.max(b))),
                BinOp::Lt => Ok(flag(a < b)),
                BinOp::Le => Ok(flag(a <= b)),
                BinOp::Eq => Ok(flag(a == b)),
                BinOp::And => Ok(flag(a != 0 && b != 0)),
            };
        }
        let (x, y) = (a.as_f64(), b.as_f64());
        Ok(match op {
            BinOp::Add => Value::Float(x + y),
            BinOp::Sub => Value::Float(x - y),
            BinOp::Mul => Value::Float(x * y),
            BinOp::Div => Value::Float(x / y),
            BinOp::Mod => Value::Float(x % y),
            BinOp::Min => Value::Float(x.min(y)),
            BinOp::Max => Value::Float(x.max(y)),
            BinOp::Lt => flag(x < y),
            BinOp::Le => flag(x <= y),
            BinOp::Eq => flag(x == y),
            BinOp::And => flag(a.truthy() && b.truthy()),
        })
    }
}

fn check_bounds(func: &str, view: &str, offset: i64, len: usize) -> Result<()> {
    if offset < 0 || offset as usize >= len {
        return Err(Error::runtime(format!(
            "`{func}`: access `{view}[{offset}]` outside {len} elements"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::HostBuffer, fusion::fuse, lower::OpLowerer, DType, Graph, GraphBuilder,
        OpRegistry, Target,
    };

    fn lower(graph: &Graph) -> Vec<LoweredFunc> {
        let registry = OpRegistry::with_builtins();
        let target = Target::host();
        let lowerer = OpLowerer::new(graph, &registry, &target).unwrap();
        fuse(graph, &registry, true)
            .unwrap()
            .iter()
            .flat_map(|g| lowerer.lower(g).unwrap())
            .collect()
    }

    fn buffer(shape: &[usize], data: Vec<f64>) -> ArgValue {
        HostBuffer::from_vec(DType::F32, shape, data)
            .unwrap()
            .into_shared()
            .into()
    }

    #[test]
    fn adds_elementwise() {
        let mut b = GraphBuilder::new("add");
        let x = b.input("x", &[2, 3], DType::F32);
        let y = b.input("y", &[2, 3], DType::F32);
        let c = b.add(x, y).unwrap();
        b.output(c).unwrap();
        let funcs = lower(&b.build());

        let out = HostBuffer::zeros(DType::F32, &[2, 3]).into_shared();
        let mut args = vec![
            buffer(&[2, 3], vec![1., 2., 3., 4., 5., 6.]),
            buffer(&[2, 3], vec![10., 20., 30., 40., 50., 60.]),
            out.clone().into(),
        ];
        Executor::run(&funcs[0], &mut args).unwrap();
        assert_eq!(out.borrow().data, vec![11., 22., 33., 44., 55., 66.]);
    }

    #[test]
    fn reduces_rows() {
        let mut b = GraphBuilder::new("sum");
        let x = b.input("x", &[2, 3], DType::F32);
        let s = b.reduce_sum(x, &[1], false).unwrap();
        b.output(s).unwrap();
        let funcs = lower(&b.build());

        let out = HostBuffer::zeros(DType::F32, &[2]).into_shared();
        let mut args = vec![
            buffer(&[2, 3], vec![1., 2., 3., 4., 5., 6.]),
            out.clone().into(),
        ];
        Executor::run(&funcs[0], &mut args).unwrap();
        assert_eq!(out.borrow().data, vec![6., 15.]);
    }

    #[test]
    fn arity_and_types_are_checked() {
        let mut b = GraphBuilder::new("relu");
        let x = b.input("x", &[4], DType::F32);
        let r = b.relu(x).unwrap();
        b.output(r).unwrap();
        let funcs = lower(&b.build());

        let mut short = vec![buffer(&[4], vec![0.; 4])];
        assert!(matches!(
            Executor::run(&funcs[0], &mut short),
            Err(Error::Runtime(_))
        ));

        let mut scalar = vec![buffer(&[4], vec![0.; 4]), ArgValue::Int(3)];
        assert!(matches!(
            Executor::run(&funcs[0], &mut scalar),
            Err(Error::Runtime(_))
        ));

        let mut wrong_size = vec![buffer(&[5], vec![0.; 5]), buffer(&[4], vec![0.; 4])];
        assert!(matches!(
            Executor::run(&funcs[0], &mut wrong_size),
            Err(Error::Runtime(_))
        ));
    }

    #[test]
    fn out_of_bounds_store_is_reported() {
        let mut b = GraphBuilder::new("relu");
        let x = b.input("x", &[4], DType::F32);
        let r = b.relu(x).unwrap();
        b.output(r).unwrap();
        let mut func = lower(&b.build()).remove(0);
        let tensor = func.outputs().next().unwrap().name().to_string();
        func.body = Stmt::Store {
            tensor,
            indices: vec![Expr::int(4)],
            value: Expr::float(1.0),
        };
        let mut args = vec![buffer(&[4], vec![0.; 4]), buffer(&[4], vec![0.; 4])];
        let err = Executor::run(&func, &mut args).unwrap_err();
        assert!(err.to_string().contains("outside 4 elements"));
    }
}
