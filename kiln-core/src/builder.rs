//! Programmatic graph construction with shape inference for the builtin
//! operators.

use crate::{
    graph::{AttrValue, Attrs},
    DType, DataId, Error, Graph, Result,
};

/// Builds a [`Graph`] one operator at a time, checking shapes as it goes.
///
/// ```
/// use kiln_core::{DType, GraphBuilder};
///
/// let mut b = GraphBuilder::new("add");
/// let x = b.input("A", &[100, 20], DType::F32);
/// let y = b.input("B", &[100, 20], DType::F32);
/// let z = b.add(x, y).unwrap();
/// b.output(z).unwrap();
/// let graph = b.build();
/// assert_eq!(graph.num_nodes(), 1);
/// ```
pub struct GraphBuilder {
    graph: Graph,
    nodes: usize,
    vars: usize,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            graph: Graph::new(name),
            nodes: 0,
            vars: 0,
        }
    }

    pub fn input(&mut self, name: impl Into<String>, shape: &[usize], dtype: DType) -> DataId {
        self.graph.add_input(name, shape, dtype)
    }

    /// Append an arbitrary operator whose output shapes are already known.
    /// All outputs take the dtype of the first input.
    pub fn op(
        &mut self,
        op: &str,
        inputs: &[DataId],
        attrs: Attrs,
        out_shapes: &[Vec<usize>],
    ) -> Result<Vec<DataId>> {
        let name = format!("{op}_{}", self.nodes);
        let dtype = match inputs.first() {
            Some(first) => self.graph.expect_data(*first)?.dtype,
            None => DType::F32,
        };
        if out_shapes.is_empty() {
            return Err(Error::import(&name, "operator declares no outputs"));
        }
        self.nodes += 1;
        let node = self.graph.add_node(Some(op), name, attrs);
        for input in inputs {
            self.graph.link(*input, node)?;
        }
        let mut outs = Vec::with_capacity(out_shapes.len());
        for shape in out_shapes {
            let var = format!("var_{}", self.vars);
            self.vars += 1;
            outs.push(self.graph.add_output(node, var, shape, dtype)?);
        }
        Ok(outs)
    }

    fn single(
        &mut self,
        op: &str,
        inputs: &[DataId],
        attrs: Attrs,
        out_shape: Vec<usize>,
    ) -> Result<DataId> {
        Ok(self.op(op, inputs, attrs, &[out_shape])?[0])
    }

    fn shape(&self, data: DataId) -> Result<Vec<usize>> {
        Ok(self.graph.expect_data(data)?.shape.clone())
    }

    fn binary(&mut self, op: &str, lhs: DataId, rhs: DataId) -> Result<DataId> {
        let (l, r) = (self.shape(lhs)?, self.shape(rhs)?);
        if l != r {
            return Err(Error::import(
                format!("{op}_{}", self.nodes),
                format!("operand shapes differ: {l:?} vs {r:?}"),
            ));
        }
        self.single(op, &[lhs, rhs], Attrs::new(), l)
    }

    fn unary(&mut self, op: &str, x: DataId, attrs: Attrs) -> Result<DataId> {
        let shape = self.shape(x)?;
        self.single(op, &[x], attrs, shape)
    }

    pub fn add(&mut self, lhs: DataId, rhs: DataId) -> Result<DataId> {
        self.binary("elementwise_add", lhs, rhs)
    }

    pub fn sub(&mut self, lhs: DataId, rhs: DataId) -> Result<DataId> {
        self.binary("elementwise_sub", lhs, rhs)
    }

    pub fn mul(&mut self, lhs: DataId, rhs: DataId) -> Result<DataId> {
        self.binary("elementwise_mul", lhs, rhs)
    }

    pub fn div(&mut self, lhs: DataId, rhs: DataId) -> Result<DataId> {
        self.binary("elementwise_div", lhs, rhs)
    }

    pub fn relu(&mut self, x: DataId) -> Result<DataId> {
        self.unary("relu", x, Attrs::new())
    }

    pub fn exp(&mut self, x: DataId) -> Result<DataId> {
        self.unary("exp", x, Attrs::new())
    }

    pub fn tanh(&mut self, x: DataId) -> Result<DataId> {
        self.unary("tanh", x, Attrs::new())
    }

    /// `x * scale + bias`
    pub fn scale(&mut self, x: DataId, scale: f64, bias: f64) -> Result<DataId> {
        let attrs = Attrs::from([
            ("scale".to_string(), AttrValue::Float(scale)),
            ("bias".to_string(), AttrValue::Float(bias)),
        ]);
        self.unary("scale", x, attrs)
    }

    /// Broadcast `x` to `out_shape`; input dim `i` maps to output dim `axes[i]`.
    pub fn broadcast_to(&mut self, x: DataId, out_shape: &[usize], axes: &[usize]) -> Result<DataId> {
        let shape = self.shape(x)?;
        let name = format!("broadcast_to_{}", self.nodes);
        if axes.len() != shape.len() {
            return Err(Error::import(name, "one broadcast axis per input dim is required"));
        }
        for (dim, axis) in shape.iter().zip(axes) {
            match out_shape.get(*axis) {
                Some(out) if *dim == *out || *dim == 1 => {}
                _ => {
                    return Err(Error::import(
                        name,
                        format!("cannot broadcast {shape:?} to {out_shape:?} along {axes:?}"),
                    ))
                }
            }
        }
        let attrs = Attrs::from([
            ("out_shape".to_string(), AttrValue::Ints(to_ints(out_shape))),
            ("broadcast_axes".to_string(), AttrValue::Ints(to_ints(axes))),
        ]);
        self.single("broadcast_to", &[x], attrs, out_shape.to_vec())
    }

    pub fn transpose(&mut self, x: DataId, perm: &[usize]) -> Result<DataId> {
        let shape = self.shape(x)?;
        let mut seen = vec![false; shape.len()];
        for p in perm {
            match seen.get_mut(*p) {
                Some(s) if !*s => *s = true,
                _ => {
                    return Err(Error::import(
                        format!("transpose_{}", self.nodes),
                        format!("{perm:?} is not a permutation of rank {}", shape.len()),
                    ))
                }
            }
        }
        if perm.len() != shape.len() {
            return Err(Error::import(
                format!("transpose_{}", self.nodes),
                format!("{perm:?} is not a permutation of rank {}", shape.len()),
            ));
        }
        let out: Vec<usize> = perm.iter().map(|p| shape[*p]).collect();
        let attrs = Attrs::from([("axis".to_string(), AttrValue::Ints(to_ints(perm)))]);
        self.single("transpose", &[x], attrs, out)
    }

    pub fn reshape(&mut self, x: DataId, shape: &[usize]) -> Result<DataId> {
        let numel: usize = self.shape(x)?.iter().product();
        if numel != shape.iter().product::<usize>() {
            return Err(Error::import(
                format!("reshape_{}", self.nodes),
                format!("cannot reshape {numel} elements into {shape:?}"),
            ));
        }
        let attrs = Attrs::from([("shape".to_string(), AttrValue::Ints(to_ints(shape)))]);
        self.single("reshape", &[x], attrs, shape.to_vec())
    }

    pub fn reduce_sum(&mut self, x: DataId, dims: &[usize], keep_dim: bool) -> Result<DataId> {
        self.reduce("reduce_sum", x, dims, keep_dim)
    }

    pub fn reduce_max(&mut self, x: DataId, dims: &[usize], keep_dim: bool) -> Result<DataId> {
        self.reduce("reduce_max", x, dims, keep_dim)
    }

    fn reduce(&mut self, op: &str, x: DataId, dims: &[usize], keep_dim: bool) -> Result<DataId> {
        let shape = self.shape(x)?;
        if dims.is_empty() || dims.iter().any(|d| *d >= shape.len()) {
            return Err(Error::import(
                format!("{op}_{}", self.nodes),
                format!("invalid reduce dims {dims:?} for rank {}", shape.len()),
            ));
        }
        let out = reduced_shape(&shape, dims, keep_dim);
        let attrs = Attrs::from([
            ("dim".to_string(), AttrValue::Ints(to_ints(dims))),
            ("keep_dim".to_string(), AttrValue::Bool(keep_dim)),
        ]);
        self.single(op, &[x], attrs, out)
    }

    pub fn matmul(&mut self, lhs: DataId, rhs: DataId) -> Result<DataId> {
        let (l, r) = (self.shape(lhs)?, self.shape(rhs)?);
        if l.len() != 2 || r.len() != 2 || l[1] != r[0] {
            return Err(Error::import(
                format!("matmul_{}", self.nodes),
                format!("incompatible matmul operands {l:?} x {r:?}"),
            ));
        }
        self.single("matmul", &[lhs, rhs], Attrs::new(), vec![l[0], r[1]])
    }

    /// Inclusive prefix sum along `axis`.
    pub fn cumsum(&mut self, x: DataId, axis: usize) -> Result<DataId> {
        let shape = self.shape(x)?;
        if axis >= shape.len() {
            return Err(Error::import(
                format!("cumsum_{}", self.nodes),
                format!("axis {axis} out of range for rank {}", shape.len()),
            ));
        }
        let attrs = Attrs::from([("axis".to_string(), AttrValue::Int(axis as i64))]);
        self.single("cumsum", &[x], attrs, shape)
    }

    pub fn output(&mut self, data: DataId) -> Result<()> {
        self.graph.mark_output(data)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn build(mut self) -> Graph {
        self.graph.refresh_links();
        self.graph
    }
}

fn to_ints(v: &[usize]) -> Vec<i64> {
    v.iter().map(|x| *x as i64).collect()
}

/// Output shape of a reduction over `dims`. Reducing every dim without
/// `keep_dim` yields `[1]`.
pub fn reduced_shape(shape: &[usize], dims: &[usize], keep_dim: bool) -> Vec<usize> {
    let mut out = Vec::with_capacity(shape.len());
    for (i, d) in shape.iter().enumerate() {
        if dims.contains(&i) {
            if keep_dim {
                out.push(1);
            }
        } else {
            out.push(*d);
        }
    }
    if out.is_empty() {
        out.push(1);
    }
    out
}
