use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    env,
    fmt::Display,
    fs,
    path::Path,
    process::Command,
};

use log::debug;
use petgraph::dot::Dot;
use petgraph::graph::NodeIndex;
use petgraph::Graph as PetGraph;

use crate::{bail, DType, Error, Result};

/// Stable index of a [`Node`] in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Stable index of a [`NodeData`] in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(pub usize);

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for DataId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
}

impl AttrValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Self::Ints(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(value: Vec<i64>) -> Self {
        Self::Ints(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// Flat, ordered attribute map of a node.
pub type Attrs = BTreeMap<String, AttrValue>;

/// An operator instance. A node without an operator is a variable.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: Option<String>,
    pub name: String,
    pub attrs: Attrs,
}

impl Node {
    pub fn is_variable(&self) -> bool {
        self.op.is_none()
    }

    pub fn op_name(&self) -> &str {
        self.op.as_deref().unwrap_or("")
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }
}

/// A value flowing along the graph: either a graph input (`source == None`)
/// or output `output_index` of its source node.
#[derive(Debug, Clone)]
pub struct NodeData {
    pub id: DataId,
    pub name: String,
    pub source: Option<NodeId>,
    pub output_index: usize,
    pub version: u32,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl NodeData {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// A data -> node edge feeding input `slot` of `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InEdge {
    data: DataId,
    node: NodeId,
    slot: usize,
}

/// Derived in-order views, rebuilt by [`Graph::refresh_links`].
#[derive(Debug, Clone, Default)]
struct LinkCache {
    inputs: HashMap<NodeId, Vec<DataId>>,
    outputs: HashMap<NodeId, Vec<DataId>>,
    consumers: HashMap<DataId, Vec<NodeId>>,
}

/// Dataflow multigraph of operator nodes and the values they exchange.
///
/// Nodes and data live in arenas addressed by [`NodeId`] / [`DataId`], which
/// stay valid across removals. The graph owns every edge; per-node in-order
/// views are a cache that topology edits invalidate.
#[derive(Debug, Clone)]
pub struct Graph {
    name: String,
    nodes: Vec<Option<Node>>,
    data: Vec<Option<NodeData>>,
    in_edges: Vec<InEdge>,
    outputs: Vec<DataId>,
    links: Option<LinkCache>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            data: Vec::new(),
            in_edges: Vec::new(),
            outputs: Vec::new(),
            links: Some(LinkCache::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a graph input.
    pub fn add_input(&mut self, name: impl Into<String>, shape: &[usize], dtype: DType) -> DataId {
        let id = DataId(self.data.len());
        self.data.push(Some(NodeData {
            id,
            name: name.into(),
            source: None,
            output_index: 0,
            version: 0,
            shape: shape.to_vec(),
            dtype,
        }));
        self.links = None;
        id
    }

    /// Append a node. Pass `None` as `op` for a variable.
    pub fn add_node(&mut self, op: Option<&str>, name: impl Into<String>, attrs: Attrs) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(Node {
            id,
            op: op.map(str::to_string),
            name: name.into(),
            attrs,
        }));
        self.links = None;
        id
    }

    /// Create the next output value of `node`.
    pub fn add_output(
        &mut self,
        node: NodeId,
        name: impl Into<String>,
        shape: &[usize],
        dtype: DType,
    ) -> Result<DataId> {
        if self.node(node).is_none() {
            bail!("add_output: no node {node}");
        }
        let output_index = self
            .data
            .iter()
            .flatten()
            .filter(|d| d.source == Some(node))
            .count();
        let id = DataId(self.data.len());
        self.data.push(Some(NodeData {
            id,
            name: name.into(),
            source: Some(node),
            output_index,
            version: 0,
            shape: shape.to_vec(),
            dtype,
        }));
        self.links = None;
        Ok(id)
    }

    /// Feed `data` into the next input slot of `node`.
    pub fn link(&mut self, data: DataId, node: NodeId) -> Result<()> {
        if self.data(data).is_none() || self.node(node).is_none() {
            bail!("link: dangling endpoint {data} -> {node}");
        }
        let slot = self.in_edges.iter().filter(|e| e.node == node).count();
        self.in_edges.push(InEdge { data, node, slot });
        self.links = None;
        Ok(())
    }

    /// Declare `data` as a graph output. Declaring twice is a no-op.
    pub fn mark_output(&mut self, data: DataId) -> Result<()> {
        if self.data(data).is_none() {
            bail!("mark_output: no data {data}");
        }
        if !self.outputs.contains(&data) {
            self.outputs.push(data);
        }
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn data(&self, id: DataId) -> Option<&NodeData> {
        self.data.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn expect_node(&self, id: NodeId) -> Result<&Node> {
        self.node(id)
            .ok_or_else(|| Error::msg(format!("node {id} is not in graph `{}`", self.name)))
    }

    pub(crate) fn expect_data(&self, id: DataId) -> Result<&NodeData> {
        self.data(id)
            .ok_or_else(|| Error::msg(format!("data {id} is not in graph `{}`", self.name)))
    }

    /// Live nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    /// Live values in declaration order.
    pub fn all_data(&self) -> impl Iterator<Item = &NodeData> {
        self.data.iter().flatten()
    }

    /// Graph inputs: values without a source node.
    pub fn inputs(&self) -> Vec<DataId> {
        self.all_data()
            .filter(|d| d.source.is_none())
            .map(|d| d.id)
            .collect()
    }

    pub fn outputs(&self) -> &[DataId] {
        &self.outputs
    }

    pub fn is_output(&self, data: DataId) -> bool {
        self.outputs.contains(&data)
    }

    pub fn producer_of(&self, data: DataId) -> Option<NodeId> {
        self.data(data).and_then(|d| d.source)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes().count()
    }

    /// Rebuild the in-order input/output/consumer views after topology edits.
    pub fn refresh_links(&mut self) {
        let mut cache = LinkCache::default();
        let mut edges = self.in_edges.clone();
        edges.sort_by_key(|e| (e.node, e.slot));
        for e in &edges {
            cache.inputs.entry(e.node).or_default().push(e.data);
            let consumers = cache.consumers.entry(e.data).or_default();
            if !consumers.contains(&e.node) {
                consumers.push(e.node);
            }
        }
        for consumers in cache.consumers.values_mut() {
            consumers.sort();
        }
        for d in self.data.iter().flatten() {
            if let Some(src) = d.source {
                cache.outputs.entry(src).or_default().push(d.id);
            }
        }
        for outs in cache.outputs.values_mut() {
            outs.sort_by_key(|d| self.data[d.0].as_ref().map(|d| d.output_index));
        }
        self.links = Some(cache);
    }

    fn links(&self) -> Result<&LinkCache> {
        self.links.as_ref().ok_or(Error::StaleLinks)
    }

    /// Inputs of `node` ordered by slot.
    pub fn inputs_of(&self, node: NodeId) -> Result<&[DataId]> {
        Ok(self
            .links()?
            .inputs
            .get(&node)
            .map(Vec::as_slice)
            .unwrap_or(&[]))
    }

    /// Outputs of `node` ordered by output index.
    pub fn outputs_of(&self, node: NodeId) -> Result<&[DataId]> {
        Ok(self
            .links()?
            .outputs
            .get(&node)
            .map(Vec::as_slice)
            .unwrap_or(&[]))
    }

    /// Distinct consumers of `data` in declaration order.
    pub fn consumers_of(&self, data: DataId) -> Result<&[NodeId]> {
        Ok(self
            .links()?
            .consumers
            .get(&data)
            .map(Vec::as_slice)
            .unwrap_or(&[]))
    }

    /// Distinct nodes consuming any output of `node`.
    pub fn node_consumers(&self, node: NodeId) -> Result<Vec<NodeId>> {
        let mut out = BTreeSet::new();
        for d in self.outputs_of(node)? {
            out.extend(self.consumers_of(*d)?.iter().copied());
        }
        Ok(out.into_iter().collect())
    }

    /// Distinct nodes producing any input of `node`.
    pub fn node_producers(&self, node: NodeId) -> Result<Vec<NodeId>> {
        let mut out = BTreeSet::new();
        for d in self.inputs_of(node)? {
            if let Some(src) = self.producer_of(*d) {
                out.insert(src);
            }
        }
        Ok(out.into_iter().collect())
    }

    /// Operator nodes in producer-before-consumer order. Ready nodes are taken
    /// in declaration order.
    pub fn topo_order(&self) -> Result<Vec<NodeId>> {
        let mut pending: HashMap<NodeId, usize> = HashMap::new();
        let mut ready = BTreeSet::new();
        for node in self.nodes() {
            let deps = self.node_producers(node.id)?.len();
            if deps == 0 {
                ready.insert(node.id);
            } else {
                pending.insert(node.id, deps);
            }
        }
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for user in self.node_consumers(next)? {
                if let Some(left) = pending.get_mut(&user) {
                    *left -= 1;
                    if *left == 0 {
                        pending.remove(&user);
                        ready.insert(user);
                    }
                }
            }
        }
        if !pending.is_empty() {
            return Err(Error::GraphNotDag);
        }
        Ok(order)
    }

    /// Remove `node` together with every value it produces and every edge
    /// touching either.
    pub fn remove_node(&mut self, node: NodeId) {
        let Some(slot) = self.nodes.get_mut(node.0) else {
            return;
        };
        if slot.take().is_none() {
            return;
        }
        let produced: HashSet<DataId> = self
            .data
            .iter()
            .flatten()
            .filter(|d| d.source == Some(node))
            .map(|d| d.id)
            .collect();
        for id in &produced {
            self.data[id.0] = None;
        }
        self.in_edges
            .retain(|e| e.node != node && !produced.contains(&e.data));
        self.outputs.retain(|d| !produced.contains(d));
        self.links = None;
    }

    /// Reachability sweep backward from the declared outputs; every node not
    /// visited is removed. Returns the number of removed nodes.
    pub fn eliminate_dead_code(&mut self) -> Result<usize> {
        if self.outputs.is_empty() {
            return Err(Error::import(&self.name, "graph declares no outputs"));
        }
        self.refresh_links();

        let mut visited = HashSet::new();
        let mut queue: VecDeque<DataId> = self.outputs.iter().copied().collect();
        while let Some(data) = queue.pop_front() {
            let Some(src) = self.producer_of(data) else {
                continue;
            };
            if visited.insert(src) {
                queue.extend(self.inputs_of(src)?.iter().copied());
            }
        }

        let dead: Vec<NodeId> = self
            .nodes()
            .map(|n| n.id)
            .filter(|id| !visited.contains(id))
            .collect();
        for id in &dead {
            debug!("dce: removing node `{}`", self.nodes[id.0].as_ref().map_or("", |n| &n.name));
            self.remove_node(*id);
        }
        self.refresh_links();
        Ok(dead.len())
    }

    pub fn to_petgraph(&self) -> Result<PetGraph<String, String>> {
        let mut g = PetGraph::<String, String>::new();
        let mut idx: HashMap<NodeId, NodeIndex> = HashMap::new();
        let mut inputs: HashMap<DataId, NodeIndex> = HashMap::new();
        for node in self.nodes() {
            let label = match &node.op {
                Some(op) => format!("{}({op})", node.name),
                None => node.name.clone(),
            };
            idx.insert(node.id, g.add_node(label));
        }
        for node in self.nodes() {
            let dst = idx[&node.id];
            for d in self.inputs_of(node.id)? {
                let data = self.expect_data(*d)?;
                let src = match data.source {
                    Some(src) => idx[&src],
                    None => *inputs
                        .entry(*d)
                        .or_insert_with(|| g.add_node(data.name.clone())),
                };
                g.add_edge(src, dst, data.name.clone());
            }
        }
        Ok(g)
    }

    /// Produce a DOT format string of this graph.
    pub fn to_dot(&self) -> Result<String> {
        let g = self.to_petgraph()?;
        Ok(format!("{:?}", Dot::new(&g)))
    }

    /// Visualize the graph by saving it to this file.
    ///
    /// Install graphvis:
    /// - brew install graphviz
    /// - apt install graphviz
    pub fn visualize<P: AsRef<Path>>(&self, filename: P) -> Result<()> {
        let path = filename.as_ref();
        let dot_path = env::temp_dir().join(format!("{}.dot", self.name));

        fs::write(&dot_path, self.to_dot()?)?;
        let status = Command::new("dot")
            .args([
                "-Tpng",
                &dot_path.display().to_string(),
                "-o",
                &path.display().to_string(),
            ])
            .status()?;
        if !status.success() {
            bail!("graphviz exited with {status}");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (Graph, NodeId, NodeId) {
        let mut g = Graph::new("chain");
        let x = g.add_input("x", &[4], DType::F32);
        let a = g.add_node(Some("relu"), "relu_0", Attrs::new());
        g.link(x, a).unwrap();
        let y = g.add_output(a, "var_1", &[4], DType::F32).unwrap();
        let b = g.add_node(Some("exp"), "exp_1", Attrs::new());
        g.link(y, b).unwrap();
        let z = g.add_output(b, "var_2", &[4], DType::F32).unwrap();
        g.mark_output(z).unwrap();
        (g, a, b)
    }

    #[test]
    fn stale_views_are_rejected_until_refreshed() {
        let (mut g, a, _) = chain();
        assert!(matches!(g.inputs_of(a), Err(Error::StaleLinks)));
        g.refresh_links();
        assert_eq!(g.inputs_of(a).unwrap(), &[DataId(0)]);
    }

    #[test]
    fn topo_order_follows_dependencies() {
        let (mut g, a, b) = chain();
        g.refresh_links();
        assert_eq!(g.topo_order().unwrap(), vec![a, b]);
    }

    #[test]
    fn self_loop_is_not_a_dag() {
        let mut g = Graph::new("loop");
        let n = g.add_node(Some("relu"), "relu_0", Attrs::new());
        let d = g.add_output(n, "var_0", &[1], DType::F32).unwrap();
        g.link(d, n).unwrap();
        g.refresh_links();
        assert!(matches!(g.topo_order(), Err(Error::GraphNotDag)));
    }

    #[test]
    fn removing_a_node_drops_its_edges() {
        let (mut g, a, b) = chain();
        g.remove_node(a);
        g.refresh_links();
        assert!(g.node(a).is_none());
        assert!(g.inputs_of(b).unwrap().is_empty());
        assert!(g.data(DataId(1)).is_none());
    }
}
