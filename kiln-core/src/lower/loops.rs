//! Turns a scheduled [`StageMap`] into a loop-level [`Stmt`].
//!
//! Inlined stages are substituted into their readers. Every other stage
//! becomes a loop nest: root stages at function level in dependency order,
//! attached stages inside their target's loop at the requested depth. A
//! reduction emits an initialization nest followed by the accumulation nest.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use log::trace;

use super::AxisInfo;
use crate::{
    error::StageError,
    ir::{Expr, ForKind, Stmt, Tensor},
    schedule::{Stage, StageMap},
    Error, Result, Target,
};

/// Suffix of the view a reduction's initialization nest stores through.
pub const REDUCE_INIT_SUFFIX: &str = "__reduce_init";

#[derive(Debug)]
pub(crate) struct LoopNest {
    pub body: Stmt,
    /// Tensors that own or share storage, in stage order.
    pub materialized: Vec<String>,
    /// `(view, tensor)`: extra names addressing a tensor's buffer.
    pub aliases: Vec<(String, String)>,
    pub axis_info: AxisInfo,
}

/// Row-major linear offset of `indices` into a tensor of `shape`.
pub fn flatten(indices: &[Expr], shape: &[usize]) -> Expr {
    let mut stride = 1i64;
    let mut terms = Vec::with_capacity(indices.len());
    for (idx, dim) in indices.iter().zip(shape).rev() {
        terms.push(match stride {
            1 => idx.clone(),
            s => Expr::int(s) * idx.clone(),
        });
        stride *= *dim as i64;
    }
    terms
        .into_iter()
        .rev()
        .reduce(|acc, t| acc + t)
        .unwrap_or(Expr::Int(0))
        .simplify()
}

pub(crate) fn lower_loops(
    stages: &StageMap,
    tensors: &HashMap<String, Tensor>,
    target: &Target,
) -> Result<LoopNest> {
    let mut nest = NestBuilder::new(stages, tensors, target)?;
    nest.assign_envs()?;
    nest.check_attachments()?;
    let roots: Vec<(usize, String)> = nest.roots.iter().map(|r| (0, r.clone())).collect();
    let body = Stmt::Block(nest.arrange(roots, Vec::new(), HashSet::new())?);
    let materialized: Vec<String> = nest
        .materialized
        .iter()
        .map(|s| s.name().to_string())
        .collect();
    let aliases = nest
        .materialized
        .iter()
        .filter(|s| s.tensor().is_reduce())
        .map(|s| (format!("{}{REDUCE_INIT_SUFFIX}", s.name()), s.name().to_string()))
        .collect();
    Ok(LoopNest {
        body,
        materialized,
        aliases,
        axis_info: nest.axis_info,
    })
}

fn illegal(stage: &str, target: &str, detail: impl Into<String>) -> Error {
    StageError::IllegalComputeAt {
        stage: stage.to_string(),
        target: target.to_string(),
        detail: detail.into(),
    }
    .into()
}

fn inline(e: &Expr, inlined: &HashMap<&str, &Tensor>) -> Result<Expr> {
    e.rewrite_loads(&mut |name, _, indices| {
        let Some(t) = inlined.get(name) else {
            return Ok(None);
        };
        let body = t
            .body()
            .ok_or_else(|| Error::msg(format!("inlined tensor `{name}` has no body")))?;
        let map: HashMap<String, Expr> = t.axis_names().iter().cloned().zip(indices).collect();
        inline(&body.substitute(&map), inlined).map(Some)
    })
}

fn var_map(env: &HashMap<String, String>) -> HashMap<String, Expr> {
    env.iter()
        .map(|(k, v)| (k.clone(), Expr::var(v)))
        .collect()
}

struct NestBuilder<'a> {
    stages: &'a StageMap,
    tensors: &'a HashMap<String, Tensor>,
    device: bool,
    materialized: Vec<&'a Stage>,
    /// Body of every materialized stage with inlined stages substituted,
    /// over the tensor's own axis variables.
    bodies: HashMap<String, Expr>,
    loads: HashMap<String, BTreeSet<String>>,
    children: HashMap<String, Vec<(usize, String)>>,
    roots: Vec<String>,
    /// Per stage: loop variable -> emitted variable name.
    envs: HashMap<String, HashMap<String, String>>,
    axis_info: AxisInfo,
}

impl<'a> NestBuilder<'a> {
    fn new(
        stages: &'a StageMap,
        tensors: &'a HashMap<String, Tensor>,
        target: &Target,
    ) -> Result<Self> {
        let inlined: HashMap<&str, &Tensor> = stages
            .iter()
            .filter(|s| s.is_inlined())
            .map(|s| (s.name(), s.tensor()))
            .collect();
        let materialized: Vec<&Stage> = stages.iter().filter(|s| !s.is_inlined()).collect();

        let mut bodies = HashMap::new();
        let mut loads = HashMap::new();
        for s in &materialized {
            let body = s
                .tensor()
                .body()
                .ok_or_else(|| Error::msg(format!("stage `{}` has no body", s.name())))?;
            let body = inline(body, &inlined)?;
            let mut read = BTreeSet::new();
            body.visit_loads(&mut |name, _| {
                read.insert(name.to_string());
            });
            loads.insert(s.name().to_string(), read);
            bodies.insert(s.name().to_string(), body);
        }

        let mut children: HashMap<String, Vec<(usize, String)>> = HashMap::new();
        let mut roots = Vec::new();
        for s in &materialized {
            let Some(ca) = s.compute_at_info() else {
                roots.push(s.name().to_string());
                continue;
            };
            let target = match stages.get(&ca.target) {
                Some(t) if !t.is_inlined() => t,
                _ => {
                    return Err(illegal(
                        s.name(),
                        &ca.target,
                        "target is not a materialized stage",
                    ))
                }
            };
            if !s.prefix_congruent(target, ca.level) {
                return Err(illegal(
                    s.name(),
                    target.name(),
                    format!("loops 0..={} do not match", ca.level),
                ));
            }
            children
                .entry(ca.target.clone())
                .or_default()
                .push((ca.level, s.name().to_string()));
        }

        for s in &materialized {
            let mut seen = HashSet::new();
            let mut cur: &Stage = s;
            while let Some(ca) = cur.compute_at_info() {
                if !seen.insert(cur.name()) {
                    return Err(StageError::ComputeAtCycle {
                        stage: s.name().to_string(),
                    }
                    .into());
                }
                cur = stages.expect(&ca.target)?;
            }
        }

        Ok(Self {
            stages,
            tensors,
            device: target.is_device(),
            materialized,
            bodies,
            loads,
            children,
            roots,
            envs: HashMap::new(),
            axis_info: AxisInfo::default(),
        })
    }

    fn stage(&self, name: &str) -> Result<&'a Stage> {
        self.stages.expect(name)
    }

    fn env(&self, name: &str) -> Result<&HashMap<String, String>> {
        self.envs
            .get(name)
            .ok_or_else(|| Error::msg(format!("stage `{name}` is unreachable from any root")))
    }

    fn emitted(&self, stage: &Stage, axis: &str) -> Result<String> {
        self.env(stage.name())?
            .get(axis)
            .cloned()
            .ok_or_else(|| Error::msg(format!("stage `{}` has no loop `{axis}`", stage.name())))
    }

    /// Name every loop variable: shared loops take the target's names, the
    /// rest keep their own unless an enclosing loop already uses it.
    fn assign_envs(&mut self) -> Result<()> {
        let mut enclosing: HashMap<String, HashSet<String>> = HashMap::new();
        let mut queue = VecDeque::new();
        for root in &self.roots {
            let s = self.stage(root)?;
            let env: HashMap<String, String> = s
                .axes()
                .iter()
                .map(|a| (a.name.clone(), a.name.clone()))
                .collect();
            enclosing.insert(root.clone(), env.values().cloned().collect());
            self.envs.insert(root.clone(), env);
            queue.push_back(root.clone());
        }
        while let Some(name) = queue.pop_front() {
            let parent = self.stage(&name)?;
            let kids = self.children.get(&name).cloned().unwrap_or_default();
            for (level, child) in kids {
                let c = self.stage(&child)?;
                let outer = enclosing.get(&name).cloned().unwrap_or_default();
                let mut env = HashMap::new();
                for (q, axis) in c.axes().iter().enumerate() {
                    let emitted = if q <= level {
                        self.emitted(parent, &parent.axes()[q].name)?
                    } else if outer.contains(&axis.name) {
                        format!("{}_{}", axis.name, c.name())
                    } else {
                        axis.name.clone()
                    };
                    env.insert(axis.name.clone(), emitted);
                }
                let mut scope = outer;
                scope.extend(env.values().cloned());
                enclosing.insert(child.clone(), scope);
                self.envs.insert(child.clone(), env);
                queue.push_back(child);
            }
        }
        Ok(())
    }

    /// Index of every original axis over emitted loop variables.
    fn origin_map(&self, s: &Stage) -> Result<HashMap<String, Expr>> {
        let vars = var_map(self.env(s.name())?);
        Ok(s.origin_axes()
            .iter()
            .zip(s.index_map())
            .map(|(axis, e)| (axis.name.clone(), e.substitute(&vars).simplify()))
            .collect())
    }

    fn store_indices(&self, s: &Stage) -> Result<Vec<Expr>> {
        let map = self.origin_map(s)?;
        Ok(s.tensor()
            .axis_names()
            .iter()
            .map(|a| map.get(a).cloned().unwrap_or(Expr::Int(0)))
            .collect())
    }

    fn emitted_body(&self, s: &Stage) -> Result<Expr> {
        let body = self
            .bodies
            .get(s.name())
            .ok_or_else(|| Error::msg(format!("no body for `{}`", s.name())))?;
        Ok(body.substitute(&self.origin_map(s)?).simplify())
    }

    fn readers(&self, producer: &str) -> Vec<&'a Stage> {
        self.materialized
            .iter()
            .copied()
            .filter(|s| self.loads.get(s.name()).is_some_and(|l| l.contains(producer)))
            .collect()
    }

    /// Whether `stage` sits inside `target`'s loop at depth `level` or deeper.
    fn nested_within(&self, stage: &Stage, target: &str, level: usize) -> Result<bool> {
        let mut cur = stage;
        while let Some(ca) = cur.compute_at_info() {
            if ca.target == target {
                return Ok(ca.level >= level);
            }
            cur = self.stage(&ca.target)?;
        }
        Ok(false)
    }

    fn check_attachments(&self) -> Result<()> {
        for p in &self.materialized {
            let Some(ca) = p.compute_at_info() else {
                continue;
            };
            let t = self.stage(&ca.target)?;
            let shared: HashSet<String> = t.axes()[..=ca.level]
                .iter()
                .map(|a| self.emitted(t, &a.name))
                .collect::<Result<_>>()?;
            for r in self.readers(p.name()) {
                if r.name() != t.name() && !self.nested_within(r, t.name(), ca.level)? {
                    return Err(illegal(
                        p.name(),
                        t.name(),
                        format!("`{}` reads it outside the attached loops", r.name()),
                    ));
                }
                if let Some(detail) = self.disagreement(p, r, &shared)? {
                    return Err(illegal(p.name(), t.name(), detail));
                }
            }
            if self.loads[p.name()].contains(t.name()) {
                if let Some(detail) = self.disagreement(t, p, &shared)? {
                    return Err(illegal(p.name(), t.name(), detail));
                }
            }
        }
        Ok(())
    }

    /// Compare how `producer` stores with how `reader` loads it. Positions
    /// indexed purely by shared loops must match exactly; positions that
    /// mix shared and private loops must match once the producer's private
    /// loops are mapped onto the reader's loops at the same depth.
    fn disagreement(
        &self,
        producer: &Stage,
        reader: &Stage,
        shared: &HashSet<String>,
    ) -> Result<Option<String>> {
        let store = self.store_indices(producer)?;
        let mut reads = Vec::new();
        self.emitted_body(reader)?.visit_loads(&mut |name, idx| {
            if name == producer.name() {
                reads.push(idx.to_vec());
            }
        });
        for idx in reads {
            for (pos, (s, l)) in store.iter().zip(&idx).enumerate() {
                let vars = s.vars();
                let s = if vars.iter().all(|v| shared.contains(v)) {
                    s.clone()
                } else if vars.iter().any(|v| shared.contains(v)) {
                    let mut map = HashMap::new();
                    for (q, axis) in producer.axes().iter().enumerate() {
                        let name = self.emitted(producer, &axis.name)?;
                        if shared.contains(&name) || !vars.contains(&name) {
                            continue;
                        }
                        let Some(theirs) = reader.axes().get(q) else {
                            return Ok(Some(format!(
                                "`{}` has no loop matching `{name}`",
                                reader.name()
                            )));
                        };
                        map.insert(name, Expr::var(self.emitted(reader, &theirs.name)?));
                    }
                    s.substitute(&map)
                } else {
                    continue;
                };
                if s.simplify() != l.simplify() {
                    return Ok(Some(format!(
                        "`{}` reads `{}` at {l} in dimension {pos}, computed at {s}",
                        reader.name(),
                        producer.name()
                    )));
                }
            }
        }
        Ok(None)
    }

    fn subtree_writes(&self, name: &str) -> HashSet<String> {
        let mut out = HashSet::from([name.to_string()]);
        for (_, kid) in self.children.get(name).into_iter().flatten() {
            out.extend(self.subtree_writes(kid));
        }
        out
    }

    fn subtree_loads(&self, name: &str) -> HashSet<String> {
        let mut out: HashSet<String> = self
            .loads
            .get(name)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default();
        for (_, kid) in self.children.get(name).into_iter().flatten() {
            out.extend(self.subtree_loads(kid));
        }
        out
    }

    /// Order `items` so producers come first; ties keep stage order.
    fn dependency_order(&self, items: Vec<(usize, String)>) -> Result<Vec<(usize, String)>> {
        let pos = |n: &str| self.stages.position(n).unwrap_or(usize::MAX);
        let writes: Vec<HashSet<String>> = items.iter().map(|(_, n)| self.subtree_writes(n)).collect();
        let loads: Vec<HashSet<String>> = items.iter().map(|(_, n)| self.subtree_loads(n)).collect();
        let mut pending: Vec<usize> = vec![0; items.len()];
        for (b, pending_b) in pending.iter_mut().enumerate() {
            *pending_b = (0..items.len())
                .filter(|a| *a != b && !writes[*a].is_disjoint(&loads[b]))
                .count();
        }
        let mut ready: BTreeSet<(usize, usize)> = pending
            .iter()
            .enumerate()
            .filter(|(_, p)| **p == 0)
            .map(|(i, _)| (pos(&items[i].1), i))
            .collect();
        let mut order = Vec::with_capacity(items.len());
        while let Some((_, a)) = ready.pop_first() {
            order.push(a);
            for b in 0..items.len() {
                if b != a && pending[b] > 0 && !writes[a].is_disjoint(&loads[b]) {
                    pending[b] -= 1;
                    if pending[b] == 0 {
                        ready.insert((pos(&items[b].1), b));
                    }
                }
            }
        }
        if order.len() != items.len() {
            return Err(Error::msg("stages read each other in a cycle"));
        }
        Ok(order.into_iter().map(|i| items[i].clone()).collect())
    }

    /// Place `items` (stage names with the loop depth they start at) around
    /// `inner`: those reading anything `inner` writes go after it.
    fn arrange(
        &mut self,
        items: Vec<(usize, String)>,
        inner: Vec<Stmt>,
        mut writes: HashSet<String>,
    ) -> Result<Vec<Stmt>> {
        if items.is_empty() {
            return Ok(inner);
        }
        let mut late = HashSet::new();
        loop {
            let mut changed = false;
            for (_, n) in &items {
                if !late.contains(n) && !self.subtree_loads(n).is_disjoint(&writes) {
                    late.insert(n.clone());
                    writes.extend(self.subtree_writes(n));
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        let (after, before): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|(_, n)| late.contains(n));
        let mut out = Vec::new();
        for (start, n) in self.dependency_order(before)? {
            out.extend(self.emit_stage(&n, start)?);
        }
        out.extend(inner);
        for (start, n) in self.dependency_order(after)? {
            out.extend(self.emit_stage(&n, start)?);
        }
        Ok(out)
    }

    /// Loops `start..` of `name`, with its attached stages placed inside.
    fn emit_stage(&mut self, name: &str, start: usize) -> Result<Vec<Stmt>> {
        let s = self.stage(name)?;
        trace!("emit `{name}` from loop {start}");
        let kids = self.children.get(name).cloned().unwrap_or_default();
        let (below, above): (Vec<_>, Vec<_>) = kids.into_iter().partition(|(l, _)| *l < start);

        let mut own = Vec::new();
        if s.tensor().is_reduce() {
            own.extend(self.build_nest(s, start, &[], true)?);
        }
        own.extend(self.build_nest(s, start, &above, false)?);

        let mut writes = HashSet::from([name.to_string()]);
        for (_, kid) in &above {
            writes.extend(self.subtree_writes(kid));
        }
        // attached at a loop that encloses this nest: placed around it
        let below = below.into_iter().map(|(l, n)| (l + 1, n)).collect();
        self.arrange(below, own, writes)
    }

    fn build_nest(
        &mut self,
        s: &'a Stage,
        from: usize,
        kids: &[(usize, String)],
        init: bool,
    ) -> Result<Vec<Stmt>> {
        let env = self.env(s.name())?.clone();
        let vars = var_map(&env);
        let mut current = vec![self.leaf(s, init, &env)?];
        for pos in (from..s.axes().len()).rev() {
            let axis = &s.axes()[pos];
            if init && axis.reduce {
                continue;
            }
            let here: Vec<(usize, String)> = kids
                .iter()
                .filter(|(l, _)| *l == pos)
                .map(|(l, n)| (l + 1, n.clone()))
                .collect();
            let mut writes = HashSet::from([s.name().to_string()]);
            for (_, kid) in kids.iter().filter(|(l, _)| *l > pos) {
                writes.extend(self.subtree_writes(kid));
            }
            let body = self.arrange(here, current, writes)?;
            let kind = match axis.bind {
                Some(p) if self.device => {
                    self.axis_info.record(p, axis.extent);
                    ForKind::Bound(p)
                }
                _ => ForKind::Serial,
            };
            current = vec![Stmt::For {
                var: env
                    .get(&axis.name)
                    .cloned()
                    .unwrap_or_else(|| axis.name.clone()),
                extent: axis.trip_count().substitute(&vars).simplify(),
                kind,
                body: Box::new(Stmt::Block(body)),
            }];
        }
        Ok(current)
    }

    fn flatten_loads(&self, e: &Expr) -> Result<Expr> {
        e.rewrite_loads(&mut |name, dtype, indices| {
            let t = self
                .tensors
                .get(name)
                .ok_or_else(|| Error::msg(format!("load of unknown tensor `{name}`")))?;
            Ok(Some(Expr::Load {
                tensor: name.to_string(),
                dtype,
                indices: vec![flatten(&indices, t.shape())],
            }))
        })
    }

    /// The innermost statement of a nest: the (guarded) store.
    fn leaf(&self, s: &Stage, init: bool, env: &HashMap<String, String>) -> Result<Stmt> {
        let tensor = s.tensor();
        let flat = flatten(&self.store_indices(s)?, tensor.shape());
        let (dest, value) = match (tensor.reduction(), init) {
            (Some(red), true) => (
                format!("{}{REDUCE_INIT_SUFFIX}", s.name()),
                red.kind.init(tensor.dtype()),
            ),
            (Some(red), false) => {
                let acc = Expr::Load {
                    tensor: s.name().to_string(),
                    dtype: tensor.dtype(),
                    indices: vec![flat.clone()],
                };
                let body = self.flatten_loads(&self.emitted_body(s)?)?;
                (s.name().to_string(), red.kind.combine(acc, body))
            }
            (None, _) => (
                s.name().to_string(),
                self.flatten_loads(&self.emitted_body(s)?)?,
            ),
        };
        let store = Stmt::Store {
            tensor: dest,
            indices: vec![flat],
            value: value.simplify(),
        };

        let reduce_vars: HashSet<&String> = s
            .axes()
            .iter()
            .filter(|a| a.reduce)
            .filter_map(|a| env.get(&a.name))
            .collect();
        let vars = var_map(env);
        let cond = s
            .guards()
            .iter()
            .map(|g| g.substitute(&vars).simplify())
            .filter(|g| !init || g.vars().iter().all(|v| !reduce_vars.contains(v)))
            .reduce(Expr::and);
        Ok(match cond {
            Some(cond) => Stmt::IfThen {
                cond,
                then: Box::new(store),
            },
            None => store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ir::ReduceKind, DType};

    fn tensors(list: &[&Tensor]) -> HashMap<String, Tensor> {
        list.iter()
            .map(|t| (t.name().to_string(), (*t).clone()))
            .collect()
    }

    #[test]
    fn flatten_is_row_major() {
        let idx = vec![Expr::var("i"), Expr::var("j")];
        assert_eq!(flatten(&idx, &[100, 20]).to_string(), "((20 * i) + j)");
        assert_eq!(flatten(&[Expr::var("i")], &[7]).to_string(), "i");
    }

    #[test]
    fn inlined_stage_is_substituted() {
        let a = Tensor::placeholder("A", &[4], DType::F32);
        let b = Tensor::compute("B", &[4], DType::F32, vec![a.clone()], |i| {
            a.at(i.to_vec()) * Expr::float(2.0)
        });
        let c = Tensor::compute("C", &[4], DType::F32, vec![b.clone()], |i| {
            b.at(i.to_vec()) + Expr::float(1.0)
        });
        let mut stages = StageMap::from_tensors(&[b.clone(), c.clone()]).unwrap();
        stages.compute_inline("B").unwrap();
        let nest = lower_loops(&stages, &tensors(&[&a, &b, &c]), &Target::host()).unwrap();
        assert_eq!(nest.materialized, vec!["C".to_string()]);
        assert_eq!(nest.body.stored_tensors(), vec!["C"]);
    }

    #[test]
    fn reduction_emits_init_then_accumulate() {
        let a = Tensor::placeholder("A", &[3, 5], DType::F32);
        let s = Tensor::reduce("S", &[3], DType::F32, vec![a.clone()], ReduceKind::Sum, &[5], |i, r| {
            a.at(vec![i[0].clone(), r[0].clone()])
        });
        let stages = StageMap::from_tensors(&[s.clone()]).unwrap();
        let nest = lower_loops(&stages, &tensors(&[&a, &s]), &Target::host()).unwrap();
        assert_eq!(nest.body.stored_tensors(), vec!["S__reduce_init", "S"]);
        assert_eq!(nest.aliases, vec![("S__reduce_init".to_string(), "S".to_string())]);
    }

    #[test]
    fn reader_outside_the_attached_loops_is_rejected() {
        let a = Tensor::placeholder("A", &[4], DType::F32);
        let b = Tensor::compute("B", &[4], DType::F32, vec![a.clone()], |i| a.at(i.to_vec()));
        let c = Tensor::compute("C", &[4], DType::F32, vec![a.clone()], |i| a.at(i.to_vec()));
        let d = Tensor::compute("D", &[4], DType::F32, vec![b.clone()], |i| b.at(i.to_vec()));
        let mut stages = StageMap::from_tensors(&[b.clone(), c.clone(), d.clone()]).unwrap();
        // D reads B but B is nested inside C's loop
        stages.compute_at("B", "C", 0).unwrap();
        let err = lower_loops(&stages, &tensors(&[&a, &b, &c, &d]), &Target::host()).unwrap_err();
        assert!(matches!(
            err.stage_error(),
            Some(StageError::IllegalComputeAt { .. })
        ));
    }

    #[test]
    fn shifted_read_of_attached_stage_is_rejected() {
        let a = Tensor::placeholder("A", &[4], DType::F32);
        let b = Tensor::compute("B", &[4], DType::F32, vec![a.clone()], |i| a.at(i.to_vec()));
        let c = Tensor::compute("C", &[3], DType::F32, vec![b.clone()], |i| {
            b.at(vec![i[0].clone() + 1])
        });
        let mut stages = StageMap::from_tensors(&[b.clone(), c.clone()]).unwrap();
        // extents differ, so the loops cannot be shared
        stages.compute_at("B", "C", 0).unwrap();
        assert!(lower_loops(&stages, &tensors(&[&a, &b, &c]), &Target::host()).is_err());
    }
}
