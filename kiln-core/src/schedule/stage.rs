use std::collections::HashMap;

use crate::{
    buffer::BufferScope,
    error::StageError,
    ir::{Expr, ParallelAxis, Tensor},
    Error, Result,
};

/// One loop of a stage's iteration space.
#[derive(Debug, Clone, PartialEq)]
pub struct IterAxis {
    pub name: String,
    pub extent: usize,
    pub reduce: bool,
    /// Trip count when it is smaller than `extent` on some iterations
    /// (the partial tile of a split), written over earlier axes.
    pub bound: Option<Expr>,
    pub bind: Option<ParallelAxis>,
}

impl IterAxis {
    fn new(name: impl Into<String>, extent: usize, reduce: bool) -> Self {
        Self {
            name: name.into(),
            extent,
            reduce,
            bound: None,
            bind: None,
        }
    }

    /// Expression for this axis' trip count.
    pub fn trip_count(&self) -> Expr {
        self.bound.clone().unwrap_or(Expr::Int(self.extent as i64))
    }
}

/// Primitive transform recorded in a stage's history, replayable on another
/// stage through [`Stage::copy_transform`].
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Split { axis: usize, factor: usize },
    Fuse { axis: usize },
    Reorder { order: Vec<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeAt {
    pub target: String,
    pub level: usize,
}

/// Schedule state of one compute tensor.
///
/// A stage never touches data. It keeps the tensor's original iteration
/// domain, the current loop axes, and for every original axis an index
/// expression over the current loop variables.
#[derive(Debug, Clone)]
pub struct Stage {
    tensor: Tensor,
    origin: Vec<IterAxis>,
    axes: Vec<IterAxis>,
    index_map: Vec<Expr>,
    guards: Vec<Expr>,
    history: Vec<Transform>,
    scope: BufferScope,
    inlined: bool,
    compute_at: Option<ComputeAt>,
    share_buffer_with: Option<String>,
}

impl Stage {
    pub fn new(tensor: Tensor) -> Result<Self> {
        if tensor.is_placeholder() {
            return Err(Error::msg(format!(
                "placeholder `{}` has no stage",
                tensor.name()
            )));
        }
        let mut origin: Vec<IterAxis> = tensor
            .axis_names()
            .iter()
            .zip(tensor.shape())
            .map(|(name, extent)| IterAxis::new(name, *extent, false))
            .collect();
        if let Some(reduction) = tensor.reduction() {
            origin.extend(
                reduction
                    .axes
                    .iter()
                    .map(|r| IterAxis::new(&r.name, r.extent, true)),
            );
        }
        let index_map = origin.iter().map(|a| Expr::var(&a.name)).collect();
        Ok(Self {
            tensor,
            axes: origin.clone(),
            origin,
            index_map,
            guards: Vec::new(),
            history: Vec::new(),
            scope: BufferScope::Global,
            inlined: false,
            compute_at: None,
            share_buffer_with: None,
        })
    }

    pub fn name(&self) -> &str {
        self.tensor.name()
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn axes(&self) -> &[IterAxis] {
        &self.axes
    }

    pub fn origin_axes(&self) -> &[IterAxis] {
        &self.origin
    }

    /// Index expression of every original axis over the current loop vars.
    pub fn index_map(&self) -> &[Expr] {
        &self.index_map
    }

    /// Conditions every iteration must satisfy before storing.
    pub fn guards(&self) -> &[Expr] {
        &self.guards
    }

    pub fn history(&self) -> &[Transform] {
        &self.history
    }

    pub fn scope(&self) -> BufferScope {
        self.scope
    }

    pub fn is_inlined(&self) -> bool {
        self.inlined
    }

    pub fn compute_at_info(&self) -> Option<&ComputeAt> {
        self.compute_at.as_ref()
    }

    pub fn shared_buffer(&self) -> Option<&str> {
        self.share_buffer_with.as_deref()
    }

    /// Number of leading non-reduction axes.
    pub fn num_spatial(&self) -> usize {
        self.axes.iter().take_while(|a| !a.reduce).count()
    }

    /// Drop every transform and return to the tensor's original domain.
    pub fn reset(&mut self) {
        self.axes = self.origin.clone();
        self.index_map = self.origin.iter().map(|a| Expr::var(&a.name)).collect();
        self.guards.clear();
        self.history.clear();
    }

    fn check_axis(&self, axis: usize) -> std::result::Result<(), StageError> {
        if axis >= self.axes.len() {
            return Err(StageError::AxisOutOfRange {
                stage: self.name().to_string(),
                axis,
                len: self.axes.len(),
            });
        }
        Ok(())
    }

    fn substitute_all(&mut self, map: &HashMap<String, Expr>) {
        for e in self.index_map.iter_mut() {
            *e = e.substitute(map).simplify();
        }
        for g in self.guards.iter_mut() {
            *g = g.substitute(map).simplify();
        }
        for a in self.axes.iter_mut() {
            if let Some(b) = &a.bound {
                a.bound = Some(b.substitute(map).simplify());
            }
        }
    }

    fn apply(&mut self, t: &Transform) -> std::result::Result<(), StageError> {
        match t {
            Transform::Split { axis, factor } => self.apply_split(*axis, *factor),
            Transform::Fuse { axis } => self.apply_fuse(*axis),
            Transform::Reorder { order } => self.apply_reorder(order),
        }
    }

    fn apply_split(&mut self, axis: usize, factor: usize) -> std::result::Result<(), StageError> {
        self.check_axis(axis)?;
        if factor == 0 {
            return Err(StageError::InvalidFactor {
                stage: self.name().to_string(),
                factor,
            });
        }
        let old = self.axes[axis].clone();
        let f = factor as i64;
        let outer_name = format!("{}_outer", old.name);
        let inner_name = format!("{}_inner", old.name);

        let mut outer = IterAxis::new(&outer_name, old.extent.div_ceil(factor), old.reduce);
        let mut inner = IterAxis::new(&inner_name, factor, old.reduce);
        if let Some(b) = &old.bound {
            outer.bound = Some(((b.clone() + (f - 1)) / f).simplify());
        }
        if old.bound.is_some() || old.extent % factor != 0 {
            let remaining = old.trip_count() - Expr::int(f) * Expr::var(&outer_name);
            inner.bound = Some(Expr::min(Expr::int(f), remaining).simplify());
        }
        self.axes.remove(axis);
        self.axes.insert(axis, inner);
        self.axes.insert(axis, outer);

        let map = HashMap::from([(
            old.name,
            Expr::int(f) * Expr::var(outer_name) + Expr::var(inner_name),
        )]);
        self.substitute_all(&map);
        Ok(())
    }

    fn apply_fuse(&mut self, axis: usize) -> std::result::Result<(), StageError> {
        self.check_axis(axis + 1)?;
        let (a, b) = (self.axes[axis].clone(), self.axes[axis + 1].clone());
        if a.reduce != b.reduce {
            return Err(StageError::IllegalFuse {
                stage: self.name().to_string(),
                detail: format!(
                    "`{}` and `{}` mix reduction and spatial iteration",
                    a.name, b.name
                ),
            });
        }
        let name = format!("{}_{}_fused", a.name, b.name);
        let eb = b.extent as i64;
        let fused = Expr::var(&name);
        let map = HashMap::from([
            (a.name.clone(), (fused.clone() / eb).simplify()),
            (b.name.clone(), (fused % eb).simplify()),
        ]);
        let mut new_guards = Vec::new();
        if let Some(bound) = &a.bound {
            new_guards.push(Expr::lt(map[&a.name].clone(), bound.substitute(&map)).simplify());
        }
        if let Some(bound) = &b.bound {
            new_guards.push(Expr::lt(map[&b.name].clone(), bound.substitute(&map)).simplify());
        }
        self.axes.drain(axis..=axis + 1);
        self.axes
            .insert(axis, IterAxis::new(name, a.extent * b.extent, a.reduce));
        self.substitute_all(&map);
        self.guards.extend(new_guards);
        Ok(())
    }

    fn apply_reorder(&mut self, order: &[usize]) -> std::result::Result<(), StageError> {
        let mut seen = vec![false; self.axes.len()];
        let is_perm = order.len() == self.axes.len()
            && order.iter().all(|i| match seen.get_mut(*i) {
                Some(s) if !*s => {
                    *s = true;
                    true
                }
                _ => false,
            });
        if !is_perm {
            return Err(StageError::AxisSetMismatch {
                stage: self.name().to_string(),
                detail: format!(
                    "reorder {order:?} is not a permutation of {} axes",
                    self.axes.len()
                ),
            });
        }
        let reordered: Vec<IterAxis> = order.iter().map(|i| self.axes[*i].clone()).collect();
        for (pos, axis) in reordered.iter().enumerate() {
            let Some(bound) = &axis.bound else {
                continue;
            };
            let earlier: Vec<&str> = reordered[..pos].iter().map(|a| a.name.as_str()).collect();
            if bound.vars().iter().any(|v| !earlier.contains(&v.as_str())) {
                return Err(StageError::BoundOrder {
                    stage: self.name().to_string(),
                    axis: axis.name.clone(),
                });
            }
        }
        self.axes = reordered;
        Ok(())
    }

    fn record(&mut self, t: Transform) -> std::result::Result<(), StageError> {
        self.apply(&t)?;
        self.history.push(t);
        Ok(())
    }

    /// Split `axis` by `factor` into `(outer, inner)`, returned as axis positions.
    pub fn split(&mut self, axis: usize, factor: usize) -> Result<(usize, usize)> {
        self.record(Transform::Split { axis, factor })?;
        Ok((axis, axis + 1))
    }

    /// Split two adjacent axes, ordering the result `(outer0, outer1, inner0, inner1)`.
    pub fn tile(&mut self, axis0: usize, axis1: usize, factor0: usize, factor1: usize) -> Result<()> {
        if axis1 != axis0 + 1 {
            return Err(StageError::AxisSetMismatch {
                stage: self.name().to_string(),
                detail: format!("tile needs adjacent axes, got {axis0} and {axis1}"),
            }
            .into());
        }
        self.split(axis1, factor1)?;
        self.split(axis0, factor0)?;
        let n = self.axes.len();
        let mut order: Vec<usize> = (0..axis0).collect();
        order.extend([axis0, axis0 + 2, axis0 + 1, axis0 + 3]);
        order.extend(axis0 + 4..n);
        self.reorder(&order)
    }

    pub fn reorder(&mut self, order: &[usize]) -> Result<()> {
        Ok(self.record(Transform::Reorder {
            order: order.to_vec(),
        })?)
    }

    /// Fuse adjacent axes `a` and `b == a + 1`, returning the new axis position.
    pub fn fuse(&mut self, a: usize, b: usize) -> Result<usize> {
        if b != a + 1 {
            return Err(StageError::IllegalFuse {
                stage: self.name().to_string(),
                detail: format!("axes {a} and {b} are not adjacent"),
            }
            .into());
        }
        self.record(Transform::Fuse { axis: a })?;
        Ok(a)
    }

    /// Fuse every spatial axis into one.
    pub fn fuse_spatial(&mut self) -> Result<Option<usize>> {
        let n = self.num_spatial();
        if n == 0 {
            return Ok(None);
        }
        for _ in 1..n {
            self.fuse(0, 1)?;
        }
        Ok(Some(0))
    }

    pub fn bind(&mut self, axis: usize, to: ParallelAxis) -> Result<()> {
        self.check_axis(axis)?;
        self.axes[axis].bind = Some(to);
        Ok(())
    }

    /// Nest this stage inside `target`'s loop at depth `level`. Legality is
    /// checked when the function is lowered, once every reader is known.
    pub fn compute_at(&mut self, target: &Stage, level: usize) -> Result<()> {
        if target.name() == self.name() {
            return Err(StageError::ComputeAtCycle {
                stage: self.name().to_string(),
            }
            .into());
        }
        target.check_axis(level)?;
        self.compute_at = Some(ComputeAt {
            target: target.name().to_string(),
            level,
        });
        Ok(())
    }

    /// [`Stage::compute_at`] that also requires the loop prefix to match now.
    pub fn simple_compute_at(&mut self, target: &Stage, level: usize) -> Result<()> {
        if !self.prefix_congruent(target, level) {
            return Err(StageError::IllegalComputeAt {
                stage: self.name().to_string(),
                target: target.name().to_string(),
                detail: format!("loops 0..={level} do not match"),
            }
            .into());
        }
        self.compute_at(target, level)
    }

    /// Whether axes `0..=level` of both stages have equal trip structure and
    /// are all spatial.
    pub fn prefix_congruent(&self, target: &Stage, level: usize) -> bool {
        if self.axes.len() <= level || target.axes.len() <= level {
            return false;
        }
        self.axes[..=level]
            .iter()
            .zip(&target.axes[..=level])
            .all(|(a, b)| {
                a.extent == b.extent && !a.reduce && !b.reduce && a.bound.is_some() == b.bound.is_some()
            })
    }

    pub fn detach(&mut self) {
        self.compute_at = None;
    }

    /// Substitute this stage into its readers instead of materializing it.
    pub fn compute_inline(&mut self) -> Result<()> {
        if self.tensor.is_reduce() {
            return Err(StageError::CannotInline {
                stage: self.name().to_string(),
            }
            .into());
        }
        self.inlined = true;
        self.compute_at = None;
        Ok(())
    }

    pub fn set_buffer(&mut self, scope: BufferScope) {
        self.scope = scope;
    }

    pub fn share_buffer_with(&mut self, other: &Stage) {
        self.share_buffer_with = Some(other.name().to_string());
    }

    /// Reset, then replay `other`'s transform history on this stage.
    ///
    /// The leading spatial axes of `other`'s original domain must match this
    /// stage's leading axes.
    pub fn copy_transform(&mut self, other: &Stage) -> Result<()> {
        self.reset();
        self.replay(other)
    }

    /// Move `reduce_dims` last, then replay `reducer`'s transforms, so a
    /// producer of a reduction iterates the same way its reader does.
    pub fn assign_reduce(&mut self, reducer: &Stage, reduce_dims: &[usize]) -> Result<()> {
        self.reset();
        let n = self.axes.len();
        if let Some(bad) = reduce_dims.iter().find(|d| **d >= n) {
            self.check_axis(*bad)?;
        }
        let mut order: Vec<usize> = (0..n).filter(|d| !reduce_dims.contains(d)).collect();
        order.extend(reduce_dims.iter().copied());
        if order.iter().enumerate().any(|(pos, d)| pos != *d) {
            self.reorder(&order)?;
        }
        self.replay(reducer)
    }

    fn replay(&mut self, other: &Stage) -> Result<()> {
        let k = other.origin.iter().take_while(|a| !a.reduce).count();
        let matches = self.axes.len() >= k
            && self.axes[..k]
                .iter()
                .zip(&other.origin[..k])
                .all(|(mine, theirs)| mine.extent == theirs.extent && !mine.reduce);
        if !matches {
            return Err(StageError::AxisSetMismatch {
                stage: self.name().to_string(),
                detail: format!("cannot copy the loops of `{}`", other.name()),
            }
            .into());
        }
        for t in &other.history {
            self.apply(t).map_err(|e| StageError::AxisSetMismatch {
                stage: self.name().to_string(),
                detail: format!("replaying {t:?} from `{}`: {e}", other.name()),
            })?;
            self.history.push(t.clone());
        }
        Ok(())
    }

    /// Copy device bindings from `other`, position by position.
    pub fn copy_loop_info(&mut self, other: &Stage) -> Result<()> {
        for (pos, axis) in other.axes.iter().enumerate() {
            let Some(bind) = axis.bind else {
                continue;
            };
            match self.axes.get_mut(pos) {
                Some(mine) if mine.extent == axis.extent => mine.bind = Some(bind),
                _ => {
                    return Err(StageError::AxisSetMismatch {
                        stage: self.name().to_string(),
                        detail: format!(
                            "no loop matching `{}` of `{}` to bind",
                            axis.name,
                            other.name()
                        ),
                    }
                    .into())
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DType;

    fn stage(shape: &[usize]) -> Stage {
        let a = Tensor::placeholder("A", shape, DType::F32);
        let t = Tensor::compute("B", shape, DType::F32, vec![a.clone()], |idx| {
            a.at(idx.to_vec())
        });
        Stage::new(t).unwrap()
    }

    #[test]
    fn split_records_partial_tile_bound() {
        let mut s = stage(&[20]);
        s.split(0, 16).unwrap();
        assert_eq!(s.axes()[0].extent, 2);
        assert_eq!(s.axes()[1].extent, 16);
        assert_eq!(
            s.axes()[1].bound.as_ref().map(|b| b.to_string()),
            Some("kiln_min(16, (20 - (16 * i_outer)))".to_string())
        );
    }

    #[test]
    fn dividing_split_has_no_bound() {
        let mut s = stage(&[32]);
        s.split(0, 8).unwrap();
        assert!(s.axes()[1].bound.is_none());
        assert_eq!(s.index_map()[0].to_string(), "((8 * i_outer) + i_inner)");
    }

    #[test]
    fn tile_orders_outer_axes_first() {
        let mut s = stage(&[8, 8]);
        s.tile(0, 1, 4, 2).unwrap();
        let names: Vec<_> = s.axes().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["i_outer", "j_outer", "i_inner", "j_inner"]);
    }

    #[test]
    fn fuse_rewrites_index_map() {
        let mut s = stage(&[4, 5]);
        s.fuse(0, 1).unwrap();
        assert_eq!(s.axes().len(), 1);
        assert_eq!(s.axes()[0].extent, 20);
        assert_eq!(s.index_map()[0].to_string(), "(i_j_fused / 5)");
        assert_eq!(s.index_map()[1].to_string(), "(i_j_fused % 5)");
    }

    #[test]
    fn reorder_rejects_non_permutation() {
        let mut s = stage(&[4, 5]);
        let err = s.reorder(&[0, 0]).unwrap_err();
        assert!(matches!(
            err.stage_error(),
            Some(StageError::AxisSetMismatch { .. })
        ));
    }

    #[test]
    fn bounded_axis_cannot_move_before_its_outer() {
        let mut s = stage(&[20]);
        s.split(0, 16).unwrap();
        let err = s.reorder(&[1, 0]).unwrap_err();
        assert!(matches!(err.stage_error(), Some(StageError::BoundOrder { .. })));
    }

    #[test]
    fn copy_transform_replays_history() {
        let mut a = stage(&[4, 6]);
        a.fuse(0, 1).unwrap();
        a.split(0, 8).unwrap();
        let mut b = stage(&[4, 6]);
        b.split(1, 2).unwrap();
        b.copy_transform(&a).unwrap();
        assert_eq!(b.axes(), a.axes());
        assert_eq!(b.history(), a.history());
    }

    #[test]
    fn copy_transform_rejects_other_shapes() {
        let mut a = stage(&[4, 6]);
        a.fuse(0, 1).unwrap();
        let mut b = stage(&[6, 4]);
        assert!(b.copy_transform(&a).is_err());
    }
}
