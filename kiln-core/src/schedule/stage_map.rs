use std::collections::HashMap;

use super::Stage;
use crate::{buffer::BufferScope, error::StageError, ir::Tensor, Result};

/// Stages keyed by tensor name, iterated in insertion order.
#[derive(Debug, Clone, Default)]
pub struct StageMap {
    stages: Vec<Stage>,
    index: HashMap<String, usize>,
}

impl StageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// One fresh stage per compute tensor; placeholders are skipped.
    pub fn from_tensors(tensors: &[Tensor]) -> Result<Self> {
        let mut map = Self::new();
        for t in tensors {
            map.insert_lazily(t)?;
        }
        Ok(map)
    }

    /// Insert or replace, keeping the original position on replacement.
    pub fn insert(&mut self, stage: Stage) {
        match self.index.get(stage.name()) {
            Some(pos) => self.stages[*pos] = stage,
            None => {
                self.index.insert(stage.name().to_string(), self.stages.len());
                self.stages.push(stage);
            }
        }
    }

    /// Create a stage for `tensor` unless one exists already.
    pub fn insert_lazily(&mut self, tensor: &Tensor) -> Result<()> {
        if tensor.is_placeholder() || self.contains(tensor.name()) {
            return Ok(());
        }
        self.insert(Stage::new(tensor.clone())?);
        Ok(())
    }

    /// Move every stage of `other` in; existing entries win.
    pub fn merge(&mut self, other: StageMap) {
        for stage in other.stages {
            if !self.contains(stage.name()) {
                self.insert(stage);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.index.get(name).map(|i| &self.stages[*i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Stage> {
        self.index.get(name).map(|i| &mut self.stages[*i])
    }

    pub fn expect(&self, name: &str) -> Result<&Stage> {
        Ok(self
            .get(name)
            .ok_or_else(|| StageError::MissingStage(name.to_string()))?)
    }

    pub fn expect_mut(&mut self, name: &str) -> Result<&mut Stage> {
        Ok(self
            .get_mut(name)
            .ok_or_else(|| StageError::MissingStage(name.to_string()))?)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Position of `name` in insertion order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn copy_transform(&mut self, dst: &str, src: &str) -> Result<()> {
        let src = self.expect(src)?.clone();
        self.expect_mut(dst)?.copy_transform(&src)
    }

    pub fn copy_loop_info(&mut self, dst: &str, src: &str) -> Result<()> {
        let src = self.expect(src)?.clone();
        self.expect_mut(dst)?.copy_loop_info(&src)
    }

    pub fn assign_reduce(&mut self, dst: &str, reducer: &str, reduce_dims: &[usize]) -> Result<()> {
        let reducer = self.expect(reducer)?.clone();
        self.expect_mut(dst)?.assign_reduce(&reducer, reduce_dims)
    }

    pub fn compute_at(&mut self, dst: &str, target: &str, level: usize) -> Result<()> {
        let target = self.expect(target)?.clone();
        self.expect_mut(dst)?.compute_at(&target, level)
    }

    pub fn simple_compute_at(&mut self, dst: &str, target: &str, level: usize) -> Result<()> {
        let target = self.expect(target)?.clone();
        self.expect_mut(dst)?.simple_compute_at(&target, level)
    }

    pub fn share_buffer_with(&mut self, dst: &str, src: &str) -> Result<()> {
        let src = self.expect(src)?.clone();
        self.expect_mut(dst)?.share_buffer_with(&src);
        Ok(())
    }

    pub fn compute_inline(&mut self, name: &str) -> Result<()> {
        self.expect_mut(name)?.compute_inline()
    }

    pub fn set_buffer(&mut self, name: &str, scope: BufferScope) -> Result<()> {
        self.expect_mut(name)?.set_buffer(scope);
        Ok(())
    }
}
