//! Operator registry: per operator name, a pattern kind, a compute rule and an
//! optional schedule rule.
//!
//! The registry is assembled once through [`RegistryBuilder`] and is read-only
//! afterwards, so one instance can be shared by concurrent compilations.

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use crate::{
    graph::{AttrValue, Node},
    ir::Tensor,
    schedule::StageMap,
    DType, Error, OpPatternKind, Result, Target,
};

pub mod builtin;

/// Everything a compute rule may look at.
pub struct ComputeContext<'a> {
    pub node: &'a Node,
    pub inputs: Vec<Tensor>,
    pub out_shapes: Vec<Vec<usize>>,
    pub out_dtypes: Vec<DType>,
    pub out_names: Vec<String>,
    pub target: &'a Target,
}

impl ComputeContext<'_> {
    pub fn input(&self, i: usize) -> Result<&Tensor> {
        self.inputs.get(i).ok_or_else(|| {
            Error::import(
                &self.node.name,
                format!("expected at least {} inputs, got {}", i + 1, self.inputs.len()),
            )
        })
    }

    fn expect_output(&self, i: usize) -> Result<()> {
        if i >= self.out_names.len() {
            return Err(Error::import(
                &self.node.name,
                format!("expected at least {} outputs, got {}", i + 1, self.out_names.len()),
            ));
        }
        Ok(())
    }

    pub fn out_name(&self, i: usize) -> Result<&str> {
        self.expect_output(i)?;
        Ok(&self.out_names[i])
    }

    pub fn out_shape(&self, i: usize) -> Result<&[usize]> {
        self.expect_output(i)?;
        Ok(&self.out_shapes[i])
    }

    pub fn out_dtype(&self, i: usize) -> Result<DType> {
        self.expect_output(i)?;
        Ok(self.out_dtypes[i])
    }

    pub fn attr(&self, key: &str) -> Result<&AttrValue> {
        self.node
            .attr(key)
            .ok_or_else(|| Error::import(&self.node.name, format!("missing attribute `{key}`")))
    }

    pub fn attr_int(&self, key: &str) -> Result<i64> {
        self.attr(key)?.as_int().ok_or_else(|| {
            Error::import(&self.node.name, format!("attribute `{key}` is not an integer"))
        })
    }

    /// An integer-list attribute, as unsigned dims.
    pub fn attr_dims(&self, key: &str) -> Result<Vec<usize>> {
        let ints = self.attr(key)?.as_ints().ok_or_else(|| {
            Error::import(&self.node.name, format!("attribute `{key}` is not a list"))
        })?;
        ints.iter()
            .map(|v| {
                usize::try_from(*v).map_err(|_| {
                    Error::import(&self.node.name, format!("negative entry in `{key}`"))
                })
            })
            .collect()
    }

    pub fn attr_bool_or(&self, key: &str, default: bool) -> bool {
        self.node
            .attr(key)
            .and_then(AttrValue::as_bool)
            .unwrap_or(default)
    }
}

/// Tensors produced by a compute rule. `outputs[i]` defines node output `i`;
/// `helpers` are extra stages (e.g. the partial sums of a two-level
/// reduction) named `{output}_0`, `{output}_1`.
#[derive(Debug, Clone, Default)]
pub struct ComputeOutput {
    pub outputs: Vec<Tensor>,
    pub helpers: Vec<Tensor>,
}

impl ComputeOutput {
    pub fn single(t: Tensor) -> Self {
        Self {
            outputs: vec![t],
            helpers: Vec::new(),
        }
    }
}

/// What a schedule rule gets to see besides the stage map.
pub struct ScheduleContext<'a> {
    pub node: &'a Node,
    pub outputs: &'a [Tensor],
    pub helpers: &'a [Tensor],
    pub target: &'a Target,
}

pub type ComputeFn = Arc<dyn Fn(&ComputeContext) -> Result<ComputeOutput> + Send + Sync>;
pub type ScheduleFn = Arc<dyn Fn(&mut StageMap, &ScheduleContext) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct OpEntry {
    pub name: String,
    pub pattern: OpPatternKind,
    pub compute: ComputeFn,
    pub schedule: Option<ScheduleFn>,
}

impl OpEntry {
    pub fn new(
        name: impl Into<String>,
        pattern: OpPatternKind,
        compute: impl Fn(&ComputeContext) -> Result<ComputeOutput> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            pattern,
            compute: Arc::new(compute),
            schedule: None,
        }
    }

    pub fn with_schedule(
        mut self,
        schedule: impl Fn(&mut StageMap, &ScheduleContext) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.schedule = Some(Arc::new(schedule));
        self
    }
}

impl Debug for OpEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpEntry")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("schedule", &self.schedule.is_some())
            .finish()
    }
}

/// Mutable startup phase of an [`OpRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: HashMap<String, OpEntry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry`, replacing an earlier entry of the same name.
    pub fn register(&mut self, entry: OpEntry) -> &mut Self {
        self.entries.insert(entry.name.clone(), entry);
        self
    }

    pub fn build(self) -> OpRegistry {
        OpRegistry {
            entries: self.entries,
        }
    }
}

/// Immutable operator table.
#[derive(Debug)]
pub struct OpRegistry {
    entries: HashMap<String, OpEntry>,
}

impl OpRegistry {
    /// A registry holding the builtin operator set.
    pub fn with_builtins() -> Self {
        let mut builder = RegistryBuilder::new();
        builtin::register_builtins(&mut builder);
        builder.build()
    }

    pub fn get(&self, op: &str) -> Option<&OpEntry> {
        self.entries.get(op)
    }

    pub fn contains(&self, op: &str) -> bool {
        self.entries.contains_key(op)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
