//! Per-tensor loop transforms over an abstract iteration space.

mod stage;
mod stage_map;

pub use stage::{ComputeAt, IterAxis, Stage, Transform};
pub use stage_map::StageMap;
