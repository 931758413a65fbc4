use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fmt::Display,
};

/// Schedule legality failures raised by [`crate::Stage`] transforms and by loop lowering.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("stage `{stage}`: axis {axis} out of range ({len} axes)")]
    AxisOutOfRange {
        stage: String,
        axis: usize,
        len: usize,
    },

    #[error("stage `{stage}`: axis-set mismatch: {detail}")]
    AxisSetMismatch { stage: String, detail: String },

    #[error("stage `{stage}`: invalid split factor {factor}")]
    InvalidFactor { stage: String, factor: usize },

    #[error("stage `{stage}`: cannot fuse axes: {detail}")]
    IllegalFuse { stage: String, detail: String },

    #[error("stage `{stage}`: axis `{axis}` would precede an axis its bound depends on")]
    BoundOrder { stage: String, axis: String },

    #[error("stage `{stage}`: illegal compute_at into `{target}`: {detail}")]
    IllegalComputeAt {
        stage: String,
        target: String,
        detail: String,
    },

    #[error("stage `{stage}`: compute_at relation forms a cycle")]
    ComputeAtCycle { stage: String },

    #[error("stage `{stage}`: reductions cannot be inlined")]
    CannotInline { stage: String },

    #[error("no stage named `{0}`")]
    MissingStage(String),
}

impl StageError {
    /// Name of the stage the failure is reported against.
    pub fn stage(&self) -> &str {
        match self {
            Self::AxisOutOfRange { stage, .. }
            | Self::AxisSetMismatch { stage, .. }
            | Self::InvalidFactor { stage, .. }
            | Self::IllegalFuse { stage, .. }
            | Self::BoundOrder { stage, .. }
            | Self::IllegalComputeAt { stage, .. }
            | Self::ComputeAtCycle { stage }
            | Self::CannotInline { stage } => stage,
            Self::MissingStage(stage) => stage,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Message: {0}")]
    Msg(String),

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<Backtrace>,
    },

    /// Writing the source dump or running graphviz failed.
    #[error("IO error: {0}")]
    IoError(String),

    /// Malformed graph: missing shape/type information, bad arity, no outputs.
    #[error("import error at node `{node}`: {msg}")]
    Import { node: String, msg: String },

    #[error("graph is not a DAG")]
    GraphNotDag,

    #[error("in-order links are stale, call `Graph::refresh_links` after editing the topology")]
    StaleLinks,

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("failed to lower group {group} at node `{node}`: {source}")]
    Lowering {
        group: usize,
        node: String,
        #[source]
        source: Box<Error>,
    },

    #[error("operator `{0}` has no registered compute rule")]
    UnregisteredOp(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// An internal invariant broke. Carries a backtrace when `RUST_BACKTRACE` is set.
    pub fn msg(msg: impl Display) -> Self {
        Self::Msg(msg.to_string()).bt()
    }

    /// Attach the current backtrace, if capturing is enabled.
    pub fn bt(self) -> Self {
        let captured = Backtrace::capture();
        if captured.status() != BacktraceStatus::Captured {
            return self;
        }
        Self::WithBacktrace {
            inner: Box::new(self),
            backtrace: Box::new(captured),
        }
    }

    /// Strip any backtrace wrapper and return the underlying error.
    pub fn root(&self) -> &Self {
        match self {
            Self::WithBacktrace { inner, .. } => inner.root(),
            other => other,
        }
    }

    /// The schedule failure at the bottom of this error, if there is one.
    pub fn stage_error(&self) -> Option<&StageError> {
        match self.root() {
            Self::Stage(e) => Some(e),
            Self::Lowering { source, .. } => source.stage_error(),
            _ => None,
        }
    }

    pub(crate) fn import(node: impl Display, msg: impl Display) -> Self {
        Self::Import {
            node: node.to_string(),
            msg: msg.to_string(),
        }
    }

    pub(crate) fn runtime(msg: impl Display) -> Self {
        Self::Runtime(msg.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

#[macro_export]
macro_rules! bail {
    ($($fmt:tt)+) => {
        return Err($crate::Error::msg(format!($($fmt)+)))
    };
}
