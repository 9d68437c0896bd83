use std::fmt;

use crate::dtype::DType;
use crate::shape::Shape;
use crate::spec::TensorSpec;
use crate::write_policy::WritePolicy;

// Error — Failure taxonomy for binding and executing graphs
//
// Bind-time failures (ShapeMismatch, InvalidArgumentCount, UnresolvedPlacement,
// MissingGradient) are raised before any executor becomes reachable.
// ExecutionError wraps every non-zero status a runtime reports, tagged with the
// phase it happened in. PrecedenceViolation and UseAfterRelease guard the
// executor's state machine.

/// Which family of bound slots a [`Slot`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Argument,
    Gradient,
    Auxiliary,
    Output,
    HeadGradient,
    /// An interior graph node (reported by shape inference).
    Node,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotKind::Argument => "argument",
            SlotKind::Gradient => "gradient",
            SlotKind::Auxiliary => "auxiliary state",
            SlotKind::Output => "output",
            SlotKind::HeadGradient => "head gradient",
            SlotKind::Node => "node",
        };
        write!(f, "{}", s)
    }
}

/// Identifies one bound slot by kind, position and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub kind: SlotKind,
    pub index: usize,
    pub name: String,
}

impl Slot {
    pub fn new(kind: SlotKind, index: usize, name: impl Into<String>) -> Self {
        Slot {
            kind,
            index,
            name: name.into(),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ('{}')", self.kind, self.index, self.name)
    }
}

/// The executor call during which a runtime failure surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Bind,
    Outputs,
    Forward,
    Backward,
    Release,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Bind => "bind",
            Phase::Outputs => "output refresh",
            Phase::Forward => "forward",
            Phase::Backward => "backward",
            Phase::Release => "release",
        };
        write!(f, "{}", s)
    }
}

/// Mode of the most recent successful forward pass, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    Training,
    Inference,
}

/// A non-zero status reported by a tensor runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("runtime status {code}: {message}")]
pub struct RuntimeStatus {
    pub code: i32,
    pub message: String,
}

impl RuntimeStatus {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        RuntimeStatus {
            code,
            message: message.into(),
        }
    }
}

/// All errors that can occur while binding or driving a graph.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A supplied buffer disagrees with the shape/dtype inferred for its slot.
    #[error("shape mismatch at {slot}: expected {expected}, got {got}")]
    ShapeMismatch {
        slot: Slot,
        expected: TensorSpec,
        got: TensorSpec,
    },

    /// Positional slot collections have inconsistent lengths.
    #[error("invalid {what} count: expected {expected}, got {got}")]
    InvalidArgumentCount {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// The group-to-context map names a group the graph never declares.
    #[error("context group '{group}' is not declared by the graph")]
    UnresolvedPlacement { group: String },

    /// A write policy other than NoOp was paired with the "no tensor" placeholder.
    #[error("argument {index} has write policy {policy:?} but no gradient buffer")]
    MissingGradient { index: usize, policy: WritePolicy },

    /// The runtime reported a failure.
    #[error("execution failed during {phase}: {status}")]
    ExecutionError { phase: Phase, status: RuntimeStatus },

    /// Backward was requested without a preceding training-mode forward.
    #[error("backward requires a preceding forward(is_train=true); last forward: {last_forward:?}")]
    PrecedenceViolation { last_forward: Option<ForwardMode> },

    /// The executor has been released.
    #[error("{operation} called on a released executor")]
    UseAfterRelease { operation: &'static str },

    /// A name did not resolve to any slot.
    #[error("unknown {what} name '{name}'")]
    UnknownName { what: &'static str, name: String },

    /// Element count mismatch when filling a buffer.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Element type mismatch between two buffers.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Dimension index out of range for the shape's rank.
    #[error("dimension out of range: dim {dim} for shape with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Wrap a runtime status reported during `phase`.
    pub fn execution(phase: Phase, status: RuntimeStatus) -> Self {
        Error::ExecutionError { phase, status }
    }

    /// Whether this error was raised by bind-time validation.
    pub fn is_bind_error(&self) -> bool {
        matches!(
            self,
            Error::ShapeMismatch { .. }
                | Error::InvalidArgumentCount { .. }
                | Error::UnresolvedPlacement { .. }
                | Error::MissingGradient { .. }
        )
    }
}

/// Convenience Result type used throughout bindgraph.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
