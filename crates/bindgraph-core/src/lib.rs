//! # bindgraph-core
//!
//! Value types and collaborator seams for binding symbolic graphs to buffers.
//!
//! This crate provides:
//! - [`Tensor`] — reference-counted handle to a shape/dtype-tagged buffer
//! - [`DeviceContext`] — (device kind, index) placement
//! - [`DType`] / [`Shape`] / [`TensorSpec`] — slot descriptions
//! - [`WritePolicy`] — how computed gradients meet their buffers
//! - [`Graph`] trait — what an executor needs to know about a symbolic graph
//! - [`Runtime`] trait — the tensor runtime that builds and runs plans
//! - [`Error`] — the bind/execute failure taxonomy

pub mod context;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod runtime;
pub mod shape;
pub mod spec;
pub mod storage;
pub mod tensor;
pub mod write_policy;

pub use context::{DeviceContext, DeviceKind};
pub use dtype::{DType, WithDType};
pub use error::{Error, ForwardMode, Phase, Result, RuntimeStatus, Slot, SlotKind};
pub use graph::Graph;
pub use runtime::{BindRequest, Runtime, RuntimeResult};
pub use shape::Shape;
pub use spec::{ShapeTable, TensorSpec};
pub use storage::Storage;
pub use tensor::{RawHandle, Tensor, TensorId};
pub use write_policy::WritePolicy;
