//! # bindgraph
//!
//! Bind symbolic computation graphs to device buffers and drive them through
//! forward evaluation, backward evaluation and parameter updates.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use bindgraph::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `bindgraph-core` | Tensor, Shape, DType, DeviceContext, WritePolicy, Graph and Runtime traits, errors |
//! | `bindgraph-symbol` | Symbol builder, flattened SymbolGraph, shape inference |
//! | `bindgraph-cpu` | Reference host runtime with rayon kernels and a shared scratch pool |
//!
//! ## Modules
//!
//! - [`exec`] — GraphExecutor, bind configuration, the parameter update loop

/// Re-export core types.
pub use bindgraph_core::{
    BindRequest, DType, DeviceContext, DeviceKind, Error, ForwardMode, Graph, Phase, Result,
    Runtime, RuntimeResult, RuntimeStatus, Shape, ShapeTable, Slot, SlotKind, Tensor, TensorSpec,
    WithDType, WritePolicy,
};

/// Re-export the CPU runtime.
pub use bindgraph_cpu::{CpuPlan, CpuRuntime, CpuRuntimeConfig, PoolStats};

/// Re-export the symbolic graph builder.
pub mod symbol {
    pub use bindgraph_symbol::*;
}

/// Graph executor — binding, forward/backward, parameter updates.
pub mod exec;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::exec::{
        Adam, BindArgs, BindOptions, GraphExecutor, ParameterUpdateLoop, Sgd, UpdateRange,
        UpdateRule,
    };
    pub use crate::symbol::{Symbol, SymbolGraph};
    pub use crate::{
        CpuRuntime, CpuRuntimeConfig, DType, DeviceContext, Error, Graph, Result, Runtime, Shape,
        Tensor, TensorSpec, WritePolicy,
    };
}
