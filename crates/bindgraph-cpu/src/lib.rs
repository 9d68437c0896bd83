//! # bindgraph-cpu
//!
//! Reference host-memory runtime for bindgraph.
//!
//! [`CpuRuntime`] implements [`bindgraph_core::Runtime`] for
//! [`bindgraph_symbol::SymbolGraph`]: it builds a [`CpuPlan`] per bind,
//! interprets the graph in f64, computes per-operator vector-Jacobian
//! products on backward, and recycles activation buffers through a
//! [`ScratchPool`] that executors can share.
//!
//! Element-wise kernels move onto rayon's thread pool once a buffer reaches
//! [`CpuRuntimeConfig::parallel_threshold`] elements.

pub mod config;
pub mod kernels;
pub mod plan;
pub mod runtime;
pub mod scratch;

pub use config::CpuRuntimeConfig;
pub use plan::CpuPlan;
pub use runtime::{status, CpuRuntime};
pub use scratch::{PoolStats, ScratchPool};
