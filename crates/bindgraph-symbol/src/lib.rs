//! # bindgraph-symbol
//!
//! Symbolic graph construction for bindgraph.
//!
//! - [`Symbol`] — immutable, composable expression DAG with operator methods
//! - [`SymbolGraph`] — flattened form implementing [`bindgraph_core::Graph`]
//! - [`OpKind`] — the operator set the reference runtime understands
//!
//! ```ignore
//! use bindgraph_symbol::Symbol;
//!
//! let x = Symbol::variable("x");
//! let w = Symbol::variable("w");
//! let graph = (&x * &w).to_graph()?;
//! ```

pub mod graph;
mod infer;
pub mod op;
pub mod symbol;

pub use graph::{AuxSlot, GraphNode, SymbolGraph};
pub use op::{AuxStat, OpKind};
pub use symbol::{NodeAttrs, NodeId, Symbol};
