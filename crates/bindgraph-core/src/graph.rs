use crate::error::Result;
use crate::spec::{ShapeTable, TensorSpec};

// Graph — The immutable symbolic computation an executor binds
//
// The executor only needs to know a graph's slot names, how many outputs it
// declares, which placement groups it uses, and what shapes/dtypes its slots
// take given the arguments the caller supplies. Everything else about the
// graph (its operators, its edges, how its backward pass is derived) stays
// behind the runtime that executes it.
//
// A graph is never mutated by binding and may back any number of executors.

/// Symbolic graph as seen by the executor.
pub trait Graph: Send + Sync {
    /// Argument names in binding order.
    fn argument_names(&self) -> Vec<String>;

    /// Auxiliary-state names in binding order.
    fn auxiliary_names(&self) -> Vec<String>;

    /// Output names in output order.
    fn output_names(&self) -> Vec<String>;

    /// Number of declared outputs.
    fn output_count(&self) -> usize {
        self.output_names().len()
    }

    /// Names of the placement groups the graph's nodes are tagged with.
    fn context_groups(&self) -> Vec<String>;

    /// Infer every slot's spec from the argument specs that are known.
    ///
    /// `given` is positionally aligned with [`Graph::argument_names`]; `None`
    /// marks an argument whose spec should be inferred. Disagreement between
    /// a given spec and what the graph requires is a
    /// [`crate::Error::ShapeMismatch`].
    fn infer_shapes(&self, given: &[Option<TensorSpec>]) -> Result<ShapeTable>;
}
