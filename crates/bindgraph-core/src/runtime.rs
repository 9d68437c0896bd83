use std::collections::HashMap;
use std::fmt;

use crate::context::DeviceContext;
use crate::error::RuntimeStatus;
use crate::graph::Graph;
use crate::spec::{ShapeTable, TensorSpec};
use crate::tensor::{RawHandle, Tensor};
use crate::write_policy::WritePolicy;

// Runtime — The tensor runtime an executor drives
//
// The runtime owns kernels, execution plans and the backward graph; the
// executor owns validation, the bind/forward/backward state machine, output
// refresh and write-policy commits. Every method that can fail returns a
// RuntimeStatus, the runtime's own status code, which the executor
// translates into its error taxonomy.
//
// WHY ASSOCIATED Graph AND Plan TYPES?
//
// A runtime can only bind graphs it understands, and its plans are opaque to
// everyone else. Associated types keep both concrete (no downcasting) while
// the executor stays generic over any runtime.
//
// Calls on one plan are issued in program order by a single caller. Running
// backward concurrently with an unfinished forward on the same plan is not
// supported; `&mut Plan` in the signatures enforces this for safe callers.

/// Result type for runtime calls.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeStatus>;

/// Everything a runtime needs to build an execution plan.
pub struct BindRequest<'a, P> {
    /// Placement for nodes without a group override.
    pub context: DeviceContext,
    /// Placement overrides keyed by group name.
    pub group_to_context: &'a HashMap<String, DeviceContext>,
    pub arguments: &'a [Tensor],
    /// Full-length, `None` where no gradient is requested.
    pub argument_gradients: &'a [Option<Tensor>],
    pub write_policies: &'a [WritePolicy],
    pub auxiliary_states: &'a [Tensor],
    /// Specs the executor validated the buffers against.
    pub shapes: &'a ShapeTable,
    /// Plan whose scratch memory the new plan should share.
    ///
    /// The caller guarantees the donor plan outlives the new one. A runtime
    /// whose shared memory is not reference-counted may rely on that and
    /// must document what happens when the donor is released first.
    pub shared_plan: Option<&'a P>,
}

impl<P> fmt::Debug for BindRequest<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindRequest")
            .field("context", &self.context)
            .field("group_to_context", self.group_to_context)
            .field("arguments", &self.arguments.len())
            .field("write_policies", &self.write_policies)
            .field("auxiliary_states", &self.auxiliary_states.len())
            .field("shared_plan", &self.shared_plan.is_some())
            .finish()
    }
}

/// A tensor runtime that can bind and execute graphs of type `Self::Graph`.
pub trait Runtime: Clone + Send + Sync + fmt::Debug + 'static {
    /// Graph type this runtime binds.
    type Graph: Graph;
    /// Opaque bound execution plan.
    type Plan: Send;

    /// Human-readable runtime name.
    fn name(&self) -> String;

    //  Tensor runtime

    /// Allocate a zeroed buffer on `context`.
    fn allocate(&self, spec: &TensorSpec, context: DeviceContext) -> RuntimeResult<Tensor> {
        Ok(Tensor::zeros_like_spec(spec, context))
    }

    /// Native address of a buffer.
    fn raw_handle(&self, tensor: &Tensor) -> RuntimeResult<RawHandle> {
        tensor
            .raw_handle()
            .map_err(|e| RuntimeStatus::new(-1, e.to_string()))
    }

    /// Give up one handle to a buffer.
    fn free(&self, tensor: Tensor) {
        drop(tensor);
    }

    //  Execution plans

    /// Build a plan binding `graph` to the buffers in `request`.
    fn bind(
        &self,
        graph: &Self::Graph,
        request: &BindRequest<'_, Self::Plan>,
    ) -> RuntimeResult<Self::Plan>;

    /// Number of outputs the plan currently exposes.
    fn output_count(&self, plan: &Self::Plan) -> usize;

    /// Handle to output `index` as of the last completed call.
    fn output(&self, plan: &Self::Plan, index: usize) -> RuntimeResult<Tensor>;

    /// Evaluate the graph. Training mode retains what backward needs.
    fn forward(&self, plan: &mut Self::Plan, is_train: bool) -> RuntimeResult<()>;

    /// Compute raw gradient contributions, one entry per argument.
    ///
    /// Entries for `NoOp` arguments are `None`. An empty `head_gradients`
    /// seeds implicit unit gradients on loss outputs. The runtime does not
    /// apply write policies; it may write a `WriteInplace` slot directly and
    /// return that very buffer, in which case that slot is written before
    /// the executor has validated the other contributions.
    fn backward(
        &self,
        plan: &mut Self::Plan,
        head_gradients: &[Tensor],
    ) -> RuntimeResult<Vec<Option<Tensor>>>;

    /// Human-readable dump of the plan.
    fn debug_string(&self, plan: &Self::Plan) -> String;

    /// Free the plan.
    fn release(&self, plan: Self::Plan) -> RuntimeResult<()>;
}
