// Bind configuration
//
// BindArgs carries the four positional tensor collections a bind consumes;
// BindOptions carries everything optional. Both are plain structs with
// builder methods:
//
//   let args = BindArgs::new(vec![x, w])
//       .with_gradients(vec![None, Some(dw)], vec![WritePolicy::NoOp, WritePolicy::WriteTo]);
//   let opts = BindOptions::default().with_group("stage2", DeviceContext::cpu(1));

use std::collections::HashMap;
use std::fmt;

use bindgraph_core::{
    DeviceContext, Error, Graph, Phase, Result, Runtime, Tensor, TensorSpec, WritePolicy,
};

use super::executor::GraphExecutor;

/// Optional bind settings.
pub struct BindOptions<'a, R: Runtime> {
    /// Placement overrides keyed by context group (default: empty).
    pub group_to_context: HashMap<String, DeviceContext>,
    /// Executor whose plan memory the new executor may share (default: none).
    ///
    /// The caller keeps the donor bound for as long as any executor that
    /// shares its memory is in use. Releasing the donor first leaves the
    /// sharer's behavior up to the runtime.
    pub shared_executor: Option<&'a GraphExecutor<R>>,
}

impl<R: Runtime> Default for BindOptions<'_, R> {
    fn default() -> Self {
        BindOptions {
            group_to_context: HashMap::new(),
            shared_executor: None,
        }
    }
}

impl<R: Runtime> fmt::Debug for BindOptions<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindOptions")
            .field("group_to_context", &self.group_to_context)
            .field("shared_executor", &self.shared_executor.is_some())
            .finish()
    }
}

impl<'a, R: Runtime> BindOptions<'a, R> {
    /// Place nodes tagged with `group` on `context`.
    pub fn with_group(mut self, group: impl Into<String>, context: DeviceContext) -> Self {
        self.group_to_context.insert(group.into(), context);
        self
    }

    /// Share plan memory with `executor`.
    pub fn with_shared_executor(mut self, executor: &'a GraphExecutor<R>) -> Self {
        self.shared_executor = Some(executor);
        self
    }
}

/// The tensors a bind attaches to a graph's slots.
///
/// Every list is positionally aligned with the graph's name lists.
/// `argument_gradients` and `write_policies` are full length: an argument
/// that needs no gradient has `None` and [`WritePolicy::NoOp`].
#[derive(Debug, Clone, Default)]
pub struct BindArgs {
    pub arguments: Vec<Tensor>,
    pub argument_gradients: Vec<Option<Tensor>>,
    pub write_policies: Vec<WritePolicy>,
    pub auxiliary_states: Vec<Tensor>,
}

impl BindArgs {
    /// Arguments only; no gradients, no auxiliary states.
    pub fn new(arguments: Vec<Tensor>) -> Self {
        let n = arguments.len();
        BindArgs {
            arguments,
            argument_gradients: vec![None; n],
            write_policies: vec![WritePolicy::NoOp; n],
            auxiliary_states: Vec::new(),
        }
    }

    pub fn with_gradients(
        mut self,
        argument_gradients: Vec<Option<Tensor>>,
        write_policies: Vec<WritePolicy>,
    ) -> Self {
        self.argument_gradients = argument_gradients;
        self.write_policies = write_policies;
        self
    }

    pub fn with_auxiliary_states(mut self, auxiliary_states: Vec<Tensor>) -> Self {
        self.auxiliary_states = auxiliary_states;
        self
    }

    /// Allocate zeroed buffers for every slot of `graph`.
    ///
    /// `argument_specs` may leave entries as `None` for shape inference to
    /// fill in. A gradient buffer is allocated for each argument whose
    /// policy is not `NoOp`.
    pub fn allocate_for<R: Runtime>(
        runtime: &R,
        graph: &R::Graph,
        context: DeviceContext,
        argument_specs: &[Option<TensorSpec>],
        write_policies: &[WritePolicy],
    ) -> Result<BindArgs> {
        if write_policies.len() != argument_specs.len() {
            return Err(Error::InvalidArgumentCount {
                what: "write policy",
                expected: argument_specs.len(),
                got: write_policies.len(),
            });
        }
        let shapes = graph.infer_shapes(argument_specs)?;
        let alloc = |spec: &TensorSpec| {
            runtime
                .allocate(spec, context)
                .map_err(|s| Error::execution(Phase::Bind, s))
        };

        let mut arguments = Vec::with_capacity(shapes.arguments.len());
        let mut argument_gradients = Vec::with_capacity(shapes.arguments.len());
        for (spec, policy) in shapes.arguments.iter().zip(write_policies) {
            arguments.push(alloc(spec)?);
            argument_gradients.push(if policy.needs_gradient() {
                Some(alloc(spec)?)
            } else {
                None
            });
        }
        let auxiliary_states = shapes
            .auxiliary_states
            .iter()
            .map(alloc)
            .collect::<Result<Vec<_>>>()?;

        Ok(BindArgs {
            arguments,
            argument_gradients,
            write_policies: write_policies.to_vec(),
            auxiliary_states,
        })
    }
}
