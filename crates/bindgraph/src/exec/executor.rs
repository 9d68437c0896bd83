// GraphExecutor — A graph bound to buffers on a device
//
// Lifecycle:
//
//   bind ──► Bound ──(forward / backward)──► Bound ──release / drop──► Released
//
// Bind validates every caller-supplied collection before the runtime sees
// it, so a bind failure never leaves a half-built executor reachable. Once
// bound, forward replaces the output list wholesale, backward commits each
// gradient contribution through the slot's WritePolicy, and release frees
// the plan exactly once. Released is terminal for everything that needs the
// plan.
//
// The executor holds handles to the caller's argument, gradient and
// auxiliary tensors; the caller keeps its own handles and may read or
// refill them between calls. Calls on one executor must come from a single
// caller in program order (`&mut self` on forward/backward enforces this).

use std::collections::HashMap;
use std::time::Instant;

use bindgraph_core::{
    DeviceContext, Error, ForwardMode, Graph, Phase, Result, Runtime, ShapeTable, Slot, SlotKind,
    Tensor, TensorSpec, WritePolicy,
};

use super::options::{BindArgs, BindOptions};
use super::update::{ParameterUpdateLoop, UpdateRange, UpdateRule};

fn mismatch(kind: SlotKind, index: usize, name: &str, expected: &TensorSpec, got: &TensorSpec) -> Error {
    Error::ShapeMismatch {
        slot: Slot::new(kind, index, name),
        expected: expected.clone(),
        got: got.clone(),
    }
}

fn check_count(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::InvalidArgumentCount {
            what,
            expected,
            got,
        });
    }
    Ok(())
}

fn position(names: &[String], what: &'static str, name: &str) -> Result<usize> {
    names
        .iter()
        .position(|n| n == name)
        .ok_or_else(|| Error::UnknownName {
            what,
            name: name.to_string(),
        })
}

/// A symbolic graph bound to concrete buffers for one primary device.
pub struct GraphExecutor<R: Runtime> {
    runtime: R,
    plan: Option<R::Plan>,
    context: DeviceContext,
    group_to_context: HashMap<String, DeviceContext>,
    arguments: Vec<Tensor>,
    argument_gradients: Vec<Option<Tensor>>,
    write_policies: Vec<WritePolicy>,
    auxiliary_states: Vec<Tensor>,
    outputs: Vec<Tensor>,
    shapes: ShapeTable,
    argument_names: Vec<String>,
    auxiliary_names: Vec<String>,
    output_names: Vec<String>,
    last_forward: Option<ForwardMode>,
}

impl<R: Runtime> std::fmt::Debug for GraphExecutor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphExecutor")
            .field("runtime", &self.runtime)
            .field("context", &self.context)
            .field("arguments", &self.argument_names)
            .field("outputs", &self.output_names)
            .field("write_policies", &self.write_policies)
            .field("last_forward", &self.last_forward)
            .field("released", &self.is_released())
            .finish()
    }
}

impl<R: Runtime> GraphExecutor<R> {
    // Binding

    /// Bind `graph` to the buffers in `args` on `context`.
    ///
    /// Checks run in a fixed order and the first failure is returned:
    ///
    /// 1. collection lengths (`InvalidArgumentCount`)
    /// 2. placement groups exist in the graph (`UnresolvedPlacement`)
    /// 3. every non-`NoOp` policy has a gradient buffer (`MissingGradient`)
    /// 4. argument, gradient and auxiliary specs (`ShapeMismatch`)
    /// 5. the runtime bind itself (`ExecutionError`)
    ///
    /// Outputs are collected before this returns.
    #[tracing::instrument(skip_all, fields(
        runtime = %runtime.name(),
        context = %context,
        arguments = args.arguments.len(),
    ))]
    pub fn bind(
        runtime: R,
        graph: &R::Graph,
        context: DeviceContext,
        args: BindArgs,
        options: BindOptions<'_, R>,
    ) -> Result<Self> {
        let start = Instant::now();
        let BindArgs {
            arguments,
            argument_gradients,
            write_policies,
            auxiliary_states,
        } = args;

        let argument_names = graph.argument_names();
        let auxiliary_names = graph.auxiliary_names();
        check_count("argument", argument_names.len(), arguments.len())?;
        check_count("argument gradient", arguments.len(), argument_gradients.len())?;
        check_count("write policy", argument_gradients.len(), write_policies.len())?;
        check_count("auxiliary state", auxiliary_names.len(), auxiliary_states.len())?;

        let groups = graph.context_groups();
        let mut requested: Vec<&String> = options.group_to_context.keys().collect();
        requested.sort();
        if let Some(group) = requested.into_iter().find(|g| !groups.contains(*g)) {
            return Err(Error::UnresolvedPlacement {
                group: group.clone(),
            });
        }

        for (index, (policy, grad)) in write_policies.iter().zip(&argument_gradients).enumerate() {
            if policy.needs_gradient() && grad.is_none() {
                return Err(Error::MissingGradient {
                    index,
                    policy: *policy,
                });
            }
        }

        let given: Vec<Option<TensorSpec>> =
            arguments.iter().map(|t| Some(t.spec().clone())).collect();
        let shapes = graph.infer_shapes(&given)?;
        check_count("inferred argument", arguments.len(), shapes.arguments.len())?;
        check_count("inferred auxiliary state", auxiliary_states.len(), shapes.auxiliary_states.len())?;
        for (i, (arg, expected)) in arguments.iter().zip(&shapes.arguments).enumerate() {
            if arg.spec() != expected {
                return Err(mismatch(SlotKind::Argument, i, &argument_names[i], expected, arg.spec()));
            }
        }
        for (i, (grad, expected)) in argument_gradients.iter().zip(&shapes.arguments).enumerate() {
            if let Some(grad) = grad {
                if grad.spec() != expected {
                    return Err(mismatch(SlotKind::Gradient, i, &argument_names[i], expected, grad.spec()));
                }
            }
        }
        for (i, (aux, expected)) in auxiliary_states.iter().zip(&shapes.auxiliary_states).enumerate() {
            if aux.spec() != expected {
                return Err(mismatch(SlotKind::Auxiliary, i, &auxiliary_names[i], expected, aux.spec()));
            }
        }

        let shared_plan = match options.shared_executor {
            Some(shared) => Some(shared.plan.as_ref().ok_or(Error::UseAfterRelease {
                operation: "bind with a shared executor",
            })?),
            None => None,
        };
        let request = bindgraph_core::BindRequest {
            context,
            group_to_context: &options.group_to_context,
            arguments: &arguments,
            argument_gradients: &argument_gradients,
            write_policies: &write_policies,
            auxiliary_states: &auxiliary_states,
            shapes: &shapes,
            shared_plan,
        };
        let plan = runtime
            .bind(graph, &request)
            .map_err(|s| Error::execution(Phase::Bind, s))?;

        let mut exec = GraphExecutor {
            runtime,
            plan: Some(plan),
            context,
            group_to_context: options.group_to_context,
            arguments,
            argument_gradients,
            write_policies,
            auxiliary_states,
            outputs: Vec::new(),
            shapes,
            argument_names,
            auxiliary_names,
            output_names: graph.output_names(),
            last_forward: None,
        };
        // On failure `exec` drops here and releases the plan.
        exec.refresh_outputs()?;

        tracing::debug!(
            duration_us = start.elapsed().as_micros() as u64,
            outputs = exec.outputs.len(),
            shared = shared_plan.is_some(),
            "executor bound"
        );
        Ok(exec)
    }

    /// Infer shapes from partial argument specs, allocate every buffer
    /// through the runtime, then [`GraphExecutor::bind`].
    pub fn simple_bind(
        runtime: R,
        graph: &R::Graph,
        context: DeviceContext,
        argument_specs: &[Option<TensorSpec>],
        write_policies: &[WritePolicy],
        options: BindOptions<'_, R>,
    ) -> Result<Self> {
        let args = BindArgs::allocate_for(&runtime, graph, context, argument_specs, write_policies)?;
        Self::bind(runtime, graph, context, args, options)
    }

    // Execution

    /// Re-query the runtime's output count and rebuild the output list.
    ///
    /// The list is replaced only once every handle has been obtained.
    fn refresh_outputs(&mut self) -> Result<()> {
        let plan = self
            .plan
            .as_ref()
            .ok_or(Error::UseAfterRelease { operation: "outputs" })?;
        let count = self.runtime.output_count(plan);
        let outputs = (0..count)
            .map(|i| {
                self.runtime
                    .output(plan, i)
                    .map_err(|s| Error::execution(Phase::Outputs, s))
            })
            .collect::<Result<Vec<_>>>()?;
        self.outputs = outputs;
        Ok(())
    }

    /// Evaluate the graph.
    ///
    /// Training mode runs dropout and batch-norm in their training form and
    /// retains what backward needs. Arguments are only read; auxiliary
    /// states may be updated in place. On failure the previous outputs stay
    /// visible and backward is refused until the next successful training
    /// forward.
    #[tracing::instrument(skip(self))]
    pub fn forward(&mut self, is_train: bool) -> Result<()> {
        let start = Instant::now();
        let Some(plan) = self.plan.as_mut() else {
            return Err(Error::UseAfterRelease {
                operation: "forward",
            });
        };
        if let Err(status) = self.runtime.forward(plan, is_train) {
            self.last_forward = None;
            return Err(Error::execution(Phase::Forward, status));
        }
        self.last_forward = Some(if is_train {
            ForwardMode::Training
        } else {
            ForwardMode::Inference
        });
        self.refresh_outputs()?;
        tracing::debug!(
            duration_us = start.elapsed().as_micros() as u64,
            outputs = self.outputs.len(),
            "forward complete"
        );
        Ok(())
    }

    /// Backpropagate `head_gradients` and commit every gradient slot by its
    /// write policy.
    ///
    /// An empty `head_gradients` asks the runtime for implicit unit
    /// gradients on loss outputs. Otherwise there must be one head gradient
    /// per output, matching that output's spec. Every contribution is
    /// checked before the executor commits any slot, so a failing backward
    /// leaves all executor-written slots untouched. A runtime that writes a
    /// `WriteInplace` slot itself has done so before that check.
    #[tracing::instrument(skip_all, fields(heads = head_gradients.len()))]
    pub fn backward(&mut self, head_gradients: &[Tensor]) -> Result<()> {
        let start = Instant::now();
        self.ensure_bound("backward")?;
        if self.last_forward != Some(ForwardMode::Training) {
            return Err(Error::PrecedenceViolation {
                last_forward: self.last_forward,
            });
        }
        if !head_gradients.is_empty() {
            check_count("head gradient", self.outputs.len(), head_gradients.len())?;
            for (i, (head, out)) in head_gradients.iter().zip(&self.outputs).enumerate() {
                if head.spec() != out.spec() {
                    let name = self.output_names.get(i).map(String::as_str).unwrap_or("");
                    return Err(mismatch(SlotKind::HeadGradient, i, name, out.spec(), head.spec()));
                }
            }
        }

        let Some(plan) = self.plan.as_mut() else {
            return Err(Error::UseAfterRelease {
                operation: "backward",
            });
        };
        let contributions = self
            .runtime
            .backward(plan, head_gradients)
            .map_err(|s| Error::execution(Phase::Backward, s))?;

        check_count("gradient contribution", self.arguments.len(), contributions.len())?;
        for (i, (policy, contribution)) in self.write_policies.iter().zip(&contributions).enumerate() {
            if !policy.needs_gradient() {
                continue;
            }
            let (Some(slot), Some(delta)) = (&self.argument_gradients[i], contribution) else {
                return Err(Error::execution(
                    Phase::Backward,
                    bindgraph_core::RuntimeStatus::new(
                        -1,
                        format!("runtime returned no gradient for argument {i} ({policy:?})"),
                    ),
                ));
            };
            if slot.spec() != delta.spec() {
                return Err(mismatch(SlotKind::Gradient, i, &self.argument_names[i], slot.spec(), delta.spec()));
            }
        }

        let mut written = 0usize;
        for (i, contribution) in contributions.iter().enumerate() {
            let policy = self.write_policies[i];
            if let (Some(slot), Some(delta)) = (&self.argument_gradients[i], contribution) {
                if policy.commit(slot, delta)? {
                    written += 1;
                    tracing::trace!(index = i, name = %self.argument_names[i], ?policy, "gradient committed");
                }
            }
        }

        tracing::debug!(
            duration_us = start.elapsed().as_micros() as u64,
            written,
            "backward complete"
        );
        Ok(())
    }

    /// Run `rule` over arguments `begin..end` (`end < 0` means all).
    pub fn update_all<U: UpdateRule + ?Sized>(
        &self,
        rule: &mut U,
        learning_rate: f64,
        weight_decay: f64,
        begin: usize,
        end: isize,
    ) -> Result<usize> {
        ParameterUpdateLoop::new(UpdateRange::from_signed(begin, end)).update_all(
            self,
            rule,
            learning_rate,
            weight_decay,
        )
    }

    // Release

    /// Free the bound plan. Calling this again is a no-op.
    #[tracing::instrument(skip(self))]
    pub fn release(&mut self) -> Result<()> {
        let Some(plan) = self.plan.take() else {
            return Ok(());
        };
        self.last_forward = None;
        self.runtime
            .release(plan)
            .map_err(|s| Error::execution(Phase::Release, s))?;
        tracing::debug!("executor released");
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.plan.is_none()
    }

    pub(crate) fn ensure_bound(&self, operation: &'static str) -> Result<()> {
        if self.plan.is_none() {
            return Err(Error::UseAfterRelease { operation });
        }
        Ok(())
    }

    // Diagnostics

    /// The runtime's dump of the bound plan.
    pub fn debug_string(&self) -> Result<String> {
        let plan = self.plan()?;
        Ok(self.runtime.debug_string(plan))
    }

    /// The bound plan, for runtime-specific inspection.
    pub fn plan(&self) -> Result<&R::Plan> {
        self.plan.as_ref().ok_or(Error::UseAfterRelease { operation: "plan" })
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn context(&self) -> DeviceContext {
        self.context
    }

    pub fn group_to_context(&self) -> &HashMap<String, DeviceContext> {
        &self.group_to_context
    }

    /// Specs inferred at bind time.
    pub fn shapes(&self) -> &ShapeTable {
        &self.shapes
    }

    /// Mode of the last successful forward since bind, if any.
    pub fn last_forward(&self) -> Option<ForwardMode> {
        self.last_forward
    }

    // Positional slots

    pub fn arguments(&self) -> &[Tensor] {
        &self.arguments
    }

    pub fn argument_gradients(&self) -> &[Option<Tensor>] {
        &self.argument_gradients
    }

    pub fn write_policies(&self) -> &[WritePolicy] {
        &self.write_policies
    }

    pub fn auxiliary_states(&self) -> &[Tensor] {
        &self.auxiliary_states
    }

    /// Output handles as of bind or the last successful forward.
    pub fn outputs(&self) -> &[Tensor] {
        &self.outputs
    }

    pub fn argument_names(&self) -> &[String] {
        &self.argument_names
    }

    pub fn auxiliary_names(&self) -> &[String] {
        &self.auxiliary_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    // Named slots

    pub fn argument(&self, name: &str) -> Result<&Tensor> {
        let i = position(&self.argument_names, "argument", name)?;
        Ok(&self.arguments[i])
    }

    /// Gradient buffer of argument `name`; `None` when it has no gradient.
    pub fn gradient(&self, name: &str) -> Result<Option<&Tensor>> {
        let i = position(&self.argument_names, "argument", name)?;
        Ok(self.argument_gradients[i].as_ref())
    }

    pub fn auxiliary_state(&self, name: &str) -> Result<&Tensor> {
        let i = position(&self.auxiliary_names, "auxiliary state", name)?;
        Ok(&self.auxiliary_states[i])
    }

    pub fn output(&self, name: &str) -> Result<&Tensor> {
        let i = position(&self.output_names, "output", name)?;
        self.outputs.get(i).ok_or(Error::InvalidArgumentCount {
            what: "output",
            expected: self.output_names.len(),
            got: self.outputs.len(),
        })
    }

    pub fn argument_map(&self) -> HashMap<String, Tensor> {
        self.argument_names
            .iter()
            .cloned()
            .zip(self.arguments.iter().cloned())
            .collect()
    }

    /// Gradient buffers keyed by argument name, for arguments that have one.
    pub fn gradient_map(&self) -> HashMap<String, Tensor> {
        self.argument_names
            .iter()
            .zip(&self.argument_gradients)
            .filter_map(|(name, g)| g.as_ref().map(|g| (name.clone(), g.clone())))
            .collect()
    }

    pub fn auxiliary_map(&self) -> HashMap<String, Tensor> {
        self.auxiliary_names
            .iter()
            .cloned()
            .zip(self.auxiliary_states.iter().cloned())
            .collect()
    }

    /// Copy parameter values into the bound buffers by name.
    ///
    /// Unknown names fail with `UnknownName` unless `allow_extra` is set.
    /// Values must match the bound spec exactly.
    pub fn copy_params_from(
        &self,
        arg_params: &HashMap<String, Tensor>,
        aux_params: Option<&HashMap<String, Tensor>>,
        allow_extra: bool,
    ) -> Result<()> {
        self.ensure_bound("copy_params_from")?;
        let empty = HashMap::new();
        let sources = [
            (arg_params, &self.argument_names, &self.arguments, SlotKind::Argument, "argument"),
            (
                aux_params.unwrap_or(&empty),
                &self.auxiliary_names,
                &self.auxiliary_states,
                SlotKind::Auxiliary,
                "auxiliary state",
            ),
        ];
        for (params, names, targets, kind, what) in sources {
            for (name, value) in params {
                let Some(i) = names.iter().position(|n| n == name) else {
                    if allow_extra {
                        continue;
                    }
                    return Err(Error::UnknownName {
                        what,
                        name: name.clone(),
                    });
                };
                let target = &targets[i];
                if target.spec() != value.spec() {
                    return Err(mismatch(kind, i, name, target.spec(), value.spec()));
                }
                target.copy_from(value)?;
            }
        }
        Ok(())
    }
}

impl<R: Runtime> Drop for GraphExecutor<R> {
    fn drop(&mut self) {
        if let Some(plan) = self.plan.take() {
            if let Err(status) = self.runtime.release(plan) {
                tracing::warn!(%status, "release failed while dropping executor");
            }
        }
    }
}
