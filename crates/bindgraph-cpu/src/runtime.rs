use std::time::Instant;

use bindgraph_core::{BindRequest, DeviceContext, Runtime, RuntimeResult, RuntimeStatus, Tensor, TensorSpec};
use bindgraph_symbol::SymbolGraph;

use crate::config::CpuRuntimeConfig;
use crate::plan::CpuPlan;

// CpuRuntime — Reference host-memory runtime
//
// Binds SymbolGraphs to tensors living on any host context (cpu, cpu_pinned,
// cpu_shared) and interprets them in f64. GPU placements are refused at
// allocation and bind time with UNSUPPORTED_DEVICE.

/// Status codes reported by [`CpuRuntime`].
pub mod status {
    /// Buffers or head gradients disagree with the plan.
    pub const INVALID_ARGUMENT: i32 = 1;
    /// A node or buffer was placed on a non-host device.
    pub const UNSUPPORTED_DEVICE: i32 = 2;
    /// Backward without activations from a training forward.
    pub const NOT_TRAINED: i32 = 3;
    /// Implicit head gradients requested for a non-loss output.
    pub const MISSING_HEAD_GRADIENT: i32 = 4;
    pub const INTERNAL: i32 = 5;
}

/// Host runtime interpreting [`SymbolGraph`]s.
#[derive(Debug, Clone, Default)]
pub struct CpuRuntime {
    config: CpuRuntimeConfig,
}

impl CpuRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CpuRuntimeConfig) -> Self {
        CpuRuntime { config }
    }

    pub fn config(&self) -> &CpuRuntimeConfig {
        &self.config
    }
}

impl Runtime for CpuRuntime {
    type Graph = SymbolGraph;
    type Plan = CpuPlan;

    fn name(&self) -> String {
        "cpu".to_string()
    }

    fn allocate(&self, spec: &TensorSpec, context: DeviceContext) -> RuntimeResult<Tensor> {
        if !context.kind.is_host() {
            return Err(RuntimeStatus::new(
                status::UNSUPPORTED_DEVICE,
                format!("cannot allocate {spec} on {context}"),
            ));
        }
        Ok(Tensor::zeros_like_spec(spec, context))
    }

    fn bind(
        &self,
        graph: &SymbolGraph,
        request: &BindRequest<'_, CpuPlan>,
    ) -> RuntimeResult<CpuPlan> {
        let plan = CpuPlan::build(&self.config, graph, request)?;
        tracing::debug!(
            nodes = plan.node_specs().len(),
            context = %request.context,
            shared_scratch = request.shared_plan.is_some(),
            "cpu plan bound"
        );
        Ok(plan)
    }

    fn output_count(&self, plan: &CpuPlan) -> usize {
        plan.output_count()
    }

    fn output(&self, plan: &CpuPlan, index: usize) -> RuntimeResult<Tensor> {
        plan.output(index)
    }

    fn forward(&self, plan: &mut CpuPlan, is_train: bool) -> RuntimeResult<()> {
        let start = Instant::now();
        plan.forward(is_train)?;
        tracing::trace!(
            is_train,
            duration_us = start.elapsed().as_micros() as u64,
            "cpu forward"
        );
        Ok(())
    }

    fn backward(
        &self,
        plan: &mut CpuPlan,
        head_gradients: &[Tensor],
    ) -> RuntimeResult<Vec<Option<Tensor>>> {
        let start = Instant::now();
        let grads = plan.backward(head_gradients)?;
        tracing::trace!(
            duration_us = start.elapsed().as_micros() as u64,
            "cpu backward"
        );
        Ok(grads)
    }

    fn debug_string(&self, plan: &CpuPlan) -> String {
        plan.debug_string()
    }

    fn release(&self, mut plan: CpuPlan) -> RuntimeResult<()> {
        plan.recycle();
        Ok(())
    }
}
