// CpuPlan — A SymbolGraph bound to host buffers
//
// Binding resolves everything that does not change between calls: per-node
// specs (re-inferred from the argument buffers), per-node placement, which
// nodes lie on a path to a trainable argument, and the initial output
// tensors. Forward then interprets the graph node by node in topological
// order; backward walks it in reverse applying each operator's
// vector-Jacobian product.
//
// Training forward keeps every node value (plus dropout masks and batch
// statistics) for backward. Inference forward hands all of them back to the
// scratch pool as soon as the outputs are written.
//
// Each forward produces brand-new output tensors, so a handle taken after
// one call keeps that call's values. Every buffer handed back to the pool
// came out of it: argument and head-gradient values are copied into pooled
// buffers, never donated. Gradient contributions are always fresh tensors;
// the executor writes the bound slots.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use bindgraph_core::{
    BindRequest, DeviceContext, Error, RuntimeResult, RuntimeStatus, Tensor, TensorSpec,
    WritePolicy,
};
use bindgraph_symbol::{AuxStat, GraphNode, OpKind, SymbolGraph};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::CpuRuntimeConfig;
use crate::kernels::{self, Kernels};
use crate::scratch::{PoolStats, ScratchPool};
use crate::status;

fn internal(e: Error) -> RuntimeStatus {
    RuntimeStatus::new(status::INTERNAL, e.to_string())
}

fn invalid(message: impl Into<String>) -> RuntimeStatus {
    RuntimeStatus::new(status::INVALID_ARGUMENT, message)
}

fn value(values: &[Option<Vec<f64>>], idx: usize) -> RuntimeResult<&[f64]> {
    values
        .get(idx)
        .and_then(|v| v.as_deref())
        .ok_or_else(|| RuntimeStatus::new(status::INTERNAL, format!("node {idx} has no value")))
}

/// Batch statistics a training forward used, kept for backward.
struct BatchStats {
    mean: Vec<f64>,
    inv_std: Vec<f64>,
}

/// Execution plan produced by [`crate::CpuRuntime`].
pub struct CpuPlan {
    graph: SymbolGraph,
    specs: Vec<TensorSpec>,
    placements: Vec<DeviceContext>,
    arguments: Vec<Tensor>,
    policies: Vec<WritePolicy>,
    auxiliary: Vec<Tensor>,
    /// Node lies on a path from an argument that wants a gradient.
    needs_grad: Vec<bool>,
    outputs: Vec<Tensor>,
    values: Vec<Option<Vec<f64>>>,
    masks: HashMap<usize, Vec<f64>>,
    batch_stats: HashMap<usize, BatchStats>,
    retained: bool,
    pool: Arc<ScratchPool>,
    rng: StdRng,
    kernels: Kernels,
    forward_count: u64,
    shares_pool: bool,
}

impl fmt::Debug for CpuPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuPlan")
            .field("nodes", &self.specs.len())
            .field("arguments", &self.arguments.len())
            .field("outputs", &self.outputs.len())
            .field("retained", &self.retained)
            .field("forward_count", &self.forward_count)
            .finish()
    }
}

impl CpuPlan {
    pub(crate) fn build(
        config: &CpuRuntimeConfig,
        graph: &SymbolGraph,
        request: &BindRequest<'_, CpuPlan>,
    ) -> RuntimeResult<CpuPlan> {
        let arg_nodes = graph.argument_nodes();
        let n_args = request.arguments.len();
        if n_args != arg_nodes.len() {
            return Err(invalid(format!(
                "expected {} arguments, got {}",
                arg_nodes.len(),
                n_args
            )));
        }
        if request.argument_gradients.len() != n_args || request.write_policies.len() != n_args {
            return Err(invalid(format!(
                "gradient and policy lists must have {n_args} entries, got {} and {}",
                request.argument_gradients.len(),
                request.write_policies.len()
            )));
        }
        if request.auxiliary_states.len() != graph.auxiliary_slots().len() {
            return Err(invalid(format!(
                "expected {} auxiliary states, got {}",
                graph.auxiliary_slots().len(),
                request.auxiliary_states.len()
            )));
        }

        let given: Vec<Option<TensorSpec>> = request
            .arguments
            .iter()
            .map(|t| Some(t.spec().clone()))
            .collect();
        let specs = graph
            .infer_node_specs(&given)
            .map_err(|e| invalid(e.to_string()))?;

        let placements: Vec<DeviceContext> = graph
            .nodes()
            .iter()
            .map(|node| {
                node.ctx_group
                    .as_ref()
                    .and_then(|g| request.group_to_context.get(g))
                    .copied()
                    .unwrap_or(request.context)
            })
            .collect();
        for (node, ctx) in graph.nodes().iter().zip(&placements) {
            if !ctx.kind.is_host() {
                return Err(RuntimeStatus::new(
                    status::UNSUPPORTED_DEVICE,
                    format!("cannot place node '{}' on {}", node.name, ctx),
                ));
            }
        }

        let mut needs_grad = vec![false; graph.nodes().len()];
        for (i, node) in graph.nodes().iter().enumerate() {
            needs_grad[i] = match graph.argument_position(i) {
                Some(pos) => request.write_policies[pos].needs_gradient(),
                None => node.inputs.iter().any(|&j| needs_grad[j]),
            };
        }

        let outputs = graph
            .output_nodes()
            .iter()
            .map(|&i| Tensor::zeros_like_spec(&specs[i], placements[i]))
            .collect();

        let (pool, shares_pool) = match request.shared_plan {
            Some(donor) => (Arc::clone(&donor.pool), true),
            None => (Arc::new(ScratchPool::new()), false),
        };

        Ok(CpuPlan {
            graph: graph.clone(),
            values: vec![None; specs.len()],
            specs,
            placements,
            arguments: request.arguments.to_vec(),
            policies: request.write_policies.to_vec(),
            auxiliary: request.auxiliary_states.to_vec(),
            needs_grad,
            outputs,
            masks: HashMap::new(),
            batch_stats: HashMap::new(),
            retained: false,
            pool,
            rng: StdRng::seed_from_u64(config.seed),
            kernels: Kernels::new(config.parallel_threshold),
            forward_count: 0,
            shares_pool,
        })
    }

    // Accessors

    pub fn graph(&self) -> &SymbolGraph {
        &self.graph
    }

    /// Inferred spec of every node, in topological order.
    pub fn node_specs(&self) -> &[TensorSpec] {
        &self.specs
    }

    /// Resolved placement of every node.
    pub fn placements(&self) -> &[DeviceContext] {
        &self.placements
    }

    /// Whether the last forward kept activations for backward.
    pub fn has_retained_activations(&self) -> bool {
        self.retained
    }

    pub fn forward_count(&self) -> u64 {
        self.forward_count
    }

    pub fn scratch_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Whether this plan and `other` recycle buffers through the same pool.
    pub fn shares_scratch_with(&self, other: &CpuPlan) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool)
    }

    pub(crate) fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub(crate) fn output(&self, index: usize) -> RuntimeResult<Tensor> {
        self.outputs.get(index).cloned().ok_or_else(|| {
            invalid(format!(
                "output index {index} out of range for {} outputs",
                self.outputs.len()
            ))
        })
    }

    /// Hand every retained buffer back to the pool.
    pub(crate) fn recycle(&mut self) {
        for v in self.values.iter_mut().filter_map(Option::take) {
            self.pool.give(v);
        }
        for (_, mask) in self.masks.drain() {
            self.pool.give(mask);
        }
        self.batch_stats.clear();
        self.retained = false;
    }

    // Forward

    pub(crate) fn forward(&mut self, is_train: bool) -> RuntimeResult<()> {
        self.recycle();
        let graph = self.graph.clone();
        let mut values: Vec<Option<Vec<f64>>> = vec![None; graph.nodes().len()];
        for (idx, node) in graph.nodes().iter().enumerate() {
            let out = self.eval_node(idx, node, &values, is_train)?;
            values[idx] = Some(out);
        }

        let mut outputs = Vec::with_capacity(graph.output_nodes().len());
        for &idx in graph.output_nodes() {
            let spec = &self.specs[idx];
            let data = value(&values, idx)?;
            let tensor = Tensor::from_f64_slice(
                data,
                spec.shape.clone(),
                spec.dtype,
                self.placements[idx],
            )
            .map_err(internal)?;
            outputs.push(tensor);
        }
        self.outputs = outputs;

        if is_train {
            self.values = values;
            self.retained = true;
        } else {
            for v in values.into_iter().flatten() {
                self.pool.give(v);
            }
        }
        self.forward_count += 1;
        Ok(())
    }

    fn map1<F>(&self, a: &[f64], f: F) -> Vec<f64>
    where
        F: Fn(f64) -> f64 + Sync + Send,
    {
        let mut out = self.pool.take(a.len());
        self.kernels.unary(&mut out, a, f);
        out
    }

    fn map2<F>(&self, a: &[f64], b: &[f64], f: F) -> Vec<f64>
    where
        F: Fn(f64, f64) -> f64 + Sync + Send,
    {
        let mut out = self.pool.take(a.len());
        self.kernels.binary(&mut out, a, b, f);
        out
    }

    fn copy(&self, a: &[f64]) -> Vec<f64> {
        let mut out = self.pool.take(a.len());
        out.copy_from_slice(a);
        out
    }

    fn aux_tensor(&self, node: &GraphNode, stat: AuxStat) -> RuntimeResult<Tensor> {
        node.aux
            .iter()
            .find(|&&a| self.graph.auxiliary_slots()[a].stat == stat)
            .map(|&a| self.auxiliary[a].clone())
            .ok_or_else(|| {
                RuntimeStatus::new(
                    status::INTERNAL,
                    format!("node '{}' has no {} state", node.name, stat.suffix()),
                )
            })
    }

    fn matrix_dims(&self, idx: usize) -> (usize, usize) {
        let dims = self.specs[idx].shape.dims();
        (dims[0], dims[1])
    }

    fn eval_node(
        &mut self,
        idx: usize,
        node: &GraphNode,
        values: &[Option<Vec<f64>>],
        is_train: bool,
    ) -> RuntimeResult<Vec<f64>> {
        let inputs = &node.inputs;
        let out = match &node.op {
            OpKind::Variable => {
                let pos = self.graph.argument_position(idx).ok_or_else(|| {
                    RuntimeStatus::new(status::INTERNAL, format!("'{}' is not an argument", node.name))
                })?;
                let data = self.arguments[pos].to_f64_vec().map_err(internal)?;
                self.copy(&data)
            }
            OpKind::Add => self.map2(value(values, inputs[0])?, value(values, inputs[1])?, |a, b| a + b),
            OpKind::Sub => self.map2(value(values, inputs[0])?, value(values, inputs[1])?, |a, b| a - b),
            OpKind::Mul => self.map2(value(values, inputs[0])?, value(values, inputs[1])?, |a, b| a * b),
            OpKind::Div => self.map2(value(values, inputs[0])?, value(values, inputs[1])?, |a, b| a / b),
            OpKind::AddScalar(s) => {
                let s = *s;
                self.map1(value(values, inputs[0])?, move |a| a + s)
            }
            OpKind::MulScalar(s) => {
                let s = *s;
                self.map1(value(values, inputs[0])?, move |a| a * s)
            }
            OpKind::Relu => self.map1(value(values, inputs[0])?, |a| a.max(0.0)),
            OpKind::Sigmoid => self.map1(value(values, inputs[0])?, |a| 1.0 / (1.0 + (-a).exp())),
            OpKind::Tanh => self.map1(value(values, inputs[0])?, f64::tanh),
            OpKind::MakeLoss => self.copy(value(values, inputs[0])?),
            OpKind::Sum => {
                let mut out = self.pool.take(1);
                out[0] = self.kernels.sum(value(values, inputs[0])?);
                out
            }
            OpKind::Dot => {
                let (m, k) = self.matrix_dims(inputs[0]);
                let (_, n) = self.matrix_dims(inputs[1]);
                let mut out = self.pool.take(m * n);
                self.kernels.matmul(
                    &mut out,
                    value(values, inputs[0])?,
                    value(values, inputs[1])?,
                    m,
                    k,
                    n,
                );
                out
            }
            OpKind::Dropout { p } => {
                let x = value(values, inputs[0])?;
                if is_train {
                    let p = *p;
                    let keep = 1.0 / (1.0 - p);
                    let mut mask = self.pool.take(x.len());
                    for m in mask.iter_mut() {
                        *m = if self.rng.gen::<f64>() < p { 0.0 } else { keep };
                    }
                    let out = self.map2(x, &mask, |a, m| a * m);
                    self.masks.insert(idx, mask);
                    out
                } else {
                    self.copy(x)
                }
            }
            OpKind::BatchNorm { eps, momentum } => {
                let x = value(values, inputs[0])?;
                let gamma = value(values, inputs[1])?;
                let beta = value(values, inputs[2])?;
                let dims = self.specs[inputs[0]].shape.dims().to_vec();
                let moving_mean = self.aux_tensor(node, AuxStat::MovingMean)?;
                let moving_var = self.aux_tensor(node, AuxStat::MovingVar)?;

                let (mean, var) = if is_train {
                    let (mean, var) = kernels::channel_stats(x, &dims);
                    let m = *momentum;
                    let blend = |moving: Vec<f64>, batch: &[f64]| -> Vec<f64> {
                        moving
                            .iter()
                            .zip(batch)
                            .map(|(r, b)| m * r + (1.0 - m) * b)
                            .collect()
                    };
                    let new_mean = blend(moving_mean.to_f64_vec().map_err(internal)?, &mean);
                    let new_var = blend(moving_var.to_f64_vec().map_err(internal)?, &var);
                    moving_mean.write_f64(&new_mean).map_err(internal)?;
                    moving_var.write_f64(&new_var).map_err(internal)?;
                    (mean, var)
                } else {
                    (
                        moving_mean.to_f64_vec().map_err(internal)?,
                        moving_var.to_f64_vec().map_err(internal)?,
                    )
                };

                let inv_std = kernels::inv_std(&var, *eps);
                let mut out = self.pool.take(x.len());
                kernels::batch_norm_forward(&mut out, x, &dims, &mean, &inv_std, gamma, beta);
                if is_train {
                    self.batch_stats.insert(idx, BatchStats { mean, inv_std });
                }
                out
            }
        };
        Ok(out)
    }

    // Backward

    fn accumulate(&self, grads: &mut [Option<Vec<f64>>], idx: usize, delta: Vec<f64>) {
        match grads[idx].as_mut() {
            Some(acc) => {
                self.kernels.add_assign(acc, &delta);
                self.pool.give(delta);
            }
            None => grads[idx] = Some(delta),
        }
    }

    pub(crate) fn backward(&mut self, head_gradients: &[Tensor]) -> RuntimeResult<Vec<Option<Tensor>>> {
        if !self.retained {
            return Err(RuntimeStatus::new(
                status::NOT_TRAINED,
                "backward requires activations retained by a training forward",
            ));
        }
        let graph = self.graph.clone();
        let mut grads: Vec<Option<Vec<f64>>> = vec![None; graph.nodes().len()];

        let output_nodes = graph.output_nodes();
        if head_gradients.is_empty() {
            for &idx in output_nodes {
                let node = graph.node(idx);
                if node.op != OpKind::MakeLoss {
                    return Err(RuntimeStatus::new(
                        status::MISSING_HEAD_GRADIENT,
                        format!("output '{}' is not a loss and needs a head gradient", node.name),
                    ));
                }
                let mut ones = self.pool.take(self.specs[idx].elem_count());
                ones.fill(1.0);
                self.accumulate(&mut grads, idx, ones);
            }
        } else {
            if head_gradients.len() != output_nodes.len() {
                return Err(invalid(format!(
                    "expected {} head gradients, got {}",
                    output_nodes.len(),
                    head_gradients.len()
                )));
            }
            for (&idx, head) in output_nodes.iter().zip(head_gradients) {
                if head.elem_count() != self.specs[idx].elem_count() {
                    return Err(invalid(format!(
                        "head gradient for '{}' has {} elements, expected {}",
                        graph.node(idx).name,
                        head.elem_count(),
                        self.specs[idx].elem_count()
                    )));
                }
                let g = self.copy(&head.to_f64_vec().map_err(internal)?);
                self.accumulate(&mut grads, idx, g);
            }
        }

        for idx in (0..graph.nodes().len()).rev() {
            let node = graph.node(idx);
            if node.op == OpKind::Variable || !self.needs_grad[idx] {
                continue;
            }
            let Some(g) = grads[idx].take() else {
                continue;
            };
            let contributions = self.vjp(idx, node, &g)?;
            self.pool.give(g);
            for (&input, delta) in node.inputs.iter().zip(contributions) {
                if let Some(delta) = delta {
                    self.accumulate(&mut grads, input, delta);
                }
            }
        }

        let mut result = Vec::with_capacity(self.arguments.len());
        for (pos, &node_idx) in graph.argument_nodes().iter().enumerate() {
            let policy = self.policies[pos];
            if !policy.needs_gradient() {
                result.push(None);
                continue;
            }
            let spec = &self.specs[node_idx];
            let g = grads[node_idx]
                .take()
                .unwrap_or_else(|| self.pool.take(spec.elem_count()));
            let tensor =
                Tensor::from_f64_slice(&g, spec.shape.clone(), spec.dtype, self.placements[node_idx])
                    .map_err(internal);
            self.pool.give(g);
            let tensor = tensor?;
            result.push(Some(tensor));
        }
        for g in grads.into_iter().flatten() {
            self.pool.give(g);
        }
        Ok(result)
    }

    /// Per-input gradient contributions of node `idx` given its output gradient.
    fn vjp(&self, idx: usize, node: &GraphNode, g: &[f64]) -> RuntimeResult<Vec<Option<Vec<f64>>>> {
        let inputs = &node.inputs;
        let wants = |i: usize| self.needs_grad[inputs[i]];
        let mut out: Vec<Option<Vec<f64>>> = vec![None; inputs.len()];

        match &node.op {
            OpKind::Variable => {}
            OpKind::Add => {
                if wants(0) {
                    out[0] = Some(self.copy(g));
                }
                if wants(1) {
                    out[1] = Some(self.copy(g));
                }
            }
            OpKind::Sub => {
                if wants(0) {
                    out[0] = Some(self.copy(g));
                }
                if wants(1) {
                    out[1] = Some(self.map1(g, |v| -v));
                }
            }
            OpKind::Mul => {
                if wants(0) {
                    out[0] = Some(self.map2(g, value(&self.values, inputs[1])?, |g, b| g * b));
                }
                if wants(1) {
                    out[1] = Some(self.map2(g, value(&self.values, inputs[0])?, |g, a| g * a));
                }
            }
            OpKind::Div => {
                let a = value(&self.values, inputs[0])?;
                let b = value(&self.values, inputs[1])?;
                if wants(0) {
                    out[0] = Some(self.map2(g, b, |g, b| g / b));
                }
                if wants(1) {
                    let mut db = self.pool.take(g.len());
                    self.kernels.ternary(&mut db, g, a, b, |g, a, b| -g * a / (b * b));
                    out[1] = Some(db);
                }
            }
            OpKind::AddScalar(_) | OpKind::MakeLoss => {
                if wants(0) {
                    out[0] = Some(self.copy(g));
                }
            }
            OpKind::MulScalar(s) => {
                if wants(0) {
                    let s = *s;
                    out[0] = Some(self.map1(g, move |v| v * s));
                }
            }
            OpKind::Relu => {
                if wants(0) {
                    let x = value(&self.values, inputs[0])?;
                    out[0] = Some(self.map2(g, x, |g, x| if x > 0.0 { g } else { 0.0 }));
                }
            }
            OpKind::Sigmoid => {
                if wants(0) {
                    let y = value(&self.values, idx)?;
                    out[0] = Some(self.map2(g, y, |g, y| g * y * (1.0 - y)));
                }
            }
            OpKind::Tanh => {
                if wants(0) {
                    let y = value(&self.values, idx)?;
                    out[0] = Some(self.map2(g, y, |g, y| g * (1.0 - y * y)));
                }
            }
            OpKind::Sum => {
                if wants(0) {
                    let mut dx = self.pool.take(self.specs[inputs[0]].elem_count());
                    dx.fill(g[0]);
                    out[0] = Some(dx);
                }
            }
            OpKind::Dot => {
                let (m, k) = self.matrix_dims(inputs[0]);
                let (_, n) = self.matrix_dims(inputs[1]);
                if wants(0) {
                    let b = value(&self.values, inputs[1])?;
                    let mut da = self.pool.take(m * k);
                    self.kernels.matmul_grad_lhs(&mut da, g, b, m, k, n);
                    out[0] = Some(da);
                }
                if wants(1) {
                    let a = value(&self.values, inputs[0])?;
                    let mut db = self.pool.take(k * n);
                    self.kernels.matmul_grad_rhs(&mut db, a, g, m, k, n);
                    out[1] = Some(db);
                }
            }
            OpKind::Dropout { .. } => {
                if wants(0) {
                    out[0] = Some(match self.masks.get(&idx) {
                        Some(mask) => self.map2(g, mask, |g, m| g * m),
                        None => self.copy(g),
                    });
                }
            }
            OpKind::BatchNorm { .. } => {
                let stats = self.batch_stats.get(&idx).ok_or_else(|| {
                    RuntimeStatus::new(
                        status::INTERNAL,
                        format!("no batch statistics retained for '{}'", node.name),
                    )
                })?;
                let x = value(&self.values, inputs[0])?;
                let gamma = value(&self.values, inputs[1])?;
                let dims = self.specs[inputs[0]].shape.dims();
                let grads =
                    kernels::batch_norm_backward(g, x, dims, &stats.mean, &stats.inv_std, gamma);
                if wants(0) {
                    out[0] = Some(self.copy(&grads.data));
                }
                if wants(1) {
                    out[1] = Some(self.copy(&grads.gamma));
                }
                if wants(2) {
                    out[2] = Some(self.copy(&grads.beta));
                }
            }
        }
        Ok(out)
    }

    // Diagnostics

    pub(crate) fn debug_string(&self) -> String {
        let stats = self.pool.stats();
        let mut s = String::new();
        let _ = writeln!(
            s,
            "CpuPlan: {} nodes, {} arguments, {} auxiliary states, {} outputs",
            self.specs.len(),
            self.arguments.len(),
            self.auxiliary.len(),
            self.outputs.len()
        );
        for (i, node) in self.graph.nodes().iter().enumerate() {
            let _ = write!(s, "  #{i} {} = {}", node.name, node.op);
            if !node.inputs.is_empty() {
                let names: Vec<&str> = node
                    .inputs
                    .iter()
                    .map(|&j| self.graph.node(j).name.as_str())
                    .collect();
                let _ = write!(s, "({})", names.join(", "));
            }
            let _ = write!(s, " : {} @ {}", self.specs[i], self.placements[i]);
            if let Some(pos) = self.graph.argument_position(i) {
                let _ = write!(s, " [grad: {:?}]", self.policies[pos]);
            }
            if node.op.is_mode_dependent() {
                let _ = write!(s, " [train/infer]");
            }
            let _ = writeln!(s);
        }
        let _ = write!(
            s,
            "scratch: {} cached buffers, {} hits, {} misses{}",
            stats.cached_buffers,
            stats.hits,
            stats.misses,
            if self.shares_pool { " (shared)" } else { "" }
        );
        s
    }
}
