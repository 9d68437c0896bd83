// =============================================================================
// Executor — Drives bound graphs through forward, backward and update
// =============================================================================
//
// This module is where a symbolic graph meets memory. It takes an immutable
// Graph, a set of caller-owned tensors and a placement, validates them, asks
// the Runtime for an execution plan, and then drives that plan:
//
//   Graph + tensors + placement → bind → forward → backward → update_all
//
// Gradients reach their buffers through the per-argument WritePolicy
// recorded at bind time; the update loop then feeds (weight, gradient)
// pairs to an UpdateRule.
//
// USAGE:
//   let graph = (&x * &w).to_graph()?;
//   let args = BindArgs::new(vec![x_buf, w_buf])
//       .with_gradients(vec![None, Some(dw)], vec![WritePolicy::NoOp, WritePolicy::WriteTo]);
//   let mut exec = GraphExecutor::bind(CpuRuntime::new(), &graph, DeviceContext::cpu(0),
//                                      args, BindOptions::default())?;
//   exec.forward(true)?;
//   exec.backward(&[head])?;
//   exec.update_all(&mut Sgd::new(), 0.1, 0.0, 1, -1)?;

mod executor;
mod options;
mod update;

pub use executor::GraphExecutor;
pub use options::{BindArgs, BindOptions};
pub use update::{Adam, ParameterUpdateLoop, Sgd, UpdateRange, UpdateRule};
