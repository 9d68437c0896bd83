// Executor tests — Binding, forward/backward, write policies and lifecycle

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use bindgraph::prelude::*;
use bindgraph::{ForwardMode, Phase, RuntimeResult, RuntimeStatus, ShapeTable, SlotKind};
use proptest::prelude::*;

fn cpu() -> DeviceContext {
    DeviceContext::cpu(0)
}

fn scalar(v: f64) -> Tensor {
    Tensor::scalar(v, DType::F64, cpu())
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

/// `y = x * w` with x at index 0 and w at index 1.
fn xw_graph() -> SymbolGraph {
    let x = Symbol::variable("x");
    let w = Symbol::variable("w");
    x.mul(&w).named("y").to_graph().unwrap()
}

fn bind_xw(x: &Tensor, w: &Tensor, dw: &Tensor, policy: WritePolicy) -> GraphExecutor<CpuRuntime> {
    let args = BindArgs::new(vec![x.clone(), w.clone()]).with_gradients(
        vec![None, Some(dw.clone())],
        vec![WritePolicy::NoOp, policy],
    );
    GraphExecutor::bind(CpuRuntime::new(), &xw_graph(), cpu(), args, BindOptions::default())
        .unwrap()
}

// End to end

#[test]
fn test_mul_forward_then_backward() {
    init_logging();
    let (x, w, dw) = (scalar(2.0), scalar(3.0), scalar(0.0));
    let mut exec = bind_xw(&x, &w, &dw, WritePolicy::WriteTo);

    exec.forward(true).unwrap();
    assert_abs_diff_eq!(exec.outputs()[0].to_scalar().unwrap(), 6.0);

    exec.backward(&[scalar(1.0)]).unwrap();
    assert_abs_diff_eq!(dw.to_scalar().unwrap(), 2.0);
    assert!(exec.argument_gradients()[0].is_none());
}

#[test]
fn test_weight_tying_accumulates_across_executors() {
    let w = scalar(3.0);
    let dw = scalar(0.0);
    let mut first = bind_xw(&scalar(2.0), &w, &dw, WritePolicy::AddTo);
    let mut second = bind_xw(&scalar(2.0), &w, &dw, WritePolicy::AddTo);

    first.forward(true).unwrap();
    first.backward(&[scalar(1.0)]).unwrap();
    second.forward(true).unwrap();
    second.backward(&[scalar(1.0)]).unwrap();

    assert_abs_diff_eq!(dw.to_scalar().unwrap(), 4.0);
}

// Shape contract

#[test]
fn test_argument_count_checked_first() {
    let args = BindArgs::new(vec![scalar(1.0)]);
    let err = GraphExecutor::bind(CpuRuntime::new(), &xw_graph(), cpu(), args, BindOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidArgumentCount {
            what: "argument",
            expected: 2,
            got: 1
        }
    ));
    assert!(err.is_bind_error());
}

#[test]
fn test_policy_count_must_match_gradients() {
    let args = BindArgs::new(vec![scalar(1.0), scalar(2.0)])
        .with_gradients(vec![None, None], vec![WritePolicy::NoOp]);
    let err = GraphExecutor::bind(CpuRuntime::new(), &xw_graph(), cpu(), args, BindOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidArgumentCount {
            what: "write policy",
            ..
        }
    ));
}

#[test]
fn test_unknown_group_is_unresolved() {
    let args = BindArgs::new(vec![scalar(1.0), scalar(2.0)]);
    let options = BindOptions::default().with_group("nowhere", cpu());
    let err = GraphExecutor::bind(CpuRuntime::new(), &xw_graph(), cpu(), args, options).unwrap_err();
    match err {
        Error::UnresolvedPlacement { group } => assert_eq!(group, "nowhere"),
        other => panic!("expected UnresolvedPlacement, got {other:?}"),
    }
}

#[test]
fn test_policy_without_buffer_is_rejected() {
    let args = BindArgs::new(vec![scalar(1.0), scalar(2.0)])
        .with_gradients(vec![None, None], vec![WritePolicy::NoOp, WritePolicy::AddTo]);
    let err = GraphExecutor::bind(CpuRuntime::new(), &xw_graph(), cpu(), args, BindOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::MissingGradient {
            index: 1,
            policy: WritePolicy::AddTo
        }
    ));
}

#[test]
fn test_gradient_spec_must_match_argument() {
    let dw = Tensor::zeros(2, DType::F64, cpu());
    let args = BindArgs::new(vec![scalar(1.0), scalar(2.0)]).with_gradients(
        vec![None, Some(dw)],
        vec![WritePolicy::NoOp, WritePolicy::WriteTo],
    );
    let err = GraphExecutor::bind(CpuRuntime::new(), &xw_graph(), cpu(), args, BindOptions::default())
        .unwrap_err();
    match err {
        Error::ShapeMismatch { slot, .. } => {
            assert_eq!(slot.kind, SlotKind::Gradient);
            assert_eq!(slot.name, "w");
        }
        other => panic!("expected ShapeMismatch, got {other:?}"),
    }
}

#[test]
fn test_auxiliary_state_spec_checked() {
    let data = Symbol::variable("data");
    let gamma = Symbol::variable("gamma");
    let beta = Symbol::variable("beta");
    let graph = data.batch_norm(&gamma, &beta, 1e-5, 0.9).named("bn").to_graph().unwrap();

    let f64s = |dims: &[usize]| Tensor::zeros(dims, DType::F64, cpu());
    let args = BindArgs::new(vec![f64s(&[4, 3]), f64s(&[3]), f64s(&[3])])
        .with_auxiliary_states(vec![f64s(&[3]), f64s(&[4])]);
    let err = GraphExecutor::bind(CpuRuntime::new(), &graph, cpu(), args, BindOptions::default())
        .unwrap_err();
    match err {
        Error::ShapeMismatch { slot, .. } => {
            assert_eq!(slot.kind, SlotKind::Auxiliary);
            assert_eq!(slot.name, "bn_moving_var");
        }
        other => panic!("expected ShapeMismatch, got {other:?}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_mismatched_arguments_never_bind(a in 1usize..8, b in 1usize..8) {
        prop_assume!(a != b);
        let x = Tensor::zeros(a, DType::F64, cpu());
        let w = Tensor::zeros(b, DType::F64, cpu());
        let result = GraphExecutor::bind(
            CpuRuntime::new(),
            &xw_graph(),
            cpu(),
            BindArgs::new(vec![x, w]),
            BindOptions::default(),
        );
        let is_mismatch = matches!(result, Err(Error::ShapeMismatch { .. }));
        prop_assert!(is_mismatch);
    }

    #[test]
    fn prop_write_policies_commit_as_declared(
        x in -10.0f64..10.0,
        head in -10.0f64..10.0,
        g0 in -10.0f64..10.0,
    ) {
        let xs = Symbol::variable("x");
        let a = Symbol::variable("a");
        let b = Symbol::variable("b");
        let c = Symbol::variable("c");
        let y = &(&(&xs * &a) + &(&xs * &b)) + &(&xs * &c);
        let graph = y.to_graph().unwrap();

        let (ga, gb, gc) = (scalar(g0), scalar(g0), scalar(g0));
        let args = BindArgs::new(vec![scalar(x), scalar(1.0), scalar(1.0), scalar(1.0)])
            .with_gradients(
                vec![None, Some(ga.clone()), Some(gb.clone()), Some(gc.clone())],
                vec![
                    WritePolicy::NoOp,
                    WritePolicy::WriteTo,
                    WritePolicy::AddTo,
                    WritePolicy::NoOp,
                ],
            );
        let mut exec =
            GraphExecutor::bind(CpuRuntime::new(), &graph, cpu(), args, BindOptions::default())
                .unwrap();
        exec.forward(true).unwrap();
        exec.backward(&[scalar(head)]).unwrap();

        let delta = x * head;
        prop_assert!((ga.to_scalar().unwrap() - delta).abs() < 1e-9);
        prop_assert!((gb.to_scalar().unwrap() - (g0 + delta)).abs() < 1e-9);
        prop_assert_eq!(gc.to_scalar().unwrap().to_bits(), g0.to_bits());
    }
}

// Ordering and lifecycle

#[test]
fn test_backward_requires_training_forward() {
    let (x, w, dw) = (scalar(2.0), scalar(3.0), scalar(0.0));
    let mut exec = bind_xw(&x, &w, &dw, WritePolicy::WriteTo);

    let err = exec.backward(&[scalar(1.0)]).unwrap_err();
    assert!(matches!(err, Error::PrecedenceViolation { last_forward: None }));

    exec.forward(false).unwrap();
    let err = exec.backward(&[scalar(1.0)]).unwrap_err();
    assert!(matches!(
        err,
        Error::PrecedenceViolation {
            last_forward: Some(ForwardMode::Inference)
        }
    ));

    exec.forward(true).unwrap();
    exec.backward(&[scalar(1.0)]).unwrap();
    // Repeated backward over the same activations is allowed.
    exec.backward(&[scalar(1.0)]).unwrap();
    assert_eq!(exec.last_forward(), Some(ForwardMode::Training));
}

#[test]
fn test_release_is_idempotent_and_terminal() {
    let (x, w, dw) = (scalar(2.0), scalar(3.0), scalar(0.0));
    let mut exec = bind_xw(&x, &w, &dw, WritePolicy::WriteTo);
    exec.forward(true).unwrap();

    exec.release().unwrap();
    exec.release().unwrap();
    assert!(exec.is_released());

    assert!(matches!(
        exec.forward(true),
        Err(Error::UseAfterRelease { operation: "forward" })
    ));
    assert!(matches!(
        exec.backward(&[]),
        Err(Error::UseAfterRelease { operation: "backward" })
    ));
    assert!(matches!(
        exec.update_all(&mut Sgd::new(), 0.1, 0.0, 1, -1),
        Err(Error::UseAfterRelease { .. })
    ));
    assert!(exec.debug_string().is_err());
    assert!(exec.plan().is_err());

    // Caller-owned handles stay readable.
    assert_eq!(exec.arguments().len(), 2);
    assert_abs_diff_eq!(exec.outputs()[0].to_scalar().unwrap(), 6.0);
}

#[test]
fn test_outputs_follow_latest_forward() {
    let (x, w, dw) = (scalar(2.0), scalar(3.0), scalar(0.0));
    let mut exec = bind_xw(&x, &w, &dw, WritePolicy::WriteTo);

    // Populated at bind.
    assert_eq!(exec.outputs().len(), 1);

    exec.forward(false).unwrap();
    let first = exec.outputs()[0].clone();
    x.fill(5.0).unwrap();
    exec.forward(false).unwrap();

    assert_abs_diff_eq!(exec.outputs()[0].to_scalar().unwrap(), 15.0);
    assert!(!exec.outputs()[0].ptr_eq(&first));
    assert_abs_diff_eq!(first.to_scalar().unwrap(), 6.0);
}

#[test]
fn test_head_gradients_validated() {
    let (x, w, dw) = (scalar(2.0), scalar(3.0), scalar(0.0));
    let mut exec = bind_xw(&x, &w, &dw, WritePolicy::WriteTo);
    exec.forward(true).unwrap();

    let err = exec.backward(&[scalar(1.0), scalar(1.0)]).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidArgumentCount {
            what: "head gradient",
            ..
        }
    ));

    let err = exec
        .backward(&[Tensor::scalar(1.0, DType::F32, cpu())])
        .unwrap_err();
    match err {
        Error::ShapeMismatch { slot, .. } => {
            assert_eq!(slot.kind, SlotKind::HeadGradient);
            assert_eq!(slot.name, "y");
        }
        other => panic!("expected ShapeMismatch, got {other:?}"),
    }

    // Implicit unit gradients need a loss output.
    let err = exec.backward(&[]).unwrap_err();
    assert!(matches!(
        err,
        Error::ExecutionError {
            phase: Phase::Backward,
            ..
        }
    ));
    assert_abs_diff_eq!(dw.to_scalar().unwrap(), 0.0);
}

#[test]
fn test_loss_output_seeds_unit_gradient() {
    let x = Symbol::variable("x");
    let w = Symbol::variable("w");
    let graph = x.mul(&w).sum().make_loss().to_graph().unwrap();
    let dw = Tensor::zeros(3, DType::F64, cpu());
    let args = BindArgs::new(vec![
        Tensor::from_f64_slice(&[1.0, 2.0, 3.0], 3, DType::F64, cpu()).unwrap(),
        Tensor::full(3, 0.5, DType::F64, cpu()),
    ])
    .with_gradients(vec![None, Some(dw.clone())], vec![WritePolicy::NoOp, WritePolicy::WriteInplace]);

    let mut exec =
        GraphExecutor::bind(CpuRuntime::new(), &graph, cpu(), args, BindOptions::default()).unwrap();
    exec.forward(true).unwrap();
    assert_abs_diff_eq!(exec.outputs()[0].to_scalar().unwrap(), 3.0);
    exec.backward(&[]).unwrap();
    assert_eq!(dw.to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0]);
}

// Configuration and name-keyed access

#[test]
fn test_simple_bind_allocates_slots() {
    let x = Symbol::variable("x");
    let w = Symbol::variable("w");
    let graph = x.dot(&w).with_shape((2, 4)).to_graph().unwrap();

    let exec = GraphExecutor::simple_bind(
        CpuRuntime::new(),
        &graph,
        cpu(),
        &[Some(TensorSpec::f32((2, 3))), None],
        &[WritePolicy::NoOp, WritePolicy::WriteTo],
        BindOptions::default(),
    )
    .unwrap();

    assert_eq!(exec.argument("w").unwrap().dims(), &[3, 4]);
    assert!(exec.gradient("x").unwrap().is_none());
    assert_eq!(exec.gradient("w").unwrap().unwrap().dims(), &[3, 4]);
    assert_eq!(exec.outputs()[0].dims(), &[2, 4]);
    assert_eq!(exec.gradient_map().len(), 1);
    assert!(matches!(
        exec.argument("missing"),
        Err(Error::UnknownName { what: "argument", .. })
    ));
}

#[test]
fn test_copy_params_from() {
    let (x, w, dw) = (scalar(2.0), scalar(3.0), scalar(0.0));
    let exec = bind_xw(&x, &w, &dw, WritePolicy::WriteTo);

    let mut params = HashMap::new();
    params.insert("w".to_string(), scalar(7.0));
    params.insert("extra".to_string(), scalar(1.0));

    let err = exec.copy_params_from(&params, None, false).unwrap_err();
    assert!(matches!(err, Error::UnknownName { .. }));

    exec.copy_params_from(&params, None, true).unwrap();
    assert_abs_diff_eq!(w.to_scalar().unwrap(), 7.0);
    assert_eq!(exec.argument_map().len(), 2);
    assert_abs_diff_eq!(exec.output("y").unwrap().to_scalar().unwrap(), 0.0);
}

#[test]
fn test_batch_norm_aux_states_through_executor() {
    let data = Symbol::variable("data");
    let gamma = Symbol::variable("gamma");
    let beta = Symbol::variable("beta");
    let graph = data.batch_norm(&gamma, &beta, 1e-5, 0.5).named("bn").to_graph().unwrap();

    let exec_args = BindArgs::new(vec![
        Tensor::from_f64_slice(&[1.0, 10.0, 3.0, 30.0], (2, 2), DType::F64, cpu()).unwrap(),
        Tensor::full(2, 1.0, DType::F64, cpu()),
        Tensor::zeros(2, DType::F64, cpu()),
    ])
    .with_auxiliary_states(vec![
        Tensor::zeros(2, DType::F64, cpu()),
        Tensor::full(2, 1.0, DType::F64, cpu()),
    ]);
    let mut exec =
        GraphExecutor::bind(CpuRuntime::new(), &graph, cpu(), exec_args, BindOptions::default())
            .unwrap();

    exec.forward(false).unwrap();
    assert_eq!(exec.auxiliary_state("bn_moving_mean").unwrap().to_f64_vec().unwrap(), vec![0.0, 0.0]);

    exec.forward(true).unwrap();
    let mean = exec.auxiliary_map()["bn_moving_mean"].to_f64_vec().unwrap();
    assert_abs_diff_eq!(mean[0], 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(mean[1], 10.0, epsilon = 1e-12);
}

#[test]
fn test_group_placement_and_shared_scratch() {
    let x = Symbol::variable("x");
    let w = Symbol::variable("w");
    let graph = x.mul(&w).with_ctx_group("stage").relu().to_graph().unwrap();

    let args = || BindArgs::new(vec![scalar(2.0), scalar(-3.0)]);
    let train = GraphExecutor::bind(
        CpuRuntime::new(),
        &graph,
        cpu(),
        args(),
        BindOptions::default().with_group("stage", DeviceContext::cpu_shared(1)),
    )
    .unwrap();
    let infer = GraphExecutor::bind(
        CpuRuntime::new(),
        &graph,
        cpu(),
        args(),
        BindOptions::default().with_shared_executor(&train),
    )
    .unwrap();

    assert!(infer.plan().unwrap().shares_scratch_with(train.plan().unwrap()));
    let dump = train.debug_string().unwrap();
    assert!(dump.contains("@ cpu_shared(1)"));
    assert_eq!(train.group_to_context().len(), 1);
}

#[test]
fn test_shared_executor_must_be_bound() {
    let (x, w, dw) = (scalar(2.0), scalar(3.0), scalar(0.0));
    let mut donor = bind_xw(&x, &w, &dw, WritePolicy::WriteTo);
    donor.release().unwrap();

    let err = GraphExecutor::bind(
        CpuRuntime::new(),
        &xw_graph(),
        cpu(),
        BindArgs::new(vec![x, w]),
        BindOptions::default().with_shared_executor(&donor),
    )
    .unwrap_err();
    assert!(matches!(err, Error::UseAfterRelease { .. }));
}

#[test]
fn test_sharer_survives_released_donor_on_cpu() {
    let (x, w, dw) = (scalar(2.0), scalar(3.0), scalar(0.0));
    let mut donor = bind_xw(&x, &w, &dw, WritePolicy::WriteTo);
    let dw2 = scalar(0.0);
    let args = BindArgs::new(vec![x.clone(), w.clone()]).with_gradients(
        vec![None, Some(dw2.clone())],
        vec![WritePolicy::NoOp, WritePolicy::WriteTo],
    );
    let mut sharer = GraphExecutor::bind(
        CpuRuntime::new(),
        &xw_graph(),
        cpu(),
        args,
        BindOptions::default().with_shared_executor(&donor),
    )
    .unwrap();
    donor.release().unwrap();

    // The CPU scratch pool is reference-counted, so the sharer keeps it.
    sharer.forward(true).unwrap();
    sharer.backward(&[scalar(1.0)]).unwrap();
    assert_abs_diff_eq!(sharer.outputs()[0].to_scalar().unwrap(), 6.0);
    assert_abs_diff_eq!(dw2.to_scalar().unwrap(), 2.0);
    assert_abs_diff_eq!(dw.to_scalar().unwrap(), 0.0);
}

#[test]
fn test_gpu_context_fails_in_runtime() {
    let err = GraphExecutor::bind(
        CpuRuntime::new(),
        &xw_graph(),
        DeviceContext::gpu(0),
        BindArgs::new(vec![scalar(1.0), scalar(1.0)]),
        BindOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::ExecutionError {
            phase: Phase::Bind,
            ..
        }
    ));
}

// Mock runtime for failure paths

#[derive(Debug, Default)]
struct MockState {
    fail_bind: AtomicBool,
    fail_forward: AtomicBool,
    fail_release: AtomicBool,
    bad_gradient: AtomicBool,
    output_count: AtomicUsize,
    releases: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
struct MockRuntime {
    state: Arc<MockState>,
}

struct MockGraph;

impl Graph for MockGraph {
    fn argument_names(&self) -> Vec<String> {
        vec!["data".into(), "w".into()]
    }

    fn auxiliary_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn output_names(&self) -> Vec<String> {
        vec!["out".into()]
    }

    fn context_groups(&self) -> Vec<String> {
        Vec::new()
    }

    fn infer_shapes(&self, given: &[Option<TensorSpec>]) -> Result<ShapeTable> {
        let one = TensorSpec::new(1, DType::F64);
        Ok(ShapeTable {
            arguments: given.iter().map(|g| g.clone().unwrap_or_else(|| one.clone())).collect(),
            auxiliary_states: Vec::new(),
            outputs: vec![one],
        })
    }
}

struct MockPlan {
    forwards: usize,
}

impl Runtime for MockRuntime {
    type Graph = MockGraph;
    type Plan = MockPlan;

    fn name(&self) -> String {
        "mock".into()
    }

    fn bind(
        &self,
        _graph: &MockGraph,
        _request: &bindgraph::BindRequest<'_, MockPlan>,
    ) -> RuntimeResult<MockPlan> {
        if self.state.fail_bind.load(Ordering::SeqCst) {
            return Err(RuntimeStatus::new(7, "out of device memory"));
        }
        Ok(MockPlan { forwards: 0 })
    }

    fn output_count(&self, _plan: &MockPlan) -> usize {
        self.state.output_count.load(Ordering::SeqCst)
    }

    fn output(&self, plan: &MockPlan, _index: usize) -> RuntimeResult<Tensor> {
        Ok(scalar(plan.forwards as f64))
    }

    fn forward(&self, plan: &mut MockPlan, _is_train: bool) -> RuntimeResult<()> {
        if self.state.fail_forward.load(Ordering::SeqCst) {
            return Err(RuntimeStatus::new(9, "kernel launch failed"));
        }
        plan.forwards += 1;
        Ok(())
    }

    fn backward(
        &self,
        _plan: &mut MockPlan,
        _head_gradients: &[Tensor],
    ) -> RuntimeResult<Vec<Option<Tensor>>> {
        let w = if self.state.bad_gradient.load(Ordering::SeqCst) {
            Tensor::zeros(2, DType::F64, cpu())
        } else {
            scalar(1.0)
        };
        Ok(vec![Some(scalar(5.0)), Some(w)])
    }

    fn debug_string(&self, plan: &MockPlan) -> String {
        format!("mock plan after {} forwards", plan.forwards)
    }

    fn release(&self, _plan: MockPlan) -> RuntimeResult<()> {
        self.state.releases.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_release.load(Ordering::SeqCst) {
            return Err(RuntimeStatus::new(11, "device lost"));
        }
        Ok(())
    }
}

fn bind_mock(runtime: &MockRuntime, grads: [Tensor; 2]) -> Result<GraphExecutor<MockRuntime>> {
    let [g0, g1] = grads;
    let args = BindArgs::new(vec![scalar(1.0), scalar(2.0)]).with_gradients(
        vec![Some(g0), Some(g1)],
        vec![WritePolicy::WriteTo, WritePolicy::WriteTo],
    );
    GraphExecutor::bind(runtime.clone(), &MockGraph, cpu(), args, BindOptions::default())
}

#[test]
fn test_runtime_bind_failure_is_execution_error() {
    let rt = MockRuntime::default();
    rt.state.fail_bind.store(true, Ordering::SeqCst);
    let err = bind_mock(&rt, [scalar(0.0), scalar(0.0)]).unwrap_err();
    match err {
        Error::ExecutionError { phase, status } => {
            assert_eq!(phase, Phase::Bind);
            assert_eq!(status.code, 7);
        }
        other => panic!("expected ExecutionError, got {other:?}"),
    }
    assert_eq!(rt.state.releases.load(Ordering::SeqCst), 0);
}

#[test]
fn test_failed_forward_keeps_previous_outputs() {
    let rt = MockRuntime::default();
    rt.state.output_count.store(1, Ordering::SeqCst);
    let mut exec = bind_mock(&rt, [scalar(0.0), scalar(0.0)]).unwrap();

    exec.forward(true).unwrap();
    let before = exec.outputs()[0].clone();

    rt.state.fail_forward.store(true, Ordering::SeqCst);
    let err = exec.forward(true).unwrap_err();
    assert!(matches!(
        err,
        Error::ExecutionError {
            phase: Phase::Forward,
            ..
        }
    ));
    assert!(exec.outputs()[0].ptr_eq(&before));
    assert!(exec.debug_string().unwrap().contains("after 1 forwards"));

    // Activations from the failed call cannot be trusted.
    assert!(matches!(
        exec.backward(&[]),
        Err(Error::PrecedenceViolation { last_forward: None })
    ));
}

#[test]
fn test_output_count_is_requeried_every_forward() {
    let rt = MockRuntime::default();
    rt.state.output_count.store(1, Ordering::SeqCst);
    let mut exec = bind_mock(&rt, [scalar(0.0), scalar(0.0)]).unwrap();
    assert_eq!(exec.outputs().len(), 1);

    rt.state.output_count.store(3, Ordering::SeqCst);
    exec.forward(false).unwrap();
    assert_eq!(exec.outputs().len(), 3);

    rt.state.output_count.store(0, Ordering::SeqCst);
    exec.forward(false).unwrap();
    assert!(exec.outputs().is_empty());
}

#[test]
fn test_bad_contribution_commits_nothing() {
    let rt = MockRuntime::default();
    rt.state.output_count.store(1, Ordering::SeqCst);
    rt.state.bad_gradient.store(true, Ordering::SeqCst);
    let (g0, g1) = (scalar(0.0), scalar(0.0));
    let mut exec = bind_mock(&rt, [g0.clone(), g1.clone()]).unwrap();

    exec.forward(true).unwrap();
    let err = exec.backward(&[]).unwrap_err();
    match err {
        Error::ShapeMismatch { slot, .. } => assert_eq!(slot.kind, SlotKind::Gradient),
        other => panic!("expected ShapeMismatch, got {other:?}"),
    }
    assert_eq!(g0.to_scalar().unwrap(), 0.0);

    rt.state.bad_gradient.store(false, Ordering::SeqCst);
    exec.backward(&[]).unwrap();
    assert_eq!(g0.to_scalar().unwrap(), 5.0);
    assert_eq!(g1.to_scalar().unwrap(), 1.0);
}

#[test]
fn test_drop_releases_once() {
    let rt = MockRuntime::default();
    {
        let _exec = bind_mock(&rt, [scalar(0.0), scalar(0.0)]).unwrap();
    }
    assert_eq!(rt.state.releases.load(Ordering::SeqCst), 1);

    let mut exec = bind_mock(&rt, [scalar(0.0), scalar(0.0)]).unwrap();
    exec.release().unwrap();
    drop(exec);
    assert_eq!(rt.state.releases.load(Ordering::SeqCst), 2);
}

#[test]
fn test_release_failures() {
    init_logging();
    let rt = MockRuntime::default();
    rt.state.fail_release.store(true, Ordering::SeqCst);

    let mut exec = bind_mock(&rt, [scalar(0.0), scalar(0.0)]).unwrap();
    let err = exec.release().unwrap_err();
    assert!(matches!(
        err,
        Error::ExecutionError {
            phase: Phase::Release,
            ..
        }
    ));
    // The plan was handed over; a second release has nothing left to free.
    exec.release().unwrap();

    // Dropping with a failing release logs instead of panicking.
    drop(bind_mock(&rt, [scalar(0.0), scalar(0.0)]).unwrap());
    assert_eq!(rt.state.releases.load(Ordering::SeqCst), 2);
}
