// Update loop tests — Parameter updates over a bound executor

use approx::assert_abs_diff_eq;
use bindgraph::prelude::*;

fn cpu() -> DeviceContext {
    DeviceContext::cpu(0)
}

fn scalar(v: f64) -> Tensor {
    Tensor::scalar(v, DType::F64, cpu())
}

/// `y = data * w + b`, trained once with a unit head gradient.
struct Trained {
    exec: GraphExecutor<CpuRuntime>,
    w: Tensor,
    b: Tensor,
    dw: Tensor,
}

fn trained(policies: [WritePolicy; 3]) -> Trained {
    let data = Symbol::variable("data");
    let w = Symbol::variable("w");
    let b = Symbol::variable("b");
    let graph = (&(&data * &w) + &b).to_graph().unwrap();

    let (wt, bt) = (scalar(3.0), scalar(0.5));
    let (dw, db) = (scalar(0.0), scalar(0.0));
    let args = BindArgs::new(vec![scalar(2.0), wt.clone(), bt.clone()]).with_gradients(
        vec![None, Some(dw.clone()), Some(db)],
        policies.to_vec(),
    );
    let mut exec =
        GraphExecutor::bind(CpuRuntime::new(), &graph, cpu(), args, BindOptions::default()).unwrap();
    exec.forward(true).unwrap();
    exec.backward(&[scalar(1.0)]).unwrap();
    Trained {
        exec,
        w: wt,
        b: bt,
        dw,
    }
}

#[test]
fn test_sgd_step_skips_data_argument() {
    let t = trained([WritePolicy::NoOp, WritePolicy::WriteTo, WritePolicy::WriteTo]);
    assert_abs_diff_eq!(t.dw.to_scalar().unwrap(), 2.0);

    let updated = t.exec.update_all(&mut Sgd::new(), 0.1, 0.0, 1, -1).unwrap();
    assert_eq!(updated, 2);
    assert_abs_diff_eq!(t.w.to_scalar().unwrap(), 2.8, epsilon = 1e-12);
    assert_abs_diff_eq!(t.b.to_scalar().unwrap(), 0.4, epsilon = 1e-12);
    assert_abs_diff_eq!(t.exec.argument("data").unwrap().to_scalar().unwrap(), 2.0);
}

#[test]
fn test_noop_slots_are_skipped() {
    let t = trained([WritePolicy::NoOp, WritePolicy::WriteTo, WritePolicy::NoOp]);

    let mut seen = Vec::new();
    let mut rule = |i: usize, w: &Tensor, g: &Tensor, lr: f64, _wd: f64| -> Result<()> {
        seen.push(i);
        let next = w.to_scalar()? - lr * g.to_scalar()?;
        w.fill(next)
    };
    let updated = t.exec.update_all(&mut rule, 0.5, 0.0, 0, -1).unwrap();

    assert_eq!(updated, 1);
    assert_eq!(seen, vec![1]);
    assert_abs_diff_eq!(t.w.to_scalar().unwrap(), 2.0);
    assert_abs_diff_eq!(t.b.to_scalar().unwrap(), 0.5);
}

#[test]
fn test_explicit_range_and_loop_object() {
    let t = trained([WritePolicy::NoOp, WritePolicy::WriteTo, WritePolicy::WriteTo]);

    let only_w = ParameterUpdateLoop::new(UpdateRange::new(1, Some(2)));
    assert_eq!(only_w.range().end, Some(2));
    let updated = only_w.update_all(&t.exec, &mut Sgd::new(), 1.0, 0.0).unwrap();
    assert_eq!(updated, 1);
    assert_abs_diff_eq!(t.w.to_scalar().unwrap(), 1.0);
    assert_abs_diff_eq!(t.b.to_scalar().unwrap(), 0.5);

    // Empty range is a no-op.
    assert_eq!(t.exec.update_all(&mut Sgd::new(), 1.0, 0.0, 2, 2).unwrap(), 0);
}

#[test]
fn test_bad_range_is_rejected() {
    let t = trained([WritePolicy::NoOp, WritePolicy::WriteTo, WritePolicy::WriteTo]);

    let err = t.exec.update_all(&mut Sgd::new(), 0.1, 0.0, 0, 4).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidArgumentCount {
            what: "update range end",
            ..
        }
    ));
    let err = t.exec.update_all(&mut Sgd::new(), 0.1, 0.0, 3, 2).unwrap_err();
    assert!(matches!(err, Error::InvalidArgumentCount { .. }));
    assert_abs_diff_eq!(t.w.to_scalar().unwrap(), 3.0);
}

#[test]
fn test_rule_errors_propagate() {
    let t = trained([WritePolicy::NoOp, WritePolicy::WriteTo, WritePolicy::WriteTo]);

    let mut rule = |i: usize, _w: &Tensor, _g: &Tensor, _lr: f64, _wd: f64| -> Result<()> {
        if i == 2 {
            return Err(Error::msg("diverged"));
        }
        Ok(())
    };
    let err = t.exec.update_all(&mut rule, 0.1, 0.0, 1, -1).unwrap_err();
    assert_eq!(err.to_string(), "diverged");
}

#[test]
fn test_weight_decay_and_momentum_over_steps() {
    let t = trained([WritePolicy::NoOp, WritePolicy::WriteTo, WritePolicy::NoOp]);
    let mut sgd = Sgd::new().with_momentum(0.5);

    // g' = 2 + 0.1 * 3 = 2.3, v = -0.23, w = 2.77
    t.exec.update_all(&mut sgd, 0.1, 0.1, 1, -1).unwrap();
    assert_abs_diff_eq!(t.w.to_scalar().unwrap(), 2.77, epsilon = 1e-12);

    // g' = 2 + 0.277 = 2.277, v = -0.115 - 0.2277 = -0.3427, w = 2.4273
    t.exec.update_all(&mut sgd, 0.1, 0.1, 1, -1).unwrap();
    assert_abs_diff_eq!(t.w.to_scalar().unwrap(), 2.4273, epsilon = 1e-12);
}

#[test]
fn test_adam_through_training_loop() {
    let t = trained([WritePolicy::NoOp, WritePolicy::WriteTo, WritePolicy::NoOp]);
    let mut exec = t.exec;
    let mut adam = Adam::new();

    for _ in 0..3 {
        exec.update_all(&mut adam, 0.01, 0.0, 1, -1).unwrap();
        exec.forward(true).unwrap();
        exec.backward(&[scalar(1.0)]).unwrap();
    }

    assert_eq!(adam.step_count(1), 3);
    assert_eq!(adam.step_count(2), 0);
    // Constant positive gradient: each bias-corrected step moves ~lr.
    assert_abs_diff_eq!(t.w.to_scalar().unwrap(), 2.97, epsilon = 1e-6);
}

#[test]
fn test_update_after_release_fails() {
    let t = trained([WritePolicy::NoOp, WritePolicy::WriteTo, WritePolicy::WriteTo]);
    let mut exec = t.exec;
    exec.release().unwrap();

    let err = ParameterUpdateLoop::default()
        .update_all(&exec, &mut Sgd::new(), 0.1, 0.0)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UseAfterRelease {
            operation: "update_all"
        }
    ));
    assert_abs_diff_eq!(t.w.to_scalar().unwrap(), 3.0);
}
