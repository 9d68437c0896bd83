// Parameter updates — Coupling bound gradients to an optimizer
//
// ParameterUpdateLoop walks a range of argument indices and hands each
// (weight, gradient) pair to an UpdateRule. It keeps no state between calls;
// all optimizer state (momentum, Adam moments) lives in the rule, keyed by
// argument index.
//
// Argument 0 is conventionally the data input, so the default range starts
// at 1. Arguments bound with a NoOp policy have no gradient and are skipped.
//
//   let mut sgd = Sgd::new().with_momentum(0.9);
//   ParameterUpdateLoop::default().update_all(&exec, &mut sgd, 0.1, 1e-4)?;

use std::collections::HashMap;

use bindgraph_core::{Error, Result, Runtime, Tensor};

use super::executor::GraphExecutor;

/// Applies one optimizer step to one parameter.
pub trait UpdateRule {
    /// Update `weight` in place from `gradient`.
    fn update(
        &mut self,
        index: usize,
        weight: &Tensor,
        gradient: &Tensor,
        learning_rate: f64,
        weight_decay: f64,
    ) -> Result<()>;
}

impl<F> UpdateRule for F
where
    F: FnMut(usize, &Tensor, &Tensor, f64, f64) -> Result<()>,
{
    fn update(
        &mut self,
        index: usize,
        weight: &Tensor,
        gradient: &Tensor,
        learning_rate: f64,
        weight_decay: f64,
    ) -> Result<()> {
        self(index, weight, gradient, learning_rate, weight_decay)
    }
}

// Range

/// Half-open range of argument indices, `begin..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRange {
    pub begin: usize,
    /// `None` runs to the last argument.
    pub end: Option<usize>,
}

impl Default for UpdateRange {
    fn default() -> Self {
        UpdateRange {
            begin: 1,
            end: None,
        }
    }
}

impl UpdateRange {
    pub fn new(begin: usize, end: Option<usize>) -> Self {
        UpdateRange { begin, end }
    }

    /// `end < 0` means "to the last argument".
    pub fn from_signed(begin: usize, end: isize) -> Self {
        UpdateRange {
            begin,
            end: usize::try_from(end).ok(),
        }
    }

    fn resolve(&self, len: usize) -> Result<std::ops::Range<usize>> {
        let end = self.end.unwrap_or(len);
        if end > len {
            return Err(Error::InvalidArgumentCount {
                what: "update range end",
                expected: len,
                got: end,
            });
        }
        if self.begin > end {
            return Err(Error::InvalidArgumentCount {
                what: "update range begin",
                expected: end,
                got: self.begin,
            });
        }
        Ok(self.begin..end)
    }
}

// Loop

/// Sequential update over a range of bound arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterUpdateLoop {
    range: UpdateRange,
}

impl ParameterUpdateLoop {
    pub fn new(range: UpdateRange) -> Self {
        ParameterUpdateLoop { range }
    }

    pub fn range(&self) -> UpdateRange {
        self.range
    }

    /// Call `rule` for each argument in range that has a gradient.
    ///
    /// Returns how many arguments were updated.
    pub fn update_all<R: Runtime, U: UpdateRule + ?Sized>(
        &self,
        executor: &GraphExecutor<R>,
        rule: &mut U,
        learning_rate: f64,
        weight_decay: f64,
    ) -> Result<usize> {
        executor.ensure_bound("update_all")?;
        let arguments = executor.arguments();
        let gradients = executor.argument_gradients();
        let policies = executor.write_policies();

        let mut updated = 0;
        for i in self.range.resolve(arguments.len())? {
            if !policies[i].needs_gradient() {
                continue;
            }
            let Some(gradient) = &gradients[i] else {
                continue;
            };
            rule.update(i, &arguments[i], gradient, learning_rate, weight_decay)?;
            updated += 1;
        }
        tracing::debug!(updated, learning_rate, weight_decay, "parameters updated");
        Ok(updated)
    }
}

// Bundled rules

fn check_pair(weight: &Tensor, gradient: &Tensor) -> Result<()> {
    if weight.elem_count() != gradient.elem_count() {
        return Err(Error::ElementCountMismatch {
            shape: weight.shape().clone(),
            expected: weight.elem_count(),
            got: gradient.elem_count(),
        });
    }
    Ok(())
}

/// `rescale * g`, optionally clipped to `[-clip, clip]`, plus L2 decay.
fn effective_gradient(
    g: f64,
    w: f64,
    rescale_grad: f64,
    clip_gradient: Option<f64>,
    weight_decay: f64,
) -> f64 {
    let mut g = g * rescale_grad;
    if let Some(c) = clip_gradient {
        g = g.clamp(-c, c);
    }
    g + weight_decay * w
}

/// Stochastic gradient descent with optional momentum.
///
/// Without momentum: `w -= lr * g'`. With momentum `m`:
/// `v = m * v - lr * g'; w += v`, where `g'` is the effective gradient.
#[derive(Debug, Clone)]
pub struct Sgd {
    pub momentum: f64,
    pub rescale_grad: f64,
    pub clip_gradient: Option<f64>,
    velocities: HashMap<usize, Vec<f64>>,
}

impl Default for Sgd {
    fn default() -> Self {
        Sgd {
            momentum: 0.0,
            rescale_grad: 1.0,
            clip_gradient: None,
            velocities: HashMap::new(),
        }
    }
}

impl Sgd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_rescale_grad(mut self, rescale_grad: f64) -> Self {
        self.rescale_grad = rescale_grad;
        self
    }

    pub fn with_clip_gradient(mut self, clip: f64) -> Self {
        self.clip_gradient = Some(clip);
        self
    }
}

impl UpdateRule for Sgd {
    fn update(
        &mut self,
        index: usize,
        weight: &Tensor,
        gradient: &Tensor,
        learning_rate: f64,
        weight_decay: f64,
    ) -> Result<()> {
        check_pair(weight, gradient)?;
        let g = gradient.to_f64_vec()?;
        let mut w = weight.to_f64_vec()?;

        if self.momentum > 0.0 {
            let v = self
                .velocities
                .entry(index)
                .or_insert_with(|| vec![0.0; w.len()]);
            for ((wi, vi), &gi) in w.iter_mut().zip(v.iter_mut()).zip(&g) {
                let ge = effective_gradient(gi, *wi, self.rescale_grad, self.clip_gradient, weight_decay);
                *vi = self.momentum * *vi - learning_rate * ge;
                *wi += *vi;
            }
        } else {
            for (wi, &gi) in w.iter_mut().zip(&g) {
                let ge = effective_gradient(gi, *wi, self.rescale_grad, self.clip_gradient, weight_decay);
                *wi -= learning_rate * ge;
            }
        }
        weight.write_f64(&w)
    }
}

/// Adam with bias correction.
#[derive(Debug, Clone)]
pub struct Adam {
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub rescale_grad: f64,
    state: HashMap<usize, AdamState>,
}

#[derive(Debug, Clone)]
struct AdamState {
    m: Vec<f64>,
    v: Vec<f64>,
    t: i32,
}

impl Default for Adam {
    fn default() -> Self {
        Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            rescale_grad: 1.0,
            state: HashMap::new(),
        }
    }
}

impl Adam {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_rescale_grad(mut self, rescale_grad: f64) -> Self {
        self.rescale_grad = rescale_grad;
        self
    }

    /// Steps taken so far for argument `index`.
    pub fn step_count(&self, index: usize) -> i32 {
        self.state.get(&index).map_or(0, |s| s.t)
    }
}

impl UpdateRule for Adam {
    fn update(
        &mut self,
        index: usize,
        weight: &Tensor,
        gradient: &Tensor,
        learning_rate: f64,
        weight_decay: f64,
    ) -> Result<()> {
        check_pair(weight, gradient)?;
        let g = gradient.to_f64_vec()?;
        let mut w = weight.to_f64_vec()?;
        let (beta1, beta2, eps, rescale) = (self.beta1, self.beta2, self.epsilon, self.rescale_grad);

        let st = self.state.entry(index).or_insert_with(|| AdamState {
            m: vec![0.0; w.len()],
            v: vec![0.0; w.len()],
            t: 0,
        });
        st.t += 1;
        let lr_t = learning_rate * (1.0 - beta2.powi(st.t)).sqrt() / (1.0 - beta1.powi(st.t));

        for (i, (wi, &gi)) in w.iter_mut().zip(&g).enumerate() {
            let ge = effective_gradient(gi, *wi, rescale, None, weight_decay);
            st.m[i] = beta1 * st.m[i] + (1.0 - beta1) * ge;
            st.v[i] = beta2 * st.v[i] + (1.0 - beta2) * ge * ge;
            *wi -= lr_t * st.m[i] / (st.v[i].sqrt() + eps);
        }
        weight.write_f64(&w)
    }
}
