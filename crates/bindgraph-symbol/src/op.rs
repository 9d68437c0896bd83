use std::fmt;

use bindgraph_core::{bail, Result};

// OpKind — Operators a symbolic graph can contain
//
// Each variant carries only its static attributes. Inputs live on the node.
// The reference runtime gives each of these a forward kernel and a
// vector-Jacobian product.

/// Operator of a graph node.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// A named input slot (data or parameter).
    Variable,
    Add,
    Sub,
    Mul,
    Div,
    AddScalar(f64),
    MulScalar(f64),
    Relu,
    Sigmoid,
    Tanh,
    /// Sum of all elements, shape `[1]`.
    Sum,
    /// 2-D matrix product `[m, k] x [k, n]`.
    Dot,
    /// Inverted dropout; identity in inference mode.
    Dropout { p: f64 },
    /// Batch normalization over axis 1, inputs `(data, gamma, beta)`.
    BatchNorm { eps: f64, momentum: f64 },
    /// Marks a loss head: identity forward, unit gradient when none is given.
    MakeLoss,
}

impl OpKind {
    /// Prefix for auto-generated node names.
    pub fn name_prefix(&self) -> &'static str {
        match self {
            OpKind::Variable => "var",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::AddScalar(_) => "addscalar",
            OpKind::MulScalar(_) => "mulscalar",
            OpKind::Relu => "relu",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Tanh => "tanh",
            OpKind::Sum => "sum",
            OpKind::Dot => "dot",
            OpKind::Dropout { .. } => "dropout",
            OpKind::BatchNorm { .. } => "batchnorm",
            OpKind::MakeLoss => "makeloss",
        }
    }

    /// Number of inputs the operator takes.
    pub fn arity(&self) -> usize {
        match self {
            OpKind::Variable => 0,
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::Dot => 2,
            OpKind::BatchNorm { .. } => 3,
            _ => 1,
        }
    }

    /// Auxiliary states the operator carries.
    pub fn auxiliary_stats(&self) -> &'static [AuxStat] {
        match self {
            OpKind::BatchNorm { .. } => &[AuxStat::MovingMean, AuxStat::MovingVar],
            _ => &[],
        }
    }

    /// Reject attribute values no kernel can run with.
    pub fn check_attrs(&self) -> Result<()> {
        match *self {
            OpKind::Dropout { p } if !(0.0..1.0).contains(&p) => {
                bail!("dropout probability must lie in [0, 1), got {p}")
            }
            OpKind::BatchNorm { eps, .. } if !(eps.is_finite() && eps > 0.0) => {
                bail!("batch norm eps must be positive and finite, got {eps}")
            }
            OpKind::BatchNorm { momentum, .. } if !(0.0..=1.0).contains(&momentum) => {
                bail!("batch norm momentum must lie in [0, 1], got {momentum}")
            }
            OpKind::AddScalar(s) | OpKind::MulScalar(s) if !s.is_finite() => {
                bail!("scalar operand must be finite, got {s}")
            }
            _ => Ok(()),
        }
    }

    /// Whether the operator behaves differently in training mode.
    pub fn is_mode_dependent(&self) -> bool {
        matches!(self, OpKind::Dropout { .. } | OpKind::BatchNorm { .. })
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Variable => write!(f, "Variable"),
            OpKind::Add => write!(f, "Add"),
            OpKind::Sub => write!(f, "Sub"),
            OpKind::Mul => write!(f, "Mul"),
            OpKind::Div => write!(f, "Div"),
            OpKind::AddScalar(s) => write!(f, "AddScalar({s})"),
            OpKind::MulScalar(s) => write!(f, "MulScalar({s})"),
            OpKind::Relu => write!(f, "Relu"),
            OpKind::Sigmoid => write!(f, "Sigmoid"),
            OpKind::Tanh => write!(f, "Tanh"),
            OpKind::Sum => write!(f, "Sum"),
            OpKind::Dot => write!(f, "Dot"),
            OpKind::Dropout { p } => write!(f, "Dropout(p={p})"),
            OpKind::BatchNorm { eps, momentum } => {
                write!(f, "BatchNorm(eps={eps}, momentum={momentum})")
            }
            OpKind::MakeLoss => write!(f, "MakeLoss"),
        }
    }
}

/// Which running statistic an auxiliary slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuxStat {
    MovingMean,
    MovingVar,
}

impl AuxStat {
    pub fn suffix(&self) -> &'static str {
        match self {
            AuxStat::MovingMean => "moving_mean",
            AuxStat::MovingVar => "moving_var",
        }
    }
}
