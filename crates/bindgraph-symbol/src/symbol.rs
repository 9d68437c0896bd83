use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bindgraph_core::{DType, Result, Shape};

use crate::graph::SymbolGraph;
use crate::op::OpKind;

// Symbol — Composable handle to a symbolic expression
//
// A Symbol is a list of output nodes in an immutable DAG. Building a new
// expression never modifies existing nodes: every operator call allocates a
// fresh node that points at its inputs through Arc, so sub-expressions can be
// shared freely between symbols and between graphs.
//
//   let x = Symbol::variable("x");
//   let w = Symbol::variable("w");
//   let y = &x * &w;                 // Mul node reading x and w
//   let graph = y.to_graph()?;       // flatten for binding
//
// Attribute setters (`named`, `with_shape`, `with_dtype`, `with_ctx_group`)
// rebuild the head node with the same inputs and return a new Symbol.

/// Identity of a node, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        NodeId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Attributes attached to a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeAttrs {
    /// Declared shape, checked during inference.
    pub shape: Option<Shape>,
    /// Declared dtype, checked during inference.
    pub dtype: Option<DType>,
    /// Placement group, resolved through the executor's group map.
    pub ctx_group: Option<String>,
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) op: OpKind,
    pub(crate) inputs: Vec<Arc<Node>>,
    pub(crate) attrs: NodeAttrs,
}

impl Node {
    fn new(op: OpKind, inputs: Vec<Arc<Node>>, name: Option<String>) -> Arc<Node> {
        let id = NodeId::next();
        let name = name.unwrap_or_else(|| format!("{}{}", op.name_prefix(), id.0));
        Arc::new(Node {
            id,
            name,
            op,
            inputs,
            attrs: NodeAttrs::default(),
        })
    }
}

/// A symbolic expression with one or more outputs.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub(crate) outputs: Vec<Arc<Node>>,
}

impl Symbol {
    fn from_node(node: Arc<Node>) -> Self {
        Symbol {
            outputs: vec![node],
        }
    }

    fn head(&self) -> &Arc<Node> {
        // Symbols are only ever built with at least one output.
        &self.outputs[0]
    }

    fn apply(op: OpKind, inputs: &[&Symbol]) -> Symbol {
        let inputs = inputs.iter().map(|s| Arc::clone(s.head())).collect();
        Symbol::from_node(Node::new(op, inputs, None))
    }

    fn rebuild_head(&self, edit: impl FnOnce(&mut String, &mut NodeAttrs)) -> Symbol {
        let head = self.head();
        let mut name = head.name.clone();
        let mut attrs = head.attrs.clone();
        edit(&mut name, &mut attrs);
        let node = Arc::new(Node {
            id: NodeId::next(),
            name,
            op: head.op.clone(),
            inputs: head.inputs.clone(),
            attrs,
        });
        let mut outputs = self.outputs.clone();
        outputs[0] = node;
        Symbol { outputs }
    }

    //  Leaves and grouping

    /// A named argument slot.
    pub fn variable(name: impl Into<String>) -> Symbol {
        Symbol::from_node(Node::new(OpKind::Variable, Vec::new(), Some(name.into())))
    }

    /// Concatenate the outputs of several symbols into one multi-output symbol.
    pub fn group(symbols: &[Symbol]) -> Result<Symbol> {
        let outputs: Vec<Arc<Node>> = symbols
            .iter()
            .flat_map(|s| s.outputs.iter().cloned())
            .collect();
        if outputs.is_empty() {
            bindgraph_core::bail!("cannot group an empty list of symbols");
        }
        Ok(Symbol { outputs })
    }

    //  Attributes

    /// Rename the head node.
    pub fn named(&self, name: impl Into<String>) -> Symbol {
        let name = name.into();
        self.rebuild_head(|n, _| *n = name)
    }

    /// Declare the head node's shape.
    pub fn with_shape(&self, shape: impl Into<Shape>) -> Symbol {
        let shape = shape.into();
        self.rebuild_head(|_, a| a.shape = Some(shape))
    }

    /// Declare the head node's dtype.
    pub fn with_dtype(&self, dtype: DType) -> Symbol {
        self.rebuild_head(|_, a| a.dtype = Some(dtype))
    }

    /// Tag the head node with a placement group.
    pub fn with_ctx_group(&self, group: impl Into<String>) -> Symbol {
        let group = group.into();
        self.rebuild_head(|_, a| a.ctx_group = Some(group))
    }

    //  Introspection

    /// Name of the head node.
    pub fn name(&self) -> &str {
        &self.head().name
    }

    /// Names of all outputs.
    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|n| n.name.clone()).collect()
    }

    /// Number of outputs.
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Operator of the head node.
    pub fn op(&self) -> &OpKind {
        &self.head().op
    }

    /// Attributes of the head node.
    pub fn attrs(&self) -> &NodeAttrs {
        &self.head().attrs
    }

    /// Flatten into a bindable graph.
    pub fn to_graph(&self) -> Result<SymbolGraph> {
        SymbolGraph::from_symbol(self)
    }

    //  Operators

    pub fn add(&self, rhs: &Symbol) -> Symbol {
        Symbol::apply(OpKind::Add, &[self, rhs])
    }

    pub fn sub(&self, rhs: &Symbol) -> Symbol {
        Symbol::apply(OpKind::Sub, &[self, rhs])
    }

    pub fn mul(&self, rhs: &Symbol) -> Symbol {
        Symbol::apply(OpKind::Mul, &[self, rhs])
    }

    pub fn div(&self, rhs: &Symbol) -> Symbol {
        Symbol::apply(OpKind::Div, &[self, rhs])
    }

    pub fn add_scalar(&self, s: f64) -> Symbol {
        Symbol::apply(OpKind::AddScalar(s), &[self])
    }

    pub fn mul_scalar(&self, s: f64) -> Symbol {
        Symbol::apply(OpKind::MulScalar(s), &[self])
    }

    pub fn relu(&self) -> Symbol {
        Symbol::apply(OpKind::Relu, &[self])
    }

    pub fn sigmoid(&self) -> Symbol {
        Symbol::apply(OpKind::Sigmoid, &[self])
    }

    pub fn tanh(&self) -> Symbol {
        Symbol::apply(OpKind::Tanh, &[self])
    }

    /// Sum of all elements.
    pub fn sum(&self) -> Symbol {
        Symbol::apply(OpKind::Sum, &[self])
    }

    /// 2-D matrix product.
    pub fn dot(&self, rhs: &Symbol) -> Symbol {
        Symbol::apply(OpKind::Dot, &[self, rhs])
    }

    /// Inverted dropout with drop probability `p`.
    pub fn dropout(&self, p: f64) -> Symbol {
        Symbol::apply(OpKind::Dropout { p }, &[self])
    }

    /// Batch normalization over axis 1 with scale `gamma` and shift `beta`.
    ///
    /// The node declares two auxiliary states, `<name>_moving_mean` and
    /// `<name>_moving_var`.
    pub fn batch_norm(&self, gamma: &Symbol, beta: &Symbol, eps: f64, momentum: f64) -> Symbol {
        Symbol::apply(OpKind::BatchNorm { eps, momentum }, &[self, gamma, beta])
    }

    /// Mark as a loss head.
    pub fn make_loss(&self) -> Symbol {
        Symbol::apply(OpKind::MakeLoss, &[self])
    }
}

impl std::ops::Add for &Symbol {
    type Output = Symbol;
    fn add(self, rhs: &Symbol) -> Symbol {
        Symbol::add(self, rhs)
    }
}

impl std::ops::Sub for &Symbol {
    type Output = Symbol;
    fn sub(self, rhs: &Symbol) -> Symbol {
        Symbol::sub(self, rhs)
    }
}

impl std::ops::Mul for &Symbol {
    type Output = Symbol;
    fn mul(self, rhs: &Symbol) -> Symbol {
        Symbol::mul(self, rhs)
    }
}

impl std::ops::Div for &Symbol {
    type Output = Symbol;
    fn div(self, rhs: &Symbol) -> Symbol {
        Symbol::div(self, rhs)
    }
}

impl std::ops::Add<f64> for &Symbol {
    type Output = Symbol;
    fn add(self, rhs: f64) -> Symbol {
        self.add_scalar(rhs)
    }
}

impl std::ops::Mul<f64> for &Symbol {
    type Output = Symbol;
    fn mul(self, rhs: f64) -> Symbol {
        self.mul_scalar(rhs)
    }
}
