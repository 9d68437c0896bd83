use bindgraph_core::{bail, DType, Error, Result, Shape, Slot, SlotKind, TensorSpec};

use crate::graph::SymbolGraph;
use crate::op::OpKind;

// Shape inference — Fixed-point unification over the whole graph
//
// Every node has one shape cell and one dtype cell. Seeds come from the
// caller's argument specs and from declared attributes; operator rules then
// unify the cells of each node with those of its inputs until nothing
// changes. Rules work in both directions, so `y = x * w` with only `x` known
// still yields a shape for `w`, and `dot(x, w)` recovers `w` from `x` and a
// declared output shape.
//
// A rule that finds a cell already holding a different value reports a
// ShapeMismatch: `expected` is what the rule requires, `got` is what the cell
// holds. Cells still empty at the fixed point are an error for shapes and
// default to f32 for dtypes.

pub(crate) struct Inferred {
    pub(crate) nodes: Vec<TensorSpec>,
    pub(crate) auxiliary: Vec<TensorSpec>,
}

struct Cells<'g> {
    graph: &'g SymbolGraph,
    shapes: Vec<Option<Shape>>,
    dtypes: Vec<Option<DType>>,
    changed: bool,
}

impl<'g> Cells<'g> {
    fn slot(&self, node: usize) -> Slot {
        let name = self.graph.node(node).name.clone();
        match self.graph.argument_position(node) {
            Some(pos) => Slot::new(SlotKind::Argument, pos, name),
            None => Slot::new(SlotKind::Node, node, name),
        }
    }

    fn spec(&self, node: usize, shape: Option<&Shape>, dtype: Option<DType>) -> TensorSpec {
        TensorSpec {
            shape: shape
                .or(self.shapes[node].as_ref())
                .cloned()
                .unwrap_or_else(|| Shape::from(())),
            dtype: dtype.or(self.dtypes[node]).unwrap_or_default(),
        }
    }

    fn unify_shape(&mut self, node: usize, required: &Shape) -> Result<()> {
        match &self.shapes[node] {
            None => {
                self.shapes[node] = Some(required.clone());
                self.changed = true;
                Ok(())
            }
            Some(held) if held == required => Ok(()),
            Some(held) => Err(Error::ShapeMismatch {
                slot: self.slot(node),
                expected: self.spec(node, Some(required), None),
                got: self.spec(node, Some(held), None),
            }),
        }
    }

    fn unify_dtype(&mut self, node: usize, required: DType) -> Result<()> {
        match self.dtypes[node] {
            None => {
                self.dtypes[node] = Some(required);
                self.changed = true;
                Ok(())
            }
            Some(held) if held == required => Ok(()),
            Some(held) => Err(Error::ShapeMismatch {
                slot: self.slot(node),
                expected: self.spec(node, None, Some(required)),
                got: self.spec(node, None, Some(held)),
            }),
        }
    }

    /// Unify all `ids` with the first known shape among them.
    fn unify_all_shapes(&mut self, ids: &[usize]) -> Result<()> {
        let known = ids.iter().find_map(|&i| self.shapes[i].clone());
        if let Some(shape) = known {
            for &i in ids {
                self.unify_shape(i, &shape)?;
            }
        }
        Ok(())
    }

    fn unify_all_dtypes(&mut self, ids: &[usize]) -> Result<()> {
        if let Some(dtype) = ids.iter().find_map(|&i| self.dtypes[i]) {
            for &i in ids {
                self.unify_dtype(i, dtype)?;
            }
        }
        Ok(())
    }

    fn matrix_dims(&self, node: usize) -> Result<Option<(usize, usize)>> {
        match &self.shapes[node] {
            None => Ok(None),
            Some(s) if s.rank() == 2 => Ok(Some((s.dims()[0], s.dims()[1]))),
            Some(s) => bail!(
                "dot expects rank-2 operands, {} has shape {}",
                self.slot(node),
                s
            ),
        }
    }

    fn apply_rule(&mut self, idx: usize) -> Result<()> {
        let graph = self.graph;
        let node = graph.node(idx);
        let inputs = node.inputs.clone();

        if node.op != OpKind::Variable {
            let mut ids = inputs.clone();
            ids.push(idx);
            self.unify_all_dtypes(&ids)?;
        }

        match &node.op {
            OpKind::Variable => {}
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
                self.unify_all_shapes(&[inputs[0], inputs[1], idx])?;
            }
            OpKind::AddScalar(_)
            | OpKind::MulScalar(_)
            | OpKind::Relu
            | OpKind::Sigmoid
            | OpKind::Tanh
            | OpKind::Dropout { .. }
            | OpKind::MakeLoss => {
                self.unify_all_shapes(&[inputs[0], idx])?;
            }
            OpKind::Sum => {
                self.unify_shape(idx, &Shape::from(1))?;
            }
            OpKind::Dot => {
                let (a, b) = (inputs[0], inputs[1]);
                let out = self.matrix_dims(idx)?;
                match (self.matrix_dims(a)?, self.matrix_dims(b)?) {
                    (Some((m, k)), Some((_, n))) => {
                        self.unify_shape(b, &Shape::from((k, n)))?;
                        self.unify_shape(idx, &Shape::from((m, n)))?;
                    }
                    (Some((m, k)), None) => {
                        if let Some((_, n)) = out {
                            self.unify_shape(b, &Shape::from((k, n)))?;
                            self.unify_shape(idx, &Shape::from((m, n)))?;
                        }
                    }
                    (None, Some((k, n))) => {
                        if let Some((m, _)) = out {
                            self.unify_shape(a, &Shape::from((m, k)))?;
                            self.unify_shape(idx, &Shape::from((m, n)))?;
                        }
                    }
                    (None, None) => {}
                }
            }
            OpKind::BatchNorm { .. } => {
                let (data, gamma, beta) = (inputs[0], inputs[1], inputs[2]);
                self.unify_all_shapes(&[data, idx])?;
                if let Some(shape) = self.shapes[data].clone() {
                    if shape.rank() < 2 {
                        bail!(
                            "batch norm expects rank >= 2 input, {} has shape {}",
                            self.slot(data),
                            shape
                        );
                    }
                    let channels = Shape::from(shape.dims()[1]);
                    self.unify_shape(gamma, &channels)?;
                    self.unify_shape(beta, &channels)?;
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn infer_nodes(graph: &SymbolGraph, given: &[Option<TensorSpec>]) -> Result<Inferred> {
    let arguments = graph.argument_nodes();
    if given.len() != arguments.len() {
        return Err(Error::InvalidArgumentCount {
            what: "argument",
            expected: arguments.len(),
            got: given.len(),
        });
    }

    let n = graph.nodes().len();
    let mut cells = Cells {
        graph,
        shapes: vec![None; n],
        dtypes: vec![None; n],
        changed: false,
    };

    for (&node, spec) in arguments.iter().zip(given) {
        if let Some(spec) = spec {
            cells.shapes[node] = Some(spec.shape.clone());
            cells.dtypes[node] = Some(spec.dtype);
        }
    }
    for (i, node) in graph.nodes().iter().enumerate() {
        if let Some(shape) = &node.shape {
            cells.unify_shape(i, shape)?;
        }
        if let Some(dtype) = node.dtype {
            cells.unify_dtype(i, dtype)?;
        }
    }

    loop {
        cells.changed = false;
        for i in 0..n {
            cells.apply_rule(i)?;
        }
        if !cells.changed {
            break;
        }
    }

    let mut nodes = Vec::with_capacity(n);
    for i in 0..n {
        let Some(shape) = cells.shapes[i].clone() else {
            bail!("cannot infer the shape of {}", cells.slot(i));
        };
        nodes.push(TensorSpec {
            shape,
            dtype: cells.dtypes[i].unwrap_or_default(),
        });
    }

    let auxiliary = graph
        .auxiliary_slots()
        .iter()
        .map(|aux| {
            let owner = graph.node(aux.node);
            let data = &nodes[owner.inputs[0]];
            TensorSpec {
                shape: Shape::from(data.shape.dims()[1]),
                dtype: nodes[aux.node].dtype,
            }
        })
        .collect();

    Ok(Inferred { nodes, auxiliary })
}
