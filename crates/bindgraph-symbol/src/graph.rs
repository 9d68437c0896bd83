use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bindgraph_core::{bail, DType, Error, Graph, Result, Shape, ShapeTable, TensorSpec};

use crate::infer;
use crate::op::{AuxStat, OpKind};
use crate::symbol::{Node, NodeId, Symbol};

// SymbolGraph — A Symbol flattened for binding
//
// Flattening walks the DAG depth-first from the outputs, visiting inputs in
// order, and lays nodes out in post-order. That single walk fixes every
// ordering the executor depends on:
//
//   - nodes:      topological (every input precedes its consumer)
//   - arguments:  variables in first-visit order
//   - auxiliary:  per-node running statistics in first-visit order
//   - outputs:    the symbol's output order
//
// The flattened form is immutable and sits behind an Arc, so one graph can
// back a training executor and an inference executor at the same time.

/// One node of a flattened graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub name: String,
    pub op: OpKind,
    /// Indices into [`SymbolGraph::nodes`].
    pub inputs: Vec<usize>,
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
    pub ctx_group: Option<String>,
    /// Indices into [`SymbolGraph::auxiliary_slots`].
    pub aux: Vec<usize>,
}

/// An auxiliary state slot and the node that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct AuxSlot {
    pub name: String,
    pub node: usize,
    pub stat: AuxStat,
}

#[derive(Debug)]
struct GraphInner {
    nodes: Vec<GraphNode>,
    arguments: Vec<usize>,
    auxiliary: Vec<AuxSlot>,
    outputs: Vec<usize>,
}

/// Immutable, shareable flattened graph.
#[derive(Debug, Clone)]
pub struct SymbolGraph {
    inner: Arc<GraphInner>,
}

struct Flattener {
    index: HashMap<NodeId, usize>,
    nodes: Vec<GraphNode>,
    arguments: Vec<usize>,
    auxiliary: Vec<AuxSlot>,
}

impl Flattener {
    fn visit(&mut self, node: &Arc<Node>) -> Result<usize> {
        if let Some(&i) = self.index.get(&node.id) {
            return Ok(i);
        }
        if node.inputs.len() != node.op.arity() {
            bail!(
                "node '{}' ({}) expects {} inputs, got {}",
                node.name,
                node.op,
                node.op.arity(),
                node.inputs.len()
            );
        }
        node.op
            .check_attrs()
            .map_err(|e| Error::msg(format!("node '{}': {e}", node.name)))?;
        let mut inputs = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            inputs.push(self.visit(input)?);
        }

        let idx = self.nodes.len();
        let mut aux = Vec::new();
        for &stat in node.op.auxiliary_stats() {
            aux.push(self.auxiliary.len());
            self.auxiliary.push(AuxSlot {
                name: format!("{}_{}", node.name, stat.suffix()),
                node: idx,
                stat,
            });
        }
        if node.op == OpKind::Variable {
            self.arguments.push(idx);
        }
        self.nodes.push(GraphNode {
            name: node.name.clone(),
            op: node.op.clone(),
            inputs,
            shape: node.attrs.shape.clone(),
            dtype: node.attrs.dtype,
            ctx_group: node.attrs.ctx_group.clone(),
            aux,
        });
        self.index.insert(node.id, idx);
        Ok(idx)
    }
}

fn check_unique<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            bail!("duplicate {what} name '{name}'");
        }
    }
    Ok(())
}

impl SymbolGraph {
    /// Flatten `symbol`. Argument and auxiliary names must be unique.
    pub fn from_symbol(symbol: &Symbol) -> Result<Self> {
        let mut flat = Flattener {
            index: HashMap::new(),
            nodes: Vec::new(),
            arguments: Vec::new(),
            auxiliary: Vec::new(),
        };
        let mut outputs = Vec::with_capacity(symbol.outputs.len());
        for out in &symbol.outputs {
            outputs.push(flat.visit(out)?);
        }

        check_unique(
            "argument",
            flat.arguments.iter().map(|&i| flat.nodes[i].name.as_str()),
        )?;
        check_unique(
            "auxiliary state",
            flat.auxiliary.iter().map(|a| a.name.as_str()),
        )?;

        Ok(SymbolGraph {
            inner: Arc::new(GraphInner {
                nodes: flat.nodes,
                arguments: flat.arguments,
                auxiliary: flat.auxiliary,
                outputs,
            }),
        })
    }

    /// Nodes in topological order.
    pub fn nodes(&self) -> &[GraphNode] {
        &self.inner.nodes
    }

    pub fn node(&self, index: usize) -> &GraphNode {
        &self.inner.nodes[index]
    }

    /// Node indices of the arguments, in binding order.
    pub fn argument_nodes(&self) -> &[usize] {
        &self.inner.arguments
    }

    pub fn auxiliary_slots(&self) -> &[AuxSlot] {
        &self.inner.auxiliary
    }

    /// Node indices of the outputs.
    pub fn output_nodes(&self) -> &[usize] {
        &self.inner.outputs
    }

    /// Position of node `index` in the argument list, if it is an argument.
    pub fn argument_position(&self, index: usize) -> Option<usize> {
        self.inner.arguments.iter().position(|&a| a == index)
    }

    /// Whether two handles share one flattened graph.
    pub fn ptr_eq(&self, other: &SymbolGraph) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Per-node specs, positionally aligned with [`SymbolGraph::nodes`].
    pub fn infer_node_specs(&self, given: &[Option<TensorSpec>]) -> Result<Vec<TensorSpec>> {
        infer::infer_nodes(self, given).map(|r| r.nodes)
    }

    /// One line per node.
    pub fn debug_string(&self) -> String {
        self.to_string()
    }
}

impl Graph for SymbolGraph {
    fn argument_names(&self) -> Vec<String> {
        self.inner
            .arguments
            .iter()
            .map(|&i| self.inner.nodes[i].name.clone())
            .collect()
    }

    fn auxiliary_names(&self) -> Vec<String> {
        self.inner.auxiliary.iter().map(|a| a.name.clone()).collect()
    }

    fn output_names(&self) -> Vec<String> {
        self.inner
            .outputs
            .iter()
            .map(|&i| self.inner.nodes[i].name.clone())
            .collect()
    }

    fn output_count(&self) -> usize {
        self.inner.outputs.len()
    }

    fn context_groups(&self) -> Vec<String> {
        let groups: BTreeSet<&String> = self
            .inner
            .nodes
            .iter()
            .filter_map(|n| n.ctx_group.as_ref())
            .collect();
        groups.into_iter().cloned().collect()
    }

    fn infer_shapes(&self, given: &[Option<TensorSpec>]) -> Result<ShapeTable> {
        let inferred = infer::infer_nodes(self, given)?;
        Ok(ShapeTable {
            arguments: self
                .inner
                .arguments
                .iter()
                .map(|&i| inferred.nodes[i].clone())
                .collect(),
            auxiliary_states: inferred.auxiliary,
            outputs: self
                .inner
                .outputs
                .iter()
                .map(|&i| inferred.nodes[i].clone())
                .collect(),
        })
    }
}

impl fmt::Display for SymbolGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.inner.nodes.iter().enumerate() {
            write!(f, "#{i} {} = {}", node.name, node.op)?;
            if !node.inputs.is_empty() {
                let names: Vec<&str> = node
                    .inputs
                    .iter()
                    .map(|&j| self.inner.nodes[j].name.as_str())
                    .collect();
                write!(f, "({})", names.join(", "))?;
            }
            if let Some(group) = &node.ctx_group {
                write!(f, " @{group}")?;
            }
            writeln!(f)?;
        }
        let outputs: Vec<String> = self.output_names();
        write!(f, "outputs: [{}]", outputs.join(", "))
    }
}
