//! The differentiable graph: an arena of variables and operation descriptors.
//!
//! Variables and operations live in dense vectors owned by the [`Graph`] and
//! refer to each other by index ([`VarId`], [`OpId`]), so neither side holds a
//! reference to the other or to the graph itself. Every construction call
//! validates fully before it mutates anything: a failed call leaves the graph
//! exactly as it was.

mod execute;

use crate::ops::Op;
use crate::runtime::backend::KernelError;
use crate::tensor::{Precision, TensorHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

pub use execute::ExecutionResult;

/// Index of a variable inside its graph.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub usize);

/// Instance id of an operation inside its graph (registration order).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub usize);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("variable '{0}' already exists in the graph")]
    DuplicateName(String),

    #[error("operation '{op}' expects {expected}, got {inputs} input(s) and {outputs} output(s)")]
    Arity {
        op: String,
        expected: String,
        inputs: usize,
        outputs: usize,
    },

    #[error("operation '{op}' is missing required attribute '{attribute}'")]
    MissingAttribute { op: String, attribute: String },

    #[error("invalid attribute '{attribute}' on operation '{op}': {message}")]
    InvalidAttribute {
        op: String,
        attribute: String,
        message: String,
    },

    #[error("no array was supplied for variable '{0}'")]
    MissingArray(String),

    #[error("unsupported operation '{op}': {reason}")]
    UnsupportedOperation { op: String, reason: String },

    #[error("variable '{variable}' has no value, needed by '{needed_by}'")]
    UnresolvedInput { variable: String, needed_by: String },

    #[error("operation '{op}' would make variable '{variable}' depend on itself")]
    Cycle { op: String, variable: String },

    #[error("variable '{variable}' is already produced by operation '{existing}'")]
    ProducerConflict { variable: String, existing: String },

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("unknown operation {0}")]
    UnknownOperation(OpId),

    #[error("gradient for '{variable}' has shape {actual:?}, expected {expected:?}")]
    GradientShape {
        variable: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("kernel for operation '{op}' failed: {source}")]
    Kernel {
        op: String,
        #[source]
        source: KernelError,
    },
}

/// Named data-carrying vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    id: VarId,
    name: String,
    tensor: Option<TensorHandle>,
    producer: Option<OpId>,
    consumers: Vec<OpId>,
    /// Bound value has been permuted into `OIHW` convolution weights.
    oihw_weights: bool,
}

impl Variable {
    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tensor(&self) -> Option<&TensorHandle> {
        self.tensor.as_ref()
    }

    /// Operation whose output this is; `None` for leaves.
    pub fn producer(&self) -> Option<OpId> {
        self.producer
    }

    /// Operations reading this variable, in registration order.
    pub fn consumers(&self) -> &[OpId] {
        &self.consumers
    }

    pub fn is_leaf(&self) -> bool {
        self.producer.is_none()
    }

    /// Whether the bound value is already in canonical `OIHW` weight layout,
    /// whatever format a convolution reading it declares.
    pub fn holds_oihw_weights(&self) -> bool {
        self.oihw_weights
    }
}

/// Operation descriptor registered in a graph.
#[derive(Debug, Clone, PartialEq)]
pub struct OpNode {
    id: OpId,
    op: Op,
    inputs: Vec<VarId>,
    outputs: Vec<VarId>,
}

impl OpNode {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn inputs(&self) -> &[VarId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[VarId] {
        &self.outputs
    }

    /// `<variant>#<id>`, used in errors and logs.
    pub fn label(&self) -> String {
        format!("{}{}", self.op.name(), self.id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    precision: Precision,
    variables: Vec<Variable>,
    names: HashMap<String, VarId>,
    operations: Vec<OpNode>,
    /// Child graphs, e.g. the gradient graph under `"grad-external"`.
    functions: HashMap<String, Graph>,
    next_anonymous: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_precision(precision: Precision) -> Self {
        Self {
            precision,
            ..Self::default()
        }
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    pub fn operations(&self) -> impl Iterator<Item = &OpNode> {
        self.operations.iter()
    }

    pub fn variable(&self, id: VarId) -> GraphResult<&Variable> {
        self.variables
            .get(id.0)
            .ok_or_else(|| GraphError::UnknownVariable(id.to_string()))
    }

    pub fn variable_by_name(&self, name: &str) -> GraphResult<&Variable> {
        let id = self.id_of(name)?;
        self.variable(id)
    }

    pub fn id_of(&self, name: &str) -> GraphResult<VarId> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownVariable(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn operation(&self, id: OpId) -> GraphResult<&OpNode> {
        self.operations
            .get(id.0)
            .ok_or(GraphError::UnknownOperation(id))
    }

    pub(crate) fn operation_mut(&mut self, id: OpId) -> GraphResult<&mut OpNode> {
        self.operations
            .get_mut(id.0)
            .ok_or(GraphError::UnknownOperation(id))
    }

    /// Tensor currently bound to `name`, if any.
    pub fn tensor(&self, name: &str) -> Option<&TensorHandle> {
        self.names
            .get(name)
            .and_then(|id| self.variables[id.0].tensor.as_ref())
    }

    pub fn function(&self, name: &str) -> Option<&Graph> {
        self.functions.get(name)
    }

    /// Registers (or replaces) a child graph and returns it.
    pub(crate) fn put_function(&mut self, name: &str, graph: Graph) -> &mut Graph {
        let slot = self.functions.entry(name.to_string()).or_default();
        *slot = graph;
        slot
    }

    /// Creates a named variable, optionally bound to a tensor.
    ///
    /// The tensor is re-rounded to the graph's precision when they differ.
    pub fn add_variable(&mut self, name: &str, tensor: Option<TensorHandle>) -> GraphResult<VarId> {
        self.check_name_free(name)?;
        let tensor = tensor.map(|t| t.with_precision(self.precision));
        Ok(self.push_variable(name.to_string(), tensor))
    }

    /// Binds (or replaces) the tensor held by a variable.
    ///
    /// Replacing the value of an operation's output is allowed; the next
    /// execution overwrites it again.
    pub fn set_tensor(&mut self, id: VarId, tensor: TensorHandle) -> GraphResult<()> {
        let precision = self.precision;
        let var = self
            .variables
            .get_mut(id.0)
            .ok_or_else(|| GraphError::UnknownVariable(id.to_string()))?;
        var.tensor = Some(tensor.with_precision(precision));
        var.oihw_weights = false;
        Ok(())
    }

    pub fn rename_variable(&mut self, id: VarId, new_name: &str) -> GraphResult<()> {
        let old = self.variable(id)?.name.clone();
        if old == new_name {
            return Ok(());
        }
        self.check_name_free(new_name)?;
        self.names.remove(&old);
        self.names.insert(new_name.to_string(), id);
        self.variables[id.0].name = new_name.to_string();
        Ok(())
    }

    /// Registers an operation over existing variables.
    ///
    /// Fails with `Arity` when the variable counts do not match the variant's
    /// signature, with `ProducerConflict` when an output already has a
    /// producer and with `Cycle` when an output is (transitively) one of the
    /// inputs.
    pub fn add_operation(&mut self, op: Op, inputs: &[VarId], outputs: &[VarId]) -> GraphResult<OpId> {
        self.check_signature(&op, inputs.len(), outputs.len())?;
        self.check_known(inputs)?;
        self.check_known(outputs)?;

        for (i, &out) in outputs.iter().enumerate() {
            let var = &self.variables[out.0];
            if let Some(existing) = var.producer {
                return Err(GraphError::ProducerConflict {
                    variable: var.name.clone(),
                    existing: self.operations[existing.0].label(),
                });
            }
            if outputs[..i].contains(&out) {
                return Err(GraphError::ProducerConflict {
                    variable: var.name.clone(),
                    existing: op.name().to_string(),
                });
            }
        }
        self.check_acyclic(&op, inputs, outputs)?;

        Ok(self.push_operation(op, inputs.to_vec(), outputs.to_vec()))
    }

    /// Places a single-output operation and creates its output variable.
    ///
    /// Anonymous outputs are named `<variant>_<n>`.
    pub fn apply(&mut self, op: Op, name: Option<&str>, inputs: &[VarId]) -> GraphResult<VarId> {
        self.check_signature(&op, inputs.len(), 1)?;
        self.check_known(inputs)?;
        let name = match name {
            Some(name) => {
                self.check_name_free(name)?;
                name.to_string()
            }
            None => self.fresh_name(op.name()),
        };
        // A brand-new output has no consumers, so no cycle is possible.
        let output = self.push_variable(name, None);
        self.push_operation(op, inputs.to_vec(), vec![output]);
        Ok(output)
    }

    pub fn unary(&mut self, op: Op, name: Option<&str>, input: VarId) -> GraphResult<VarId> {
        self.apply(op, name, &[input])
    }

    pub fn binary(&mut self, op: Op, name: Option<&str>, lhs: VarId, rhs: VarId) -> GraphResult<VarId> {
        self.apply(op, name, &[lhs, rhs])
    }

    /// A name not yet used in this graph, starting with `prefix`.
    pub fn fresh_name(&mut self, prefix: &str) -> String {
        loop {
            let candidate = format!("{}_{}", prefix, self.next_anonymous);
            self.next_anonymous += 1;
            if !self.names.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn check_name_free(&self, name: &str) -> GraphResult<()> {
        if self.names.contains_key(name) {
            return Err(GraphError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    fn check_signature(&self, op: &Op, inputs: usize, outputs: usize) -> GraphResult<()> {
        if !op.validate_arity(inputs, outputs) {
            return Err(GraphError::Arity {
                op: op.name().to_string(),
                expected: op.signature(),
                inputs,
                outputs,
            });
        }
        op.validate_config()
            .map_err(|(attribute, message)| GraphError::InvalidAttribute {
                op: op.name().to_string(),
                attribute: attribute.to_string(),
                message,
            })
    }

    fn check_known(&self, ids: &[VarId]) -> GraphResult<()> {
        for id in ids {
            self.variable(*id)?;
        }
        Ok(())
    }

    /// Walks upstream from the inputs; reaching any output means a cycle.
    fn check_acyclic(&self, op: &Op, inputs: &[VarId], outputs: &[VarId]) -> GraphResult<()> {
        let mut stack: Vec<VarId> = inputs.to_vec();
        let mut seen = vec![false; self.variables.len()];
        while let Some(id) = stack.pop() {
            if outputs.contains(&id) {
                return Err(GraphError::Cycle {
                    op: op.name().to_string(),
                    variable: self.variables[id.0].name.clone(),
                });
            }
            if std::mem::replace(&mut seen[id.0], true) {
                continue;
            }
            if let Some(producer) = self.variables[id.0].producer {
                stack.extend(self.operations[producer.0].inputs.iter().copied());
            }
        }
        Ok(())
    }

    fn push_variable(&mut self, name: String, tensor: Option<TensorHandle>) -> VarId {
        let id = VarId(self.variables.len());
        self.names.insert(name.clone(), id);
        self.variables.push(Variable {
            id,
            name,
            tensor,
            producer: None,
            consumers: Vec::new(),
            oihw_weights: false,
        });
        id
    }

    fn push_operation(&mut self, op: Op, inputs: Vec<VarId>, outputs: Vec<VarId>) -> OpId {
        let id = OpId(self.operations.len());
        for (i, input) in inputs.iter().enumerate() {
            if !inputs[..i].contains(input) {
                self.variables[input.0].consumers.push(id);
            }
        }
        for output in &outputs {
            self.variables[output.0].producer = Some(id);
        }
        tracing::trace!(op = %op, id = id.0, "registered operation");
        self.operations.push(OpNode {
            id,
            op,
            inputs,
            outputs,
        });
        id
    }

    pub(crate) fn bind_unchecked(&mut self, id: VarId, tensor: TensorHandle) {
        self.variables[id.0].tensor = Some(tensor);
    }

    /// Marks a bound leaf as holding weights in `OIHW`, so no convolution
    /// permutes it again.
    pub(crate) fn mark_oihw_weights(&mut self, id: VarId) -> GraphResult<()> {
        let var = self
            .variables
            .get_mut(id.0)
            .ok_or_else(|| GraphError::UnknownVariable(id.to_string()))?;
        var.oihw_weights = true;
        Ok(())
    }
}
