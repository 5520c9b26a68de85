//! Forward execution and the one-time materialization step.

use super::{Graph, GraphError, GraphResult, OpId, VarId};
use crate::ops::{Conv2dConfig, Op};
use crate::runtime::backend::{Kernel, KernelError};
use crate::tensor::{TensorHandle, WeightFormat};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

/// Every bound variable after a pass, by name.
pub type ExecutionResult = BTreeMap<String, TensorHandle>;

/// Memoized evaluation state of a single forward pass.
///
/// Values are collected here and only written back to the graph once the
/// whole pass has succeeded.
struct ExecutionContext<'a> {
    graph: &'a Graph,
    kernels: &'a dyn Kernel,
    values: HashMap<VarId, TensorHandle>,
    executed: HashSet<OpId>,
}

impl<'a> ExecutionContext<'a> {
    fn new(graph: &'a Graph, kernels: &'a dyn Kernel) -> Self {
        Self {
            graph,
            kernels,
            values: HashMap::new(),
            executed: HashSet::new(),
        }
    }

    /// Concrete value of a variable, running its producer if needed.
    fn resolve(&mut self, id: VarId, needed_by: &str) -> GraphResult<TensorHandle> {
        if let Some(value) = self.values.get(&id) {
            return Ok(value.clone());
        }
        let graph = self.graph;
        let var = graph.variable(id)?;
        let unresolved = || GraphError::UnresolvedInput {
            variable: var.name().to_string(),
            needed_by: needed_by.to_string(),
        };
        match var.producer() {
            Some(producer) => {
                self.evaluate_op(producer)?;
                self.values.get(&id).cloned().ok_or_else(unresolved)
            }
            None => var.tensor().cloned().ok_or_else(unresolved),
        }
    }

    /// Runs an operation at most once per pass.
    fn evaluate_op(&mut self, id: OpId) -> GraphResult<()> {
        if self.executed.contains(&id) {
            return Ok(());
        }
        let graph = self.graph;
        let node = graph.operation(id)?;
        let label = node.label();

        let mut inputs = Vec::with_capacity(node.inputs().len());
        for &input in node.inputs() {
            inputs.push(self.resolve(input, &label)?);
        }

        tracing::debug!(op = %node.op(), id = id.0, inputs = inputs.len(), "executing");
        let outputs = self
            .kernels
            .invoke(node.op(), &inputs)
            .map_err(|source| GraphError::Kernel {
                op: label.clone(),
                source,
            })?;
        if outputs.len() != node.outputs().len() {
            return Err(GraphError::Kernel {
                op: label,
                source: KernelError::Shape(format!(
                    "kernel returned {} output(s), operation declares {}",
                    outputs.len(),
                    node.outputs().len()
                )),
            });
        }

        for (&var, array) in node.outputs().iter().zip(outputs) {
            self.values
                .insert(var, TensorHandle::new(array, graph.precision()));
        }
        self.executed.insert(id);
        Ok(())
    }
}

impl Graph {
    /// Operations in dependency order; ties go to the earlier registration.
    pub fn topological_order(&self) -> GraphResult<Vec<OpId>> {
        let mut pending: Vec<usize> = self
            .operations
            .iter()
            .map(|node| {
                let mut seen: Vec<VarId> = Vec::new();
                node.inputs
                    .iter()
                    .filter(|&&input| {
                        let fresh = !seen.contains(&input);
                        seen.push(input);
                        fresh && self.variables[input.0].producer.is_some()
                    })
                    .count()
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<OpId>> = pending
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(i, _)| Reverse(OpId(i)))
            .collect();

        let mut order = Vec::with_capacity(self.operations.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for output in &self.operations[id.0].outputs {
                for consumer in &self.variables[output.0].consumers {
                    pending[consumer.0] -= 1;
                    if pending[consumer.0] == 0 {
                        ready.push(Reverse(*consumer));
                    }
                }
            }
        }

        if order.len() != self.operations.len() {
            // Only reachable for graphs assembled without the checked API.
            let stuck = pending
                .iter()
                .position(|&count| count > 0)
                .map(|i| &self.operations[i]);
            if let Some(node) = stuck {
                let variable = node
                    .inputs
                    .first()
                    .map(|id| self.variables[id.0].name.clone())
                    .unwrap_or_default();
                return Err(GraphError::Cycle {
                    op: node.label(),
                    variable,
                });
            }
        }
        Ok(order)
    }

    /// Runs every operation and binds the results to their output variables.
    pub fn execute(&mut self, kernels: &dyn Kernel) -> GraphResult<ExecutionResult> {
        self.execute_with(kernels, &HashMap::new())
    }

    /// Like [`execute`](Self::execute), after materializing with the given
    /// placeholder values.
    pub fn execute_with(
        &mut self,
        kernels: &dyn Kernel,
        placeholders: &HashMap<String, TensorHandle>,
    ) -> GraphResult<ExecutionResult> {
        self.materialize(placeholders)?;
        let order = self.topological_order()?;
        tracing::debug!(operations = order.len(), precision = ?self.precision, "forward pass");

        let values = {
            let mut ctx = ExecutionContext::new(self, kernels);
            for id in order {
                ctx.evaluate_op(id)?;
            }
            ctx.values
        };
        for (id, value) in values {
            self.bind_unchecked(id, value);
        }
        Ok(self.bound_values())
    }

    /// Snapshot of every variable that currently holds a value.
    pub fn bound_values(&self) -> ExecutionResult {
        self.variables
            .iter()
            .filter_map(|v| v.tensor.clone().map(|t| (v.name.clone(), t)))
            .collect()
    }

    /// One-time preparation before the first forward pass.
    ///
    /// Binds placeholder values to unbound leaves (bound leaves keep their
    /// value; use [`set_tensor`](Self::set_tensor) to replace one). Then, for
    /// every convolution not yet materialized: resolves its weights (bound
    /// value or placeholder), permutes them into `OIHW`, and records the
    /// kernel size they imply. All checks run before anything is written, so
    /// a failure leaves the graph untouched. Calling it again is a no-op for
    /// convolutions already materialized.
    pub fn materialize(&mut self, placeholders: &HashMap<String, TensorHandle>) -> GraphResult<()> {
        let mut bindings: HashMap<VarId, TensorHandle> = HashMap::new();

        for (name, value) in placeholders {
            let id = self.id_of(name)?;
            let var = &self.variables[id.0];
            if var.is_leaf() && var.tensor.is_none() {
                bindings.insert(id, value.with_precision(self.precision));
            }
        }

        let mut configs: Vec<(OpId, Conv2dConfig)> = Vec::new();
        // Weights permuted by this call; earlier calls leave a mark on the variable.
        let mut permuted: HashSet<VarId> = HashSet::new();

        for node in &self.operations {
            let Op::Conv2d(cfg) = &node.op else { continue };
            if cfg.materialized {
                continue;
            }
            let label = node.label();
            let weight_id = node.inputs[1];
            let weight_var = &self.variables[weight_id.0];
            let mut cfg = cfg.clone();

            if !weight_var.is_leaf() {
                // Computed weights are produced in canonical layout.
                if cfg.weight_format != WeightFormat::Oihw {
                    return Err(GraphError::InvalidAttribute {
                        op: label,
                        attribute: "weight_format".to_string(),
                        message: format!(
                            "weights '{}' are computed and must already be OIHW",
                            weight_var.name
                        ),
                    });
                }
                cfg.materialized = true;
                configs.push((node.id, cfg));
                continue;
            }

            let weights = match bindings.get(&weight_id).or(weight_var.tensor.as_ref()) {
                Some(w) => w.clone(),
                None => return Err(GraphError::MissingArray(weight_var.name.clone())),
            };
            if weights.shape().len() != 4 {
                return Err(GraphError::InvalidAttribute {
                    op: label,
                    attribute: "weights".to_string(),
                    message: format!(
                        "'{}' must be 4-D, got shape {:?}",
                        weight_var.name,
                        weights.shape()
                    ),
                });
            }

            let canonical = if cfg.weight_format == WeightFormat::Oihw
                || weight_var.holds_oihw_weights()
                || permuted.contains(&weight_id)
            {
                weights
            } else {
                let order = cfg.weight_format.to_canonical();
                tracing::debug!(op = %label, from = ?cfg.weight_format, "permuting weights to OIHW");
                let canonical = weights.permuted(&order).map_err(|e| GraphError::InvalidAttribute {
                    op: label.clone(),
                    attribute: "weights".to_string(),
                    message: e.to_string(),
                })?;
                permuted.insert(weight_id);
                bindings.insert(weight_id, canonical.clone());
                canonical
            };

            let (kh, kw) = (canonical.shape()[2], canonical.shape()[3]);
            if (cfg.kernel_h != 0 && cfg.kernel_h != kh) || (cfg.kernel_w != 0 && cfg.kernel_w != kw) {
                return Err(GraphError::InvalidAttribute {
                    op: label,
                    attribute: "kernel_shape".to_string(),
                    message: format!(
                        "configured {}x{} but weights '{}' are {}x{}",
                        cfg.kernel_h, cfg.kernel_w, weight_var.name, kh, kw
                    ),
                });
            }
            if cfg.effective_kernel(kh, kw).is_none() {
                return Err(GraphError::InvalidAttribute {
                    op: label,
                    attribute: "dilations".to_string(),
                    message: format!(
                        "dilation {}x{} overflows a {}x{} kernel",
                        cfg.dilation_y, cfg.dilation_x, kh, kw
                    ),
                });
            }
            if cfg.kernel_h == 0 || cfg.kernel_w == 0 {
                tracing::debug!(op = %label, kh, kw, "inferred kernel size from weights");
            }
            cfg.kernel_h = kh;
            cfg.kernel_w = kw;
            cfg.weight_format = WeightFormat::Oihw;
            cfg.materialized = true;
            configs.push((node.id, cfg));
        }

        for (id, value) in bindings {
            self.bind_unchecked(id, value);
        }
        for id in permuted {
            self.mark_oihw_weights(id)?;
        }
        for (id, cfg) in configs {
            if let Some(slot) = self.operation_mut(id)?.op.conv_config_mut() {
                *slot = cfg;
            }
        }
        Ok(())
    }
}
