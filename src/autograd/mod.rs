//! Построение графа обратного прохода: d(output)/d(variable) для каждой
//! переменной, от которой зависит выбранный выход.
//!
//! Алгоритм:
//!  - собрать операции, от которых зависит выход, и обойти их в обратном
//!    топологическом порядке;
//!  - для каждой операции, выходы которой несут градиент, применить ее
//!    локальное правило производной (см. [`rules`]) и записать по одной
//!    частной производной на вход;
//!  - когда градиент переменной нужен (ее производитель вот-вот будет
//!    продифференцирован, или обход завершен), сложить частные производные
//!    явными узлами `Add` и назвать результат `<name>-grad`.
//!
//! Результат - обычный [`Graph`], зарегистрированный в прямом графе как
//! функция `"grad-external"`. Правила, которым нужны прямые значения, читают
//! их через "зеркала": листья графа градиентов, привязанные к тому же
//! хранилищу, что и прямая переменная.

pub mod rules;

use crate::graph::{ExecutionResult, Graph, GraphError, GraphResult, OpId, VarId};
use crate::ops::Op;
use crate::runtime::backend::Kernel;
use crate::tensor::TensorHandle;
use std::collections::{HashMap, HashSet};

/// Имя, под которым граф градиентов регистрируется в прямом графе.
pub const GRAD_FUNCTION: &str = "grad-external";

/// Имя переменной-градиента для `variable`.
pub fn grad_name(variable: &str) -> String {
    format!("{}-grad", variable)
}

impl Graph {
    /// Строит граф градиентов для `output` с начальным градиентом `external_grad`,
    /// регистрирует его как [`GRAD_FUNCTION`] и возвращает.
    ///
    /// Правилам, зависящим от прямых значений, нужен уже выполненный прямой проход.
    pub fn build_backward(&mut self, output: VarId, external_grad: TensorHandle) -> GraphResult<&mut Graph> {
        let grad = GradientBuilder::new(self).build(output, external_grad)?;
        Ok(self.put_function(GRAD_FUNCTION, grad))
    }

    /// Строит граф градиентов и выполняет его.
    pub fn exec_backward(
        &mut self,
        kernels: &dyn Kernel,
        output: VarId,
        external_grad: TensorHandle,
    ) -> GraphResult<ExecutionResult> {
        self.build_backward(output, external_grad)?.execute(kernels)
    }

    /// Value of `<name>-grad` in the last executed gradient graph.
    pub fn gradient(&self, name: &str) -> Option<&TensorHandle> {
        self.function(GRAD_FUNCTION)?.tensor(&grad_name(name))
    }
}

pub struct GradientBuilder<'a> {
    fwd: &'a Graph,
    grad: Graph,
    /// forward variable -> bound leaf in `grad` sharing its storage
    mirrors: HashMap<VarId, VarId>,
    /// forward variable -> gradient contributions not yet summed
    partials: HashMap<VarId, Vec<VarId>>,
    /// forward variable -> its `<name>-grad` variable
    finalized: HashMap<VarId, VarId>,
    /// Gradient-graph variables whose name is already fixed.
    named: HashSet<VarId>,
}

impl<'a> GradientBuilder<'a> {
    pub fn new(fwd: &'a Graph) -> Self {
        Self {
            fwd,
            grad: Graph::with_precision(fwd.precision()),
            mirrors: HashMap::new(),
            partials: HashMap::new(),
            finalized: HashMap::new(),
            named: HashSet::new(),
        }
    }

    pub fn build(mut self, output: VarId, external_grad: TensorHandle) -> GraphResult<Graph> {
        let fwd = self.fwd;
        let out_var = fwd.variable(output)?;
        if let Some(value) = out_var.tensor() {
            if value.shape() != external_grad.shape() {
                return Err(GraphError::GradientShape {
                    variable: out_var.name().to_string(),
                    expected: value.shape().to_vec(),
                    actual: external_grad.shape().to_vec(),
                });
            }
        }

        let seed = self
            .grad
            .add_variable(&grad_name(out_var.name()), Some(external_grad))?;
        self.named.insert(seed);
        self.finalized.insert(output, seed);

        let reachable = self.reachable_ops(output);
        let order: Vec<OpId> = fwd
            .topological_order()?
            .into_iter()
            .filter(|id| reachable.contains(id))
            .collect();
        tracing::debug!(output = %out_var.name(), operations = order.len(), "building gradient graph");

        for &id in order.iter().rev() {
            let node = fwd.operation(id)?;

            let mut output_grads = Vec::with_capacity(node.outputs().len());
            for &out in node.outputs() {
                output_grads.push(self.finalize(out)?);
            }
            if output_grads.iter().all(Option::is_none) {
                continue;
            }
            let mut grads = Vec::with_capacity(output_grads.len());
            for (&out, g) in node.outputs().iter().zip(output_grads) {
                let g = match g {
                    Some(g) => g,
                    None => {
                        let like = self.mirror(out, &node.label())?;
                        self.apply(Op::ZerosLike, &[like])?
                    }
                };
                grads.push(g);
            }

            tracing::debug!(op = %node.label(), "applying derivative rule");
            let input_grads = rules::derivative(&mut self, node, &grads)?;
            for (&input, partial) in node.inputs().iter().zip(input_grads) {
                if let Some(partial) = partial {
                    self.partials.entry(input).or_default().push(partial);
                }
            }
        }

        // Листья (и все оставшееся) в порядке id, для стабильных имен.
        let mut remaining: Vec<VarId> = self.partials.keys().copied().collect();
        remaining.sort();
        for var in remaining {
            self.finalize(var)?;
        }
        Ok(self.grad)
    }

    /// Operations the output transitively depends on.
    fn reachable_ops(&self, output: VarId) -> HashSet<OpId> {
        let mut ops = HashSet::new();
        let mut seen = HashSet::new();
        let mut stack = vec![output];
        while let Some(var) = stack.pop() {
            if !seen.insert(var) {
                continue;
            }
            let producer = self.fwd.variable(var).ok().and_then(|v| v.producer());
            if let Some(producer) = producer {
                if ops.insert(producer) {
                    if let Ok(node) = self.fwd.operation(producer) {
                        stack.extend(node.inputs().iter().copied());
                    }
                }
            }
        }
        ops
    }

    /// Sums the partials of `var` into `<name>-grad`; `None` if no gradient
    /// reaches it.
    fn finalize(&mut self, var: VarId) -> GraphResult<Option<VarId>> {
        if let Some(&done) = self.finalized.get(&var) {
            return Ok(Some(done));
        }
        let parts = match self.partials.remove(&var) {
            Some(parts) if !parts.is_empty() => parts,
            _ => return Ok(None),
        };
        let name = grad_name(self.fwd.variable(var)?.name());

        let total = if let [single] = parts[..] {
            if self.named.contains(&single) {
                // Сквозной градиент, у которого уже есть свое имя.
                self.grad.unary(Op::Identity, Some(name.as_str()), single)?
            } else {
                self.grad.rename_variable(single, &name)?;
                single
            }
        } else {
            tracing::debug!(variable = %name, partials = parts.len(), "accumulating gradient");
            let mut acc = parts[0];
            for (i, &part) in parts.iter().enumerate().skip(1) {
                let last = i + 1 == parts.len();
                acc = self
                    .grad
                    .binary(Op::Add, last.then_some(name.as_str()), acc, part)?;
            }
            acc
        };

        self.named.insert(total);
        self.finalized.insert(var, total);
        Ok(Some(total))
    }

    /// Лист графа градиентов, хранящий прямое значение `var`.
    pub fn mirror(&mut self, var: VarId, needed_by: &str) -> GraphResult<VarId> {
        if let Some(&m) = self.mirrors.get(&var) {
            return Ok(m);
        }
        let fwd_var = self.fwd.variable(var)?;
        let value = fwd_var.tensor().cloned().ok_or_else(|| GraphError::UnresolvedInput {
            variable: fwd_var.name().to_string(),
            needed_by: format!("derivative of {}", needed_by),
        })?;
        let name = if self.grad.contains(fwd_var.name()) {
            self.grad.fresh_name(fwd_var.name())
        } else {
            fwd_var.name().to_string()
        };
        let m = self.grad.add_variable(&name, Some(value))?;
        self.named.insert(m);
        self.mirrors.insert(var, m);
        Ok(m)
    }

    /// Shape of a forward variable's value.
    pub fn forward_shape(&self, var: VarId, needed_by: &str) -> GraphResult<&'a [usize]> {
        let fwd: &'a Graph = self.fwd;
        let v = fwd.variable(var)?;
        v.tensor()
            .map(|t| t.shape())
            .ok_or_else(|| GraphError::UnresolvedInput {
                variable: v.name().to_string(),
                needed_by: format!("derivative of {}", needed_by),
            })
    }

    /// Добавляет в граф градиентов анонимную операцию с одним выходом.
    pub fn apply(&mut self, op: Op, inputs: &[VarId]) -> GraphResult<VarId> {
        self.grad.apply(op, None, inputs)
    }

    /// Places a multi-output operation with fresh output variables.
    pub fn apply_multi(&mut self, op: Op, inputs: &[VarId], outputs: usize) -> GraphResult<Vec<VarId>> {
        let mut vars = Vec::with_capacity(outputs);
        for _ in 0..outputs {
            let name = self.grad.fresh_name(op.name());
            vars.push(self.grad.add_variable(&name, None)?);
        }
        self.grad.add_operation(op, inputs, &vars)?;
        Ok(vars)
    }

    /// Суммирует `g` до формы прямого `input`, если трансляция расширила его
    /// на пути к `output`.
    pub fn reduce_to(&mut self, g: VarId, input: VarId, output: VarId, needed_by: &str) -> GraphResult<VarId> {
        let input_shape = self.forward_shape(input, needed_by)?;
        let output_shape = self.forward_shape(output, needed_by)?;
        if input_shape == output_shape {
            return Ok(g);
        }
        let like = self.mirror(input, needed_by)?;
        self.apply(Op::ReduceSumTo, &[g, like])
    }
}
