//! Import of externally produced graphs (TensorFlow, ONNX).
//!
//! Readers of the actual wire formats live outside this crate; what arrives
//! here is their normalized output: a list of [`ExternalNode`]s (operation
//! type, input/output names, attributes) plus any tensors the reader could
//! materialize. An [`ImportRegistry`] maps each `(format, op type)` to an
//! [`OpKind`] and each kind to the function building its configured [`Op`].

pub mod onnx;
pub mod tensorflow;

use crate::graph::{Graph, GraphError, GraphResult, VarId};
use crate::ops::{Op, OpKind};
use crate::tensor::{Precision, TensorHandle, WeightFormat};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalFormat {
    TensorFlow,
    Onnx,
}

impl FromStr for ExternalFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tensorflow" | "tf" => Ok(ExternalFormat::TensorFlow),
            "onnx" => Ok(ExternalFormat::Onnx),
            other => Err(format!("unknown external format '{}'", other)),
        }
    }
}

impl fmt::Display for ExternalFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalFormat::TensorFlow => write!(f, "tensorflow"),
            ExternalFormat::Onnx => write!(f, "onnx"),
        }
    }
}

/// Attribute value as the readers report it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
}

/// One node of an external graph, normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalNode {
    pub name: String,
    pub op_type: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Defaults to the node name when empty, as TensorFlow names outputs.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
}

impl ExternalNode {
    pub fn new(name: &str, op_type: &str, inputs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            op_type: op_type.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: AttrValue) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    fn output_names(&self) -> Vec<String> {
        if self.outputs.is_empty() {
            vec![self.name.clone()]
        } else {
            self.outputs.clone()
        }
    }

    fn invalid(&self, attribute: &str, message: String) -> GraphError {
        GraphError::InvalidAttribute {
            op: format!("{} ({})", self.name, self.op_type),
            attribute: attribute.to_string(),
            message,
        }
    }

    pub fn missing(&self, attribute: &str) -> GraphError {
        GraphError::MissingAttribute {
            op: format!("{} ({})", self.name, self.op_type),
            attribute: attribute.to_string(),
        }
    }

    pub fn unsupported(&self, reason: &str) -> GraphError {
        GraphError::UnsupportedOperation {
            op: format!("{} ({})", self.name, self.op_type),
            reason: reason.to_string(),
        }
    }

    pub fn int_attr(&self, key: &str) -> GraphResult<Option<i64>> {
        match self.attributes.get(key) {
            None => Ok(None),
            Some(AttrValue::Int(v)) => Ok(Some(*v)),
            Some(other) => Err(self.invalid(key, format!("expected an integer, got {:?}", other))),
        }
    }

    /// Integers are accepted where a float is expected.
    pub fn float_attr(&self, key: &str) -> GraphResult<Option<f64>> {
        match self.attributes.get(key) {
            None => Ok(None),
            Some(AttrValue::Float(v)) => Ok(Some(*v)),
            Some(AttrValue::Int(v)) => Ok(Some(*v as f64)),
            Some(other) => Err(self.invalid(key, format!("expected a float, got {:?}", other))),
        }
    }

    pub fn str_attr(&self, key: &str) -> GraphResult<Option<&str>> {
        match self.attributes.get(key) {
            None => Ok(None),
            Some(AttrValue::Str(v)) => Ok(Some(v.as_str())),
            Some(other) => Err(self.invalid(key, format!("expected a string, got {:?}", other))),
        }
    }

    pub fn bool_attr(&self, key: &str) -> GraphResult<Option<bool>> {
        match self.attributes.get(key) {
            None => Ok(None),
            Some(AttrValue::Bool(v)) => Ok(Some(*v)),
            Some(AttrValue::Int(v)) => Ok(Some(*v != 0)),
            Some(other) => Err(self.invalid(key, format!("expected a bool, got {:?}", other))),
        }
    }

    /// Integer list; a single integer reads as a one-element list.
    pub fn ints_attr(&self, key: &str) -> GraphResult<Option<Vec<i64>>> {
        match self.attributes.get(key) {
            None => Ok(None),
            Some(AttrValue::Ints(v)) => Ok(Some(v.clone())),
            Some(AttrValue::Int(v)) => Ok(Some(vec![*v])),
            Some(other) => Err(self.invalid(key, format!("expected a list of integers, got {:?}", other))),
        }
    }

    /// Integer list whose entries must all be positive.
    pub fn dims_attr(&self, key: &str) -> GraphResult<Option<Vec<usize>>> {
        self.ints_attr(key)?
            .map(|values| self.to_dims(key, &values, 1))
            .transpose()
    }

    /// Integer list whose entries must be non-negative (paddings).
    pub fn pads_attr(&self, key: &str) -> GraphResult<Option<Vec<usize>>> {
        self.ints_attr(key)?
            .map(|values| self.to_dims(key, &values, 0))
            .transpose()
    }

    fn to_dims(&self, key: &str, values: &[i64], min: i64) -> GraphResult<Vec<usize>> {
        values
            .iter()
            .map(|&v| {
                if v < min {
                    Err(self.invalid(key, format!("value {} is below {}", v, min)))
                } else {
                    Ok(v as usize)
                }
            })
            .collect()
    }
}

/// Builds the configured operation for one external node.
pub type ImportFn = fn(&ExternalNode, OpKind) -> GraphResult<Op>;

/// Lookup tables for import: external op name to variant, variant to builder.
#[derive(Clone)]
pub struct ImportRegistry {
    names: HashMap<(ExternalFormat, String), OpKind>,
    builders: HashMap<(ExternalFormat, OpKind), ImportFn>,
}

impl ImportRegistry {
    pub fn empty() -> Self {
        Self {
            names: HashMap::new(),
            builders: HashMap::new(),
        }
    }

    /// Maps `op_type` of `format` to `kind`, built by `builder`.
    pub fn register(&mut self, format: ExternalFormat, op_type: &str, kind: OpKind, builder: ImportFn) {
        self.names.insert((format, op_type.to_string()), kind);
        self.builders.insert((format, kind), builder);
    }

    pub fn lookup(&self, format: ExternalFormat, op_type: &str) -> Option<OpKind> {
        self.names.get(&(format, op_type.to_string())).copied()
    }

    /// External op types registered for `format`, sorted.
    pub fn op_types(&self, format: ExternalFormat) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .names
            .keys()
            .filter(|(f, _)| *f == format)
            .map(|(_, name)| name.as_str())
            .collect();
        types.sort_unstable();
        types
    }

    fn build(&self, format: ExternalFormat, node: &ExternalNode) -> GraphResult<Op> {
        let kind = self
            .lookup(format, &node.op_type)
            .ok_or_else(|| node.unsupported(&format!("no {} mapping for this operation type", format)))?;
        let builder = self
            .builders
            .get(&(format, kind))
            .ok_or_else(|| node.unsupported(&format!("no {} builder for '{}'", format, kind)))?;
        builder(node, kind)
    }
}

impl Default for ImportRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        tensorflow::register(&mut registry);
        onnx::register(&mut registry);
        registry
    }
}

/// Builder for variants without attributes.
pub fn plain(node: &ExternalNode, kind: OpKind) -> GraphResult<Op> {
    let op = match kind {
        OpKind::Add => Op::Add,
        OpKind::Subtract => Op::Subtract,
        OpKind::Multiply => Op::Multiply,
        OpKind::Divide => Op::Divide,
        OpKind::Negate => Op::Negate,
        OpKind::Exp => Op::Exp,
        OpKind::Log => Op::Log,
        OpKind::Sqrt => Op::Sqrt,
        OpKind::Square => Op::Square,
        OpKind::Identity => Op::Identity,
        OpKind::Sigmoid => Op::Sigmoid,
        OpKind::Tanh => Op::Tanh,
        OpKind::Relu => Op::Relu { cutoff: 0.0 },
        OpKind::HardTanh => Op::HardTanh,
        OpKind::Softplus => Op::Softplus,
        OpKind::Softsign => Op::Softsign,
        OpKind::Softmax => Op::Softmax,
        OpKind::MatMul => Op::MatMul,
        OpKind::Transpose => Op::Transpose,
        OpKind::Sum => Op::Sum,
        OpKind::ZerosLike => Op::ZerosLike,
        OpKind::OnesLike => Op::OnesLike,
        other => return Err(node.unsupported(&format!("'{}' needs configuration", other))),
    };
    Ok(op)
}

/// Staging state of one import call.
struct ImportScope<'a> {
    graph: &'a mut Graph,
    tensors: &'a HashMap<String, TensorHandle>,
    /// Leaves created by this import and bound from `tensors`.
    supplied: HashSet<VarId>,
}

impl<'a> ImportScope<'a> {
    fn input(&mut self, name: &str) -> GraphResult<VarId> {
        if self.graph.contains(name) {
            return self.graph.id_of(name);
        }
        let tensor = self.tensors.get(name).cloned();
        let supplied = tensor.is_some();
        let id = self.graph.add_variable(name, tensor)?;
        if supplied {
            self.supplied.insert(id);
        }
        Ok(id)
    }

    fn output(&mut self, name: &str) -> GraphResult<VarId> {
        if self.graph.contains(name) {
            return self.graph.id_of(name);
        }
        self.graph.add_variable(name, None)
    }

    /// Puts supplied convolution weights into `OIHW` and records the kernel
    /// size they imply.
    fn prepare_weights(&mut self, node: &ExternalNode, op: &mut Op, weight: VarId) -> GraphResult<()> {
        let Op::Conv2d(cfg) = op else { return Ok(()) };
        let var = self.graph.variable(weight)?;
        let canonical = var.holds_oihw_weights();
        if !canonical && !self.supplied.contains(&weight) {
            return Ok(());
        }
        if !canonical {
            let raw = var
                .tensor()
                .cloned()
                .ok_or_else(|| GraphError::MissingArray(node.inputs[1].clone()))?;
            if raw.shape().len() != 4 {
                return Err(node.invalid("weights", format!("expected 4-D weights, got {:?}", raw.shape())));
            }
            let permuted = raw
                .permuted(&cfg.weight_format.to_canonical())
                .map_err(|e| node.invalid("weights", e.to_string()))?;
            self.graph.set_tensor(weight, permuted)?;
            self.graph.mark_oihw_weights(weight)?;
        }
        cfg.weight_format = WeightFormat::Oihw;

        let shape = self
            .graph
            .variable(weight)?
            .tensor()
            .map(|t| t.shape().to_vec())
            .unwrap_or_default();
        if let [_, _, kh, kw] = shape[..] {
            if (cfg.kernel_h != 0 && cfg.kernel_h != kh) || (cfg.kernel_w != 0 && cfg.kernel_w != kw) {
                return Err(node.invalid(
                    "kernel_shape",
                    format!("{}x{} does not match weights {:?}", cfg.kernel_h, cfg.kernel_w, shape),
                ));
            }
            cfg.kernel_h = kh;
            cfg.kernel_w = kw;
        }
        Ok(())
    }

    fn import_node(&mut self, registry: &ImportRegistry, format: ExternalFormat, node: &ExternalNode) -> GraphResult<()> {
        let mut op = registry.build(format, node)?;

        let mut inputs = Vec::with_capacity(node.inputs.len());
        for name in &node.inputs {
            inputs.push(self.input(name)?);
        }
        if let Some(&weight) = inputs.get(1) {
            self.prepare_weights(node, &mut op, weight)?;
        }

        let mut outputs = Vec::new();
        for name in node.output_names() {
            outputs.push(self.output(&name)?);
        }
        tracing::debug!(node = %node.name, op_type = %node.op_type, op = %op, %format, "imported node");
        self.graph.add_operation(op, &inputs, &outputs)?;
        Ok(())
    }
}

impl Graph {
    /// Imports `nodes` with the default registry and no supplied tensors.
    pub fn import_from_external(&mut self, format: ExternalFormat, nodes: &[ExternalNode]) -> GraphResult<()> {
        self.import_with(&ImportRegistry::default(), format, nodes, &HashMap::new())
    }

    /// Imports `nodes`, binding leaves named in `tensors` (given in the
    /// format's own layout) as they are created.
    ///
    /// All or nothing: on error the graph is left as it was.
    pub fn import_with(
        &mut self,
        registry: &ImportRegistry,
        format: ExternalFormat,
        nodes: &[ExternalNode],
        tensors: &HashMap<String, TensorHandle>,
    ) -> GraphResult<()> {
        let mut staged = self.clone();
        {
            let mut scope = ImportScope {
                graph: &mut staged,
                tensors,
                supplied: HashSet::new(),
            };
            for node in nodes {
                scope.import_node(registry, format, node)?;
            }
        }
        tracing::debug!(%format, nodes = nodes.len(), "import complete");
        *self = staged;
        Ok(())
    }
}

/// Tensor as written in a JSON dump: shape plus row-major values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

/// A reader's complete output: nodes plus the tensors it materialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalGraph {
    pub nodes: Vec<ExternalNode>,
    #[serde(default)]
    pub tensors: BTreeMap<String, ExternalTensor>,
}

impl ExternalGraph {
    /// Converts the supplied tensors into handles at `precision`.
    pub fn tensor_handles(&self, precision: Precision) -> GraphResult<HashMap<String, TensorHandle>> {
        self.tensors
            .iter()
            .map(|(name, t)| {
                TensorHandle::from_shape_vec(&t.shape, t.data.clone(), precision)
                    .map(|handle| (name.clone(), handle))
                    .map_err(|e| GraphError::InvalidAttribute {
                        op: "import".to_string(),
                        attribute: name.clone(),
                        message: e.to_string(),
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_values_deserialize_untagged() {
        let json = r#"{"name":"c","op_type":"Conv","inputs":["x","w"],
            "attributes":{"strides":[1,2],"auto_pad":"VALID","alpha":0.5,"group":1}}"#;
        let node: ExternalNode = serde_json::from_str(json).unwrap();
        assert_eq!(node.dims_attr("strides").unwrap(), Some(vec![1, 2]));
        assert_eq!(node.str_attr("auto_pad").unwrap(), Some("VALID"));
        assert_eq!(node.float_attr("alpha").unwrap(), Some(0.5));
        assert_eq!(node.int_attr("group").unwrap(), Some(1));
        assert!(node.outputs.is_empty());
    }

    #[test]
    fn wrong_attribute_kind_is_invalid() {
        let node = ExternalNode::new("n", "Conv", &[]).with_attr("strides", AttrValue::Str("x".into()));
        assert!(matches!(node.dims_attr("strides"), Err(GraphError::InvalidAttribute { .. })));
        let node = ExternalNode::new("n", "Conv", &[]).with_attr("strides", AttrValue::Ints(vec![0, 1]));
        assert!(matches!(node.dims_attr("strides"), Err(GraphError::InvalidAttribute { .. })));
    }

    #[test]
    fn unknown_op_type_is_unsupported() {
        let mut g = Graph::new();
        let nodes = vec![ExternalNode::new("q", "Quantize", &["x"])];
        let err = g.import_from_external(ExternalFormat::Onnx, &nodes).unwrap_err();
        assert!(matches!(err, GraphError::UnsupportedOperation { .. }));
        assert_eq!(g.variable_count(), 0);
    }

    #[test]
    fn registry_lists_types_per_format() {
        let registry = ImportRegistry::default();
        assert!(registry.op_types(ExternalFormat::TensorFlow).contains(&"Conv2D"));
        assert!(registry.op_types(ExternalFormat::Onnx).contains(&"Conv"));
        assert_eq!(registry.lookup(ExternalFormat::Onnx, "Conv2D"), None);
        assert_eq!(registry.lookup(ExternalFormat::TensorFlow, "AddV2"), Some(OpKind::Add));
    }

    #[test]
    fn custom_registration() {
        let mut registry = ImportRegistry::default();
        registry.register(ExternalFormat::Onnx, "Square", OpKind::Square, plain);
        let mut g = Graph::new();
        let nodes = vec![ExternalNode::new("sq", "Square", &["x"])];
        g.import_with(&registry, ExternalFormat::Onnx, &nodes, &HashMap::new()).unwrap();
        let y = g.variable_by_name("sq").unwrap();
        let op = g.operation(y.producer().unwrap()).unwrap().op().clone();
        assert_eq!(op, Op::Square);
    }
}
