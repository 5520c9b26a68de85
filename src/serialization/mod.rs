//! Saving and loading graphs.
//!
//! A saved graph is a directory holding:
//! - **graph.json**: precision, variables and operations (variant,
//!   configuration, ordered input/output names);
//! - **tensors.safetensors**: every bound tensor, as `F64`.
//!
//! Loading rebuilds the graph through the public construction API, so every
//! structural invariant is checked again. Child functions (such as the
//! gradient graph) are not saved; they are rebuilt on demand.
//!
//! ```rust,ignore
//! use diffgraph::serialization::{save_graph, load_graph};
//!
//! save_graph(&graph, "model/")?;
//! let restored = load_graph("model/")?;
//! ```

pub mod safetensors_io;

pub use safetensors_io::{list_tensors, load_safetensors, save_safetensors};

use crate::graph::{Graph, GraphError};
use crate::ops::Op;
use crate::tensor::Precision;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const GRAPH_FILE: &str = "graph.json";
pub const TENSORS_FILE: &str = "tensors.safetensors";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("tensor '{name}': expected shape {expected:?}, got {actual:?}")]
    TensorShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("unsupported graph format version {0}")]
    Version(u32),
}

pub type Result<T> = std::result::Result<T, SerializationError>;

/// Structural description of a graph as stored in `graph.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    pub version: u32,
    pub precision: Precision,
    pub variables: Vec<VariableRecord>,
    pub operations: Vec<OperationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub name: String,
    /// Shape of the bound tensor, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
    /// Bound value is already in `OIHW` weight layout.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub oihw_weights: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub op: Op,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl GraphDocument {
    pub fn from_graph(graph: &Graph) -> Self {
        let name_of = |id| {
            graph
                .variable(id)
                .map(|v| v.name().to_string())
                .unwrap_or_default()
        };
        Self {
            version: FORMAT_VERSION,
            precision: graph.precision(),
            variables: graph
                .variables()
                .map(|v| VariableRecord {
                    name: v.name().to_string(),
                    shape: v.tensor().map(|t| t.shape().to_vec()),
                    oihw_weights: v.holds_oihw_weights(),
                })
                .collect(),
            operations: graph
                .operations()
                .map(|node| OperationRecord {
                    op: node.op().clone(),
                    inputs: node.inputs().iter().map(|&id| name_of(id)).collect(),
                    outputs: node.outputs().iter().map(|&id| name_of(id)).collect(),
                })
                .collect(),
        }
    }

    /// Rebuilds an unbound graph.
    pub fn into_graph(self) -> Result<Graph> {
        if self.version != FORMAT_VERSION {
            return Err(SerializationError::Version(self.version));
        }
        let mut graph = Graph::with_precision(self.precision);
        for var in &self.variables {
            graph.add_variable(&var.name, None)?;
        }
        for record in self.operations {
            let inputs = record
                .inputs
                .iter()
                .map(|name| graph.id_of(name))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let outputs = record
                .outputs
                .iter()
                .map(|name| graph.id_of(name))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            graph.add_operation(record.op, &inputs, &outputs)?;
        }
        Ok(graph)
    }
}

/// Structure of `graph` as pretty-printed JSON (no tensor values).
pub fn to_json(graph: &Graph) -> Result<String> {
    Ok(serde_json::to_string_pretty(&GraphDocument::from_graph(graph))?)
}

/// Rebuilds an unbound graph from [`to_json`] output.
pub fn from_json(json: &str) -> Result<Graph> {
    let doc: GraphDocument = serde_json::from_str(json)?;
    doc.into_graph()
}

/// Writes `graph.json` and `tensors.safetensors` into `dir`, creating it.
pub fn save_graph<P: AsRef<Path>>(graph: &Graph, dir: P) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    fs::write(dir.join(GRAPH_FILE), to_json(graph)?)?;

    let tensors = graph.bound_values();
    save_safetensors(dir.join(TENSORS_FILE), &tensors)?;
    tracing::debug!(
        dir = %dir.display(),
        variables = graph.variable_count(),
        operations = graph.operation_count(),
        tensors = tensors.len(),
        "saved graph"
    );
    Ok(())
}

/// Loads a graph written by [`save_graph`], rebinding its tensors.
pub fn load_graph<P: AsRef<Path>>(dir: P) -> Result<Graph> {
    let dir = dir.as_ref();
    let doc: GraphDocument = serde_json::from_str(&fs::read_to_string(dir.join(GRAPH_FILE))?)?;
    let expected: BTreeMap<String, Vec<usize>> = doc
        .variables
        .iter()
        .filter_map(|v| v.shape.clone().map(|s| (v.name.clone(), s)))
        .collect();
    let canonical: Vec<String> = doc
        .variables
        .iter()
        .filter(|v| v.oihw_weights)
        .map(|v| v.name.clone())
        .collect();
    let mut graph = doc.into_graph()?;

    let tensors_path = dir.join(TENSORS_FILE);
    if tensors_path.exists() {
        for (name, tensor) in load_safetensors(&tensors_path, graph.precision())? {
            if let Some(shape) = expected.get(&name) {
                if shape.as_slice() != tensor.shape() {
                    return Err(SerializationError::TensorShape {
                        name,
                        expected: shape.clone(),
                        actual: tensor.shape().to_vec(),
                    });
                }
            }
            let id = graph.id_of(&name)?;
            graph.set_tensor(id, tensor)?;
            if canonical.contains(&name) {
                graph.mark_oihw_weights(id)?;
            }
        }
    }
    tracing::debug!(dir = %dir.display(), "loaded graph");
    Ok(graph)
}
