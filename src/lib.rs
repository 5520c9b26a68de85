//! # diffgraph: differentiable computation graphs
//!
//! A graph is an arena of named **variables** (optionally holding a tensor)
//! and **operation descriptors** (a variant with its configuration plus
//! ordered input/output variables). Around it:
//!
//! - forward execution in dependency order through a pluggable
//!   [`Kernel`](runtime::Kernel) capability ([`runtime::CpuBackend`] is the
//!   reference implementation);
//! - construction of the gradient graph for a designated output
//!   ([`autograd`]), itself an ordinary graph;
//! - import of normalized TensorFlow / ONNX node lists ([`import`]);
//! - saving and loading ([`serialization`]).
//!
//! ## Usage Example
//!
//! ```no_run
//! use diffgraph::ops::Op;
//! use diffgraph::runtime::CpuBackend;
//! use diffgraph::tensor::{Precision, TensorHandle};
//! use diffgraph::Graph;
//!
//! let mut graph = Graph::with_precision(Precision::F64);
//! let x = graph.add_variable("in", Some(TensorHandle::ones(&[1, 4], Precision::F64)))?;
//! let y = graph.unary(Op::Sigmoid, Some("out"), x)?;
//!
//! let kernels = CpuBackend::new();
//! graph.execute(&kernels)?;
//! graph.exec_backward(&kernels, y, TensorHandle::ones(&[1, 4], Precision::F64))?;
//! let d_in = graph.gradient("in");
//! # Ok::<(), diffgraph::GraphError>(())
//! ```

pub mod autograd;
pub mod graph;
pub mod import;
pub mod ops;
pub mod runtime;
pub mod serialization;
pub mod tensor;

pub use graph::{Graph, GraphError, GraphResult, OpId, VarId};
