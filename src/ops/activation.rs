//! Activation factory: maps an activation name to the operation it places.

use crate::graph::{Graph, GraphError, GraphResult, VarId};
use crate::ops::Op;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Activation {
    Cube,
    Elu,
    HardSigmoid,
    HardTanh,
    Identity,
    LeakyRelu,
    RationalTanh,
    Relu,
    Rrelu,
    Sigmoid,
    Softmax,
    Softplus,
    Softsign,
    Tanh,
    RectifiedTanh,
    Selu,
    Swish,
}

impl Activation {
    pub const ALL: [Activation; 17] = [
        Activation::Cube,
        Activation::Elu,
        Activation::HardSigmoid,
        Activation::HardTanh,
        Activation::Identity,
        Activation::LeakyRelu,
        Activation::RationalTanh,
        Activation::Relu,
        Activation::Rrelu,
        Activation::Sigmoid,
        Activation::Softmax,
        Activation::Softplus,
        Activation::Softsign,
        Activation::Tanh,
        Activation::RectifiedTanh,
        Activation::Selu,
        Activation::Swish,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Activation::Cube => "cube",
            Activation::Elu => "elu",
            Activation::HardSigmoid => "hardsigmoid",
            Activation::HardTanh => "hardtanh",
            Activation::Identity => "identity",
            Activation::LeakyRelu => "leakyrelu",
            Activation::RationalTanh => "rationaltanh",
            Activation::Relu => "relu",
            Activation::Rrelu => "rrelu",
            Activation::Sigmoid => "sigmoid",
            Activation::Softmax => "softmax",
            Activation::Softplus => "softplus",
            Activation::Softsign => "softsign",
            Activation::Tanh => "tanh",
            Activation::RectifiedTanh => "rectifiedtanh",
            Activation::Selu => "selu",
            Activation::Swish => "swish",
        }
    }

    /// The operation this activation lowers to.
    ///
    /// `Ok(None)` for `Identity`, which places nothing.
    pub fn op(self) -> GraphResult<Option<Op>> {
        let op = match self {
            Activation::Identity => return Ok(None),
            Activation::Cube => Op::Pow { exponent: 3.0 },
            Activation::Elu => Op::Elu { alpha: 1.0 },
            Activation::HardTanh => Op::HardTanh,
            Activation::LeakyRelu => Op::LeakyRelu { alpha: 0.01 },
            Activation::Relu => Op::Relu { cutoff: 0.0 },
            Activation::Sigmoid => Op::Sigmoid,
            Activation::Softmax => Op::Softmax,
            Activation::Softplus => Op::Softplus,
            Activation::Softsign => Op::Softsign,
            Activation::Tanh => Op::Tanh,
            Activation::HardSigmoid
            | Activation::RationalTanh
            | Activation::Rrelu
            | Activation::RectifiedTanh
            | Activation::Selu
            | Activation::Swish => {
                return Err(GraphError::UnsupportedOperation {
                    op: self.name().to_string(),
                    reason: "activation not yet supported".to_string(),
                })
            }
        };
        Ok(Some(op))
    }

    /// Applies the activation to `input`, returning the output variable.
    pub fn apply(self, graph: &mut Graph, name: Option<&str>, input: VarId) -> GraphResult<VarId> {
        match self.op()? {
            Some(op) => graph.unary(op, name, input),
            None => {
                graph.variable(input)?;
                Ok(input)
            }
        }
    }
}

impl FromStr for Activation {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        Activation::ALL
            .iter()
            .copied()
            .find(|a| a.name() == wanted)
            .ok_or_else(|| GraphError::UnsupportedOperation {
                op: s.to_string(),
                reason: "unknown activation".to_string(),
            })
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
