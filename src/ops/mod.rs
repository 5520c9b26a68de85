//! Operation descriptors: the closed set of variants a graph can hold.
//!
//! `Op` carries the per-variant configuration; `OpKind` is the field-less tag
//! used as the key of the dispatch tables (import registry, arity checks,
//! log and naming prefixes). The forward kernels live behind the
//! [`Kernel`](crate::runtime::backend::Kernel) capability and the derivative
//! rules in [`autograd`](crate::autograd).

pub mod activation;
pub mod conv;

pub use activation::Activation;
pub use conv::Conv2dConfig;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    // Elementwise binary, numpy-style broadcasting
    Add,
    Subtract,
    Multiply,
    Divide,

    // Elementwise unary
    Negate,
    Exp,
    Log,
    Sqrt,
    Square,
    Pow { exponent: f64 },
    Scale { factor: f64 },

    // Activations
    Identity,
    Sigmoid,
    Tanh,
    Relu { cutoff: f64 },
    LeakyRelu { alpha: f64 },
    Elu { alpha: f64 },
    HardTanh,
    Softplus,
    Softsign,
    /// Over the last axis.
    Softmax,

    // Derivative companions: inputs are (forward value, output gradient)
    SigmoidDerivative,
    TanhDerivative,
    ReluDerivative { cutoff: f64 },
    LeakyReluDerivative { alpha: f64 },
    EluDerivative { alpha: f64 },
    HardTanhDerivative,
    SoftsignDerivative,
    SoftmaxDerivative,

    // Linear algebra and shape
    MatMul,
    Transpose,
    /// Full reduction to a scalar.
    Sum,
    /// (value, shape donor) -> value broadcast to the donor's shape.
    BroadcastTo,
    /// (value, shape donor) -> value summed down to the donor's shape.
    ReduceSumTo,
    ZerosLike,
    OnesLike,

    // Convolution
    /// Inputs: (input, weight[, bias]).
    Conv2d(Conv2dConfig),
    /// Inputs: (input, weight[, bias], output gradient); one gradient per
    /// forward input.
    Conv2dDerivative(Conv2dConfig),
}

/// Variant tag of an [`Op`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    Add,
    Subtract,
    Multiply,
    Divide,
    Negate,
    Exp,
    Log,
    Sqrt,
    Square,
    Pow,
    Scale,
    Identity,
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu,
    Elu,
    HardTanh,
    Softplus,
    Softsign,
    Softmax,
    SigmoidDerivative,
    TanhDerivative,
    ReluDerivative,
    LeakyReluDerivative,
    EluDerivative,
    HardTanhDerivative,
    SoftsignDerivative,
    SoftmaxDerivative,
    MatMul,
    Transpose,
    Sum,
    BroadcastTo,
    ReduceSumTo,
    ZerosLike,
    OnesLike,
    Conv2d,
    Conv2dDerivative,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Add => OpKind::Add,
            Op::Subtract => OpKind::Subtract,
            Op::Multiply => OpKind::Multiply,
            Op::Divide => OpKind::Divide,
            Op::Negate => OpKind::Negate,
            Op::Exp => OpKind::Exp,
            Op::Log => OpKind::Log,
            Op::Sqrt => OpKind::Sqrt,
            Op::Square => OpKind::Square,
            Op::Pow { .. } => OpKind::Pow,
            Op::Scale { .. } => OpKind::Scale,
            Op::Identity => OpKind::Identity,
            Op::Sigmoid => OpKind::Sigmoid,
            Op::Tanh => OpKind::Tanh,
            Op::Relu { .. } => OpKind::Relu,
            Op::LeakyRelu { .. } => OpKind::LeakyRelu,
            Op::Elu { .. } => OpKind::Elu,
            Op::HardTanh => OpKind::HardTanh,
            Op::Softplus => OpKind::Softplus,
            Op::Softsign => OpKind::Softsign,
            Op::Softmax => OpKind::Softmax,
            Op::SigmoidDerivative => OpKind::SigmoidDerivative,
            Op::TanhDerivative => OpKind::TanhDerivative,
            Op::ReluDerivative { .. } => OpKind::ReluDerivative,
            Op::LeakyReluDerivative { .. } => OpKind::LeakyReluDerivative,
            Op::EluDerivative { .. } => OpKind::EluDerivative,
            Op::HardTanhDerivative => OpKind::HardTanhDerivative,
            Op::SoftsignDerivative => OpKind::SoftsignDerivative,
            Op::SoftmaxDerivative => OpKind::SoftmaxDerivative,
            Op::MatMul => OpKind::MatMul,
            Op::Transpose => OpKind::Transpose,
            Op::Sum => OpKind::Sum,
            Op::BroadcastTo => OpKind::BroadcastTo,
            Op::ReduceSumTo => OpKind::ReduceSumTo,
            Op::ZerosLike => OpKind::ZerosLike,
            Op::OnesLike => OpKind::OnesLike,
            Op::Conv2d(_) => OpKind::Conv2d,
            Op::Conv2dDerivative(_) => OpKind::Conv2dDerivative,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Declared signature check.
    pub fn validate_arity(&self, inputs: usize, outputs: usize) -> bool {
        match self {
            Op::Conv2d(_) => (2..=3).contains(&inputs) && outputs == 1,
            Op::Conv2dDerivative(_) => (3..=4).contains(&inputs) && outputs == inputs - 1,
            _ => inputs == self.kind().input_count() && outputs == 1,
        }
    }

    /// Human-readable form of the signature, for arity errors.
    pub fn signature(&self) -> String {
        match self {
            Op::Conv2d(_) => "2 or 3 inputs -> 1 output".to_string(),
            Op::Conv2dDerivative(_) => "3 or 4 inputs -> (inputs - 1) outputs".to_string(),
            _ => format!("{} input(s) -> 1 output", self.kind().input_count()),
        }
    }

    /// Checks configuration values a kernel would choke on.
    ///
    /// Returns the offending field and a description.
    pub fn validate_config(&self) -> Result<(), (&'static str, String)> {
        match self {
            Op::Conv2d(cfg) | Op::Conv2dDerivative(cfg) => {
                if cfg.stride_y == 0 || cfg.stride_x == 0 {
                    return Err(("strides", "stride must be at least 1".to_string()));
                }
                if cfg.dilation_y == 0 || cfg.dilation_x == 0 {
                    return Err(("dilations", "dilation must be at least 1".to_string()));
                }
                if cfg.effective_kernel(cfg.kernel_h, cfg.kernel_w).is_none() {
                    return Err((
                        "dilations",
                        format!(
                            "dilation {}x{} overflows a {}x{} kernel",
                            cfg.dilation_y, cfg.dilation_x, cfg.kernel_h, cfg.kernel_w
                        ),
                    ));
                }
                Ok(())
            }
            Op::Pow { exponent } if !exponent.is_finite() => {
                Err(("exponent", format!("exponent {} is not finite", exponent)))
            }
            _ => Ok(()),
        }
    }

    /// Mutable access to the convolution configuration, if any.
    pub fn conv_config_mut(&mut self) -> Option<&mut Conv2dConfig> {
        match self {
            Op::Conv2d(cfg) | Op::Conv2dDerivative(cfg) => Some(cfg),
            _ => None,
        }
    }

    pub fn conv_config(&self) -> Option<&Conv2dConfig> {
        match self {
            Op::Conv2d(cfg) | Op::Conv2dDerivative(cfg) => Some(cfg),
            _ => None,
        }
    }
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Subtract => "subtract",
            OpKind::Multiply => "multiply",
            OpKind::Divide => "divide",
            OpKind::Negate => "negate",
            OpKind::Exp => "exp",
            OpKind::Log => "log",
            OpKind::Sqrt => "sqrt",
            OpKind::Square => "square",
            OpKind::Pow => "pow",
            OpKind::Scale => "scale",
            OpKind::Identity => "identity",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Tanh => "tanh",
            OpKind::Relu => "relu",
            OpKind::LeakyRelu => "leaky_relu",
            OpKind::Elu => "elu",
            OpKind::HardTanh => "hard_tanh",
            OpKind::Softplus => "softplus",
            OpKind::Softsign => "softsign",
            OpKind::Softmax => "softmax",
            OpKind::SigmoidDerivative => "sigmoid_derivative",
            OpKind::TanhDerivative => "tanh_derivative",
            OpKind::ReluDerivative => "relu_derivative",
            OpKind::LeakyReluDerivative => "leaky_relu_derivative",
            OpKind::EluDerivative => "elu_derivative",
            OpKind::HardTanhDerivative => "hard_tanh_derivative",
            OpKind::SoftsignDerivative => "softsign_derivative",
            OpKind::SoftmaxDerivative => "softmax_derivative",
            OpKind::MatMul => "matmul",
            OpKind::Transpose => "transpose",
            OpKind::Sum => "sum",
            OpKind::BroadcastTo => "broadcast_to",
            OpKind::ReduceSumTo => "reduce_sum_to",
            OpKind::ZerosLike => "zeros_like",
            OpKind::OnesLike => "ones_like",
            OpKind::Conv2d => "conv2d",
            OpKind::Conv2dDerivative => "conv2d_derivative",
        }
    }

    /// Fixed input count of single-output variants. Convolutions are
    /// variadic and handled by [`Op::validate_arity`].
    fn input_count(self) -> usize {
        match self {
            OpKind::Add
            | OpKind::Subtract
            | OpKind::Multiply
            | OpKind::Divide
            | OpKind::MatMul
            | OpKind::BroadcastTo
            | OpKind::ReduceSumTo
            | OpKind::SigmoidDerivative
            | OpKind::TanhDerivative
            | OpKind::ReluDerivative
            | OpKind::LeakyReluDerivative
            | OpKind::EluDerivative
            | OpKind::HardTanhDerivative
            | OpKind::SoftsignDerivative
            | OpKind::SoftmaxDerivative => 2,
            OpKind::Conv2d => 2,
            OpKind::Conv2dDerivative => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
