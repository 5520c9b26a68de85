//! TensorFlow op names and attribute conventions.

use super::{plain, ExternalFormat, ExternalNode, ImportRegistry};
use crate::graph::GraphResult;
use crate::ops::{Conv2dConfig, Op, OpKind};
use crate::tensor::{DataFormat, WeightFormat};

const FORMAT: ExternalFormat = ExternalFormat::TensorFlow;

/// TensorFlow's default `LeakyRelu` slope.
pub const LEAKY_RELU_ALPHA: f64 = 0.2;

pub fn register(registry: &mut ImportRegistry) {
    let simple = [
        ("Add", OpKind::Add),
        ("AddV2", OpKind::Add),
        ("Sub", OpKind::Subtract),
        ("Mul", OpKind::Multiply),
        ("RealDiv", OpKind::Divide),
        ("Neg", OpKind::Negate),
        ("Exp", OpKind::Exp),
        ("Log", OpKind::Log),
        ("Sqrt", OpKind::Sqrt),
        ("Square", OpKind::Square),
        ("Identity", OpKind::Identity),
        ("Sigmoid", OpKind::Sigmoid),
        ("Tanh", OpKind::Tanh),
        ("Relu", OpKind::Relu),
        ("Softplus", OpKind::Softplus),
        ("Softsign", OpKind::Softsign),
        ("Softmax", OpKind::Softmax),
    ];
    for (name, kind) in simple {
        registry.register(FORMAT, name, kind, plain);
    }
    registry.register(FORMAT, "LeakyRelu", OpKind::LeakyRelu, leaky_relu);
    registry.register(FORMAT, "Elu", OpKind::Elu, elu);
    registry.register(FORMAT, "MatMul", OpKind::MatMul, matmul);
    registry.register(FORMAT, "Conv2D", OpKind::Conv2d, conv2d);
}

fn leaky_relu(node: &ExternalNode, _: OpKind) -> GraphResult<Op> {
    let alpha = node.float_attr("alpha")?.unwrap_or(LEAKY_RELU_ALPHA);
    Ok(Op::LeakyRelu { alpha })
}

fn elu(_: &ExternalNode, _: OpKind) -> GraphResult<Op> {
    Ok(Op::Elu { alpha: 1.0 })
}

fn matmul(node: &ExternalNode, kind: OpKind) -> GraphResult<Op> {
    for flag in ["transpose_a", "transpose_b"] {
        if node.bool_attr(flag)?.unwrap_or(false) {
            return Err(node.unsupported(&format!("{} is not supported", flag)));
        }
    }
    plain(node, kind)
}

/// `strides` and `padding` are required; `strides`/`dilations` are 4-element
/// lists laid out like the activations (`data_format`, default `NHWC`).
/// Filters are stored `HWIO`.
fn conv2d(node: &ExternalNode, _: OpKind) -> GraphResult<Op> {
    let data_format = match node.str_attr("data_format")? {
        None => DataFormat::Nhwc,
        Some(s) => s.parse::<DataFormat>().map_err(|e| node.invalid("data_format", e))?,
    };
    let (h_axis, w_axis) = data_format.spatial_axes();

    let strides = node.dims_attr("strides")?.ok_or_else(|| node.missing("strides"))?;
    if strides.len() != 4 {
        return Err(node.invalid("strides", format!("expected 4 values, got {:?}", strides)));
    }
    let dilations = node.dims_attr("dilations")?.unwrap_or_else(|| vec![1; 4]);
    if dilations.len() != 4 {
        return Err(node.invalid("dilations", format!("expected 4 values, got {:?}", dilations)));
    }

    let padding = node.str_attr("padding")?.ok_or_else(|| node.missing("padding"))?;
    let same_mode = match padding.to_ascii_uppercase().as_str() {
        "SAME" => true,
        "VALID" => false,
        other => return Err(node.invalid("padding", format!("unsupported padding '{}'", other))),
    };

    let cfg = Conv2dConfig::default()
        .with_stride((strides[h_axis], strides[w_axis]))
        .with_dilation((dilations[h_axis], dilations[w_axis]))
        .with_same_mode(same_mode)
        .with_data_format(data_format)
        .with_weight_format(WeightFormat::Hwio);
    Ok(Op::Conv2d(cfg))
}
