//! ONNX op names and attribute conventions.

use super::{plain, ExternalFormat, ExternalNode, ImportRegistry};
use crate::graph::GraphResult;
use crate::ops::{Conv2dConfig, Op, OpKind};
use crate::tensor::{DataFormat, WeightFormat};

const FORMAT: ExternalFormat = ExternalFormat::Onnx;

/// ONNX's default `LeakyRelu` slope.
pub const LEAKY_RELU_ALPHA: f64 = 0.01;

pub fn register(registry: &mut ImportRegistry) {
    let simple = [
        ("Add", OpKind::Add),
        ("Sub", OpKind::Subtract),
        ("Mul", OpKind::Multiply),
        ("Div", OpKind::Divide),
        ("Neg", OpKind::Negate),
        ("Exp", OpKind::Exp),
        ("Log", OpKind::Log),
        ("Sqrt", OpKind::Sqrt),
        ("Identity", OpKind::Identity),
        ("Sigmoid", OpKind::Sigmoid),
        ("Tanh", OpKind::Tanh),
        ("Relu", OpKind::Relu),
        ("Softplus", OpKind::Softplus),
        ("Softsign", OpKind::Softsign),
        ("MatMul", OpKind::MatMul),
    ];
    for (name, kind) in simple {
        registry.register(FORMAT, name, kind, plain);
    }
    registry.register(FORMAT, "LeakyRelu", OpKind::LeakyRelu, leaky_relu);
    registry.register(FORMAT, "Elu", OpKind::Elu, elu);
    registry.register(FORMAT, "Softmax", OpKind::Softmax, softmax);
    registry.register(FORMAT, "Transpose", OpKind::Transpose, transpose);
    registry.register(FORMAT, "Conv", OpKind::Conv2d, conv);
}

fn leaky_relu(node: &ExternalNode, _: OpKind) -> GraphResult<Op> {
    let alpha = node.float_attr("alpha")?.unwrap_or(LEAKY_RELU_ALPHA);
    Ok(Op::LeakyRelu { alpha })
}

fn elu(node: &ExternalNode, _: OpKind) -> GraphResult<Op> {
    let alpha = node.float_attr("alpha")?.unwrap_or(1.0);
    Ok(Op::Elu { alpha })
}

/// Only the last axis is supported.
fn softmax(node: &ExternalNode, kind: OpKind) -> GraphResult<Op> {
    match node.int_attr("axis")? {
        None | Some(-1) => plain(node, kind),
        Some(axis) => Err(node.unsupported(&format!("softmax over axis {}", axis))),
    }
}

/// Only the default (fully reversed) permutation is supported.
fn transpose(node: &ExternalNode, kind: OpKind) -> GraphResult<Op> {
    if let Some(perm) = node.ints_attr("perm")? {
        let reversed = perm.iter().rev().enumerate().all(|(i, &p)| i as i64 == p);
        if !reversed {
            return Err(node.unsupported(&format!("permutation {:?}", perm)));
        }
    }
    plain(node, kind)
}

/// Spatial attributes are `[y, x]`; a single stride applies to both axes.
/// Activations are `NCHW`, weights `OIHW`.
fn conv(node: &ExternalNode, _: OpKind) -> GraphResult<Op> {
    if let Some(group) = node.int_attr("group")? {
        if group != 1 {
            return Err(node.unsupported(&format!("grouped convolution (group = {})", group)));
        }
    }

    let pair = |values: Option<Vec<usize>>, name: &str| -> GraphResult<(usize, usize)> {
        match values.as_deref() {
            None => Ok((1, 1)),
            Some([v]) => Ok((*v, *v)),
            Some([y, x]) => Ok((*y, *x)),
            Some(other) => Err(node.invalid(name, format!("expected 1 or 2 values, got {:?}", other))),
        }
    };
    let strides = pair(node.dims_attr("strides")?, "strides")?;
    let dilations = pair(node.dims_attr("dilations")?, "dilations")?;

    let mut cfg = Conv2dConfig::default()
        .with_stride(strides)
        .with_dilation(dilations)
        .with_data_format(DataFormat::Nchw)
        .with_weight_format(WeightFormat::Oihw);

    if let Some(kernel) = node.dims_attr("kernel_shape")? {
        match kernel[..] {
            [kh, kw] => {
                cfg.kernel_h = kh;
                cfg.kernel_w = kw;
            }
            _ => return Err(node.invalid("kernel_shape", format!("expected 2 values, got {:?}", kernel))),
        }
    }

    let auto_pad = node.str_attr("auto_pad")?.unwrap_or("NOTSET");
    match auto_pad.to_ascii_uppercase().as_str() {
        "SAME_UPPER" | "SAME_LOWER" => cfg.same_mode = true,
        "VALID" => {}
        "NOTSET" => {
            // [top, left, bottom, right]; only symmetric padding is representable
            if let Some(pads) = node.pads_attr("pads")? {
                match pads[..] {
                    [top, left, bottom, right] if top == bottom && left == right => {
                        cfg = cfg.with_padding((top, left));
                    }
                    _ => return Err(node.invalid("pads", format!("expected symmetric [t, l, b, r], got {:?}", pads))),
                }
            }
        }
        other => return Err(node.invalid("auto_pad", format!("unknown mode '{}'", other))),
    }
    Ok(Op::Conv2d(cfg))
}
