//! Local derivative rules, one per operation variant.
//!
//! A rule receives the forward operation and the gradient of each of its
//! outputs (already present in the gradient graph) and places the operations
//! computing one partial gradient per input. `None` means no gradient flows to
//! that input (shape donors).

use super::GradientBuilder;
use crate::graph::{GraphError, GraphResult, OpNode, VarId};
use crate::ops::Op;

pub fn derivative(b: &mut GradientBuilder<'_>, node: &OpNode, grads: &[VarId]) -> GraphResult<Vec<Option<VarId>>> {
    let label = node.label();
    let ins = node.inputs();
    let out = node.outputs()[0];
    let g = grads[0];

    let partials = match node.op() {
        Op::Add => vec![
            Some(b.reduce_to(g, ins[0], out, &label)?),
            Some(b.reduce_to(g, ins[1], out, &label)?),
        ],
        Op::Subtract => {
            let neg = b.apply(Op::Negate, &[g])?;
            vec![
                Some(b.reduce_to(g, ins[0], out, &label)?),
                Some(b.reduce_to(neg, ins[1], out, &label)?),
            ]
        }
        Op::Multiply => {
            let lhs = b.mirror(ins[0], &label)?;
            let rhs = b.mirror(ins[1], &label)?;
            let d_lhs = b.apply(Op::Multiply, &[g, rhs])?;
            let d_rhs = b.apply(Op::Multiply, &[g, lhs])?;
            vec![
                Some(b.reduce_to(d_lhs, ins[0], out, &label)?),
                Some(b.reduce_to(d_rhs, ins[1], out, &label)?),
            ]
        }
        Op::Divide => {
            // y = a / b:  da = g / b,  db = -g * y / b
            let rhs = b.mirror(ins[1], &label)?;
            let y = b.mirror(out, &label)?;
            let d_lhs = b.apply(Op::Divide, &[g, rhs])?;
            let gy = b.apply(Op::Multiply, &[g, y])?;
            let gy_b = b.apply(Op::Divide, &[gy, rhs])?;
            let d_rhs = b.apply(Op::Negate, &[gy_b])?;
            vec![
                Some(b.reduce_to(d_lhs, ins[0], out, &label)?),
                Some(b.reduce_to(d_rhs, ins[1], out, &label)?),
            ]
        }

        Op::Negate => vec![Some(b.apply(Op::Negate, &[g])?)],
        Op::Exp => {
            let y = b.mirror(out, &label)?;
            vec![Some(b.apply(Op::Multiply, &[g, y])?)]
        }
        Op::Log => {
            let x = b.mirror(ins[0], &label)?;
            vec![Some(b.apply(Op::Divide, &[g, x])?)]
        }
        Op::Sqrt => {
            // d sqrt(x) = 1 / (2 sqrt(x))
            let y = b.mirror(out, &label)?;
            let g_y = b.apply(Op::Divide, &[g, y])?;
            vec![Some(b.apply(Op::Scale { factor: 0.5 }, &[g_y])?)]
        }
        Op::Square => {
            let x = b.mirror(ins[0], &label)?;
            let two_x = b.apply(Op::Scale { factor: 2.0 }, &[x])?;
            vec![Some(b.apply(Op::Multiply, &[g, two_x])?)]
        }
        Op::Pow { exponent } => {
            let x = b.mirror(ins[0], &label)?;
            let lowered = b.apply(Op::Pow { exponent: exponent - 1.0 }, &[x])?;
            let slope = b.apply(Op::Scale { factor: *exponent }, &[lowered])?;
            vec![Some(b.apply(Op::Multiply, &[g, slope])?)]
        }
        Op::Scale { factor } => vec![Some(b.apply(Op::Scale { factor: *factor }, &[g])?)],

        Op::Identity => vec![Some(g)],
        Op::Sigmoid => {
            let y = b.mirror(out, &label)?;
            vec![Some(b.apply(Op::SigmoidDerivative, &[y, g])?)]
        }
        Op::Tanh => {
            let y = b.mirror(out, &label)?;
            vec![Some(b.apply(Op::TanhDerivative, &[y, g])?)]
        }
        Op::Softmax => {
            let y = b.mirror(out, &label)?;
            vec![Some(b.apply(Op::SoftmaxDerivative, &[y, g])?)]
        }
        Op::Relu { cutoff } => {
            let x = b.mirror(ins[0], &label)?;
            vec![Some(b.apply(Op::ReluDerivative { cutoff: *cutoff }, &[x, g])?)]
        }
        Op::LeakyRelu { alpha } => {
            let x = b.mirror(ins[0], &label)?;
            vec![Some(b.apply(Op::LeakyReluDerivative { alpha: *alpha }, &[x, g])?)]
        }
        Op::Elu { alpha } => {
            let x = b.mirror(ins[0], &label)?;
            vec![Some(b.apply(Op::EluDerivative { alpha: *alpha }, &[x, g])?)]
        }
        Op::HardTanh => {
            let x = b.mirror(ins[0], &label)?;
            vec![Some(b.apply(Op::HardTanhDerivative, &[x, g])?)]
        }
        Op::Softsign => {
            let x = b.mirror(ins[0], &label)?;
            vec![Some(b.apply(Op::SoftsignDerivative, &[x, g])?)]
        }
        Op::Softplus => {
            // softplus'(x) = sigmoid(x)
            let x = b.mirror(ins[0], &label)?;
            let s = b.apply(Op::Sigmoid, &[x])?;
            vec![Some(b.apply(Op::Multiply, &[g, s])?)]
        }

        Op::MatMul => {
            let a = b.mirror(ins[0], &label)?;
            let rhs = b.mirror(ins[1], &label)?;
            let rhs_t = b.apply(Op::Transpose, &[rhs])?;
            let a_t = b.apply(Op::Transpose, &[a])?;
            vec![
                Some(b.apply(Op::MatMul, &[g, rhs_t])?),
                Some(b.apply(Op::MatMul, &[a_t, g])?),
            ]
        }
        Op::Transpose => vec![Some(b.apply(Op::Transpose, &[g])?)],
        Op::Sum => {
            let x = b.mirror(ins[0], &label)?;
            vec![Some(b.apply(Op::BroadcastTo, &[g, x])?)]
        }
        Op::BroadcastTo => {
            let x = b.mirror(ins[0], &label)?;
            vec![Some(b.apply(Op::ReduceSumTo, &[g, x])?), None]
        }
        Op::ReduceSumTo => {
            let x = b.mirror(ins[0], &label)?;
            vec![Some(b.apply(Op::BroadcastTo, &[g, x])?), None]
        }
        Op::ZerosLike | Op::OnesLike => {
            let x = b.mirror(ins[0], &label)?;
            vec![Some(b.apply(Op::ZerosLike, &[x])?)]
        }

        Op::Conv2d(cfg) => {
            let mut inputs = Vec::with_capacity(ins.len() + 1);
            for &input in ins {
                inputs.push(b.mirror(input, &label)?);
            }
            inputs.push(g);
            b.apply_multi(Op::Conv2dDerivative(cfg.clone()), &inputs, ins.len())?
                .into_iter()
                .map(Some)
                .collect()
        }

        Op::SigmoidDerivative
        | Op::TanhDerivative
        | Op::ReluDerivative { .. }
        | Op::LeakyReluDerivative { .. }
        | Op::EluDerivative { .. }
        | Op::HardTanhDerivative
        | Op::SoftsignDerivative
        | Op::SoftmaxDerivative
        | Op::Conv2dDerivative(_) => {
            return Err(GraphError::UnsupportedOperation {
                op: label,
                reason: "no derivative rule (second-order gradients are not supported)".to_string(),
            })
        }
    };
    Ok(partials)
}
