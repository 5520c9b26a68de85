//! Эталонные CPU-ядра для всех вариантов операций.
//!
//! Простые циклы на `ndarray`, написанные ради корректности, а не скорости.
//! Тесты используют их как численный эталон.

use super::backend::{Kernel, KernelError};
use crate::ops::{Conv2dConfig, Op};
use crate::tensor::{DataFormat, TensorHandle, WeightFormat};
use ndarray::{Array4, ArrayD, ArrayViewD, Axis, Ix2, Ix4, IxDyn, Zip};

type KernelResult = Result<Vec<ArrayD<f64>>, KernelError>;

pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for CpuBackend {
    fn invoke(&self, op: &Op, inputs: &[TensorHandle]) -> KernelResult {
        let args: Vec<&ArrayD<f64>> = inputs.iter().map(|t| t.array()).collect();
        let single = |r: Result<ArrayD<f64>, KernelError>| r.map(|a| vec![a]);

        match op {
            Op::Add => single(op_binary(&args, |a, b| a + b)),
            Op::Subtract => single(op_binary(&args, |a, b| a - b)),
            Op::Multiply => single(op_binary(&args, |a, b| a * b)),
            Op::Divide => single(op_binary(&args, |a, b| a / b)),

            Op::Negate => single(op_unary(&args, |x| -x)),
            Op::Exp => single(op_unary(&args, f64::exp)),
            Op::Log => single(op_unary(&args, f64::ln)),
            Op::Sqrt => single(op_unary(&args, f64::sqrt)),
            Op::Square => single(op_unary(&args, |x| x * x)),
            Op::Pow { exponent } => {
                let e = *exponent;
                single(op_unary(&args, |x| x.powf(e)))
            }
            Op::Scale { factor } => {
                let f = *factor;
                single(op_unary(&args, |x| x * f))
            }

            Op::Identity => single(op_unary(&args, |x| x)),
            Op::Sigmoid => single(op_unary(&args, sigmoid)),
            Op::Tanh => single(op_unary(&args, f64::tanh)),
            Op::Relu { cutoff } => {
                let c = *cutoff;
                single(op_unary(&args, |x| if x > c { x } else { 0.0 }))
            }
            Op::LeakyRelu { alpha } => {
                let a = *alpha;
                single(op_unary(&args, |x| if x > 0.0 { x } else { a * x }))
            }
            Op::Elu { alpha } => {
                let a = *alpha;
                single(op_unary(&args, |x| if x > 0.0 { x } else { a * (x.exp() - 1.0) }))
            }
            Op::HardTanh => single(op_unary(&args, |x| x.clamp(-1.0, 1.0))),
            Op::Softplus => single(op_unary(&args, softplus)),
            Op::Softsign => single(op_unary(&args, |x| x / (1.0 + x.abs()))),
            Op::Softmax => single(op_softmax(&args)),

            Op::SigmoidDerivative => single(op_binary(&args, |y, g| g * y * (1.0 - y))),
            Op::TanhDerivative => single(op_binary(&args, |y, g| g * (1.0 - y * y))),
            Op::ReluDerivative { cutoff } => {
                let c = *cutoff;
                single(op_binary(&args, |x, g| if x > c { g } else { 0.0 }))
            }
            Op::LeakyReluDerivative { alpha } => {
                let a = *alpha;
                single(op_binary(&args, |x, g| if x > 0.0 { g } else { a * g }))
            }
            Op::EluDerivative { alpha } => {
                let a = *alpha;
                single(op_binary(&args, |x, g| if x > 0.0 { g } else { g * a * x.exp() }))
            }
            Op::HardTanhDerivative => {
                single(op_binary(&args, |x, g| if x > -1.0 && x < 1.0 { g } else { 0.0 }))
            }
            Op::SoftsignDerivative => {
                single(op_binary(&args, |x, g| g / ((1.0 + x.abs()) * (1.0 + x.abs()))))
            }
            Op::SoftmaxDerivative => single(op_softmax_derivative(&args)),

            Op::MatMul => single(op_matmul(&args)),
            Op::Transpose => single(arg(&args, 0).map(|a| a.view().reversed_axes().to_owned())),
            Op::Sum => single(arg(&args, 0).map(|a| ndarray::arr0(a.sum()).into_dyn())),
            Op::BroadcastTo => single(op_broadcast_to(&args)),
            Op::ReduceSumTo => single(op_reduce_sum_to(&args)),
            Op::ZerosLike => single(arg(&args, 0).map(|a| ArrayD::zeros(a.raw_dim()))),
            Op::OnesLike => single(arg(&args, 0).map(|a| ArrayD::ones(a.raw_dim()))),

            Op::Conv2d(cfg) => single(op_conv2d(&args, cfg)),
            Op::Conv2dDerivative(cfg) => op_conv2d_derivative(&args, cfg),
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn softplus(x: f64) -> f64 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

fn arg<'a>(args: &[&'a ArrayD<f64>], index: usize) -> Result<&'a ArrayD<f64>, KernelError> {
    args.get(index).copied().ok_or_else(|| {
        KernelError::Shape(format!("expected at least {} input(s), got {}", index + 1, args.len()))
    })
}

fn op_unary(args: &[&ArrayD<f64>], f: impl Fn(f64) -> f64) -> Result<ArrayD<f64>, KernelError> {
    Ok(arg(args, 0)?.mapv(f))
}

/// Форма, к которой транслируются оба операнда (правила numpy: выравнивание справа, 1 растягивается).
fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>, KernelError> {
    let rank = a.len().max(b.len());
    let mut shape = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        shape[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(KernelError::Shape(format!(
                    "cannot broadcast {:?} with {:?}",
                    a, b
                )))
            }
        };
    }
    Ok(shape)
}

fn broadcast_pair<'a>(
    a: &'a ArrayD<f64>,
    b: &'a ArrayD<f64>,
) -> Result<(ArrayViewD<'a, f64>, ArrayViewD<'a, f64>), KernelError> {
    let shape = broadcast_shape(a.shape(), b.shape())?;
    let err = || KernelError::Shape(format!("cannot broadcast {:?} with {:?}", a.shape(), b.shape()));
    let av = a.broadcast(IxDyn(&shape)).ok_or_else(err)?;
    let bv = b.broadcast(IxDyn(&shape)).ok_or_else(err)?;
    Ok((av, bv))
}

fn op_binary(args: &[&ArrayD<f64>], f: impl Fn(f64, f64) -> f64) -> Result<ArrayD<f64>, KernelError> {
    let (a, b) = broadcast_pair(arg(args, 0)?, arg(args, 1)?)?;
    Ok(Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y)))
}

fn op_softmax(args: &[&ArrayD<f64>]) -> Result<ArrayD<f64>, KernelError> {
    let a = arg(args, 0)?;
    if a.ndim() == 0 {
        return Ok(ArrayD::ones(a.raw_dim()));
    }
    let mut result = a.clone();
    let last_axis = Axis(a.ndim() - 1);
    for mut row in result.lanes_mut(last_axis) {
        let max_val = row.iter().fold(f64::NEG_INFINITY, |max, &v| max.max(v));
        row.mapv_inplace(|x| (x - max_val).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
    Ok(result)
}

/// dx = y * (g - sum(g * y)) along the last axis.
fn op_softmax_derivative(args: &[&ArrayD<f64>]) -> Result<ArrayD<f64>, KernelError> {
    let y = arg(args, 0)?;
    let g = arg(args, 1)?;
    if y.shape() != g.shape() {
        return Err(KernelError::Shape(format!(
            "softmax derivative: output {:?} and gradient {:?} differ",
            y.shape(),
            g.shape()
        )));
    }
    if y.ndim() == 0 {
        return Ok(ArrayD::zeros(y.raw_dim()));
    }
    let last_axis = Axis(y.ndim() - 1);
    let mut result = ArrayD::zeros(y.raw_dim());
    Zip::from(result.lanes_mut(last_axis))
        .and(y.lanes(last_axis))
        .and(g.lanes(last_axis))
        .for_each(|mut out, y_row, g_row| {
            let dot: f64 = y_row.iter().zip(g_row.iter()).map(|(a, b)| a * b).sum();
            Zip::from(&mut out)
                .and(&y_row)
                .and(&g_row)
                .for_each(|o, &yv, &gv| *o = yv * (gv - dot));
        });
    Ok(result)
}

fn op_matmul(args: &[&ArrayD<f64>]) -> Result<ArrayD<f64>, KernelError> {
    let a = arg(args, 0)?;
    let b = arg(args, 1)?;
    let a_mat = a
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| KernelError::Shape(format!("matmul lhs: {}", e)))?;
    let b_mat = b
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| KernelError::Shape(format!("matmul rhs: {}", e)))?;
    if a_mat.shape()[1] != b_mat.shape()[0] {
        return Err(KernelError::Shape(format!(
            "incompatible matmul shapes: {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(a_mat.dot(&b_mat).into_dyn())
}

fn op_broadcast_to(args: &[&ArrayD<f64>]) -> Result<ArrayD<f64>, KernelError> {
    let source = arg(args, 0)?;
    let target = arg(args, 1)?;
    source
        .broadcast(target.raw_dim())
        .map(|v| v.to_owned())
        .ok_or_else(|| {
            KernelError::Shape(format!(
                "cannot broadcast {:?} to {:?}",
                source.shape(),
                target.shape()
            ))
        })
}

/// Суммирует транслированные оси `source`, чтобы он принял форму донора.
fn op_reduce_sum_to(args: &[&ArrayD<f64>]) -> Result<ArrayD<f64>, KernelError> {
    let mut source = arg(args, 0)?.clone();
    let target_shape = arg(args, 1)?.shape().to_vec();
    let target_rank = target_shape.len();

    while source.ndim() > target_rank {
        source = source.sum_axis(Axis(0));
    }
    if source.ndim() < target_rank {
        return Err(KernelError::Shape(format!(
            "cannot reduce {:?} to larger rank {:?}",
            source.shape(),
            target_shape
        )));
    }
    for axis in 0..target_rank {
        if target_shape[axis] == 1 && source.shape()[axis] > 1 {
            source = source.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    if source.shape() != target_shape.as_slice() {
        return Err(KernelError::Shape(format!(
            "cannot reduce {:?} to {:?}",
            source.shape(),
            target_shape
        )));
    }
    Ok(source)
}

/// Приводит 4-D активацию к `NCHW`.
fn to_nchw(a: &ArrayD<f64>, format: DataFormat, what: &str) -> Result<Array4<f64>, KernelError> {
    if a.ndim() != 4 {
        return Err(KernelError::Shape(format!("conv2d {} must be 4-D, got {:?}", what, a.shape())));
    }
    a.view()
        .permuted_axes(IxDyn(&format.to_canonical()))
        .to_owned()
        .into_dimensionality::<Ix4>()
        .map_err(|e| KernelError::Shape(format!("conv2d {}: {}", what, e)))
}

fn from_nchw(a: Array4<f64>, format: DataFormat) -> ArrayD<f64> {
    let a = a.into_dyn();
    match format {
        DataFormat::Nchw => a,
        _ => a
            .view()
            .permuted_axes(IxDyn(&format.from_canonical()))
            .as_standard_layout()
            .into_owned(),
    }
}

/// Веса должны быть уже в канонической раскладке (`OIHW`); их перестановкой
/// занимается шаг материализации графа.
fn canonical_weights(w: &ArrayD<f64>, cfg: &Conv2dConfig) -> Result<Array4<f64>, KernelError> {
    if cfg.weight_format != WeightFormat::Oihw {
        return Err(KernelError::Shape(format!(
            "conv2d weights are still in {:?} layout; materialize the graph first",
            cfg.weight_format
        )));
    }
    let w = w
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| KernelError::Shape(format!("conv2d weights: {}", e)))?
        .to_owned();
    let (_, _, kh, kw) = w.dim();
    if (cfg.kernel_h != 0 && cfg.kernel_h != kh) || (cfg.kernel_w != 0 && cfg.kernel_w != kw) {
        return Err(KernelError::Shape(format!(
            "conv2d kernel {}x{} does not match weights {:?}",
            cfg.kernel_h,
            cfg.kernel_w,
            w.shape()
        )));
    }
    Ok(w)
}

struct ConvGeometry {
    out_h: usize,
    out_w: usize,
    pad_top: usize,
    pad_left: usize,
}

fn conv_geometry(x: &Array4<f64>, w: &Array4<f64>, cfg: &Conv2dConfig) -> Result<ConvGeometry, KernelError> {
    let (_, in_c, in_h, in_w) = x.dim();
    let (_, w_in_c, kh, kw) = w.dim();
    if in_c != w_in_c {
        return Err(KernelError::Shape(format!(
            "conv2d input has {} channels, weights expect {}",
            in_c, w_in_c
        )));
    }
    let ((out_h, out_w), (pad_top, pad_left)) = cfg
        .output_geometry(in_h, in_w, kh, kw)
        .ok_or_else(|| KernelError::Shape(format!("conv2d kernel {}x{} larger than padded input {}x{}", kh, kw, in_h, in_w)))?;
    Ok(ConvGeometry {
        out_h,
        out_w,
        pad_top,
        pad_left,
    })
}

/// Позиция входа, которую читает выход `(oh, ow)` в точке ядра `(ky, kx)`.
fn tap(g: &ConvGeometry, cfg: &Conv2dConfig, oh: usize, ow: usize, ky: usize, kx: usize, in_h: usize, in_w: usize) -> Option<(usize, usize)> {
    let ih = (oh * cfg.stride_y + ky * cfg.dilation_y) as isize - g.pad_top as isize;
    let iw = (ow * cfg.stride_x + kx * cfg.dilation_x) as isize - g.pad_left as isize;
    if ih >= 0 && ih < in_h as isize && iw >= 0 && iw < in_w as isize {
        Some((ih as usize, iw as usize))
    } else {
        None
    }
}

fn bias_vector(args: &[&ArrayD<f64>], index: usize, out_c: usize) -> Result<Option<Vec<f64>>, KernelError> {
    match args.get(index) {
        None => Ok(None),
        Some(b) if b.len() == out_c => Ok(Some(b.iter().copied().collect())),
        Some(b) => Err(KernelError::Shape(format!(
            "conv2d bias has {} elements, expected {}",
            b.len(),
            out_c
        ))),
    }
}

/// Input: `[N, C_in, H, W]` (after layout conversion), weight `[C_out, C_in, kH, kW]`,
/// bias `[C_out]`.
fn op_conv2d(args: &[&ArrayD<f64>], cfg: &Conv2dConfig) -> Result<ArrayD<f64>, KernelError> {
    let x = to_nchw(arg(args, 0)?, cfg.data_format, "input")?;
    let w = canonical_weights(arg(args, 1)?, cfg)?;
    let geo = conv_geometry(&x, &w, cfg)?;
    let (batch, in_c, in_h, in_w) = x.dim();
    let (out_c, _, kh, kw) = w.dim();
    let bias = bias_vector(args, 2, out_c)?;

    let mut output = Array4::<f64>::zeros((batch, out_c, geo.out_h, geo.out_w));
    for n in 0..batch {
        for oc in 0..out_c {
            for oh in 0..geo.out_h {
                for ow in 0..geo.out_w {
                    let mut sum = bias.as_ref().map_or(0.0, |b| b[oc]);
                    for ic in 0..in_c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                if let Some((ih, iw)) = tap(&geo, cfg, oh, ow, ky, kx, in_h, in_w) {
                                    sum += x[[n, ic, ih, iw]] * w[[oc, ic, ky, kx]];
                                }
                            }
                        }
                    }
                    output[[n, oc, oh, ow]] = sum;
                }
            }
        }
    }
    Ok(from_nchw(output, cfg.data_format))
}

/// Градиенты `op_conv2d` по каждому прямому входу; градиент выхода
/// передается последним входом.
fn op_conv2d_derivative(args: &[&ArrayD<f64>], cfg: &Conv2dConfig) -> KernelResult {
    if args.len() < 3 {
        return Err(KernelError::Shape(format!(
            "conv2d derivative expects at least 3 inputs, got {}",
            args.len()
        )));
    }
    let has_bias = args.len() == 4;
    let grad_index = args.len() - 1;

    let x = to_nchw(args[0], cfg.data_format, "input")?;
    let w = canonical_weights(args[1], cfg)?;
    let dy = to_nchw(args[grad_index], cfg.data_format, "output gradient")?;
    let geo = conv_geometry(&x, &w, cfg)?;
    let (batch, in_c, in_h, in_w) = x.dim();
    let (out_c, _, kh, kw) = w.dim();
    if dy.dim() != (batch, out_c, geo.out_h, geo.out_w) {
        return Err(KernelError::Shape(format!(
            "conv2d output gradient {:?} does not match output {:?}",
            dy.shape(),
            [batch, out_c, geo.out_h, geo.out_w]
        )));
    }

    let mut dx = Array4::<f64>::zeros(x.raw_dim());
    let mut dw = Array4::<f64>::zeros(w.raw_dim());
    let mut db = vec![0.0; out_c];
    for n in 0..batch {
        for oc in 0..out_c {
            for oh in 0..geo.out_h {
                for ow in 0..geo.out_w {
                    let g = dy[[n, oc, oh, ow]];
                    db[oc] += g;
                    for ic in 0..in_c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                if let Some((ih, iw)) = tap(&geo, cfg, oh, ow, ky, kx, in_h, in_w) {
                                    dx[[n, ic, ih, iw]] += g * w[[oc, ic, ky, kx]];
                                    dw[[oc, ic, ky, kx]] += g * x[[n, ic, ih, iw]];
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    let mut grads = vec![from_nchw(dx, cfg.data_format), dw.into_dyn()];
    if has_bias {
        let bias_shape = args[2].raw_dim();
        let db = ArrayD::from_shape_vec(bias_shape, db).map_err(|e| KernelError::Shape(format!("conv2d bias gradient: {}", e)))?;
        grads.push(db);
    }
    Ok(grads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Precision;

    fn t(shape: &[usize], values: Vec<f64>) -> TensorHandle {
        TensorHandle::from_shape_vec(shape, values, Precision::F64).unwrap()
    }

    #[test]
    fn binary_ops_broadcast() {
        let cpu = CpuBackend::new();
        let a = t(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let b = t(&[1, 2], vec![10.0, 20.0]);
        let out = cpu.invoke(&Op::Add, &[a.clone(), b]).unwrap();
        assert_eq!(out[0].iter().copied().collect::<Vec<_>>(), vec![11.0, 22.0, 13.0, 24.0]);

        let bad = t(&[3], vec![1.0, 2.0, 3.0]);
        assert!(matches!(cpu.invoke(&Op::Add, &[a, bad]), Err(KernelError::Shape(_))));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let cpu = CpuBackend::new();
        let x = t(&[2, 3], vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0]);
        let out = cpu.invoke(&Op::Softmax, &[x]).unwrap();
        for row in out[0].lanes(Axis(1)) {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
        assert!(out[0][[0, 2]] > out[0][[0, 1]]);
    }

    #[test]
    fn reduce_sum_to_collapses_broadcast_axes() {
        let cpu = CpuBackend::new();
        let g = t(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let like = t(&[1, 3], vec![0.0; 3]);
        let out = cpu.invoke(&Op::ReduceSumTo, &[g.clone(), like]).unwrap();
        assert_eq!(out[0].shape(), &[1, 3]);
        assert_eq!(out[0].iter().copied().collect::<Vec<_>>(), vec![5.0, 7.0, 9.0]);

        let scalar = TensorHandle::scalar(0.0, Precision::F64);
        let out = cpu.invoke(&Op::ReduceSumTo, &[g, scalar]).unwrap();
        assert_eq!(out[0].first().copied(), Some(21.0));
    }

    #[test]
    fn conv2d_matches_hand_computation() {
        // 1x1x3x3 input, 1x1x2x2 identity-diagonal kernel
        let x = t(&[1, 1, 3, 3], (1..=9).map(f64::from).collect());
        let w = t(&[1, 1, 2, 2], vec![1.0, 0.0, 0.0, 1.0]);
        let cfg = Conv2dConfig::new((2, 2));
        let out = CpuBackend::new().invoke(&Op::Conv2d(cfg), &[x, w]).unwrap();
        assert_eq!(out[0].shape(), &[1, 1, 2, 2]);
        assert_eq!(out[0].iter().copied().collect::<Vec<_>>(), vec![6.0, 8.0, 12.0, 14.0]);
    }

    #[test]
    fn conv2d_nhwc_matches_nchw() {
        let cpu = CpuBackend::new();
        let x_nchw = t(&[1, 2, 3, 3], (0..18).map(|v| f64::from(v) * 0.5).collect());
        let w = t(&[2, 2, 2, 2], (0..16).map(|v| f64::from(v) - 7.0).collect());
        let x_nhwc = x_nchw.permuted(&DataFormat::Nhwc.from_canonical()).unwrap();

        let nchw = cpu.invoke(&Op::Conv2d(Conv2dConfig::new((2, 2))), &[x_nchw, w.clone()]).unwrap();
        let cfg = Conv2dConfig::new((2, 2)).with_data_format(DataFormat::Nhwc);
        let nhwc = cpu.invoke(&Op::Conv2d(cfg), &[x_nhwc, w]).unwrap();
        let back = nhwc[0].view().permuted_axes(IxDyn(&DataFormat::Nhwc.to_canonical())).to_owned();
        assert_eq!(back, nchw[0]);
    }

    #[test]
    fn conv2d_derivative_valid_stride1() {
        let x = t(&[1, 1, 3, 3], (1..=9).map(f64::from).collect());
        let w = t(&[1, 1, 2, 2], vec![1.0, 0.0, 0.0, 1.0]);
        let b = t(&[1], vec![0.5]);
        let dy = t(&[1, 1, 2, 2], vec![1.0; 4]);
        let grads = CpuBackend::new()
            .invoke(&Op::Conv2dDerivative(Conv2dConfig::new((2, 2))), &[x, w, b, dy])
            .unwrap();
        assert_eq!(grads.len(), 3);
        assert_eq!(
            grads[0].iter().copied().collect::<Vec<_>>(),
            vec![1.0, 1.0, 0.0, 1.0, 2.0, 1.0, 0.0, 1.0, 1.0]
        );
        // dW[ky,kx] = sum of the 2x2 input windows shifted by (ky,kx)
        assert_eq!(grads[1].iter().copied().collect::<Vec<_>>(), vec![12.0, 16.0, 24.0, 28.0]);
        assert_eq!(grads[2].iter().copied().collect::<Vec<_>>(), vec![4.0]);
    }

    #[test]
    fn unmaterialized_weights_are_rejected() {
        let x = t(&[1, 1, 3, 3], vec![0.0; 9]);
        let w = t(&[2, 2, 1, 1], vec![0.0; 4]);
        let cfg = Conv2dConfig::default().with_weight_format(WeightFormat::Hwio);
        assert!(CpuBackend::new().invoke(&Op::Conv2d(cfg), &[x, w]).is_err());
    }
}
