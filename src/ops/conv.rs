//! Configuration of the 2-D convolution variants.

use crate::tensor::{DataFormat, WeightFormat};
use serde::{Deserialize, Serialize};

/// Configuration shared by `Op::Conv2d` and its derivative companion.
///
/// Numeric fields use sentinels when unset: a kernel size of `0` means "not
/// known yet, infer from the weights on materialization"; stride and dilation
/// default to `1`, padding to `0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conv2dConfig {
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub dilation_y: usize,
    pub dilation_x: usize,
    /// TensorFlow-style `SAME` padding; explicit pads are ignored when set.
    pub same_mode: bool,
    /// Layout of the activation input and output.
    pub data_format: DataFormat,
    /// Layout the weight tensor is (or will be) supplied in. Reset to `Oihw`
    /// once the weights have been permuted into the graph.
    pub weight_format: WeightFormat,
    /// Set by the one-time materialization step.
    pub materialized: bool,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            kernel_h: 0,
            kernel_w: 0,
            stride_y: 1,
            stride_x: 1,
            pad_h: 0,
            pad_w: 0,
            dilation_y: 1,
            dilation_x: 1,
            same_mode: false,
            data_format: DataFormat::Nchw,
            weight_format: WeightFormat::Oihw,
            materialized: false,
        }
    }
}

impl Conv2dConfig {
    pub fn new(kernel: (usize, usize)) -> Self {
        Self {
            kernel_h: kernel.0,
            kernel_w: kernel.1,
            ..Default::default()
        }
    }

    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride_y = stride.0;
        self.stride_x = stride.1;
        self
    }

    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.pad_h = padding.0;
        self.pad_w = padding.1;
        self
    }

    pub fn with_dilation(mut self, dilation: (usize, usize)) -> Self {
        self.dilation_y = dilation.0;
        self.dilation_x = dilation.1;
        self
    }

    pub fn with_same_mode(mut self, same_mode: bool) -> Self {
        self.same_mode = same_mode;
        self
    }

    pub fn with_data_format(mut self, format: DataFormat) -> Self {
        self.data_format = format;
        self
    }

    pub fn with_weight_format(mut self, format: WeightFormat) -> Self {
        self.weight_format = format;
        self
    }

    /// Kernel extent once dilation is applied; `None` if it overflows.
    pub fn effective_kernel(&self, kernel_h: usize, kernel_w: usize) -> Option<(usize, usize)> {
        let extent = |k: usize, dilation: usize| k.saturating_sub(1).checked_mul(dilation)?.checked_add(1);
        Some((extent(kernel_h, self.dilation_y)?, extent(kernel_w, self.dilation_x)?))
    }

    /// Output spatial size and (top, left) padding for an input of `in_h x in_w`.
    ///
    /// Returns `None` when the kernel does not fit or the sizes overflow.
    pub fn output_geometry(
        &self,
        in_h: usize,
        in_w: usize,
        kernel_h: usize,
        kernel_w: usize,
    ) -> Option<((usize, usize), (usize, usize))> {
        let (ek_h, ek_w) = self.effective_kernel(kernel_h, kernel_w)?;
        if self.same_mode {
            let out_h = ceil_div(in_h, self.stride_y);
            let out_w = ceil_div(in_w, self.stride_x);
            let span = |out: usize, stride: usize, ek: usize| out.saturating_sub(1).checked_mul(stride)?.checked_add(ek);
            let total_h = span(out_h, self.stride_y, ek_h)?.saturating_sub(in_h);
            let total_w = span(out_w, self.stride_x, ek_w)?.saturating_sub(in_w);
            return Some(((out_h, out_w), (total_h / 2, total_w / 2)));
        }
        let padded_h = self.pad_h.checked_mul(2)?.checked_add(in_h)?;
        let padded_w = self.pad_w.checked_mul(2)?.checked_add(in_w)?;
        if padded_h < ek_h || padded_w < ek_w {
            return None;
        }
        let out_h = (padded_h - ek_h) / self.stride_y + 1;
        let out_w = (padded_w - ek_w) / self.stride_x + 1;
        Some(((out_h, out_w), (self.pad_h, self.pad_w)))
    }
}

fn ceil_div(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}
