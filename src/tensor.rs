//! Модуль, определяющий `TensorHandle` - значение, которое хранит `Variable`.
//!
//! Дескриптор - это указатель со счетчиком ссылок на неизменяемое хранилище
//! `ndarray` плюс точность (`Precision`), с которой значение было получено.
//! Клонирование дескриптора никогда не копирует данные; любое "изменение"
//! (перестановка осей, округление) создает новое хранилище, поэтому два графа,
//! держащие один и тот же дескриптор, не видят записей друг друга.
//!
//! Здесь же находятся теги раскладки (`DataFormat`, `WeightFormat`), которые
//! описывают порядок осей 4-D тензоров во внешних форматах, и перестановки,
//! приводящие их к канонической раскладке (`NCHW` для активаций, `OIHW` для весов).

use ndarray::{ArrayD, IxDyn, ShapeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Разрядность, с которой вычисляет граф.
///
/// Хранилище всегда `f64`; при `F32` каждое полученное значение округляется
/// через `f32`, чтобы результат побитово совпадал с одинарной точностью.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Precision {
    #[default]
    F32,
    F64,
}

impl Precision {
    /// Округляет одно значение до этой точности.
    pub fn round(self, value: f64) -> f64 {
        match self {
            Precision::F32 => value as f32 as f64,
            Precision::F64 => value,
        }
    }
}

/// Разделяемое неизменяемое хранилище тензора.
#[derive(Debug, Clone)]
pub struct TensorHandle {
    data: Arc<ArrayD<f64>>,
    precision: Precision,
}

impl TensorHandle {
    /// Оборачивает массив, округляя его до `precision`.
    pub fn new(mut array: ArrayD<f64>, precision: Precision) -> Self {
        if precision == Precision::F32 {
            array.mapv_inplace(|v| precision.round(v));
        }
        // Canonical row-major layout keeps `as_slice` and serialization simple.
        let array = if array.is_standard_layout() {
            array
        } else {
            array.as_standard_layout().into_owned()
        };
        Self {
            data: Arc::new(array),
            precision,
        }
    }

    pub fn from_shape_vec(
        shape: &[usize],
        values: Vec<f64>,
        precision: Precision,
    ) -> Result<Self, ShapeError> {
        let array = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(Self::new(array, precision))
    }

    pub fn scalar(value: f64, precision: Precision) -> Self {
        Self::new(ndarray::arr0(value).into_dyn(), precision)
    }

    pub fn filled(shape: &[usize], value: f64, precision: Precision) -> Self {
        Self::new(ArrayD::from_elem(IxDyn(shape), value), precision)
    }

    pub fn zeros(shape: &[usize], precision: Precision) -> Self {
        Self::filled(shape, 0.0, precision)
    }

    pub fn ones(shape: &[usize], precision: Precision) -> Self {
        Self::filled(shape, 1.0, precision)
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn array(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Копия значений в построчном порядке.
    pub fn to_vec(&self) -> Vec<f64> {
        self.data.iter().copied().collect()
    }

    /// `true`, если оба дескриптора указывают на одно и то же хранилище.
    pub fn shares_storage_with(&self, other: &TensorHandle) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Возвращает новый дескриптор с осями, переставленными по `order`.
    ///
    /// Результат владеет новым хранилищем в стандартной раскладке; `self` не меняется.
    pub fn permuted(&self, order: &[usize]) -> Result<Self, ShapeError> {
        if order.len() != self.data.ndim() {
            return Err(ShapeError::from_kind(ndarray::ErrorKind::IncompatibleShape));
        }
        let view = self.data.view().permuted_axes(IxDyn(order));
        Ok(Self::new(view.to_owned(), self.precision))
    }

    /// Те же значения, округленные до другой точности.
    pub fn with_precision(&self, precision: Precision) -> Self {
        if precision == self.precision {
            return self.clone();
        }
        Self::new((*self.data).clone(), precision)
    }
}

/// Равенство по значениям; совпадение хранилищ не важно.
impl PartialEq for TensorHandle {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

/// Порядок осей 4-D тензоров активаций.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataFormat {
    /// `[batch, channels, height, width]`, the canonical layout.
    #[default]
    Nchw,
    /// `[batch, height, width, channels]`, TensorFlow's default.
    Nhwc,
}

impl DataFormat {
    /// Перестановка из этой раскладки в `NCHW`.
    pub fn to_canonical(self) -> [usize; 4] {
        match self {
            DataFormat::Nchw => [0, 1, 2, 3],
            DataFormat::Nhwc => [0, 3, 1, 2],
        }
    }

    /// Обратная перестановка из `NCHW` в эту раскладку.
    pub fn from_canonical(self) -> [usize; 4] {
        match self {
            DataFormat::Nchw => [0, 1, 2, 3],
            DataFormat::Nhwc => [0, 2, 3, 1],
        }
    }

    /// Position of the (height, width) axes inside a 4-element attribute
    /// laid out in this format (e.g. TensorFlow `strides`).
    pub fn spatial_axes(self) -> (usize, usize) {
        match self {
            DataFormat::Nchw => (2, 3),
            DataFormat::Nhwc => (1, 2),
        }
    }
}

impl FromStr for DataFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NCHW" => Ok(DataFormat::Nchw),
            "NHWC" => Ok(DataFormat::Nhwc),
            other => Err(format!("unknown data format '{}'", other)),
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::Nchw => write!(f, "NCHW"),
            DataFormat::Nhwc => write!(f, "NHWC"),
        }
    }
}

/// Порядок осей 4-D весов свертки.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WeightFormat {
    /// `[out_channels, in_channels, kernel_h, kernel_w]`, the canonical layout.
    #[default]
    Oihw,
    /// `[kernel_h, kernel_w, in_channels, out_channels]`, TensorFlow filters.
    Hwio,
}

impl WeightFormat {
    /// Перестановка весов из этой раскладки в `OIHW`.
    pub fn to_canonical(self) -> [usize; 4] {
        match self {
            WeightFormat::Oihw => [0, 1, 2, 3],
            WeightFormat::Hwio => [3, 2, 0, 1],
        }
    }
}
