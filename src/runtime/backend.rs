//! Модуль, определяющий интерфейс вычислительных ядер, которые граф вызывает при выполнении.

use crate::ops::Op;
use crate::tensor::TensorHandle;
use ndarray::ArrayD;
use thiserror::Error;

/// Ошибки, которые ядро может вернуть при одном вызове.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("shape error: {0}")]
    Shape(String),
}

/// Трейт, определяющий численные ядра для вариантов операций.
///
/// Реализации обязаны быть детерминированными: одинаковые входы и конфигурация
/// дают одинаковые выходы. Граф сам округляет каждый результат до своей точности
/// и сверяет число выходов с выходами операции.
pub trait Kernel {
    /// Вычисляет выходы `op` (вариант плюс конфигурация) для `inputs`,
    /// переданных в объявленном порядке входов операции.
    fn invoke(&self, op: &Op, inputs: &[TensorHandle]) -> Result<Vec<ArrayD<f64>>, KernelError>;
}
