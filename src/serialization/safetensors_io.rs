//! Хранение тензоров в формате SafeTensors.
//!
//! Значения пишутся как little-endian `F64`. При загрузке принимаются и файлы
//! `F32`; каждое значение заново округляется до запрошенной точности.

use super::{Result, SerializationError};
use crate::tensor::{Precision, TensorHandle};
use safetensors::serialize_to_file;
use safetensors::tensor::{SafeTensors, TensorView};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Записывает все тензоры из `tensors` в `path`.
pub fn save_safetensors<P: AsRef<Path>>(path: P, tensors: &BTreeMap<String, TensorHandle>) -> Result<()> {
    // Буферы байтов должны жить дольше, чем заимствующие их представления.
    let data_storage: Vec<(&str, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, tensor)| {
            let bytes: Vec<u8> = tensor.array().iter().flat_map(|&x| x.to_le_bytes()).collect();
            (name.as_str(), tensor.shape().to_vec(), bytes)
        })
        .collect();

    let mut views: Vec<(&str, TensorView<'_>)> = Vec::with_capacity(data_storage.len());
    for (name, shape, bytes) in &data_storage {
        views.push((*name, TensorView::new(safetensors::Dtype::F64, shape.clone(), bytes)?));
    }

    serialize_to_file(views, &None, path.as_ref())?;
    Ok(())
}

/// Читает все тензоры, сохраненные в `path`.
pub fn load_safetensors<P: AsRef<Path>>(path: P, precision: Precision) -> Result<BTreeMap<String, TensorHandle>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut result = BTreeMap::new();
    for (name, tensor) in tensors.tensors() {
        let shape: Vec<usize> = tensor.shape().to_vec();
        let data = tensor.data();
        let values: Vec<f64> = match tensor.dtype() {
            safetensors::Dtype::F64 => data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
            safetensors::Dtype::F32 => data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            other => return Err(SerializationError::UnsupportedDtype(format!("{:?}", other))),
        };
        let len = values.len();
        let handle = TensorHandle::from_shape_vec(&shape, values, precision).map_err(|_| {
            SerializationError::TensorShape {
                name: name.clone(),
                expected: shape.clone(),
                actual: vec![len],
            }
        })?;
        result.insert(name, handle);
    }
    Ok(result)
}

/// Имена тензоров в файле SafeTensors.
pub fn list_tensors<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    let mut names: Vec<String> = tensors.names().iter().map(|s| s.to_string()).collect();
    names.sort();
    Ok(names)
}
