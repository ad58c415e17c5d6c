//! Small conversions between `ort` values and `ndarray` views used by the
//! diffusion sessions.

use ndarray::{Array2, Array3, Array4};
use ort::value::{DynValue, Tensor};

use crate::error::{DaemonError, Result};

pub fn shape_of(value: &DynValue, what: &str) -> Result<(Vec<usize>, Vec<f32>)> {
    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| DaemonError::inference(format!("cannot extract {what}: {e}")))?;
    Ok((shape.iter().map(|&d| d as usize).collect(), data.to_vec()))
}

pub fn to_array2(value: &DynValue, what: &str) -> Result<Array2<f32>> {
    let (dims, data) = shape_of(value, what)?;
    if dims.len() != 2 {
        return Err(DaemonError::inference(format!(
            "{what}: expected 2-d tensor, got {dims:?}"
        )));
    }
    Array2::from_shape_vec((dims[0], dims[1]), data)
        .map_err(|e| DaemonError::inference(format!("cannot reshape {what}: {e}")))
}

pub fn to_array3(value: &DynValue, what: &str) -> Result<Array3<f32>> {
    let (dims, data) = shape_of(value, what)?;
    if dims.len() != 3 {
        return Err(DaemonError::inference(format!(
            "{what}: expected 3-d tensor, got {dims:?}"
        )));
    }
    Array3::from_shape_vec((dims[0], dims[1], dims[2]), data)
        .map_err(|e| DaemonError::inference(format!("cannot reshape {what}: {e}")))
}

pub fn to_array4(value: &DynValue, what: &str) -> Result<Array4<f32>> {
    let (dims, data) = shape_of(value, what)?;
    if dims.len() != 4 {
        return Err(DaemonError::inference(format!(
            "{what}: expected 4-d tensor, got {dims:?}"
        )));
    }
    Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), data)
        .map_err(|e| DaemonError::inference(format!("cannot reshape {what}: {e}")))
}

pub fn f32_tensor(shape: Vec<usize>, data: Vec<f32>, what: &str) -> Result<DynValue> {
    Ok(Tensor::from_array((shape, data))
        .map_err(|e| DaemonError::inference(format!("cannot build {what} tensor: {e}")))?
        .into_dyn())
}

pub fn i64_tensor(shape: Vec<usize>, data: Vec<i64>, what: &str) -> Result<DynValue> {
    Ok(Tensor::from_array((shape, data))
        .map_err(|e| DaemonError::inference(format!("cannot build {what} tensor: {e}")))?
        .into_dyn())
}
