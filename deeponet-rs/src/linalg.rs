//! Dense linear-algebra helpers shared by the output handlings, the
//! decomposition helper and the POD helper.
//!
//! candle provides autodiff and matrix products; factorizations (QR, SVD) go
//! through nalgebra. The bridge functions here convert between the two,
//! always through `f64`.

use candle_core::{DType, Device, Tensor};
use nalgebra::DMatrix;

use crate::error::{DeepOnetError, Result};

/// `n × n` identity matrix.
pub fn identity(n: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0.0f64; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Ok(Tensor::from_vec(data, (n, n), device)?.to_dtype(dtype)?)
}

/// `copies` identity blocks of size `k` placed side by side: shape `(k, k·copies)`.
pub fn tiled_identity(k: usize, copies: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let eye = identity(k, dtype, device)?;
    let blocks = vec![eye; copies];
    Ok(Tensor::cat(&blocks, 1)?)
}

/// Block-diagonal matrix built from 2-D blocks.
pub fn block_diag(blocks: &[Tensor]) -> Result<Tensor> {
    let first = blocks
        .first()
        .ok_or_else(|| DeepOnetError::shape_mismatch("at least one block", "none"))?;
    let (dtype, device) = (first.dtype(), first.device().clone());

    let mut dims = Vec::with_capacity(blocks.len());
    for block in blocks {
        dims.push(block.dims2()?);
    }
    let total_cols: usize = dims.iter().map(|(_, c)| c).sum();

    let mut rows = Vec::with_capacity(blocks.len());
    let mut offset = 0;
    for (block, &(r, c)) in blocks.iter().zip(&dims) {
        let mut parts = Vec::with_capacity(3);
        if offset > 0 {
            parts.push(Tensor::zeros((r, offset), dtype, &device)?);
        }
        parts.push(block.clone());
        let right = total_cols - offset - c;
        if right > 0 {
            parts.push(Tensor::zeros((r, right), dtype, &device)?);
        }
        rows.push(Tensor::cat(&parts, 1)?);
        offset += c;
    }
    Ok(Tensor::cat(&rows, 0)?)
}

/// Copy a 2-D tensor into an `f64` nalgebra matrix.
pub fn tensor_to_dmatrix(t: &Tensor) -> Result<DMatrix<f64>> {
    let (rows, cols) = t.dims2()?;
    let data = t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    Ok(DMatrix::from_row_slice(rows, cols, &data))
}

/// Copy an nalgebra matrix back into a tensor of the requested dtype.
pub fn dmatrix_to_tensor(m: &DMatrix<f64>, dtype: DType, device: &Device) -> Result<Tensor> {
    let (rows, cols) = m.shape();
    let mut data = Vec::with_capacity(rows * cols);
    for i in 0..rows {
        for j in 0..cols {
            data.push(m[(i, j)]);
        }
    }
    Ok(Tensor::from_vec(data, (rows, cols), device)?.to_dtype(dtype)?)
}

/// Vector norm of all elements of `t` with order `ord`.
///
/// `ord = ∞` is the max-abs norm and `ord = 0` counts non-zeros, matching the
/// usual vector-norm conventions.
pub fn vector_norm(t: &Tensor, ord: f64) -> Result<f64> {
    let values = t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    let norm = if ord == f64::INFINITY {
        values.iter().fold(0.0f64, |acc, v| acc.max(v.abs()))
    } else if ord == f64::NEG_INFINITY {
        values.iter().fold(f64::INFINITY, |acc, v| acc.min(v.abs()))
    } else if ord == 0.0 {
        values.iter().filter(|v| **v != 0.0).count() as f64
    } else {
        values
            .iter()
            .map(|v| v.abs().powf(ord))
            .sum::<f64>()
            .powf(1.0 / ord)
    };
    Ok(norm)
}

/// Relative error `‖target − prediction‖ / ‖target‖`.
///
/// A target with zero norm yields `f64::INFINITY`, never NaN.
pub fn relative_error(target: &Tensor, prediction: &Tensor, ord: f64) -> Result<f64> {
    if target.dims() != prediction.dims() {
        return Err(DeepOnetError::shape_mismatch(
            format!("{:?}", target.dims()),
            format!("{:?}", prediction.dims()),
        ));
    }
    let norm_target = vector_norm(target, ord)?;
    if norm_target > 0.0 {
        let diff = target.to_dtype(DType::F64)?.sub(&prediction.to_dtype(DType::F64)?)?;
        Ok(vector_norm(&diff, ord)? / norm_target)
    } else {
        Ok(f64::INFINITY)
    }
}
