//! Numerically stable log-sum-exp reductions.
//!
//! Each reduction factors out the maximum along the reduced axis:
//! `max(x) + log(sum(exp(x - max(x))))`. Rows made only of `-inf` yield NaN,
//! which is left to propagate to the caller.

use crate::error::{Error, Result};
use candle_core::Tensor;

/// Reduces a `(m)` or `(1, m)` vector to a scalar.
pub fn log_sum_exp_vec(x: &Tensor) -> Result<Tensor> {
    let x = match x.dims() {
        [_] => x.clone(),
        [1, _] => x.squeeze(0)?,
        dims => {
            return Err(Error::Shape(format!(
                "log_sum_exp_vec expects a (m) or (1, m) tensor, got {:?}",
                dims
            )))
        }
    };
    Ok(reduce_last(&x)?)
}

/// Reduces a `(n, m)` matrix along its last axis to `(n)`.
pub fn log_sum_exp_mat(x: &Tensor) -> Result<Tensor> {
    if x.rank() != 2 {
        return Err(Error::Shape(format!(
            "log_sum_exp_mat expects 2 dimensions, got {}",
            x.rank()
        )));
    }
    Ok(reduce_last(x)?)
}

/// Reduces a `(batch, n, m)` tensor along its last axis to `(batch, n)`.
pub fn log_sum_exp_batch(x: &Tensor) -> Result<Tensor> {
    if x.rank() != 3 {
        return Err(Error::Shape(format!(
            "log_sum_exp_batch expects 3 dimensions, got {}",
            x.rank()
        )));
    }
    Ok(reduce_last(x)?)
}

fn reduce_last(x: &Tensor) -> candle_core::Result<Tensor> {
    x.log_sum_exp(x.rank() - 1)
}
