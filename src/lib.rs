//! BERT + linear-chain CRF sequence labeling on candle.
//!
//! [`CRF`] owns the learned transition scores and runs the forward
//! (partition), gold-path and Viterbi recursions over batched emissions.
//! [`BertCrfTagger`] puts a dropout + linear emission head between any
//! [`Encoder`] and the CRF.

use candle_core::{shape::Dim, Tensor, D};

pub mod config;
pub mod crf;
pub mod error;
pub mod log_space;
pub mod tagger;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::CrfConfig;
pub use crf::{TransitionConstraints, Viterbi, CRF, IMPOSSIBLE};
pub use error::{Error, Result};
pub use log_space::{log_sum_exp_batch, log_sum_exp_mat, log_sum_exp_vec};
pub use tagger::{BertCrfTagger, EmissionHead, Encoder};

/// Reduction Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// One loss per sequence.
    None,
    Sum,
    Mean,
    /// Batch mean divided by the padded sequence length.
    LengthMean,
}

impl Default for Reduction {
    fn default() -> Self {
        Reduction::LengthMean
    }
}

// -----------------------------------------------------------------------------

pub(crate) fn all(x: &Tensor) -> candle_core::Result<bool> {
    let zero = x.zeros_like()?;
    Ok(x.broadcast_ne(&zero)?
        .flatten_all()?
        .min(0)?
        .to_scalar::<u8>()?
        != 0)
}

// -----------------------------------------------------------------------------

/// Picks `src[b, idx[b]]` for every row `b`.
pub(crate) fn gather(src: &Tensor, idx: &Tensor) -> candle_core::Result<Tensor> {
    let index = idx.reshape((idx.dim(0)?, 1))?;
    src.gather(&index, D::Minus1)?.squeeze(D::Minus1)
}

// -----------------------------------------------------------------------------

/// Max values and their first (lowest-index) arg positions along `dim`.
pub(crate) fn max_indices<D: Dim + Copy>(
    x: &Tensor,
    dim: D,
) -> candle_core::Result<(Tensor, Tensor)> {
    let max = x.max(dim)?;
    let idx = x.argmax(dim)?;
    Ok((max, idx))
}
