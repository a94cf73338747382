use crate::error::{Error, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Construction-time settings of a [`BertCrfTagger`](crate::BertCrfTagger).
///
/// The label alphabet has `num_labels` entries, two of which are the
/// `start` and `stop` sentinels bounding every sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrfConfig {
    pub num_labels: usize,
    pub start_label_id: usize,
    pub stop_label_id: usize,
    pub hidden_size: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

fn default_dropout() -> f32 {
    0.2
}

impl CrfConfig {
    pub fn new(
        num_labels: usize,
        start_label_id: usize,
        stop_label_id: usize,
        hidden_size: usize,
    ) -> Self {
        Self {
            num_labels,
            start_label_id,
            stop_label_id,
            hidden_size,
            dropout: default_dropout(),
        }
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_labels(self.num_labels, self.start_label_id, self.stop_label_id)?;
        if self.hidden_size == 0 {
            return Err(Error::InvalidConfig(
                "hidden_size must be greater than 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

pub(crate) fn check_labels(num_labels: usize, start: usize, stop: usize) -> Result<()> {
    if num_labels == 0 {
        return Err(Error::InvalidConfig(
            "num_labels must be greater than 0".to_string(),
        ));
    }
    if start >= num_labels || stop >= num_labels {
        return Err(Error::InvalidConfig(format!(
            "start ({}) and stop ({}) labels must be below num_labels ({})",
            start, stop, num_labels
        )));
    }
    if start == stop {
        return Err(Error::InvalidConfig(format!(
            "start and stop labels must differ, both are {}",
            start
        )));
    }
    Ok(())
}

pub(crate) fn check_dtype(dtype: DType) -> Result<()> {
    use DType::*;
    match dtype {
        #[cfg(any(feature = "cuda", feature = "metal"))]
        F32 | F64 => Ok(()),
        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        BF16 | F16 | F32 | F64 => Ok(()),
        _ => Err(Error::UnsupportedDType(dtype)),
    }
}
