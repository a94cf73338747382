//! Encoder + emission head + CRF, wired for training and inference.

use crate::config::CrfConfig;
use crate::crf::{Viterbi, CRF};
use crate::error::{Error, Result};
use crate::Reduction;
use candle_core::Tensor;
use candle_nn::{Dropout, Init, Linear, Module, VarBuilder};

/// Contextual token encoder (BERT or similar) producing one hidden vector per
/// position.
pub trait Encoder {
    fn hidden_size(&self) -> usize;

    /// `(batch, seq_length)` ids and mask to `(batch, seq_length, hidden_size)`.
    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor>;
}

/// Dropout followed by the hidden to label projection.
pub struct EmissionHead {
    dropout: Dropout,
    hidden2label: Linear,
}

impl EmissionHead {
    /// Xavier-uniform weight, zero bias.
    pub fn load(
        hidden_size: usize,
        num_labels: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bound = (6. / (hidden_size + num_labels) as f64).sqrt();
        let weight = vb.get_with_hints(
            (num_labels, hidden_size),
            "weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let bias = vb.get_with_hints(num_labels, "bias", Init::Const(0.))?;
        Ok(Self {
            dropout: Dropout::new(dropout),
            hidden2label: Linear::new(weight, Some(bias)),
        })
    }

    pub fn forward(&self, hidden: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.dropout.forward(hidden, train)?;
        Ok(self.hidden2label.forward(&hidden)?)
    }
}

/// Sequence tagger scoring label paths with a CRF on top of `E`.
pub struct BertCrfTagger<E> {
    encoder: E,
    head: EmissionHead,
    crf: CRF,
    config: CrfConfig,
}

impl<E: Encoder> BertCrfTagger<E> {
    /// Parameters live under `hidden2label.*` and `crf.transitions` in `vb`.
    pub fn new(encoder: E, config: CrfConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        if encoder.hidden_size() != config.hidden_size {
            return Err(Error::InvalidConfig(format!(
                "encoder hidden size is {}, config expects {}",
                encoder.hidden_size(),
                config.hidden_size
            )));
        }

        let head = EmissionHead::load(
            config.hidden_size,
            config.num_labels,
            config.dropout,
            vb.pp("hidden2label"),
        )?;
        let crf = CRF::load(
            config.num_labels,
            config.start_label_id,
            config.stop_label_id,
            vb.pp("crf"),
        )?;

        tracing::debug!(
            hidden_size = config.hidden_size,
            num_labels = config.num_labels,
            dropout = config.dropout,
            "built tagger"
        );
        Ok(Self {
            encoder,
            head,
            crf,
            config,
        })
    }

    pub fn config(&self) -> &CrfConfig {
        &self.config
    }

    pub fn crf(&self) -> &CRF {
        &self.crf
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Per-position label scores, `(batch, seq_length, num_labels)`.
    pub fn emissions(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let ids = input_ids.dims2()?;
        let mask = attention_mask.dims2()?;
        if ids != mask {
            return Err(Error::Shape(format!(
                "input_ids and attention_mask must match, got {:?} and {:?}",
                ids, mask
            )));
        }
        let hidden = self.encoder.encode(input_ids, attention_mask, train)?;
        self.head.forward(&hidden, train)
    }

    /// Length-normalized batch mean NLL, computed in training mode.
    pub fn neg_log_likelihood(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        label_ids: &Tensor,
    ) -> Result<Tensor> {
        let emissions = self.emissions(input_ids, attention_mask, true)?;
        self.crf
            .neg_log_likelihood(&emissions, label_ids, Reduction::LengthMean)
    }

    /// Inference only: best score and label path per sequence.
    pub fn decode(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Viterbi> {
        let emissions = self.emissions(input_ids, attention_mask, false)?;
        self.crf.decode(&emissions)
    }
}
