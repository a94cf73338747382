//! Linear-chain CRF with explicit `start` / `stop` sentinel labels.
//!
//! The transition matrix is indexed `[to, from]`. Every recursion starts from
//! a lattice where only `start` is reachable, so position 0 of each sequence
//! is the `start` slot and its emissions are never read.

use crate::config::{check_dtype, check_labels};
use crate::error::{Error, Result};
use crate::log_space::log_sum_exp_batch;
use crate::{all, gather, max_indices, Reduction};
use candle_core::{DType, Device, IndexOp, Tensor, Var, D};
use candle_nn::{Init, VarBuilder};
use std::fmt::Display;

/// Score given to forbidden transitions.
pub const IMPOSSIBLE: f64 = -10000.0;

// -----------------------------------------------------------------------------

/// Hard structure of the transition matrix: nothing moves *to* `start` and
/// nothing moves *from* `stop`.
///
/// Built once and never mutated. [`apply`](Self::apply) overlays the forbidden
/// cells on a raw score matrix without touching it.
#[derive(Debug, Clone)]
pub struct TransitionConstraints {
    num_labels: usize,
    start_label_id: usize,
    stop_label_id: usize,
    forbidden: Tensor,
}

impl TransitionConstraints {
    pub fn new(
        num_labels: usize,
        start_label_id: usize,
        stop_label_id: usize,
        device: &Device,
    ) -> Result<Self> {
        check_labels(num_labels, start_label_id, stop_label_id)?;

        let mut cells = vec![0_u8; num_labels * num_labels];
        for from in 0..num_labels {
            cells[start_label_id * num_labels + from] = 1;
        }
        for to in 0..num_labels {
            cells[to * num_labels + stop_label_id] = 1;
        }
        let forbidden = Tensor::from_vec(cells, (num_labels, num_labels), device)?;

        Ok(Self {
            num_labels,
            start_label_id,
            stop_label_id,
            forbidden,
        })
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn start_label_id(&self) -> usize {
        self.start_label_id
    }

    pub fn stop_label_id(&self) -> usize {
        self.stop_label_id
    }

    /// Returns `raw` with row `start` and column `stop` set to [`IMPOSSIBLE`].
    /// Gradients only flow to the unconstrained cells.
    pub fn apply(&self, raw: &Tensor) -> Result<Tensor> {
        let dims = raw.dims2()?;
        if dims != (self.num_labels, self.num_labels) {
            return Err(Error::Shape(format!(
                "transitions must be ({}, {}), got {:?}",
                self.num_labels, self.num_labels, dims
            )));
        }
        let impossible = Tensor::full(IMPOSSIBLE, dims, raw.device())?.to_dtype(raw.dtype())?;
        Ok(self.forbidden.where_cond(&impossible, raw)?)
    }

    /// Whether every forbidden cell of `transitions` already holds [`IMPOSSIBLE`].
    pub fn is_satisfied_by(&self, transitions: &Tensor) -> Result<bool> {
        let constrained = self.apply(transitions)?;
        Ok(all(&transitions.eq(&constrained)?)?)
    }
}

// -----------------------------------------------------------------------------

/// Result of a batched Viterbi pass.
#[derive(Debug, Clone)]
pub struct Viterbi {
    /// `(batch)` best path score.
    pub scores: Tensor,
    /// `(batch, seq_length)` u32 labels, position 0 is the `start` slot.
    pub paths: Tensor,
    /// `(batch, seq_length, num_labels)` u32; `[b, t, k]` is the best
    /// predecessor of label `k` at step `t`. Step 0 is all zeros.
    pub backpointers: Tensor,
}

impl Viterbi {
    /// Host copies of scores and paths. Scores are narrowed to f32, use
    /// [`scores_f64`](Self::scores_f64) to keep F64 precision.
    pub fn to_vecs(&self) -> Result<(Vec<f32>, Vec<Vec<u32>>)> {
        let scores = self.scores.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let paths = self.paths.to_vec2::<u32>()?;
        Ok((scores, paths))
    }

    pub fn scores_f64(&self) -> Result<Vec<f64>> {
        Ok(self.scores.to_dtype(DType::F64)?.to_vec1::<f64>()?)
    }
}

// -----------------------------------------------------------------------------

/// CRF output layer.
///
/// The trainable buffer is a [`Var`]; every recursion reads it through
/// [`TransitionConstraints::apply`], so the sentinel cells hold regardless
/// of what an optimizer writes.
pub struct CRF {
    constraints: TransitionConstraints,
    transitions: Var,
}

impl Display for CRF {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CRF(num_labels: {}, start: {}, stop: {})",
            self.num_labels(),
            self.start_label_id(),
            self.stop_label_id()
        )
    }
}

impl CRF {
    /// Create a new CRF with N(0, 1) transitions.
    pub fn new(
        num_labels: usize,
        start_label_id: usize,
        stop_label_id: usize,
        device: &Device,
    ) -> Result<Self> {
        Self::new_with_dtype(num_labels, start_label_id, stop_label_id, DType::F32, device)
    }

    pub fn new_with_dtype(
        num_labels: usize,
        start_label_id: usize,
        stop_label_id: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        check_dtype(dtype)?;
        let constraints =
            TransitionConstraints::new(num_labels, start_label_id, stop_label_id, device)?;
        let raw = Tensor::randn(0_f32, 1., (num_labels, num_labels), device)?.to_dtype(dtype)?;
        let transitions = Var::from_tensor(&constraints.apply(&raw)?)?;

        tracing::debug!(
            num_labels,
            start_label_id,
            stop_label_id,
            ?dtype,
            "initialized CRF transitions"
        );
        Ok(Self {
            constraints,
            transitions,
        })
    }

    /// Load or create the `transitions` parameter through `vb`.
    ///
    /// With a `VarMap` backed builder the buffer is registered there, so
    /// `varmap.all_vars()` hands it to an optimizer.
    pub fn load(
        num_labels: usize,
        start_label_id: usize,
        stop_label_id: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        check_dtype(vb.dtype())?;
        let constraints =
            TransitionConstraints::new(num_labels, start_label_id, stop_label_id, vb.device())?;
        let raw = vb.get_with_hints(
            (num_labels, num_labels),
            "transitions",
            Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
        )?;
        let crf = Self {
            constraints,
            transitions: Var::from_tensor(&raw)?,
        };
        crf.enforce_constraints()?;

        tracing::debug!(
            num_labels,
            start_label_id,
            stop_label_id,
            dtype = ?vb.dtype(),
            "loaded CRF transitions"
        );
        Ok(crf)
    }

    /// Build a CRF around a known `(num_labels, num_labels)` score matrix.
    pub fn from_transitions(
        transitions: &Tensor,
        start_label_id: usize,
        stop_label_id: usize,
    ) -> Result<Self> {
        check_dtype(transitions.dtype())?;
        let (rows, cols) = transitions.dims2()?;
        if rows != cols {
            return Err(Error::Shape(format!(
                "transitions must be square, got ({}, {})",
                rows, cols
            )));
        }
        let constraints =
            TransitionConstraints::new(rows, start_label_id, stop_label_id, transitions.device())?;
        let transitions = Var::from_tensor(&constraints.apply(transitions)?)?;
        Ok(Self {
            constraints,
            transitions,
        })
    }

    pub fn num_labels(&self) -> usize {
        self.constraints.num_labels()
    }

    pub fn start_label_id(&self) -> usize {
        self.constraints.start_label_id()
    }

    pub fn stop_label_id(&self) -> usize {
        self.constraints.stop_label_id()
    }

    pub fn dtype(&self) -> DType {
        self.transitions.dtype()
    }

    pub fn constraints(&self) -> &TransitionConstraints {
        &self.constraints
    }

    /// The trainable buffer, for optimizers.
    pub fn raw_transitions(&self) -> &Var {
        &self.transitions
    }

    /// Constrained transition matrix, `[to, from]`.
    pub fn transitions(&self) -> Result<Tensor> {
        self.constraints.apply(self.transitions.as_tensor())
    }

    /// Write the sentinel cells back into the buffer, e.g. after an optimizer
    /// step with weight decay moved them.
    pub fn enforce_constraints(&self) -> Result<()> {
        let constrained = self.transitions()?;
        self.transitions.set(&constrained)?;
        Ok(())
    }

    /// validate
    fn validate(&self, emissions: &Tensor, labels: Option<&Tensor>) -> Result<(usize, usize)> {
        {
            let dtype_transitions = self.transitions.dtype();
            let dtype_emissions = emissions.dtype();
            if dtype_transitions != dtype_emissions {
                return Err(Error::Shape(format!(
                    "emissions and CRF must have the same dtype, expected {:?}, got {:?}",
                    dtype_transitions, dtype_emissions
                )));
            }
        }

        {
            let dims = emissions.dims().len();
            if dims != 3 {
                return Err(Error::Shape(format!(
                    "emissions must have 3 dimensions, got {}",
                    dims
                )));
            }
        }

        let (batch_size, seq_length, num_labels) = emissions.dims3()?;

        if num_labels != self.num_labels() {
            return Err(Error::Shape(format!(
                "expected last dimension of emissions is {}, got {}",
                self.num_labels(),
                num_labels
            )));
        }

        if batch_size == 0 || seq_length == 0 {
            return Err(Error::Shape(format!(
                "emissions must hold at least one position, got ({}, {})",
                batch_size, seq_length
            )));
        }

        if let Some(labels) = labels {
            if !matches!(labels.dtype(), DType::U32 | DType::I64) {
                return Err(Error::Shape(format!(
                    "labels must be of type u32 or i64, got {:?}",
                    labels.dtype()
                )));
            }

            if labels.dims().len() != 2 {
                return Err(Error::Shape(format!(
                    "labels must have 2 dimensions, got {}",
                    labels.dims().len()
                )));
            }

            let (label_d1, label_d2) = labels.dims2()?;
            if (batch_size, seq_length) != (label_d1, label_d2) {
                return Err(Error::Shape(format!(
                    "the first two dimensions of emissions and labels must match, \
                     got ({}, {}) and ({}, {})",
                    batch_size, seq_length, label_d1, label_d2
                )));
            }

            let labels = labels.to_dtype(DType::I64)?;
            let lo = labels.min_all()?.to_scalar::<i64>()?;
            let hi = labels.max_all()?.to_scalar::<i64>()?;
            if lo < 0 || hi >= num_labels as i64 {
                return Err(Error::Shape(format!(
                    "labels must be in [0, {}), got {}",
                    num_labels,
                    if lo < 0 { lo } else { hi }
                )));
            }
        }

        Ok((batch_size, seq_length))
    }

    /// `(batch, 1, num_labels)` lattice with all mass on `start`.
    fn initial_lattice(&self, batch_size: usize, emissions: &Tensor) -> Result<Tensor> {
        let num_labels = self.num_labels();
        let mut init = vec![IMPOSSIBLE; num_labels];
        init[self.start_label_id()] = 0.;
        Ok(Tensor::new(init.as_slice(), emissions.device())?
            .to_dtype(emissions.dtype())?
            .reshape((1, 1, num_labels))?
            .broadcast_as((batch_size, 1, num_labels))?
            .contiguous()?)
    }

    /// Forward recursion, `(batch)` log partition values.
    fn compute_normalizer(&self, emissions: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_length, _) = emissions.dims3()?;
        let transitions = self.transitions()?.unsqueeze(0)?;

        let mut log_alpha = self.initial_lattice(batch_size, emissions)?;
        for t in 1..seq_length {
            // [b, to, from] = transitions[to, from] + log_alpha[b, from]
            let scores = transitions.broadcast_add(&log_alpha)?;
            log_alpha = log_sum_exp_batch(&scores)?
                .add(&emissions.i((.., t))?)?
                .unsqueeze(1)?;
        }

        Ok(log_sum_exp_batch(&log_alpha)?.squeeze(1)?)
    }

    /// Unnormalized score of the given label paths, `(batch)`.
    fn compute_score(&self, emissions: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_length, num_labels) = emissions.dims3()?;
        if seq_length == 1 {
            return Ok(Tensor::zeros(
                batch_size,
                emissions.dtype(),
                emissions.device(),
            )?);
        }
        let steps = seq_length - 1;

        let labels = labels.to_dtype(DType::I64)?;
        let from = labels.narrow(1, 0, steps)?;
        let to = labels.narrow(1, 1, steps)?.contiguous()?;

        let row_stride = Tensor::new(num_labels as i64, labels.device())?;
        let cells = to.broadcast_mul(&row_stride)?.add(&from)?.flatten_all()?;
        let transition_scores = self
            .transitions()?
            .flatten_all()?
            .index_select(&cells, 0)?
            .reshape((batch_size, steps))?;

        let emission_scores = emissions
            .narrow(1, 1, steps)?
            .contiguous()?
            .gather(&to.unsqueeze(2)?, 2)?
            .squeeze(2)?;

        Ok(transition_scores.add(&emission_scores)?.sum(1)?)
    }

    /// Max-product recursion with full backpointer history and trace-back.
    fn viterbi_decode(&self, emissions: &Tensor) -> Result<Viterbi> {
        let (batch_size, seq_length, num_labels) = emissions.dims3()?;
        let transitions = self.transitions()?.unsqueeze(0)?;

        let mut log_delta = self.initial_lattice(batch_size, emissions)?;
        let mut history = Vec::with_capacity(seq_length);
        history.push(Tensor::zeros(
            (batch_size, num_labels),
            DType::U32,
            emissions.device(),
        )?);

        for t in 1..seq_length {
            let scores = transitions.broadcast_add(&log_delta)?;
            let (best, indices) = max_indices(&scores, D::Minus1)?;
            history.push(indices);
            log_delta = best.add(&emissions.i((.., t))?)?.unsqueeze(1)?;
        }

        let (scores, last) = max_indices(&log_delta.squeeze(1)?, D::Minus1)?;

        let mut path = Vec::with_capacity(seq_length);
        path.push(last);
        for hist in history[1..].iter().rev() {
            let next = &path[path.len() - 1];
            let prev = gather(hist, next)?;
            path.push(prev);
        }
        path.reverse();

        Ok(Viterbi {
            scores,
            paths: Tensor::stack(&path, 1)?,
            backpointers: Tensor::stack(&history, 1)?,
        })
    }

    /// Log partition value per sequence, `(batch)`.
    pub fn forward_score(&self, emissions: &Tensor) -> Result<Tensor> {
        self.validate(emissions, None)?;
        self.compute_normalizer(emissions)
    }

    /// Unnormalized score of `labels` per sequence, `(batch)`.
    ///
    /// `labels[:, 0]` is expected to be the `start` label; it only enters the
    /// score through the first transition.
    pub fn gold_score(&self, emissions: &Tensor, labels: &Tensor) -> Result<Tensor> {
        self.validate(emissions, Some(labels))?;
        self.compute_score(emissions, labels)
    }

    /// Negative log-likelihood of `labels` under `emissions`.
    pub fn neg_log_likelihood(
        &self,
        emissions: &Tensor,
        labels: &Tensor,
        reduction: Reduction,
    ) -> Result<Tensor> {
        let (batch_size, seq_length) = self.validate(emissions, Some(labels))?;
        tracing::trace!(batch_size, seq_length, ?reduction, "crf negative log-likelihood");

        let forward_score = self.compute_normalizer(emissions)?;
        let gold_score = self.compute_score(emissions, labels)?;
        let nll = forward_score.sub(&gold_score)?;

        Ok(match reduction {
            Reduction::None => nll,
            Reduction::Sum => nll.sum_all()?,
            Reduction::Mean => nll.mean_all()?,
            Reduction::LengthMean => (nll.mean_all()? / seq_length as f64)?,
        })
    }

    /// Best label path per sequence. Ties go to the lowest label index.
    pub fn decode(&self, emissions: &Tensor) -> Result<Viterbi> {
        let (batch_size, seq_length) = self.validate(emissions, None)?;
        tracing::trace!(batch_size, seq_length, "crf viterbi decode");
        self.viterbi_decode(emissions)
    }
}

// -----------------------------------------------------------------------------
