use anyhow::Result;
use candle_bert_crf::{BertCrfTagger, CrfConfig, Encoder, Error};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Embedding, Module, Optimizer, VarBuilder, VarMap};

const VOCAB: usize = 7;
const HIDDEN: usize = 8;
const NUM_LABELS: usize = 5;
const START: usize = 3;
const STOP: usize = 4;

/// Looks tokens up in a trainable table and zeroes padded positions.
struct EmbeddingEncoder {
    embedding: Embedding,
}

impl EmbeddingEncoder {
    fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        let embedding = candle_nn::embedding(VOCAB, HIDDEN, vb.pp("embeddings"))?;
        Ok(Self { embedding })
    }
}

impl Encoder for EmbeddingEncoder {
    fn hidden_size(&self) -> usize {
        HIDDEN
    }

    fn encode(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        _train: bool,
    ) -> candle_bert_crf::Result<Tensor> {
        let hidden = self.embedding.forward(input_ids)?;
        let mask = attention_mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
        Ok(hidden.broadcast_mul(&mask)?)
    }
}

/// Token 0 opens every sequence; token `t > 0` carries label `t % 3`.
fn batch(device: &Device) -> Result<(Tensor, Tensor, Tensor)> {
    let ids: [[u32; 5]; 4] = [
        [0, 1, 2, 3, 4],
        [0, 5, 6, 1, 2],
        [0, 3, 3, 6, 5],
        [0, 4, 1, 5, 6],
    ];
    let labels: Vec<u32> = ids
        .iter()
        .flatten()
        .map(|&t| if t == 0 { START as u32 } else { t % 3 })
        .collect();
    let input_ids = Tensor::new(&ids, device)?;
    let mask = input_ids.ones_like()?;
    let labels = Tensor::from_vec(labels, (4, 5), device)?;
    Ok((input_ids, mask, labels))
}

fn build(
    varmap: &VarMap,
    config: CrfConfig,
    device: &Device,
) -> Result<BertCrfTagger<EmbeddingEncoder>> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
    let encoder = EmbeddingEncoder::new(vb.pp("encoder"))?;
    Ok(BertCrfTagger::new(encoder, config, vb.pp("tagger"))?)
}

#[test]
fn training_lowers_loss_and_recovers_labels() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let config = CrfConfig::new(NUM_LABELS, START, STOP, HIDDEN).with_dropout(0.0);
    let tagger = build(&varmap, config, &device)?;
    let (input_ids, mask, labels) = batch(&device)?;

    let mut opt = AdamW::new_lr(varmap.all_vars(), 0.05)?;
    let initial = tagger
        .neg_log_likelihood(&input_ids, &mask, &labels)?
        .to_scalar::<f32>()?;
    let mut last = initial;
    for _ in 0..200 {
        let loss = tagger.neg_log_likelihood(&input_ids, &mask, &labels)?;
        opt.backward_step(&loss)?;
        last = loss.to_scalar::<f32>()?;
    }
    assert!(last < initial * 0.5, "loss went from {} to {}", initial, last);

    let crf = tagger.crf();
    assert!(crf.constraints().is_satisfied_by(&crf.transitions()?)?);
    // weight decay moves the stored sentinels, the constrained view does not
    crf.enforce_constraints()?;
    assert!(crf.constraints().is_satisfied_by(crf.raw_transitions())?);

    let (_, paths) = tagger.decode(&input_ids, &mask)?.to_vecs()?;
    assert_eq!(paths, labels.to_vec2::<u32>()?);
    Ok(())
}

#[test]
fn decode_is_idempotent() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let tagger = build(&varmap, CrfConfig::new(NUM_LABELS, START, STOP, HIDDEN), &device)?;
    let (input_ids, mask, _) = batch(&device)?;

    let first = tagger.decode(&input_ids, &mask)?;
    let second = tagger.decode(&input_ids, &mask)?;
    assert_eq!(first.to_vecs()?, second.to_vecs()?);
    assert_eq!(first.paths.dims2()?, (4, 5));
    assert_eq!(first.backpointers.dims3()?, (4, 5, NUM_LABELS));
    Ok(())
}

#[test]
fn loss_is_a_nonnegative_scalar() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let tagger = build(&varmap, CrfConfig::new(NUM_LABELS, START, STOP, HIDDEN), &device)?;
    let (input_ids, mask, labels) = batch(&device)?;

    let loss = tagger.neg_log_likelihood(&input_ids, &mask, &labels)?;
    assert_eq!(loss.rank(), 0);
    assert!(loss.to_scalar::<f32>()? >= 0.);

    let grads = loss.backward()?;
    assert!(grads.get(tagger.crf().raw_transitions()).is_some());
    Ok(())
}

#[test]
fn rejects_mismatched_hidden_size() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let result = build(&varmap, CrfConfig::new(NUM_LABELS, START, STOP, HIDDEN + 1), &device);
    let err = result.err().expect("hidden size mismatch is rejected");
    assert_eq!(
        err.downcast_ref::<Error>().map(|e| e.to_string()),
        Some("invalid config: encoder hidden size is 8, config expects 9".to_string())
    );
    Ok(())
}

#[test]
fn rejects_mismatched_mask() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let tagger = build(&varmap, CrfConfig::new(NUM_LABELS, START, STOP, HIDDEN), &device)?;
    let (input_ids, _, _) = batch(&device)?;
    let mask = Tensor::ones((4, 3), DType::U32, &device)?;
    assert!(matches!(
        tagger.decode(&input_ids, &mask),
        Err(Error::Shape(_))
    ));
    Ok(())
}
