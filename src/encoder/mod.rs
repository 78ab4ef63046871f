//! Text encoding: fixed-width tokenization and the pretrained BERT encoder

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

mod bert;
mod tokenizer;

pub use bert::{
    assign_weights, build_classifier, find_weights_file, load_pretrained, read_tensors,
    BertClassifier, BertEncoder, EncoderConfig, HiddenAct, WeightLoadReport,
};
pub use tokenizer::{TextTokenizer, TokenizedInput};

/// A batch of tokenized texts, each tensor shaped `[batch, seq_len]`
#[derive(Debug, Clone)]
pub struct TokenBatch {
    /// WordPiece ids
    pub input_ids: Tensor,
    /// Segment ids, all zero for single texts
    pub token_type_ids: Tensor,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Tensor,
}

impl TokenBatch {
    /// Stack equal-length tokenized inputs into `u32` tensors
    pub fn from_inputs(inputs: &[TokenizedInput], device: &Device) -> Result<Self> {
        let seq_len = inputs
            .first()
            .map(|input| input.len())
            .ok_or_else(|| Error::data("cannot build an empty token batch"))?;
        if inputs.iter().any(|input| input.len() != seq_len) {
            return Err(Error::data("token batch rows differ in length"));
        }

        let shape = (inputs.len(), seq_len);
        let flatten = |field: fn(&TokenizedInput) -> &Vec<u32>| -> Vec<u32> {
            inputs.iter().flat_map(|input| field(input).iter().copied()).collect()
        };

        Ok(Self {
            input_ids: Tensor::from_vec(flatten(|i| &i.input_ids), shape, device)?,
            token_type_ids: Tensor::from_vec(flatten(|i| &i.token_type_ids), shape, device)?,
            attention_mask: Tensor::from_vec(flatten(|i| &i.attention_mask), shape, device)?,
        })
    }

    /// Number of rows
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }
}

/// A network mapping token batches to class logits `[batch, num_classes]`
pub trait SequenceClassifier: Send + Sync {
    /// Compute raw logits; `train` enables dropout
    fn forward(&self, batch: &TokenBatch, train: bool) -> Result<Tensor>;

    /// Number of output classes
    fn num_classes(&self) -> usize;
}
