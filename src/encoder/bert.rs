//! BERT sequence classifier
//!
//! Layout follows the Hugging Face `BertForSequenceClassification` naming
//! (`bert.embeddings.*`, `bert.encoder.layer.N.*`, `bert.pooler.dense.*`,
//! `classifier.*`) so pretrained checkpoints load by name. Every operation
//! is composed from differentiable tensor ops so the whole encoder trains.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{Dropout, Embedding, Init, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{SequenceClassifier, TokenBatch};
use crate::error::{Error, Result};

const INIT_STDEV: f64 = 0.02;
const MASKED_SCORE: f64 = -10_000.0;

/// Feed-forward activation named by `hidden_act`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenAct {
    /// Exact erf GELU
    Gelu,
    /// Tanh approximation
    #[serde(alias = "gelu_new", alias = "gelu_pytorch_tanh")]
    GeluApproximate,
    /// Rectified linear unit
    Relu,
}

impl HiddenAct {
    fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(match self {
            HiddenAct::Gelu => xs.gelu_erf()?,
            HiddenAct::GeluApproximate => xs.gelu()?,
            HiddenAct::Relu => xs.relu()?,
        })
    }
}

fn default_attention_dropout() -> f32 {
    0.1
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_hidden_act() -> HiddenAct {
    HiddenAct::Gelu
}

/// Encoder configuration read from a model's `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Rows of the word embedding table
    pub vocab_size: usize,
    /// Model width
    pub hidden_size: usize,
    /// Transformer layers
    pub num_hidden_layers: usize,
    /// Attention heads per layer
    pub num_attention_heads: usize,
    /// Feed-forward width
    pub intermediate_size: usize,
    /// Feed-forward activation
    #[serde(default = "default_hidden_act")]
    pub hidden_act: HiddenAct,
    /// Dropout on embeddings and sublayer outputs
    #[serde(default = "default_attention_dropout")]
    pub hidden_dropout_prob: f32,
    /// Dropout on attention probabilities
    #[serde(default = "default_attention_dropout")]
    pub attention_probs_dropout_prob: f32,
    /// Longest supported sequence
    pub max_position_embeddings: usize,
    /// Number of segment types
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    /// Layer normalization epsilon
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_type_vocab_size() -> usize {
    2
}

impl EncoderConfig {
    /// Parse a `config.json` document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read `config.json` from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::model(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::model(format!(
                "hidden_size {} is not divisible by {} attention heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_hidden_layers == 0 {
            return Err(Error::model("encoder needs at least one layer"));
        }
        Ok(())
    }

    /// Width of a single attention head
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Linear layer over f32 master weights, evaluated in the compute dtype.
/// Initialised like BERT: N(0, 0.02) weights, zero bias.
struct Dense {
    weight: Tensor,
    bias: Tensor,
    dtype: DType,
}

impl Dense {
    fn new(in_dim: usize, out_dim: usize, dtype: DType, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_dim, in_dim),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: INIT_STDEV,
            },
        )?;
        let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight,
            bias,
            dtype,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // same-dtype casts return the variable itself
        let linear = Linear::new(
            self.weight.to_dtype(self.dtype)?,
            Some(self.bias.to_dtype(self.dtype)?),
        );
        Ok(linear.forward(xs)?)
    }
}

fn embedding(rows: usize, dim: usize, vb: VarBuilder) -> Result<Embedding> {
    let weight = vb.get_with_hints(
        (rows, dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: INIT_STDEV,
        },
    )?;
    Ok(Embedding::new(weight, dim))
}

/// Layer normalization over the last dimension, computed in f32 and
/// returned in the input dtype
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get_with_hints(size, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(size, "bias", Init::Const(0.0))?,
            eps,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = variance.affine(1.0, self.eps)?.sqrt()?;
        Ok(centered
            .broadcast_div(&std)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?
            .to_dtype(dtype)?)
    }
}

struct Embeddings {
    word: Embedding,
    position: Embedding,
    token_type: Embedding,
    layer_norm: LayerNorm,
    dropout: Dropout,
    max_positions: usize,
    dtype: DType,
}

impl Embeddings {
    fn new(config: &EncoderConfig, dtype: DType, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            word: embedding(config.vocab_size, hidden, vb.pp("word_embeddings"))?,
            position: embedding(
                config.max_position_embeddings,
                hidden,
                vb.pp("position_embeddings"),
            )?,
            token_type: embedding(config.type_vocab_size, hidden, vb.pp("token_type_embeddings"))?,
            layer_norm: LayerNorm::new(hidden, config.layer_norm_eps, vb.pp("LayerNorm"))?,
            dropout: Dropout::new(config.hidden_dropout_prob),
            max_positions: config.max_position_embeddings,
            dtype,
        })
    }

    fn forward(&self, input_ids: &Tensor, token_type_ids: &Tensor, train: bool) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        if seq_len > self.max_positions {
            return Err(Error::model(format!(
                "sequence length {} exceeds {} position embeddings",
                seq_len, self.max_positions
            )));
        }

        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let positions = self.position.forward(&position_ids)?.unsqueeze(0)?;
        let xs = self
            .word
            .forward(input_ids)?
            .add(&self.token_type.forward(token_type_ids)?)?
            .broadcast_add(&positions)?;
        let xs = self.layer_norm.forward(&xs)?.to_dtype(self.dtype)?;
        Ok(self.dropout.forward(&xs, train)?)
    }
}

struct SelfAttention {
    query: Dense,
    key: Dense,
    value: Dense,
    output: Dense,
    layer_norm: LayerNorm,
    attention_dropout: Dropout,
    hidden_dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn new(config: &EncoderConfig, dtype: DType, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let projections = vb.pp("self");
        Ok(Self {
            query: Dense::new(hidden, hidden, dtype, projections.pp("query"))?,
            key: Dense::new(hidden, hidden, dtype, projections.pp("key"))?,
            value: Dense::new(hidden, hidden, dtype, projections.pp("value"))?,
            output: Dense::new(hidden, hidden, dtype, vb.pp("output.dense"))?,
            layer_norm: LayerNorm::new(hidden, config.layer_norm_eps, vb.pp("output.LayerNorm"))?,
            attention_dropout: Dropout::new(config.attention_probs_dropout_prob),
            hidden_dropout: Dropout::new(config.hidden_dropout_prob),
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    /// `[batch, seq, hidden]` -> `[batch, heads, seq, head_dim]`
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = xs.dims3()?;
        Ok(xs
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn forward(&self, xs: &Tensor, mask_bias: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, seq_len, hidden) = xs.dims3()?;
        let q = self.split_heads(&self.query.forward(xs)?)?;
        let k = self.split_heads(&self.key.forward(xs)?)?;
        let v = self.split_heads(&self.value.forward(xs)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q
            .matmul(&k.transpose(2, 3)?.contiguous()?)?
            .affine(scale, 0.0)?
            .to_dtype(DType::F32)?
            .broadcast_add(mask_bias)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(xs.dtype())?;
        let probs = self.attention_dropout.forward(&probs, train)?;

        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, hidden))?;
        let projected = self.output.forward(&context)?;
        let projected = self.hidden_dropout.forward(&projected, train)?;
        self.layer_norm.forward(&projected.add(xs)?)
    }
}

struct EncoderLayer {
    attention: SelfAttention,
    intermediate: Dense,
    output: Dense,
    layer_norm: LayerNorm,
    dropout: Dropout,
    activation: HiddenAct,
}

impl EncoderLayer {
    fn new(config: &EncoderConfig, dtype: DType, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            attention: SelfAttention::new(config, dtype, vb.pp("attention"))?,
            intermediate: Dense::new(
                hidden,
                config.intermediate_size,
                dtype,
                vb.pp("intermediate.dense"),
            )?,
            output: Dense::new(config.intermediate_size, hidden, dtype, vb.pp("output.dense"))?,
            layer_norm: LayerNorm::new(hidden, config.layer_norm_eps, vb.pp("output.LayerNorm"))?,
            dropout: Dropout::new(config.hidden_dropout_prob),
            activation: config.hidden_act,
        })
    }

    fn forward(&self, xs: &Tensor, mask_bias: &Tensor, train: bool) -> Result<Tensor> {
        let attended = self.attention.forward(xs, mask_bias, train)?;
        let inner = self
            .activation
            .apply(&self.intermediate.forward(&attended)?)?;
        let out = self.dropout.forward(&self.output.forward(&inner)?, train)?;
        self.layer_norm.forward(&out.add(&attended)?)
    }
}

/// Embeddings followed by the transformer stack
pub struct BertEncoder {
    embeddings: Embeddings,
    layers: Vec<EncoderLayer>,
}

impl BertEncoder {
    /// Register parameters under `vb` (normally the `bert` prefix); `dtype`
    /// is the compute dtype, parameters keep the dtype of `vb`
    pub fn new(config: &EncoderConfig, dtype: DType, vb: VarBuilder) -> Result<Self> {
        let embeddings = Embeddings::new(config, dtype, vb.pp("embeddings"))?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| EncoderLayer::new(config, dtype, vb.pp(format!("encoder.layer.{}", i))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { embeddings, layers })
    }

    /// Hidden states `[batch, seq, hidden]`
    pub fn forward(&self, batch: &TokenBatch, train: bool) -> Result<Tensor> {
        let (rows, seq_len) = batch.input_ids.dims2()?;
        // 0 where attended, large negative where padded; [batch, 1, 1, seq]
        let mask_bias = batch
            .attention_mask
            .to_dtype(DType::F32)?
            .affine(-MASKED_SCORE, MASKED_SCORE)?
            .reshape((rows, 1, 1, seq_len))?;

        let mut xs = self
            .embeddings
            .forward(&batch.input_ids, &batch.token_type_ids, train)?;
        for layer in &self.layers {
            xs = layer.forward(&xs, &mask_bias, train)?;
        }
        Ok(xs)
    }
}

/// Pretrained encoder with a pooler, dropout and a resized linear head
pub struct BertClassifier {
    encoder: BertEncoder,
    pooler: Dense,
    dropout: Dropout,
    classifier: Dense,
    num_classes: usize,
}

impl BertClassifier {
    /// Build the network, registering every parameter in `vb` and running
    /// the forward pass in `dtype`
    pub fn new(
        vb: VarBuilder,
        config: &EncoderConfig,
        num_classes: usize,
        drop_rate: f32,
        dtype: DType,
    ) -> Result<Self> {
        let encoder = BertEncoder::new(config, dtype, vb.pp("bert"))?;
        let pooler = Dense::new(
            config.hidden_size,
            config.hidden_size,
            dtype,
            vb.pp("bert.pooler.dense"),
        )?;
        let classifier = Dense::new(config.hidden_size, num_classes, dtype, vb.pp("classifier"))?;

        debug!(
            "BertClassifier: layers={}, hidden={}, classes={}, dropout={}",
            config.num_hidden_layers, config.hidden_size, num_classes, drop_rate
        );

        Ok(Self {
            encoder,
            pooler,
            dropout: Dropout::new(drop_rate),
            classifier,
            num_classes,
        })
    }
}

impl SequenceClassifier for BertClassifier {
    fn forward(&self, batch: &TokenBatch, train: bool) -> Result<Tensor> {
        let hidden = self.encoder.forward(batch, train)?;
        // [CLS] position
        let cls = hidden.i((.., 0))?;
        let pooled = self.pooler.forward(&cls)?.tanh()?;
        let pooled = self.dropout.forward(&pooled, train)?;
        self.classifier.forward(&pooled)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// Outcome of copying checkpoint tensors into a `VarMap`
#[derive(Debug, Clone, Default)]
pub struct WeightLoadReport {
    /// Parameters overwritten from the checkpoint
    pub loaded: Vec<String>,
    /// Parameters absent from the checkpoint (kept at initialisation)
    pub missing: Vec<String>,
    /// Parameters present with a different shape (kept at initialisation)
    pub mismatched: Vec<String>,
}

/// Locate the weights file of a pretrained model directory
pub fn find_weights_file(model_dir: &Path) -> Result<PathBuf> {
    for name in ["model.safetensors", "pytorch_model.bin"] {
        let candidate = model_dir.join(name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::model(format!(
        "no model.safetensors or pytorch_model.bin in {}",
        model_dir.display()
    )))
}

/// Read every tensor of a `.safetensors` or PyTorch pickle file
pub fn read_tensors(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let is_safetensors = path
        .extension()
        .map(|ext| ext == "safetensors")
        .unwrap_or(false);

    if is_safetensors {
        Ok(candle_core::safetensors::load(path, device)?)
    } else {
        let tensors = candle_core::pickle::read_all(path)?;
        tensors
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
            .collect()
    }
}

/// Canonical parameter name: legacy LayerNorm `gamma`/`beta` become
/// `weight`/`bias`, and bare encoder names gain the `bert.` prefix.
fn canonical_name(name: &str) -> String {
    let name = if let Some(stem) = name.strip_suffix(".gamma") {
        format!("{}.weight", stem)
    } else if let Some(stem) = name.strip_suffix(".beta") {
        format!("{}.bias", stem)
    } else {
        name.to_string()
    };

    let bare = ["embeddings.", "encoder.", "pooler."];
    if bare.iter().any(|prefix| name.starts_with(prefix)) {
        format!("bert.{}", name)
    } else {
        name
    }
}

/// Overwrite variables in `var_map` with same-named, same-shaped tensors.
/// Values are cast to each variable's dtype.
pub fn assign_weights(
    var_map: &VarMap,
    tensors: HashMap<String, Tensor>,
) -> Result<WeightLoadReport> {
    let tensors: HashMap<String, Tensor> = tensors
        .into_iter()
        .map(|(name, tensor)| (canonical_name(&name), tensor))
        .collect();

    let vars = var_map
        .data()
        .lock()
        .map_err(|_| Error::model("variable map lock poisoned"))?;

    let mut report = WeightLoadReport::default();
    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();

    for name in names {
        let var = &vars[name];
        match tensors.get(name) {
            Some(tensor) if tensor.dims() == var.dims() => {
                let value = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
                var.set(&value)?;
                report.loaded.push(name.clone());
            }
            Some(tensor) => {
                debug!(
                    "Shape mismatch for {}: checkpoint {:?}, model {:?}",
                    name,
                    tensor.dims(),
                    var.dims()
                );
                report.mismatched.push(name.clone());
            }
            None => report.missing.push(name.clone()),
        }
    }

    Ok(report)
}

/// Load pretrained encoder weights into `var_map`; the classifier head is
/// expected to stay at its fresh initialisation.
pub fn load_pretrained(var_map: &VarMap, model_dir: &Path, device: &Device) -> Result<WeightLoadReport> {
    let weights = find_weights_file(model_dir)?;
    info!("Loading pretrained weights from {}", weights.display());

    let report = assign_weights(var_map, read_tensors(&weights, device)?)?;
    if report.loaded.is_empty() {
        return Err(Error::model(format!(
            "no parameters in {} match the encoder layout",
            weights.display()
        )));
    }

    let encoder_missing: Vec<&String> = report
        .missing
        .iter()
        .filter(|name| name.starts_with("bert."))
        .collect();
    if !encoder_missing.is_empty() {
        warn!(
            "{} encoder parameters not found in checkpoint, first: {}",
            encoder_missing.len(),
            encoder_missing[0]
        );
    }
    info!(
        "Loaded {} tensors ({} newly initialised, {} resized)",
        report.loaded.len(),
        report.missing.len(),
        report.mismatched.len()
    );

    Ok(report)
}

/// Build a classifier with freshly initialised f32 parameters in `var_map`.
/// The forward pass runs in `dtype`, so half precision keeps f32 master
/// weights for the optimizer.
pub fn build_classifier(
    var_map: &VarMap,
    config: &EncoderConfig,
    num_classes: usize,
    drop_rate: f32,
    dtype: DType,
    device: &Device,
) -> Result<BertClassifier> {
    let vb = VarBuilder::from_varmap(var_map, DType::F32, device);
    BertClassifier::new(vb, config, num_classes, drop_rate, dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_name() {
        assert_eq!(
            canonical_name("bert.embeddings.LayerNorm.gamma"),
            "bert.embeddings.LayerNorm.weight"
        );
        assert_eq!(
            canonical_name("encoder.layer.0.output.LayerNorm.beta"),
            "bert.encoder.layer.0.output.LayerNorm.bias"
        );
        assert_eq!(canonical_name("classifier.weight"), "classifier.weight");
    }

    #[test]
    fn test_find_weights_file_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(find_weights_file(dir.path()).is_err());
    }

    fn tiny_config() -> EncoderConfig {
        EncoderConfig::from_json_str(
            r#"{
                "vocab_size": 16,
                "hidden_size": 8,
                "num_hidden_layers": 1,
                "num_attention_heads": 2,
                "intermediate_size": 16,
                "hidden_act": "gelu",
                "max_position_embeddings": 8,
                "type_vocab_size": 2
            }"#,
        )
        .unwrap()
    }

    fn batch(ids: &[u32], mask: &[u32]) -> TokenBatch {
        let shape = (1, ids.len());
        TokenBatch {
            input_ids: Tensor::from_vec(ids.to_vec(), shape, &Device::Cpu).unwrap(),
            token_type_ids: Tensor::zeros(shape, DType::U32, &Device::Cpu).unwrap(),
            attention_mask: Tensor::from_vec(mask.to_vec(), shape, &Device::Cpu).unwrap(),
        }
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = tiny_config();
        assert_eq!(config.head_dim(), 4);
        assert_eq!(config.layer_norm_eps, 1e-12);
        assert_eq!(config.hidden_act, HiddenAct::Gelu);

        let bad = r#"{"vocab_size": 4, "hidden_size": 9, "num_hidden_layers": 1,
            "num_attention_heads": 2, "intermediate_size": 4, "max_position_embeddings": 4}"#;
        assert!(EncoderConfig::from_json_str(bad).is_err());
    }

    #[test]
    fn test_layer_norm_normalizes_last_dim() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let norm = LayerNorm::new(4, 1e-12, vb).unwrap();
        let xs = Tensor::new(&[[1f32, 2., 3., 4.]], &Device::Cpu).unwrap();

        let out: Vec<f32> = norm.forward(&xs).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        let var: f32 = out.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_classifier_parameter_names() {
        let var_map = VarMap::new();
        build_classifier(&var_map, &tiny_config(), 3, 0.1, DType::F32, &Device::Cpu).unwrap();
        let vars = var_map.data().lock().unwrap();

        for name in [
            "bert.embeddings.word_embeddings.weight",
            "bert.embeddings.LayerNorm.weight",
            "bert.encoder.layer.0.attention.self.query.weight",
            "bert.encoder.layer.0.attention.output.LayerNorm.bias",
            "bert.encoder.layer.0.intermediate.dense.weight",
            "bert.encoder.layer.0.output.dense.bias",
            "bert.pooler.dense.weight",
            "classifier.weight",
        ] {
            assert!(vars.contains_key(name), "missing {}", name);
        }
        assert_eq!(vars["classifier.weight"].dims(), &[3, 8]);
    }

    #[test]
    fn test_padding_does_not_change_logits() {
        let var_map = VarMap::new();
        let model = build_classifier(&var_map, &tiny_config(), 3, 0.0, DType::F32, &Device::Cpu).unwrap();

        let a = model.forward(&batch(&[2, 5, 3, 0], &[1, 1, 1, 0]), false).unwrap();
        let b = model.forward(&batch(&[2, 5, 3, 9], &[1, 1, 1, 0]), false).unwrap();

        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_gradients_reach_every_parameter() {
        let var_map = VarMap::new();
        let model = build_classifier(&var_map, &tiny_config(), 3, 0.1, DType::F32, &Device::Cpu).unwrap();

        let logits = model.forward(&batch(&[2, 5, 6, 3], &[1, 1, 1, 1]), true).unwrap();
        let grads = logits.sqr().unwrap().sum_all().unwrap().backward().unwrap();

        let vars = var_map.data().lock().unwrap();
        for name in [
            "bert.embeddings.LayerNorm.weight",
            "bert.encoder.layer.0.attention.self.key.weight",
            "bert.encoder.layer.0.output.LayerNorm.weight",
            "bert.pooler.dense.weight",
        ] {
            assert!(grads.get(vars[name].as_tensor()).is_some(), "no gradient for {}", name);
        }
    }

    #[test]
    fn test_half_precision_step_keeps_f32_weights_finite() {
        use crate::training::optimizers::{build_adamw, AdamWConfig};
        use candle_nn::Optimizer;

        let var_map = VarMap::new();
        let model = build_classifier(&var_map, &tiny_config(), 3, 0.0, DType::F16, &Device::Cpu).unwrap();
        assert!(var_map.all_vars().iter().all(|var| var.dtype() == DType::F32));

        let table = "bert.embeddings.word_embeddings.weight";
        let before: Vec<Vec<f32>> = var_map.data().lock().unwrap()[table].to_vec2().unwrap();

        let config = AdamWConfig {
            learning_rate: 8e-7,
            ..AdamWConfig::default()
        };
        let mut optimizer = build_adamw(&var_map, &config).unwrap();

        // rows other than 2, 5, 6 and 3 get exactly-zero gradients
        let logits = model.forward(&batch(&[2, 5, 6, 3], &[1, 1, 1, 1]), false).unwrap();
        assert_eq!(logits.dtype(), DType::F16);
        let loss = logits.to_dtype(DType::F32).unwrap().sqr().unwrap().sum_all().unwrap();
        optimizer.backward_step(&loss).unwrap();

        let vars = var_map.data().lock().unwrap();
        for (name, var) in vars.iter() {
            let values: Vec<f32> = var.flatten_all().unwrap().to_vec1().unwrap();
            assert!(values.iter().all(|v| v.is_finite()), "non-finite values in {}", name);
        }

        let after: Vec<Vec<f32>> = vars[table].to_vec2().unwrap();
        assert_ne!(after[5], before[5], "looked-up row did not move");
        for (row, (a, b)) in after.iter().zip(&before).enumerate() {
            if ![2, 3, 5, 6].contains(&row) {
                for (x, y) in a.iter().zip(b) {
                    assert!((x - y).abs() < 1e-6, "unused row {} drifted", row);
                }
            }
        }
    }
}
