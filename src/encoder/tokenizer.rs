//! Fixed-width WordPiece tokenization

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde_json::json;
use tokenizers::{
    Encoding, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams, TruncationStrategy,
};
use tracing::{debug, info};

use crate::error::{Error, Result};

const SPECIAL_TOKENS: [&str; 5] = ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]"];

/// Token IDs, segment IDs and attention mask for one text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedInput {
    /// WordPiece ids
    pub input_ids: Vec<u32>,
    /// Segment ids
    pub token_type_ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Vec<u32>,
}

impl TokenizedInput {
    /// Create from encoding
    pub fn from_encoding(encoding: &Encoding) -> Self {
        Self {
            input_ids: encoding.get_ids().to_vec(),
            token_type_ids: encoding.get_type_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        }
    }

    /// Sequence length
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Whether the sequence is empty
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// BERT tokenizer that always produces sequences of exactly `max_length`
/// tokens: longest-first truncation, right padding with `[PAD]`.
#[derive(Clone)]
pub struct TextTokenizer {
    tokenizer: Tokenizer,
    max_length: usize,
}

impl TextTokenizer {
    /// Load from a model directory holding `tokenizer.json` or `vocab.txt`
    pub fn from_model_dir(dir: impl AsRef<Path>, max_length: usize) -> Result<Self> {
        let dir = dir.as_ref();
        let tokenizer_json = dir.join("tokenizer.json");
        let vocab_txt = dir.join("vocab.txt");

        let tokenizer = if tokenizer_json.exists() {
            info!("Loading tokenizer from {}", tokenizer_json.display());
            Tokenizer::from_file(&tokenizer_json)
                .map_err(|e| Error::tokenizer(format!("failed to load tokenizer: {}", e)))?
        } else if vocab_txt.exists() {
            info!("Building WordPiece tokenizer from {}", vocab_txt.display());
            let content = std::fs::read_to_string(&vocab_txt)?;
            let vocab: Vec<String> = content.lines().map(|l| l.trim_end().to_string()).collect();
            build_wordpiece(&vocab)?
        } else {
            return Err(Error::tokenizer(format!(
                "no tokenizer.json or vocab.txt in {}",
                dir.display()
            )));
        };

        Self::from_tokenizer(tokenizer, max_length)
    }

    /// Build from an in-memory vocabulary; line order defines token ids
    pub fn from_vocab(vocab: &[String], max_length: usize) -> Result<Self> {
        Self::from_tokenizer(build_wordpiece(vocab)?, max_length)
    }

    /// Wrap an existing tokenizer, overriding its truncation and padding
    pub fn from_tokenizer(mut tokenizer: Tokenizer, max_length: usize) -> Result<Self> {
        if max_length < 2 {
            return Err(Error::tokenizer("max_length must leave room for [CLS] and [SEP]"));
        }

        let pad_id = tokenizer.token_to_id("[PAD]").unwrap_or(0);

        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                strategy: TruncationStrategy::LongestFirst,
                ..Default::default()
            }))
            .map_err(|e| Error::tokenizer(format!("invalid truncation: {}", e)))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::Fixed(max_length),
            pad_id,
            pad_token: "[PAD]".to_string(),
            ..Default::default()
        }));

        debug!("Tokenizer ready: max_length={}, pad_id={}", max_length, pad_id);
        Ok(Self {
            tokenizer,
            max_length,
        })
    }

    /// Encode a single text with special tokens
    pub fn encode(&self, text: &str) -> Result<TokenizedInput> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| Error::tokenizer(format!("encoding failed: {}", e)))?;
        Ok(TokenizedInput::from_encoding(&encoding))
    }

    /// Configured output length
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Vocabulary size including added tokens
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Look up a token id
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }
}

/// Assemble a BERT WordPiece pipeline (normalizer, pre-tokenizer, model,
/// `[CLS] … [SEP]` post-processor) from a vocabulary list.
fn build_wordpiece(vocab: &[String]) -> Result<Tokenizer> {
    let mut ids = BTreeMap::new();
    for (id, token) in vocab.iter().enumerate() {
        if token.is_empty() {
            continue;
        }
        ids.entry(token.clone()).or_insert(id as u32);
    }

    let lookup = |token: &str| {
        ids.get(token)
            .copied()
            .ok_or_else(|| Error::tokenizer(format!("vocabulary is missing {}", token)))
    };
    let cls_id = lookup("[CLS]")?;
    let sep_id = lookup("[SEP]")?;
    lookup("[UNK]")?;

    let added_tokens: Vec<_> = SPECIAL_TOKENS
        .iter()
        .filter_map(|token| {
            ids.get(*token).map(|id| {
                json!({
                    "id": id,
                    "content": token,
                    "single_word": false,
                    "lstrip": false,
                    "rstrip": false,
                    "normalized": false,
                    "special": true
                })
            })
        })
        .collect();

    let spec = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": {
            "type": "BertNormalizer",
            "clean_text": true,
            "handle_chinese_chars": true,
            "strip_accents": null,
            "lowercase": true
        },
        "pre_tokenizer": { "type": "BertPreTokenizer" },
        "post_processor": {
            "type": "BertProcessing",
            "sep": ["[SEP]", sep_id],
            "cls": ["[CLS]", cls_id]
        },
        "decoder": { "type": "WordPiece", "prefix": "##", "cleanup": true },
        "model": {
            "type": "WordPiece",
            "unk_token": "[UNK]",
            "continuing_subword_prefix": "##",
            "max_input_chars_per_word": 100,
            "vocab": ids
        }
    });

    Tokenizer::from_str(&spec.to_string())
        .map_err(|e| Error::tokenizer(format!("failed to build WordPiece tokenizer: {}", e)))
}
