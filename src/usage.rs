use serde::Serialize;
use tiktoken_rs::CoreBPE;
use tiktoken_rs::tokenizer::{Tokenizer, get_tokenizer};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub source: UsageSource,
}

impl Usage {
    pub fn reported(prompt_tokens: u64, completion_tokens: u64, total_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            source: UsageSource::Reported,
        }
    }

    pub fn is_estimated(&self) -> bool {
        self.source == UsageSource::Estimated
    }
}

/// Where the completion count came from. Billing treats `Estimated` as approximate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    #[default]
    Reported,
    Estimated,
}

impl UsageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reported => "reported",
            Self::Estimated => "estimated",
        }
    }
}

/// Counts tokens in `text` as `model` would. Must be pure for a given input.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str, model: &str) -> u64;
}

impl<F> TokenEstimator for F
where
    F: Fn(&str, &str) -> u64 + Send + Sync,
{
    fn estimate(&self, text: &str, model: &str) -> u64 {
        self(text, model)
    }
}

/// BPE counting with the model's tokenizer, `cl100k_base` when the model is unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct TiktokenEstimator;

impl TiktokenEstimator {
    /// Tokenizers are lazy loaded and slow to build; call this off the request path.
    pub fn preload() {
        let _ = tiktoken_rs::cl100k_base_singleton();
        let _ = tiktoken_rs::o200k_base_singleton();
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str, model: &str) -> u64 {
        let tokenizer = get_tokenizer(model).unwrap_or(Tokenizer::Cl100kBase);
        bpe_for(tokenizer).encode_with_special_tokens(text).len() as u64
    }
}

fn bpe_for<'a>(tokenizer: Tokenizer) -> &'a CoreBPE {
    match tokenizer {
        Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        Tokenizer::R50kBase
        | Tokenizer::P50kBase
        | Tokenizer::P50kEdit
        | Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    }
}
