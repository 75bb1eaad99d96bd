//! Model families and their adapters
//!
//! A family fixes everything the decode loop needs to know that is not in the
//! graph itself: which auxiliary tensor accompanies `input_ids`, the axis
//! order of the cache, the chat template, default sampling and EOS strings.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{ChatError, Result};
use crate::graph::{
    Dim, ElementType, GraphManifest, NetworkConfig, PortInfo, ATTENTION_MASK, INPUT_IDS, LOGITS,
    POSITION_IDS,
};
use crate::kv_cache::{past_name, present_name, CacheKind, CacheLayout};
use crate::postprocess::{cut_at_end_of_answer, process_response};
use crate::prompt::PromptTemplate;
use crate::request::SamplingParams;

/// Supported model families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    ChatGlm2,
    Qwen,
    Baichuan2,
    InternLm,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 4] = [
        ModelFamily::ChatGlm2,
        ModelFamily::Qwen,
        ModelFamily::Baichuan2,
        ModelFamily::InternLm,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::ChatGlm2 => "chatglm2",
            ModelFamily::Qwen => "qwen",
            ModelFamily::Baichuan2 => "baichuan2",
            ModelFamily::InternLm => "internlm",
        }
    }

    /// Parse a family tag, ignoring case, `-` and `_`
    pub fn from_str_loose(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_lowercase();
        Self::ALL.into_iter().find(|f| f.as_str() == normalized)
    }

    /// First family whose tag appears in the lowercased path
    pub fn detect_from_path(path: &str) -> Option<Self> {
        let lower = path.to_lowercase();
        Self::ALL.into_iter().find(|f| lower.contains(f.as_str()))
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Auxiliary tensor fed next to `input_ids`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxInput {
    /// Absolute positions of the tokens in this call
    PositionIds,
    /// Ones over every position seen so far, including this call
    AttentionMask,
}

impl AuxInput {
    pub fn name(self) -> &'static str {
        match self {
            AuxInput::PositionIds => POSITION_IDS,
            AuxInput::AttentionMask => ATTENTION_MASK,
        }
    }
}

/// Per-generation bookkeeping for the auxiliary tensor.
///
/// `past` counts the positions already consumed by earlier forward passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxState {
    kind: AuxInput,
    past: usize,
}

impl AuxState {
    pub fn new(kind: AuxInput) -> Self {
        Self { kind, past: 0 }
    }

    pub fn kind(&self) -> AuxInput {
        self.kind
    }

    pub fn past(&self) -> usize {
        self.past
    }

    /// The tensor accompanying an input of `input_len` tokens
    pub fn tensor(&self, input_len: usize, device: &Device) -> Result<Tensor> {
        let t = match self.kind {
            AuxInput::PositionIds => {
                let start = self.past as i64;
                Tensor::arange(start, start + input_len as i64, device)?.unsqueeze(0)?
            }
            AuxInput::AttentionMask => Tensor::ones((1, self.past + input_len), DType::I64, device)?,
        };
        Ok(t)
    }

    /// Record that a forward pass consumed `input_len` tokens
    pub fn advance(&mut self, input_len: usize) {
        self.past += input_len;
    }
}

/// Family-specific behavior around one decode loop
#[derive(Debug, Clone, PartialEq)]
pub struct ModelAdapter {
    pub family: ModelFamily,
    pub aux: AuxInput,
    pub layout: CacheLayout,
    pub template: PromptTemplate,
    pub sampling: SamplingParams,
    /// Candidate EOS token strings, first match in the vocabulary wins
    pub eos_tokens: Vec<String>,
    /// Cut responses at the first `<eoa>`
    pub cut_at_eoa: bool,
}

impl ModelAdapter {
    pub fn chatglm2() -> Self {
        Self {
            family: ModelFamily::ChatGlm2,
            aux: AuxInput::PositionIds,
            layout: CacheLayout::SeqBatchHeadDim,
            template: PromptTemplate::ChatGlm2,
            sampling: SamplingParams::new(20, 0.7, 1.0),
            eos_tokens: vec!["</s>".into()],
            cut_at_eoa: false,
        }
    }

    pub fn qwen() -> Self {
        Self {
            family: ModelFamily::Qwen,
            aux: AuxInput::AttentionMask,
            layout: CacheLayout::BatchSeqHeadDim,
            template: PromptTemplate::ChatMl,
            sampling: SamplingParams::new(50, 0.8, 1.0),
            eos_tokens: vec!["<|im_end|>".into(), "<|endoftext|>".into()],
            cut_at_eoa: false,
        }
    }

    pub fn baichuan2() -> Self {
        Self {
            family: ModelFamily::Baichuan2,
            aux: AuxInput::AttentionMask,
            layout: CacheLayout::BatchHeadSeqDim,
            template: PromptTemplate::Baichuan2,
            sampling: SamplingParams::new(5, 0.85, 0.3),
            eos_tokens: vec!["</s>".into()],
            cut_at_eoa: false,
        }
    }

    pub fn internlm() -> Self {
        Self {
            family: ModelFamily::InternLm,
            aux: AuxInput::AttentionMask,
            layout: CacheLayout::BatchHeadSeqDim,
            template: PromptTemplate::InternLm,
            sampling: SamplingParams::new(20, 0.8, 1.0),
            eos_tokens: vec!["</s>".into()],
            cut_at_eoa: true,
        }
    }

    pub fn for_family(family: ModelFamily) -> Self {
        match family {
            ModelFamily::ChatGlm2 => Self::chatglm2(),
            ModelFamily::Qwen => Self::qwen(),
            ModelFamily::Baichuan2 => Self::baichuan2(),
            ModelFamily::InternLm => Self::internlm(),
        }
    }

    /// Put `token` ahead of the family's EOS candidates
    pub fn with_eos_token(mut self, token: impl Into<String>) -> Self {
        self.eos_tokens.insert(0, token.into());
        self
    }

    pub fn eos_candidates(&self) -> Vec<&str> {
        self.eos_tokens.iter().map(String::as_str).collect()
    }

    pub fn build_prompt(&self, history: &[(String, String)], query: &str, system: &str) -> String {
        self.template.build(history, query, system)
    }

    /// Normalize decoded text for display
    pub fn postprocess(&self, text: &str) -> String {
        let processed = process_response(text);
        if self.cut_at_eoa {
            cut_at_end_of_answer(&processed).to_string()
        } else {
            processed
        }
    }

    pub fn aux_state(&self) -> AuxState {
        AuxState::new(self.aux)
    }

    /// Describe the graph an exporter produces for this family.
    ///
    /// Every cache port has a symbolic batch and sequence axis; heads and
    /// head size are fixed. `compress_weights` records f16 weight storage.
    pub fn export_manifest(&self, network: NetworkConfig, compress_weights: bool) -> GraphManifest {
        let batch = || Dim::dynamic("batch");
        let seq = || Dim::dynamic("seq_len");

        let mut inputs = vec![PortInfo::new(INPUT_IDS, ElementType::I64, vec![batch(), seq()])];
        let aux_len = match self.aux {
            AuxInput::PositionIds => seq(),
            AuxInput::AttentionMask => Dim::dynamic("past_seq_len + seq_len"),
        };
        inputs.push(PortInfo::new(self.aux.name(), ElementType::I64, vec![batch(), aux_len]));

        let mut outputs = vec![PortInfo::new(
            LOGITS,
            ElementType::F32,
            vec![batch(), seq(), Dim::Fixed(network.vocab_size)],
        )];

        let heads = Dim::Fixed(network.num_kv_heads);
        let head_dim = Dim::Fixed(network.head_dim());
        for layer in 0..network.num_layers {
            for kind in [CacheKind::Key, CacheKind::Value] {
                let past = self
                    .layout
                    .dims(batch(), heads.clone(), Dim::dynamic("past_seq_len"), head_dim.clone());
                inputs.push(PortInfo::new(past_name(layer, kind), ElementType::F32, past));
                let present = self.layout.dims(
                    batch(),
                    heads.clone(),
                    Dim::dynamic("past_seq_len + seq_len"),
                    head_dim.clone(),
                );
                outputs.push(PortInfo::new(present_name(layer, kind), ElementType::F32, present));
            }
        }

        GraphManifest {
            family: self.family.as_str().to_string(),
            inputs,
            outputs,
            cache_layout: self.layout,
            weight_type: if compress_weights {
                ElementType::F16
            } else {
                ElementType::F32
            },
            eos_token: None,
            network,
        }
    }
}

/// Explicit mapping from family tag to adapter constructor
pub struct ModelRegistry {
    constructors: HashMap<ModelFamily, fn() -> ModelAdapter>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register(ModelFamily::ChatGlm2, ModelAdapter::chatglm2);
        registry.register(ModelFamily::Qwen, ModelAdapter::qwen);
        registry.register(ModelFamily::Baichuan2, ModelAdapter::baichuan2);
        registry.register(ModelFamily::InternLm, ModelAdapter::internlm);
        registry
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, family: ModelFamily, constructor: fn() -> ModelAdapter) {
        self.constructors.insert(family, constructor);
    }

    pub fn get(&self, family: ModelFamily) -> Result<ModelAdapter> {
        self.constructors
            .get(&family)
            .map(|ctor| ctor())
            .ok_or_else(|| ChatError::UnsupportedModel(family.to_string()))
    }

    /// Resolve a declared family tag such as `qwen` or `InternLM`
    pub fn resolve_tag(&self, tag: &str) -> Result<ModelAdapter> {
        let family =
            ModelFamily::from_str_loose(tag).ok_or_else(|| ChatError::UnsupportedModel(tag.to_string()))?;
        self.get(family)
    }

    /// Resolve by family substring in a model path
    pub fn detect(&self, path: impl AsRef<Path>) -> Result<ModelAdapter> {
        let path = path.as_ref().to_string_lossy();
        let family = ModelFamily::detect_from_path(&path)
            .ok_or_else(|| ChatError::UnsupportedModel(path.to_string()))?;
        info!("Detected model family {} from path {}", family, path);
        self.get(family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_network() -> NetworkConfig {
        NetworkConfig {
            vocab_size: 32,
            hidden_size: 16,
            num_layers: 2,
            num_heads: 4,
            num_kv_heads: 2,
            intermediate_size: 32,
            rms_norm_eps: 1e-6,
            rope_theta: 10_000.0,
        }
    }

    #[test]
    fn test_family_from_str_loose() {
        assert_eq!(ModelFamily::from_str_loose("ChatGLM2"), Some(ModelFamily::ChatGlm2));
        assert_eq!(ModelFamily::from_str_loose("intern-lm"), Some(ModelFamily::InternLm));
        assert_eq!(ModelFamily::from_str_loose("llama"), None);
    }

    #[test]
    fn test_family_detect_from_path() {
        assert_eq!(
            ModelFamily::detect_from_path("/models/chatglm2-6b/ir"),
            Some(ModelFamily::ChatGlm2)
        );
        assert_eq!(ModelFamily::detect_from_path("Qwen-7B-Chat"), Some(ModelFamily::Qwen));
        assert_eq!(
            ModelFamily::detect_from_path("./Baichuan2-7B-Chat"),
            Some(ModelFamily::Baichuan2)
        );
        assert_eq!(ModelFamily::detect_from_path("internlm-chat-7b"), Some(ModelFamily::InternLm));
        assert_eq!(ModelFamily::detect_from_path("/models/llama-2"), None);
    }

    #[test]
    fn test_registry_rejects_unknown() {
        let registry = ModelRegistry::new();
        assert!(matches!(
            registry.detect("/models/mistral-7b"),
            Err(ChatError::UnsupportedModel(_))
        ));
        assert!(matches!(
            registry.resolve_tag("gpt2"),
            Err(ChatError::UnsupportedModel(_))
        ));
        assert_eq!(registry.resolve_tag("qwen").unwrap().family, ModelFamily::Qwen);
    }

    #[test]
    fn test_family_defaults_differ() {
        let glm = ModelAdapter::chatglm2().sampling;
        let baichuan = ModelAdapter::baichuan2().sampling;
        assert_eq!(glm, SamplingParams::new(20, 0.7, 1.0));
        assert_eq!(baichuan, SamplingParams::new(5, 0.85, 0.3));
        assert_eq!(ModelAdapter::internlm().sampling.top_p, 0.8);
    }

    #[test]
    fn test_position_ids_reset_per_call() {
        let mut aux = ModelAdapter::chatglm2().aux_state();
        let prefill = aux.tensor(4, &Device::Cpu).unwrap();
        assert_eq!(prefill.to_vec2::<i64>().unwrap(), vec![vec![0, 1, 2, 3]]);
        aux.advance(4);
        let step = aux.tensor(1, &Device::Cpu).unwrap();
        assert_eq!(step.to_vec2::<i64>().unwrap(), vec![vec![4]]);
        aux.advance(1);
        assert_eq!(aux.tensor(1, &Device::Cpu).unwrap().to_vec2::<i64>().unwrap(), vec![vec![5]]);
    }

    #[test]
    fn test_attention_mask_grows() {
        let mut aux = ModelAdapter::internlm().aux_state();
        assert_eq!(aux.tensor(3, &Device::Cpu).unwrap().dims(), &[1, 3]);
        aux.advance(3);
        assert_eq!(aux.tensor(1, &Device::Cpu).unwrap().dims(), &[1, 4]);
        aux.advance(1);
        let mask = aux.tensor(1, &Device::Cpu).unwrap();
        assert_eq!(mask.to_vec2::<i64>().unwrap(), vec![vec![1, 1, 1, 1, 1]]);
    }

    #[test]
    fn test_internlm_postprocess_cuts_eoa() {
        let adapter = ModelAdapter::internlm();
        assert_eq!(adapter.postprocess(" 你好,我是书生<eoa>\n<|User|>"), "你好，我是书生");
        assert_eq!(ModelAdapter::qwen().postprocess("a<eoa>b"), "a<eoa>b");
    }

    #[test]
    fn test_export_manifest_names_and_layout() {
        let manifest = ModelAdapter::chatglm2().export_manifest(tiny_network(), true);
        manifest.validate().unwrap();
        assert_eq!(manifest.family, "chatglm2");
        assert_eq!(manifest.weight_type, ElementType::F16);
        assert!(manifest.input(POSITION_IDS).is_some());
        assert!(manifest.input(ATTENTION_MASK).is_none());
        // inputs: ids, aux, 2 layers * key/value
        assert_eq!(manifest.inputs.len(), 6);
        assert_eq!(manifest.outputs.len(), 5);

        let past = manifest.input("past_key_values.1.value").unwrap();
        assert!(past.shape[0].is_dynamic());
        assert_eq!(past.shape[2], Dim::Fixed(2));
        assert_eq!(past.shape[3], Dim::Fixed(4));
        assert!(manifest.output("present.1.value").is_some());
    }
}
