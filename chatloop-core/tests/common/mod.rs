//! Shared fixtures: a scripted engine, a byte tokenizer and tiny model directories
#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use chatloop_core::graph::MANIFEST_FILE;
use chatloop_core::runtime::{weight_shapes, WEIGHTS_FILE};
use chatloop_core::{
    CacheBindings, ChatError, InferenceEngine, ModelAdapter, NetworkConfig, PortInfo, Result, TensorMap,
    Tokenizer,
};
use std::collections::HashMap;
use std::path::Path;

pub const EOS: u32 = 256;
pub const VOCAB: usize = 260;

pub fn tiny_network() -> NetworkConfig {
    NetworkConfig {
        vocab_size: VOCAB,
        hidden_size: 32,
        num_layers: 2,
        num_heads: 4,
        num_kv_heads: 2,
        intermediate_size: 64,
        rms_norm_eps: 1e-6,
        rope_theta: 10_000.0,
    }
}

/// One byte per token, EOS rendered as `</s>`
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut bytes = Vec::new();
        for &id in ids {
            if id == EOS {
                if !skip_special_tokens {
                    bytes.extend_from_slice(b"</s>");
                }
            } else {
                bytes.push(id as u8);
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> u32 {
        EOS
    }
}

/// What the engine saw on one call
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub input_ids: Vec<i64>,
    pub aux: Vec<i64>,
    pub cache_len: usize,
    /// Batch axis of the cache tensors fed to the pass
    pub cache_batch: usize,
}

/// Engine that answers every pass with `last input token + 1`, or EOS once
/// the sequence holds `eos_at_total` positions.
pub struct ScriptedEngine {
    adapter: ModelAdapter,
    inputs: Vec<PortInfo>,
    outputs: Vec<PortInfo>,
    bindings: CacheBindings,
    device: Device,
    pub eos_at_total: Option<usize>,
    pub fail_on_call: Option<usize>,
    /// Return a cache one position short
    pub drop_cache_position: bool,
    pub calls: Vec<CallRecord>,
}

impl ScriptedEngine {
    pub fn new(adapter: &ModelAdapter) -> Self {
        let manifest = adapter.export_manifest(tiny_network(), false);
        let bindings = CacheBindings::from_ports(&manifest.inputs, &manifest.outputs).unwrap();
        Self {
            adapter: adapter.clone(),
            inputs: manifest.inputs,
            outputs: manifest.outputs,
            bindings,
            device: Device::Cpu,
            eos_at_total: None,
            fail_on_call: None,
            drop_cache_position: false,
            calls: Vec::new(),
        }
    }

    /// EOS becomes the `k`-th generated token (1-based)
    pub fn with_eos_at_step(mut self, prompt_len: usize, k: usize) -> Self {
        self.eos_at_total = Some(prompt_len + k - 1);
        self
    }

    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }
}

impl InferenceEngine for ScriptedEngine {
    fn inputs(&self) -> &[PortInfo] {
        &self.inputs
    }

    fn outputs(&self) -> &[PortInfo] {
        &self.outputs
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn run(&mut self, mut inputs: TensorMap) -> Result<TensorMap> {
        if self.fail_on_call == Some(self.calls.len() + 1) {
            return Err(ChatError::Engine("scripted failure".into()));
        }
        let layout = self.adapter.layout;
        let ids = inputs.remove("input_ids").unwrap().to_vec2::<i64>()?.remove(0);
        let aux = inputs
            .remove(self.adapter.aux.name())
            .unwrap()
            .to_vec2::<i64>()?
            .remove(0);

        let mut outputs = TensorMap::new();
        let mut cache_len = 0;
        let mut cache_batch = 0;
        for slot in self.bindings.slots() {
            let past = inputs.remove(&slot.input).unwrap();
            cache_len = past.dim(layout.seq_axis())?;
            cache_batch = past.dim(layout.batch_axis())?;
            let mut dims = past.dims().to_vec();
            dims[layout.seq_axis()] = ids.len();
            let new = Tensor::zeros(dims, DType::F32, &self.device)?;
            let mut present = if cache_len == 0 {
                new
            } else {
                Tensor::cat(&[&past, &new], layout.seq_axis())?
            };
            if self.drop_cache_position {
                let len = present.dim(layout.seq_axis())?;
                present = present.narrow(layout.seq_axis(), 0, len - 1)?;
            }
            outputs.insert(slot.output.clone(), present);
        }

        let total = cache_len + ids.len();
        let next = match self.eos_at_total {
            Some(n) if total >= n => EOS as usize,
            _ => ((*ids.last().unwrap() + 1) % 200) as usize,
        };
        let mut logits = vec![-100f32; ids.len() * VOCAB];
        logits[(ids.len() - 1) * VOCAB + next] = 100.0;
        outputs.insert(
            "logits".to_string(),
            Tensor::from_vec(logits, (1, ids.len(), VOCAB), &self.device)?,
        );

        self.calls.push(CallRecord {
            input_ids: ids,
            aux,
            cache_len,
            cache_batch,
        });
        Ok(outputs)
    }
}

/// GPT-2 byte to unicode table
fn byte_chars() -> Vec<char> {
    let mut printable: Vec<u32> = (b'!' as u32..=b'~' as u32)
        .chain(0xA1..=0xAC)
        .chain(0xAE..=0xFF)
        .collect();
    let mut chars: Vec<u32> = printable.clone();
    let mut n = 0;
    for b in 0..256u32 {
        if !printable.contains(&b) {
            printable.push(b);
            chars.push(256 + n);
            n += 1;
        }
    }
    let mut table = vec![' '; 256];
    for (b, c) in printable.into_iter().zip(chars) {
        table[b as usize] = char::from_u32(c).unwrap();
    }
    table
}

/// Byte-level BPE `tokenizer.json` with one token per byte (id = byte value)
/// and special tokens from id 256 on.
pub fn write_byte_level_tokenizer(path: &Path) {
    let specials = ["</s>", "<|im_end|>", "<|endoftext|>", "<eoa>"];
    let vocab: serde_json::Map<String, serde_json::Value> = byte_chars()
        .into_iter()
        .enumerate()
        .map(|(id, c)| (c.to_string(), serde_json::json!(id)))
        .collect();
    let added: Vec<serde_json::Value> = specials
        .iter()
        .enumerate()
        .map(|(i, content)| {
            serde_json::json!({
                "id": 256 + i,
                "content": content,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            })
        })
        .collect();
    let byte_level = serde_json::json!({
        "type": "ByteLevel",
        "add_prefix_space": false,
        "trim_offsets": true,
        "use_regex": true
    });
    let tokenizer = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": null,
        "pre_tokenizer": byte_level,
        "post_processor": null,
        "decoder": byte_level,
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": null,
            "continuing_subword_prefix": null,
            "end_of_word_suffix": null,
            "fuse_unk": false,
            "byte_fallback": false,
            "vocab": vocab,
            "merges": []
        }
    });
    std::fs::write(path, serde_json::to_string(&tokenizer).unwrap()).unwrap();
}

/// Write graph.json, random weights and a tokenizer for `adapter` into `dir`
pub fn write_model_dir(dir: &Path, adapter: &ModelAdapter) {
    let network = tiny_network();
    let manifest = adapter.export_manifest(network.clone(), false);
    manifest.save(dir.join(MANIFEST_FILE)).unwrap();

    let mut weights = HashMap::new();
    for (name, shape) in weight_shapes(&network) {
        let t = if shape.len() == 1 {
            Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap()
        } else {
            Tensor::randn(0f32, 0.5, shape, &Device::Cpu).unwrap()
        };
        weights.insert(name, t);
    }
    candle_core::safetensors::save(&weights, dir.join(WEIGHTS_FILE)).unwrap();
    write_byte_level_tokenizer(&dir.join("tokenizer.json"));
}
