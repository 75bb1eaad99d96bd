//! Reference runtime - executes an exported graph with candle
//!
//! A pre-norm rotary decoder (RMSNorm, grouped-query attention, SwiGLU MLP)
//! whose inputs and outputs follow the graph manifest exactly: cache tensors
//! are read and written under their declared names and in the family's axis
//! order, and the auxiliary input is whichever one the manifest declares.

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Embedding, Linear, RmsNorm, VarBuilder};
use std::path::Path;
use tracing::info;

use crate::error::{ChatError, Result};
use crate::graph::{
    GraphManifest, InferenceEngine, NetworkConfig, PortInfo, TensorMap, ATTENTION_MASK, INPUT_IDS,
    LOGITS, POSITION_IDS,
};
use crate::kv_cache::{CacheBindings, CacheKind, CacheLayout};

pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Every weight tensor the runtime loads, with its shape
pub fn weight_shapes(network: &NetworkConfig) -> Vec<(String, Vec<usize>)> {
    let h = network.hidden_size;
    let kv = network.num_kv_heads * network.head_dim();
    let ffn = network.intermediate_size;
    let mut shapes = vec![
        ("embed_tokens.weight".to_string(), vec![network.vocab_size, h]),
        ("norm.weight".to_string(), vec![h]),
        ("lm_head.weight".to_string(), vec![network.vocab_size, h]),
    ];
    for i in 0..network.num_layers {
        let p = format!("layers.{i}");
        shapes.extend([
            (format!("{p}.input_layernorm.weight"), vec![h]),
            (format!("{p}.post_attention_layernorm.weight"), vec![h]),
            (format!("{p}.self_attn.q_proj.weight"), vec![h, h]),
            (format!("{p}.self_attn.k_proj.weight"), vec![kv, h]),
            (format!("{p}.self_attn.v_proj.weight"), vec![kv, h]),
            (format!("{p}.self_attn.o_proj.weight"), vec![h, h]),
            (format!("{p}.mlp.gate_proj.weight"), vec![ffn, h]),
            (format!("{p}.mlp.up_proj.weight"), vec![ffn, h]),
            (format!("{p}.mlp.down_proj.weight"), vec![h, ffn]),
        ]);
    }
    shapes
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(network: &NetworkConfig, vb: VarBuilder) -> Result<Self> {
        let h = network.hidden_size;
        let kv = network.num_kv_heads * network.head_dim();
        Ok(Self {
            q_proj: candle_nn::linear_no_bias(h, h, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear_no_bias(h, kv, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear_no_bias(h, kv, vb.pp("v_proj"))?,
            o_proj: candle_nn::linear_no_bias(h, h, vb.pp("o_proj"))?,
            num_heads: network.num_heads,
            num_kv_heads: network.num_kv_heads,
            head_dim: network.head_dim(),
        })
    }

    /// Returns the attention output and the full key/value tensors in
    /// `[batch, kv_heads, past + seq, head_dim]` order.
    fn forward(
        &self,
        x: &Tensor,
        rope: &Rope,
        bias: &Tensor,
        past: Option<(&Tensor, &Tensor)>,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (b, s, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, s, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, s, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, s, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = rope.apply(&q)?;
        let k = rope.apply(&k)?;

        let (k, v) = match past {
            Some((pk, pv)) => (Tensor::cat(&[pk, &k], 2)?, Tensor::cat(&[pv, &v], 2)?),
            None => (k, v),
        };

        let n_rep = self.num_heads / self.num_kv_heads;
        let k_rep = candle_transformers::utils::repeat_kv(k.clone(), n_rep)?.contiguous()?;
        let v_rep = candle_transformers::utils::repeat_kv(v.clone(), n_rep)?.contiguous()?;

        let scale = (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k_rep.transpose(2, 3)?)? / scale)?;
        let attn = attn.broadcast_add(bias)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v_rep)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, s, self.num_heads * self.head_dim))?;

        Ok((self.o_proj.forward(&out)?, k, v))
    }
}

struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn load(network: &NetworkConfig, vb: VarBuilder) -> Result<Self> {
        let h = network.hidden_size;
        let ffn = network.intermediate_size;
        Ok(Self {
            gate_proj: candle_nn::linear_no_bias(h, ffn, vb.pp("gate_proj"))?,
            up_proj: candle_nn::linear_no_bias(h, ffn, vb.pp("up_proj"))?,
            down_proj: candle_nn::linear_no_bias(ffn, h, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?.silu()?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    fn load(network: &NetworkConfig, vb: VarBuilder) -> Result<Self> {
        let h = network.hidden_size;
        Ok(Self {
            input_layernorm: candle_nn::rms_norm(h, network.rms_norm_eps, vb.pp("input_layernorm"))?,
            self_attn: Attention::load(network, vb.pp("self_attn"))?,
            post_attention_layernorm: candle_nn::rms_norm(
                h,
                network.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::load(network, vb.pp("mlp"))?,
        })
    }
}

/// Rotary tables for one forward pass
struct Rope {
    cos: Tensor,
    sin: Tensor,
}

impl Rope {
    /// `positions` holds one absolute position per input token
    fn new(positions: &Tensor, inv_freq: &Tensor) -> Result<Self> {
        let freqs = positions.unsqueeze(1)?.matmul(&inv_freq.unsqueeze(0)?)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        Ok(Self {
            cos: emb.cos()?.unsqueeze(0)?.unsqueeze(0)?,
            sin: emb.sin()?.unsqueeze(0)?.unsqueeze(0)?,
        })
    }

    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let half = x.dim(D::Minus1)? / 2;
        let x1 = x.narrow(D::Minus1, 0, half)?;
        let x2 = x.narrow(D::Minus1, half, half)?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
        Ok((x.broadcast_mul(&self.cos)? + rotated.broadcast_mul(&self.sin)?)?)
    }
}

/// Candle implementation of an exported decoder graph
pub struct CandleRuntime {
    inputs: Vec<PortInfo>,
    outputs: Vec<PortInfo>,
    device: Device,
    layout: CacheLayout,
    bindings: CacheBindings,
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    inv_freq: Tensor,
}

impl CandleRuntime {
    /// Load `model.safetensors` from `dir` for the graph in `manifest`
    pub fn load(dir: impl AsRef<Path>, manifest: GraphManifest, device: &Device) -> Result<Self> {
        let weights = dir.as_ref().join(WEIGHTS_FILE);
        info!(
            "Loading {:?} ({:?} weights) on {:?}",
            weights, manifest.weight_type, device
        );
        // Stored f16 weights are widened on load
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        Self::from_var_builder(manifest, vb, device)
    }

    pub fn from_var_builder(manifest: GraphManifest, vb: VarBuilder, device: &Device) -> Result<Self> {
        manifest.validate()?;
        let network = &manifest.network;
        let bindings = CacheBindings::from_ports(&manifest.inputs, &manifest.outputs)?;
        if bindings.num_layers() != network.num_layers {
            return Err(ChatError::Graph(format!(
                "graph declares cache for {} layers, network has {}",
                bindings.num_layers(),
                network.num_layers
            )));
        }
        if network.num_heads % network.num_kv_heads != 0 {
            return Err(ChatError::Graph(format!(
                "{} heads cannot be grouped over {} kv heads",
                network.num_heads, network.num_kv_heads
            )));
        }

        let embed_tokens = candle_nn::embedding(network.vocab_size, network.hidden_size, vb.pp("embed_tokens"))?;
        let layers = (0..network.num_layers)
            .map(|i| DecoderLayer::load(network, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let norm = candle_nn::rms_norm(network.hidden_size, network.rms_norm_eps, vb.pp("norm"))?;
        let lm_head = candle_nn::linear_no_bias(network.hidden_size, network.vocab_size, vb.pp("lm_head"))?;

        let head_dim = network.head_dim();
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / network.rope_theta.powf(i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq, device)?;

        info!(
            "Runtime ready: family={}, layers={}, hidden={}, heads={}/{}, vocab={}",
            manifest.family,
            network.num_layers,
            network.hidden_size,
            network.num_heads,
            network.num_kv_heads,
            network.vocab_size
        );

        Ok(Self {
            inputs: manifest.inputs,
            outputs: manifest.outputs,
            device: device.clone(),
            layout: manifest.cache_layout,
            bindings,
            embed_tokens,
            layers,
            norm,
            lm_head,
            inv_freq,
        })
    }

    fn forward(&self, inputs: &TensorMap) -> Result<TensorMap> {
        let input_ids = required(inputs, INPUT_IDS)?;
        let (batch, seq_len) = input_ids.dims2()?;

        // Past key/value per layer in [batch, kv_heads, past, head_dim]
        let mut past = Vec::with_capacity(self.layers.len());
        for layer in 0..self.layers.len() {
            let mut pair = Vec::with_capacity(2);
            for kind in [CacheKind::Key, CacheKind::Value] {
                let name = self.slot_input(layer, kind)?;
                let t = self.layout.to_canonical(required(inputs, name)?)?.contiguous()?;
                pair.push(t);
            }
            past.push((pair.remove(0), pair.remove(0)));
        }
        let past_len = match past.first() {
            Some((k, _)) => k.dim(2)?,
            None => 0,
        };
        let total_len = past_len + seq_len;

        let positions = match inputs.get(POSITION_IDS) {
            Some(ids) => {
                let (_, n) = ids.dims2()?;
                if n != seq_len {
                    return Err(ChatError::Engine(format!(
                        "{n} position ids for {seq_len} input tokens"
                    )));
                }
                ids.get(0)?.to_dtype(DType::F32)?
            }
            None => Tensor::arange(past_len as f32, total_len as f32, &self.device)?,
        };
        let rope = Rope::new(&positions, &self.inv_freq)?;
        let bias = self.attention_bias(inputs.get(ATTENTION_MASK), batch, past_len, seq_len)?;

        let mut h = self.embed_tokens.forward(input_ids)?;
        let mut present = Vec::with_capacity(self.layers.len());
        for (layer, (pk, pv)) in self.layers.iter().zip(past.iter()) {
            let past_kv = if past_len > 0 { Some((pk, pv)) } else { None };
            let normed = layer.input_layernorm.forward(&h)?;
            let (attn, k, v) = layer.self_attn.forward(&normed, &rope, &bias, past_kv)?;
            h = (h + attn)?;
            let normed = layer.post_attention_layernorm.forward(&h)?;
            h = (&h + layer.mlp.forward(&normed)?)?;
            present.push((k, v));
        }
        let logits = self.lm_head.forward(&self.norm.forward(&h)?)?;

        let mut outputs = TensorMap::new();
        outputs.insert(LOGITS.to_string(), logits.to_dtype(DType::F32)?);
        for slot in self.bindings.slots() {
            let (k, v) = &present[slot.layer];
            let t = match slot.kind {
                CacheKind::Key => k,
                CacheKind::Value => v,
            };
            outputs.insert(slot.output.clone(), self.layout.from_canonical(t)?);
        }
        Ok(outputs)
    }

    fn slot_input(&self, layer: usize, kind: CacheKind) -> Result<&str> {
        self.bindings
            .slots()
            .iter()
            .find(|s| s.layer == layer && s.kind == kind)
            .map(|s| s.input.as_str())
            .ok_or_else(|| ChatError::Graph(format!("no cache input for layer {layer}")))
    }

    /// Additive `[batch, 1, seq, past + seq]` bias: causal, plus padding
    /// from the attention mask when one is given.
    fn attention_bias(
        &self,
        mask: Option<&Tensor>,
        batch: usize,
        past_len: usize,
        seq_len: usize,
    ) -> Result<Tensor> {
        let total = past_len + seq_len;
        let causal: Vec<f32> = (0..seq_len)
            .flat_map(|i| (0..total).map(move |j| if j <= i + past_len { 0.0 } else { f32::NEG_INFINITY }))
            .collect();
        let causal = Tensor::from_vec(causal, (1, 1, seq_len, total), &self.device)?;

        let Some(mask) = mask else {
            return Ok(causal);
        };
        let rows = mask.to_dtype(DType::I64)?.to_vec2::<i64>()?;
        if rows.len() != batch || rows.iter().any(|r| r.len() != total) {
            return Err(ChatError::Engine(format!(
                "attention mask {:?} does not cover {} positions",
                mask.dims(),
                total
            )));
        }
        let padding: Vec<f32> = rows
            .iter()
            .flatten()
            .map(|&m| if m != 0 { 0.0 } else { f32::NEG_INFINITY })
            .collect();
        let padding = Tensor::from_vec(padding, (batch, 1, 1, total), &self.device)?;
        Ok(causal.broadcast_add(&padding)?)
    }
}

fn required<'a>(inputs: &'a TensorMap, name: &str) -> Result<&'a Tensor> {
    inputs
        .get(name)
        .ok_or_else(|| ChatError::Engine(format!("missing input `{name}`")))
}

impl InferenceEngine for CandleRuntime {
    fn inputs(&self) -> &[PortInfo] {
        &self.inputs
    }

    fn outputs(&self) -> &[PortInfo] {
        &self.outputs
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn run(&mut self, inputs: TensorMap) -> Result<TensorMap> {
        self.forward(&inputs).map_err(|e| match e {
            ChatError::Candle(e) => ChatError::engine(e),
            other => other,
        })
    }
}
