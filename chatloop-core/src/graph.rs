//! Inference engine interface
//!
//! An engine runs one forward pass of an exported graph: named input tensors
//! in, named output tensors out. Ports carry a declared element type and a
//! partial shape whose axes are either fixed or symbolic, which is what lets
//! the decode loop materialize an empty cache before the first call.

use candle_core::{DType, Device, Tensor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::{ChatError, Result};
use crate::kv_cache::CacheLayout;

/// Named tensors passed to or returned from one forward pass
pub type TensorMap = HashMap<String, Tensor>;

pub const INPUT_IDS: &str = "input_ids";
pub const POSITION_IDS: &str = "position_ids";
pub const ATTENTION_MASK: &str = "attention_mask";
pub const LOGITS: &str = "logits";

/// One axis of a declared shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dim {
    Fixed(usize),
    Dynamic(String),
}

impl Dim {
    pub fn dynamic(name: impl Into<String>) -> Self {
        Dim::Dynamic(name.into())
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Dim::Dynamic(_))
    }
}

/// Element types a graph port can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    I64,
    F32,
    F16,
    Bf16,
}

impl ElementType {
    pub fn dtype(self) -> DType {
        match self {
            ElementType::I64 => DType::I64,
            ElementType::F32 => DType::F32,
            ElementType::F16 => DType::F16,
            ElementType::Bf16 => DType::BF16,
        }
    }
}

/// A named graph input or output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    pub element_type: ElementType,
    pub shape: Vec<Dim>,
}

impl PortInfo {
    pub fn new(name: impl Into<String>, element_type: ElementType, shape: Vec<Dim>) -> Self {
        Self {
            name: name.into(),
            element_type,
            shape,
        }
    }
}

/// A forward-pass executor over named tensors.
///
/// `run` is blocking: when it returns, every output is materialized. Engines
/// are not required to be shareable; wrap one in [`SharedEngine`] to drive
/// several generations from different threads.
pub trait InferenceEngine {
    /// Declared graph inputs
    fn inputs(&self) -> &[PortInfo];

    /// Declared graph outputs
    fn outputs(&self) -> &[PortInfo];

    /// Device the engine expects its input tensors on
    fn device(&self) -> &Device;

    /// Run one forward pass
    fn run(&mut self, inputs: TensorMap) -> Result<TensorMap>;

    fn input(&self, name: &str) -> Option<&PortInfo> {
        self.inputs().iter().find(|p| p.name == name)
    }

    fn output(&self, name: &str) -> Option<&PortInfo> {
        self.outputs().iter().find(|p| p.name == name)
    }
}

/// An engine shared between generations.
///
/// Each `run` holds the lock for exactly one forward pass, so concurrent
/// generations interleave at step granularity while each keeps its own cache.
pub struct SharedEngine<E> {
    inner: Arc<Mutex<E>>,
    inputs: Vec<PortInfo>,
    outputs: Vec<PortInfo>,
    device: Device,
}

impl<E: InferenceEngine> SharedEngine<E> {
    pub fn new(engine: E) -> Self {
        let inputs = engine.inputs().to_vec();
        let outputs = engine.outputs().to_vec();
        let device = engine.device().clone();
        Self {
            inner: Arc::new(Mutex::new(engine)),
            inputs,
            outputs,
            device,
        }
    }

    /// Access the wrapped engine under the lock
    pub fn with_engine<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut E) -> R,
    {
        f(&mut self.inner.lock())
    }
}

impl<E> Clone for SharedEngine<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            device: self.device.clone(),
        }
    }
}

impl<E: InferenceEngine> InferenceEngine for SharedEngine<E> {
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
        self.inner.lock().run(inputs)
    }
}

/// Hyperparameters of the exported decoder network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    #[serde(alias = "num_hidden_layers")]
    pub num_layers: usize,
    #[serde(alias = "num_attention_heads")]
    pub num_heads: usize,
    #[serde(alias = "num_key_value_heads", alias = "multi_query_group_num")]
    pub num_kv_heads: usize,
    #[serde(alias = "ffn_hidden_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_rms_norm_eps", alias = "layernorm_epsilon")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10_000.0
}

impl NetworkConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Serialized description of an exported graph (`graph.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphManifest {
    /// Model family tag, e.g. `chatglm2`
    pub family: String,
    pub inputs: Vec<PortInfo>,
    pub outputs: Vec<PortInfo>,
    pub cache_layout: CacheLayout,
    /// Storage type of the weights file
    pub weight_type: ElementType,
    /// Overrides the family's end-of-sequence token strings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_token: Option<String>,
    pub network: NetworkConfig,
}

pub const MANIFEST_FILE: &str = "graph.json";

impl GraphManifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let manifest: GraphManifest = serde_json::from_slice(&data)?;
        info!(
            "Loaded graph manifest {:?}: family={}, {} inputs, {} outputs",
            path,
            manifest.family,
            manifest.inputs.len(),
            manifest.outputs.len()
        );
        Ok(manifest)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn input(&self, name: &str) -> Option<&PortInfo> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&PortInfo> {
        self.outputs.iter().find(|p| p.name == name)
    }

    /// Fail unless the manifest declares `input_ids` and `logits`.
    pub fn validate(&self) -> Result<()> {
        if self.input(INPUT_IDS).is_none() {
            return Err(ChatError::Graph(format!("graph has no `{INPUT_IDS}` input")));
        }
        if self.output(LOGITS).is_none() {
            return Err(ChatError::Graph(format!("graph has no `{LOGITS}` output")));
        }
        Ok(())
    }
}
