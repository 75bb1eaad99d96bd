//! Key/value cache carried between forward passes
//!
//! Cache tensors are bound by name: every graph input
//! `past_key_values.{layer}.{key|value}` is paired with the graph output whose
//! name starts with `present` and carries the same layer and kind. The layout
//! of each tensor is family-specific and only matters when an empty cache is
//! built or when a tensor is read in canonical order.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::{ChatError, Result};
use crate::graph::{Dim, PortInfo, TensorMap};

const PAST_PREFIX: &str = "past_key_values";
const PRESENT_PREFIX: &str = "present";

/// Axis order of one cache tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLayout {
    /// `[seq, batch, heads, head_dim]`
    SeqBatchHeadDim,
    /// `[batch, seq, heads, head_dim]`
    BatchSeqHeadDim,
    /// `[batch, heads, seq, head_dim]`
    BatchHeadSeqDim,
}

impl CacheLayout {
    pub fn seq_axis(self) -> usize {
        match self {
            CacheLayout::SeqBatchHeadDim => 0,
            CacheLayout::BatchSeqHeadDim => 1,
            CacheLayout::BatchHeadSeqDim => 2,
        }
    }

    pub fn batch_axis(self) -> usize {
        match self {
            CacheLayout::SeqBatchHeadDim => 1,
            CacheLayout::BatchSeqHeadDim | CacheLayout::BatchHeadSeqDim => 0,
        }
    }

    /// Declared shape of a cache port in this layout
    pub fn dims(self, batch: Dim, heads: Dim, seq: Dim, head_dim: Dim) -> Vec<Dim> {
        match self {
            CacheLayout::SeqBatchHeadDim => vec![seq, batch, heads, head_dim],
            CacheLayout::BatchSeqHeadDim => vec![batch, seq, heads, head_dim],
            CacheLayout::BatchHeadSeqDim => vec![batch, heads, seq, head_dim],
        }
    }

    /// Reorder a tensor in this layout to `[batch, heads, seq, head_dim]`
    pub fn to_canonical(self, t: &Tensor) -> Result<Tensor> {
        Ok(match self {
            CacheLayout::SeqBatchHeadDim => t.permute((1, 2, 0, 3))?,
            CacheLayout::BatchSeqHeadDim => t.permute((0, 2, 1, 3))?,
            CacheLayout::BatchHeadSeqDim => t.clone(),
        })
    }

    /// Reorder a `[batch, heads, seq, head_dim]` tensor into this layout
    pub fn from_canonical(self, t: &Tensor) -> Result<Tensor> {
        let t = match self {
            CacheLayout::SeqBatchHeadDim => t.permute((2, 0, 1, 3))?,
            CacheLayout::BatchSeqHeadDim => t.permute((0, 2, 1, 3))?,
            CacheLayout::BatchHeadSeqDim => t.clone(),
        };
        Ok(t.contiguous()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheKind {
    Key,
    Value,
}

impl CacheKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKind::Key => "key",
            CacheKind::Value => "value",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "key" => Some(CacheKind::Key),
            "value" => Some(CacheKind::Value),
            _ => None,
        }
    }
}

/// Name of the cache input for one layer and kind
pub fn past_name(layer: usize, kind: CacheKind) -> String {
    format!("{PAST_PREFIX}.{layer}.{}", kind.as_str())
}

/// Name of the cache output for one layer and kind
pub fn present_name(layer: usize, kind: CacheKind) -> String {
    format!("{PRESENT_PREFIX}.{layer}.{}", kind.as_str())
}

// `{prefix}.{layer}.{kind}` with an arbitrary dotted prefix
fn parse_slot(name: &str) -> Option<(usize, CacheKind)> {
    let mut parts = name.rsplitn(3, '.');
    let kind = CacheKind::parse(parts.next()?)?;
    let layer = parts.next()?.parse().ok()?;
    Some((layer, kind))
}

/// One paired cache input/output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSlot {
    pub layer: usize,
    pub kind: CacheKind,
    pub input: String,
    pub output: String,
}

/// Pairing of cache inputs with cache outputs, derived from the graph ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheBindings {
    slots: Vec<CacheSlot>,
    num_layers: usize,
}

impl CacheBindings {
    /// Pair every input containing `key_values` with its `present` output.
    ///
    /// Layers must be numbered `0..n` with both a key and a value, or the
    /// graph is rejected.
    pub fn from_ports(inputs: &[PortInfo], outputs: &[PortInfo]) -> Result<Self> {
        let mut present: BTreeMap<(usize, CacheKind), String> = BTreeMap::new();
        for port in outputs.iter().filter(|p| p.name.starts_with(PRESENT_PREFIX)) {
            let slot = parse_slot(&port.name).ok_or_else(|| {
                ChatError::Graph(format!("cannot parse cache output name `{}`", port.name))
            })?;
            present.insert(slot, port.name.clone());
        }

        let mut slots = BTreeMap::new();
        for port in inputs.iter().filter(|p| p.name.contains("key_values")) {
            let (layer, kind) = parse_slot(&port.name).ok_or_else(|| {
                ChatError::Graph(format!("cannot parse cache input name `{}`", port.name))
            })?;
            let output = present.remove(&(layer, kind)).ok_or_else(|| {
                ChatError::Graph(format!("cache input `{}` has no matching output", port.name))
            })?;
            slots.insert(
                (layer, kind),
                CacheSlot {
                    layer,
                    kind,
                    input: port.name.clone(),
                    output,
                },
            );
        }

        if let Some(name) = present.values().next() {
            return Err(ChatError::Graph(format!(
                "cache output `{name}` has no matching input"
            )));
        }

        let num_layers = slots.len() / 2;
        for layer in 0..num_layers {
            for kind in [CacheKind::Key, CacheKind::Value] {
                if !slots.contains_key(&(layer, kind)) {
                    return Err(ChatError::Graph(format!(
                        "cache for layer {layer} is missing its {}",
                        kind.as_str()
                    )));
                }
            }
        }
        if slots.len() % 2 != 0 {
            return Err(ChatError::Graph("unpaired cache key/value ports".into()));
        }

        Ok(Self {
            slots: slots.into_values().collect(),
            num_layers,
        })
    }

    pub fn slots(&self) -> &[CacheSlot] {
        &self.slots
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Key and value tensors of one layer
#[derive(Debug, Clone)]
pub struct LayerKv {
    pub key: Tensor,
    pub value: Tensor,
}

/// Per-generation cache. Every tensor has the same length along the
/// sequence axis.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<LayerKv>,
    seq_axis: usize,
    len: usize,
}

impl KvCache {
    /// Zero-length placeholders built from the declared input shapes.
    ///
    /// A dynamic axis resolves to 0 on the sequence axis and to `batch` on the
    /// batch axis; any other dynamic axis cannot be materialized.
    pub fn empty(
        inputs: &[PortInfo],
        bindings: &CacheBindings,
        layout: CacheLayout,
        batch: usize,
        device: &Device,
    ) -> Result<Self> {
        let mut tensors = BTreeMap::new();
        for slot in bindings.slots() {
            let port = inputs
                .iter()
                .find(|p| p.name == slot.input)
                .ok_or_else(|| ChatError::Graph(format!("missing cache input `{}`", slot.input)))?;
            let shape = resolve_empty_shape(port, layout, batch)?;
            let t = Tensor::zeros(shape, port.element_type.dtype(), device)?;
            tensors.insert((slot.layer, slot.kind), t);
        }
        Self::from_slots(tensors, bindings.num_layers(), layout.seq_axis())
    }

    /// Collect the `present` outputs of a forward pass, removing them from `outputs`.
    pub fn from_outputs(
        outputs: &mut TensorMap,
        bindings: &CacheBindings,
        layout: CacheLayout,
    ) -> Result<Self> {
        let mut tensors = BTreeMap::new();
        for slot in bindings.slots() {
            let t = outputs.remove(&slot.output).ok_or_else(|| {
                ChatError::Engine(format!("engine did not return `{}`", slot.output))
            })?;
            tensors.insert((slot.layer, slot.kind), t);
        }
        Self::from_slots(tensors, bindings.num_layers(), layout.seq_axis())
    }

    fn from_slots(
        mut tensors: BTreeMap<(usize, CacheKind), Tensor>,
        num_layers: usize,
        seq_axis: usize,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        let mut len = None;
        for layer in 0..num_layers {
            let key = tensors
                .remove(&(layer, CacheKind::Key))
                .ok_or_else(|| ChatError::Graph(format!("missing key for layer {layer}")))?;
            let value = tensors
                .remove(&(layer, CacheKind::Value))
                .ok_or_else(|| ChatError::Graph(format!("missing value for layer {layer}")))?;
            for t in [&key, &value] {
                let l = t.dim(seq_axis)?;
                match len {
                    None => len = Some(l),
                    Some(expected) if expected != l => {
                        return Err(ChatError::Engine(format!(
                            "cache length mismatch in layer {layer}: {l} != {expected}"
                        )));
                    }
                    Some(_) => {}
                }
            }
            layers.push(LayerKv { key, value });
        }
        Ok(Self {
            layers,
            seq_axis,
            len: len.unwrap_or(0),
        })
    }

    /// Number of positions already cached
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn seq_axis(&self) -> usize {
        self.seq_axis
    }

    pub fn layer(&self, layer: usize) -> Option<&LayerKv> {
        self.layers.get(layer)
    }

    /// Bind every cache tensor to its input name
    pub fn bind(&self, bindings: &CacheBindings, inputs: &mut TensorMap) {
        for slot in bindings.slots() {
            if let Some(kv) = self.layers.get(slot.layer) {
                let t = match slot.kind {
                    CacheKind::Key => &kv.key,
                    CacheKind::Value => &kv.value,
                };
                inputs.insert(slot.input.clone(), t.clone());
            }
        }
    }
}

fn resolve_empty_shape(port: &PortInfo, layout: CacheLayout, batch: usize) -> Result<Vec<usize>> {
    port.shape
        .iter()
        .enumerate()
        .map(|(axis, dim)| match dim {
            Dim::Fixed(n) if axis == layout.seq_axis() => {
                if *n != 0 {
                    warn!("cache input `{}` declares a fixed sequence length {}", port.name, n);
                }
                Ok(0)
            }
            Dim::Fixed(n) => Ok(*n),
            Dim::Dynamic(_) if axis == layout.seq_axis() => Ok(0),
            Dim::Dynamic(_) if axis == layout.batch_axis() => Ok(batch),
            Dim::Dynamic(name) => Err(ChatError::Graph(format!(
                "cannot resolve dynamic axis {axis} (`{name}`) of cache input `{}`",
                port.name
            ))),
        })
        .collect()
}
