//! Chatloop Core - cache-aware autoregressive decoding for exported chat models
//!
//! This crate implements the generation logic around an external inference graph:
//! - Sampling with temperature, top-k and nucleus (top-p) truncation
//! - Per-family chat prompt templates and response post-processing
//! - A single prefill/decode loop with batch and streaming output
//! - Adapters for ChatGLM2, Qwen, Baichuan2 and InternLM graphs
//! - A candle reference runtime for exported graphs

pub mod error;
pub mod request;
pub mod sampler;
pub mod prompt;
pub mod postprocess;
pub mod graph;
pub mod kv_cache;
pub mod tokenizer;
pub mod model;
pub mod engine;
pub mod runtime;

pub use error::{ChatError, Result};
pub use request::{Conversation, FinishReason, GenerateOptions, SamplingParams};
pub use sampler::Sampler;
pub use prompt::PromptTemplate;
pub use postprocess::process_response;
pub use graph::{Dim, ElementType, GraphManifest, InferenceEngine, NetworkConfig, PortInfo, SharedEngine, TensorMap};
pub use kv_cache::{CacheBindings, CacheLayout, KvCache};
pub use tokenizer::{HfTokenizer, Tokenizer};
pub use model::{AuxInput, ModelAdapter, ModelFamily, ModelRegistry};
pub use engine::{load_model, ChatModel, Generation, GenerationResult, GenerationState, LoadedModel, Phase, TextStream};
pub use runtime::CandleRuntime;
