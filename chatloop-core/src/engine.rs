//! Decode loop - drives an inference engine one forward pass at a time
//!
//! The first pass feeds the whole prompt with an empty cache (prefill). Every
//! later pass feeds only the last sampled token together with the cache the
//! previous pass returned (decode). The same loop serves all families; the
//! adapter supplies the auxiliary tensor and cache layout.
//!
//! Generation stops when the sampled token is EOS or when the output holds
//! more than `max_generated_tokens` tokens. Both stop tokens are kept in the
//! output.

use candle_core::{DType, Device, IndexOp, Tensor};
use std::ops::ControlFlow;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{ChatError, Result};
use crate::graph::{GraphManifest, InferenceEngine, TensorMap, INPUT_IDS, LOGITS, MANIFEST_FILE};
use crate::kv_cache::{CacheBindings, KvCache};
use crate::model::{AuxState, ModelAdapter, ModelFamily, ModelRegistry};
use crate::request::{Conversation, FinishReason, GenerateOptions, SamplingParams};
use crate::runtime::CandleRuntime;
use crate::sampler::Sampler;
use crate::tokenizer::{HfTokenizer, Tokenizer, TOKENIZER_FILE};

/// Where a generation is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing has run yet
    Init,
    /// The prompt pass is running
    Prefill,
    /// The next pass is the n-th single-token pass
    Decode(usize),
    Done(FinishReason),
}

/// Mutable state of one generation. Never shared between generations.
#[derive(Debug, Clone)]
pub struct GenerationState {
    /// Tokens fed to the next forward pass
    pub input_tokens: Vec<u32>,
    /// Cache returned by the previous pass, `None` before prefill
    pub cache: Option<KvCache>,
    pub aux: AuxState,
    pub output_tokens: Vec<u32>,
    /// Forward passes run so far
    pub iterations: usize,
    pub phase: Phase,
    pub prompt_len: usize,
}

impl GenerationState {
    pub fn new(prompt_tokens: Vec<u32>, aux: AuxState) -> Self {
        Self {
            prompt_len: prompt_tokens.len(),
            input_tokens: prompt_tokens,
            cache: None,
            aux,
            output_tokens: Vec::new(),
            iterations: 0,
            phase: Phase::Init,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done(_))
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self.phase {
            Phase::Done(reason) => Some(reason),
            _ => None,
        }
    }

    /// Positions held by the cache
    pub fn cache_len(&self) -> usize {
        self.cache.as_ref().map_or(0, KvCache::len)
    }
}

/// Result of a single generation
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Generated tokens, including the stop token
    pub tokens: Vec<u32>,
    /// Post-processed response text
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    /// Forward passes run
    pub iterations: usize,
    pub elapsed: Duration,
    pub tokens_per_second: f64,
    pub finish_reason: FinishReason,
}

/// A generation in progress, borrowing the model it runs on
pub struct Generation<'a, E, T> {
    engine: &'a mut E,
    tokenizer: &'a T,
    adapter: &'a ModelAdapter,
    bindings: &'a CacheBindings,
    state: GenerationState,
    sampler: Sampler,
    sampling: SamplingParams,
    max_generated_tokens: usize,
    started: Instant,
}

impl<'a, E: InferenceEngine, T: Tokenizer> Generation<'a, E, T> {
    pub fn state(&self) -> &GenerationState {
        &self.state
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// Run one forward pass and sample one token.
    ///
    /// Returns `None` once the generation is done. A failed pass ends the
    /// generation with [`FinishReason::Error`].
    pub fn step(&mut self) -> Result<Option<u32>> {
        let decode_index = match self.state.phase {
            Phase::Done(_) => return Ok(None),
            Phase::Init => {
                debug!("Prefill: {} prompt tokens", self.state.input_tokens.len());
                self.state.phase = Phase::Prefill;
                0
            }
            Phase::Prefill => 0,
            Phase::Decode(n) => n,
        };

        match self.forward_and_sample(decode_index) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(
                    "Generation aborted after {} tokens: {}",
                    self.state.output_tokens.len(),
                    e
                );
                self.state.cache = None;
                self.state.phase = Phase::Done(FinishReason::Error);
                Err(e)
            }
        }
    }

    fn forward_and_sample(&mut self, decode_index: usize) -> Result<u32> {
        let device = self.engine.device().clone();
        let input_len = self.state.input_tokens.len();
        let ids: Vec<i64> = self.state.input_tokens.iter().map(|&t| t as i64).collect();
        let input_ids = Tensor::from_vec(ids, (1, input_len), &device)?;
        let batch = input_ids.dim(0)?;

        let mut inputs = TensorMap::new();
        inputs.insert(INPUT_IDS.to_string(), input_ids);
        inputs.insert(
            self.state.aux.kind().name().to_string(),
            self.state.aux.tensor(input_len, &device)?,
        );

        let cache = match self.state.cache.take() {
            Some(cache) => cache,
            None => KvCache::empty(self.engine.inputs(), self.bindings, self.adapter.layout, batch, &device)?,
        };
        let past_len = cache.len();
        cache.bind(self.bindings, &mut inputs);
        drop(cache);

        let mut outputs = self.engine.run(inputs)?;
        self.state.iterations += 1;

        let logits = take_last_logits(&mut outputs)?;
        let cache = KvCache::from_outputs(&mut outputs, self.bindings, self.adapter.layout)?;
        if !self.bindings.is_empty() && cache.len() != past_len + input_len {
            return Err(ChatError::Engine(format!(
                "cache length {} after a pass over {} tokens with {} cached",
                cache.len(),
                input_len,
                past_len
            )));
        }
        self.state.cache = Some(cache);
        self.state.aux.advance(input_len);

        let token = self.sampler.sample(&logits, &self.sampling)?;
        self.state.output_tokens.push(token);

        if token == self.tokenizer.eos_token_id() {
            debug!("EOS after {} tokens", self.state.output_tokens.len());
            self.state.phase = Phase::Done(FinishReason::Stop);
        } else if self.state.output_tokens.len() > self.max_generated_tokens {
            debug!("Length limit after {} tokens", self.state.output_tokens.len());
            self.state.phase = Phase::Done(FinishReason::Length);
        } else {
            self.state.input_tokens = vec![token];
            self.state.phase = Phase::Decode(decode_index + 1);
        }
        Ok(token)
    }

    /// Step until done
    pub fn run_to_end(&mut self) -> Result<()> {
        while self.step()?.is_some() {}
        Ok(())
    }

    /// Post-processed text of every token so far, special tokens included
    pub fn partial_text(&self) -> Result<String> {
        let text = self.tokenizer.decode(&self.state.output_tokens, false)?;
        Ok(self.adapter.postprocess(&text))
    }

    /// Decode the output with special tokens stripped and summarize.
    ///
    /// A generation that has not finished reports `Cancelled`, one whose pass
    /// failed reports `Error`.
    pub fn finish(self) -> Result<GenerationResult> {
        let elapsed = self.started.elapsed();
        let text = self.tokenizer.decode(&self.state.output_tokens, true)?;
        let text = self.adapter.postprocess(&text);
        let generated_tokens = self.state.output_tokens.len();
        let tokens_per_second = if elapsed.as_secs_f64() > 0.0 {
            generated_tokens as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let finish_reason = self.state.finish_reason().unwrap_or(FinishReason::Cancelled);
        info!(
            "Generated {} tokens in {:.3} s ({:.1} tok/s, {} passes, {:?})",
            generated_tokens,
            elapsed.as_secs_f64(),
            tokens_per_second,
            self.state.iterations,
            finish_reason
        );
        Ok(GenerationResult {
            tokens: self.state.output_tokens,
            text,
            prompt_tokens: self.state.prompt_len,
            generated_tokens,
            iterations: self.state.iterations,
            elapsed,
            tokens_per_second,
            finish_reason,
        })
    }
}

fn take_last_logits(outputs: &mut TensorMap) -> Result<Vec<f32>> {
    let logits = outputs
        .remove(LOGITS)
        .ok_or_else(|| ChatError::Engine(format!("engine did not return `{LOGITS}`")))?;
    let last = match logits.rank() {
        3 => {
            let seq = logits.dim(1)?;
            if seq == 0 {
                return Err(ChatError::Engine("empty logits".into()));
            }
            logits.i((0, seq - 1))?
        }
        2 => {
            let seq = logits.dim(0)?;
            if seq == 0 {
                return Err(ChatError::Engine("empty logits".into()));
            }
            logits.i(seq - 1)?
        }
        1 => logits,
        rank => {
            return Err(ChatError::Engine(format!("logits of rank {rank}")));
        }
    };
    Ok(last.to_dtype(DType::F32)?.to_vec1::<f32>()?)
}

/// Streaming view of a generation.
///
/// Each item is the post-processed text of every token so far. The pass that
/// samples the stop token yields nothing; call [`TextStream::finish`] for the
/// final text. Dropping the stream stops the generation.
pub struct TextStream<'a, E, T> {
    generation: Generation<'a, E, T>,
    failed: bool,
}

impl<'a, E: InferenceEngine, T: Tokenizer> TextStream<'a, E, T> {
    pub fn state(&self) -> &GenerationState {
        self.generation.state()
    }

    pub fn finish(self) -> Result<GenerationResult> {
        self.generation.finish()
    }
}

impl<'a, E: InferenceEngine, T: Tokenizer> Iterator for TextStream<'a, E, T> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.generation.step() {
            Ok(Some(_)) if self.generation.is_done() => None,
            Ok(Some(_)) => match self.generation.partial_text() {
                Ok(text) => Some(Ok(text)),
                Err(e) => {
                    self.failed = true;
                    self.generation.state.phase = Phase::Done(FinishReason::Error);
                    Some(Err(e))
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// An engine, a tokenizer and the adapter for their family
pub struct ChatModel<E, T> {
    engine: E,
    tokenizer: T,
    adapter: ModelAdapter,
    bindings: CacheBindings,
}

impl<E: InferenceEngine, T: Tokenizer> ChatModel<E, T> {
    /// Bind the cache ports and check the graph declares what the adapter feeds.
    pub fn new(engine: E, tokenizer: T, adapter: ModelAdapter) -> Result<Self> {
        let bindings = CacheBindings::from_ports(engine.inputs(), engine.outputs())?;
        for name in [INPUT_IDS, adapter.aux.name()] {
            if engine.input(name).is_none() {
                return Err(ChatError::Graph(format!(
                    "{} graph has no `{name}` input",
                    adapter.family
                )));
            }
        }
        if engine.output(LOGITS).is_none() {
            return Err(ChatError::Graph(format!("graph has no `{LOGITS}` output")));
        }
        info!(
            "Chat model ready: family={}, {} cache layers, eos={}",
            adapter.family,
            bindings.num_layers(),
            tokenizer.eos_token_id()
        );
        Ok(Self {
            engine,
            tokenizer,
            adapter,
            bindings,
        })
    }

    pub fn adapter(&self) -> &ModelAdapter {
        &self.adapter
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn bindings(&self) -> &CacheBindings {
        &self.bindings
    }

    pub fn build_prompt(&self, conversation: &Conversation, query: &str) -> String {
        self.adapter
            .build_prompt(&conversation.turns, query, &conversation.system)
    }

    /// Encode a prompt, keeping only its last `max_input_tokens` tokens
    pub fn encode_prompt(&self, prompt: &str, max_input_tokens: usize) -> Result<Vec<u32>> {
        let mut tokens = self.tokenizer.encode(prompt)?;
        if tokens.len() > max_input_tokens {
            warn!(
                "Prompt has {} tokens, keeping the last {}",
                tokens.len(),
                max_input_tokens
            );
            tokens.drain(..tokens.len() - max_input_tokens);
        }
        if tokens.is_empty() {
            return Err(ChatError::Tokenizer("prompt encoded to no tokens".into()));
        }
        Ok(tokens)
    }

    /// Start a generation with fresh state
    pub fn start(&mut self, prompt_tokens: &[u32], options: &GenerateOptions) -> Result<Generation<'_, E, T>> {
        if prompt_tokens.is_empty() {
            return Err(ChatError::Tokenizer("empty prompt".into()));
        }
        let sampling = options.sampling.unwrap_or(self.adapter.sampling);
        sampling.validate()?;

        Ok(Generation {
            engine: &mut self.engine,
            tokenizer: &self.tokenizer,
            adapter: &self.adapter,
            bindings: &self.bindings,
            state: GenerationState::new(prompt_tokens.to_vec(), self.adapter.aux_state()),
            sampler: Sampler::new(options.seed),
            sampling,
            max_generated_tokens: options.max_generated_tokens,
            started: Instant::now(),
        })
    }

    /// Generate to completion and return every token
    pub fn generate(&mut self, prompt_tokens: &[u32], options: &GenerateOptions) -> Result<GenerationResult> {
        let mut generation = self.start(prompt_tokens, options)?;
        generation.run_to_end()?;
        generation.finish()
    }

    /// Encode `prompt` and generate
    pub fn generate_text(&mut self, prompt: &str, options: &GenerateOptions) -> Result<GenerationResult> {
        let tokens = self.encode_prompt(prompt, options.max_input_tokens)?;
        self.generate(&tokens, options)
    }

    /// Generate lazily, one text update per pass
    pub fn stream(&mut self, prompt_tokens: &[u32], options: &GenerateOptions) -> Result<TextStream<'_, E, T>> {
        Ok(TextStream {
            generation: self.start(prompt_tokens, options)?,
            failed: false,
        })
    }

    /// Stream updates into `callback` until done or until it breaks
    pub fn generate_streaming<F>(
        &mut self,
        prompt_tokens: &[u32],
        options: &GenerateOptions,
        mut callback: F,
    ) -> Result<GenerationResult>
    where
        F: FnMut(&str) -> ControlFlow<()>,
    {
        let mut stream = self.stream(prompt_tokens, options)?;
        for update in stream.by_ref() {
            if callback(&update?).is_break() {
                debug!("Stream cancelled by consumer");
                break;
            }
        }
        stream.finish()
    }

    /// Answer `query` in `conversation` and record the turn
    pub fn chat(
        &mut self,
        conversation: &mut Conversation,
        query: &str,
        options: &GenerateOptions,
    ) -> Result<GenerationResult> {
        let prompt = self.build_prompt(conversation, query);
        let result = self.generate_text(&prompt, options)?;
        conversation.push(query, result.text.clone());
        Ok(result)
    }
}

/// A chat model running on the reference runtime
pub type LoadedModel = ChatModel<CandleRuntime, HfTokenizer>;

/// Load `graph.json`, weights and `tokenizer.json` from a model directory.
///
/// The family is taken from `family` when given, then from the manifest tag,
/// then from a family name in the directory path.
pub fn load_model(dir: impl AsRef<Path>, family: Option<ModelFamily>, device: &Device) -> Result<LoadedModel> {
    let dir = dir.as_ref();
    info!("Loading model from {:?}", dir);
    let registry = ModelRegistry::new();
    let manifest = GraphManifest::load(dir.join(MANIFEST_FILE))?;

    let mut adapter = match family {
        Some(family) => {
            if ModelFamily::from_str_loose(&manifest.family) != Some(family) {
                warn!(
                    "Using family {} although the graph declares `{}`",
                    family, manifest.family
                );
            }
            registry.get(family)?
        }
        None => registry
            .resolve_tag(&manifest.family)
            .or_else(|_| registry.detect(dir))?,
    };
    if let Some(eos) = &manifest.eos_token {
        adapter = adapter.with_eos_token(eos.clone());
    }

    let tokenizer = HfTokenizer::from_file(dir.join(TOKENIZER_FILE), &adapter.eos_candidates())?;
    let runtime = CandleRuntime::load(dir, manifest, device)?;
    ChatModel::new(runtime, tokenizer, adapter)
}
