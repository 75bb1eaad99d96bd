use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

/// Sampling parameters for one generation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Number of highest-probability candidates kept, must be > 0
    pub top_k: usize,
    /// Nucleus mass in (0, 1]
    pub top_p: f64,
    /// Logit temperature, must be > 0
    pub temperature: f64,
}

impl SamplingParams {
    pub fn new(top_k: usize, top_p: f64, temperature: f64) -> Self {
        Self { top_k, top_p, temperature }
    }

    /// Reject parameters outside `top_k > 0`, `0 < top_p <= 1`, `temperature > 0`.
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(ChatError::InvalidSampling("top_k must be at least 1".into()));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(ChatError::InvalidSampling(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !(self.temperature > 0.0) || !self.temperature.is_finite() {
            return Err(ChatError::InvalidSampling(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// Options for a single `generate` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Generation stops once the output holds more than this many tokens
    pub max_generated_tokens: usize,
    /// Over-long prompts keep only their trailing tokens
    pub max_input_tokens: usize,
    /// Overrides the family defaults when set
    pub sampling: Option<SamplingParams>,
    /// RNG seed for the sampler
    pub seed: u64,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_generated_tokens: 100,
            max_input_tokens: 2048,
            sampling: None,
            seed: 42,
        }
    }
}

impl GenerateOptions {
    pub fn with_max_tokens(mut self, max_generated_tokens: usize) -> Self {
        self.max_generated_tokens = max_generated_tokens;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = Some(sampling);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Reason for completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// The end-of-sequence token was sampled
    Stop,
    /// The output grew past `max_generated_tokens`
    Length,
    /// The consumer stopped pulling a stream before it finished
    Cancelled,
    /// A forward pass failed; the generation cannot continue
    Error,
}

/// Conversation history: ordered (query, response) turns plus an optional system string
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub system: String,
    pub turns: Vec<(String, String)>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            turns: Vec::new(),
        }
    }

    /// Append a finished turn
    pub fn push(&mut self, query: impl Into<String>, response: impl Into<String>) {
        self.turns.push((query.into(), response.into()));
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
