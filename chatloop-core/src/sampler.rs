//! Sampler module - turns a logits vector into one token id
//!
//! Temperature softmax, then top-k, then a nucleus cut that looks at the mass
//! *preceding* each candidate. The top candidate always has zero preceding
//! mass, so at least one candidate survives every cut.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{ChatError, Result};
use crate::request::SamplingParams;

/// Token sampler with a pluggable RNG
pub struct Sampler<R: Rng = StdRng> {
    rng: R,
}

impl Sampler<StdRng> {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl<R: Rng> Sampler<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    /// Sample a token index in `[0, logits.len())`
    pub fn sample(&mut self, logits: &[f32], params: &SamplingParams) -> Result<u32> {
        params.validate()?;
        let candidates = candidate_distribution(logits, params)?;

        let dist = WeightedIndex::new(candidates.iter().map(|(_, p)| *p))
            .map_err(|_| ChatError::DegenerateDistribution)?;
        let (token, _) = candidates[dist.sample(&mut self.rng)];
        Ok(token as u32)
    }
}

/// Softmax of `logits / temperature`.
pub fn softmax_with_temperature(logits: &[f32], temperature: f64) -> Vec<f64> {
    let scaled: Vec<f64> = logits.iter().map(|&l| l as f64 / temperature).collect();
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scaled.iter().map(|&s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// The top-k candidates in descending probability order with their final,
/// renormalized weights. Candidates removed by the nucleus cut keep weight 0.
///
/// Ties are broken by the lower vocabulary index first.
pub fn candidate_distribution(logits: &[f32], params: &SamplingParams) -> Result<Vec<(usize, f64)>> {
    if logits.is_empty() {
        return Err(ChatError::DegenerateDistribution);
    }
    let probs = softmax_with_temperature(logits, params.temperature);

    let mut order: Vec<usize> = (0..probs.len()).collect();
    // Stable sort keeps index order among equal probabilities
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
    order.truncate(params.top_k.min(probs.len()));

    let mut candidates: Vec<(usize, f64)> = order.into_iter().map(|i| (i, probs[i])).collect();

    let mut preceding = 0.0;
    for (_, p) in candidates.iter_mut() {
        let own = *p;
        if preceding > params.top_p {
            *p = 0.0;
        }
        preceding += own;
    }

    let total: f64 = candidates.iter().map(|(_, p)| p).sum();
    if !(total > 0.0) || !total.is_finite() {
        return Err(ChatError::DegenerateDistribution);
    }
    for (_, p) in candidates.iter_mut() {
        *p /= total;
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(top_k: usize, top_p: f64, temperature: f64) -> SamplingParams {
        SamplingParams::new(top_k, top_p, temperature)
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax_with_temperature(&[1.0, 2.0, 3.0], 1.0);
        let sum: f64 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_top_k_keeps_highest() {
        let logits = [0.0, 5.0, 1.0, 4.0, 2.0];
        let cands = candidate_distribution(&logits, &params(2, 1.0, 1.0)).unwrap();
        let ids: Vec<usize> = cands.iter().map(|(i, _)| *i).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_ties_broken_by_index() {
        let logits = [1.0, 3.0, 3.0, 3.0];
        let cands = candidate_distribution(&logits, &params(2, 1.0, 1.0)).unwrap();
        let ids: Vec<usize> = cands.iter().map(|(i, _)| *i).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_nucleus_cut_uses_preceding_mass() {
        // probs ~ [0.5, 0.3, 0.2] after softmax of ln values
        let logits = [0.5f32.ln(), 0.3f32.ln(), 0.2f32.ln()];
        // preceding masses: 0.0, 0.5, 0.8
        let cands = candidate_distribution(&logits, &params(3, 0.6, 1.0)).unwrap();
        assert!(cands[0].1 > 0.0);
        assert!(cands[1].1 > 0.0, "0.5 preceding mass does not exceed 0.6");
        assert_eq!(cands[2].1, 0.0, "0.8 preceding mass exceeds 0.6");

        // two equal logits give exactly 0.5 each; 0.5 preceding is not > 0.5
        let cands = candidate_distribution(&[0.0, 0.0], &params(2, 0.5, 1.0)).unwrap();
        assert_eq!(cands[1].1, 0.5);
        let cands = candidate_distribution(&[0.0, 0.0], &params(2, 0.49, 1.0)).unwrap();
        assert_eq!(cands[0].1, 1.0);
        assert_eq!(cands[1].1, 0.0);
    }

    #[test]
    fn test_tiny_top_p_keeps_top_candidate() {
        let logits = [2.0, 1.0, 0.5, 0.1];
        let cands = candidate_distribution(&logits, &params(4, 1e-9, 1.0)).unwrap();
        assert!((cands[0].1 - 1.0).abs() < 1e-12);
        assert!(cands[1..].iter().all(|(_, p)| *p == 0.0));

        let mut sampler = Sampler::new(7);
        for _ in 0..50 {
            assert_eq!(sampler.sample(&logits, &params(4, 1e-9, 1.0)).unwrap(), 0);
        }
    }

    #[test]
    fn test_renormalized_weights_sum_to_one() {
        let logits = [0.3, 1.7, -2.0, 0.9, 1.1];
        let cands = candidate_distribution(&logits, &params(4, 0.7, 0.8)).unwrap();
        let sum: f64 = cands.iter().map(|(_, p)| p).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_seeded_sampling_is_deterministic() {
        let logits: Vec<f32> = (0..64).map(|i| ((i * 37) % 11) as f32 * 0.3).collect();
        let p = params(20, 0.9, 1.2);
        let mut a = Sampler::new(1234);
        let mut b = Sampler::new(1234);
        for _ in 0..32 {
            assert_eq!(a.sample(&logits, &p).unwrap(), b.sample(&logits, &p).unwrap());
        }
    }

    #[test]
    fn test_large_logits_do_not_overflow() {
        let logits = [1000.0, 999.0, -1000.0];
        let mut sampler = Sampler::new(0);
        let token = sampler.sample(&logits, &params(3, 1.0, 1.0)).unwrap();
        assert!(token < 2);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut sampler = Sampler::new(0);
        assert!(sampler.sample(&[1.0, 2.0], &params(0, 0.5, 1.0)).is_err());
        assert!(matches!(
            candidate_distribution(&[], &params(1, 0.5, 1.0)),
            Err(ChatError::DegenerateDistribution)
        ));
    }
}
