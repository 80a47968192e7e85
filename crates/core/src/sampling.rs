use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::config::TokenIds;

/// Parameters controlling token sampling behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Temperature for logit scaling. 0.0 = greedy, higher = more random.
    pub temperature: f32,
    /// Nucleus sampling threshold (0..1). 1.0 = disabled.
    pub top_p: f32,
    /// Top-K filtering. 0 = disabled.
    pub top_k: u32,
    /// Penalty for repeated tokens. 1.0 = none, >1.0 discourages repeats.
    pub repetition_penalty: f32,
    /// Minimum probability relative to max. 0.0 = disabled.
    pub min_p: f32,
    /// Optional seed for deterministic sampling.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            min_p: 0.0,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < 1e-6
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        if seed.is_some() {
            self.seed = seed;
        }
        self
    }
}

/// Mutable state for sampling (holds the RNG for one generation).
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

/// Pick the next token from `logits` (length == vocab_size).
///
/// `context_tokens` is the whole sequence so far (prompt and generated) and
/// feeds the repetition penalty.
pub fn sample(
    logits: &[f32],
    params: &SamplingParams,
    context_tokens: &[u32],
    sampler_state: &mut SamplerState,
) -> u32 {
    let vocab_size = logits.len();
    let mut logits = logits.to_vec();

    if params.repetition_penalty != 1.0 {
        apply_repetition_penalty(&mut logits, context_tokens, params.repetition_penalty);
    }

    if params.is_greedy() {
        return argmax(&logits);
    }

    if params.temperature != 1.0 {
        let inv_temp = 1.0 / params.temperature;
        for logit in logits.iter_mut() {
            *logit *= inv_temp;
        }
    }

    // Filters mask logits to -inf in HuggingFace order, so each one sees the
    // distribution renormalized over what the previous one kept.
    if params.top_k > 0 && (params.top_k as usize) < vocab_size {
        apply_top_k(&mut logits, params.top_k as usize);
    }

    if params.top_p < 1.0 && params.top_p > 0.0 {
        apply_top_p(&mut logits, params.top_p);
    }

    if params.min_p > 0.0 {
        apply_min_p(&mut logits, params.min_p);
    }

    let probs = softmax(&logits);
    sample_from_probs(&probs, &mut sampler_state.rng)
}

/// Each distinct token is penalized once, however often it occurs.
fn apply_repetition_penalty(logits: &mut [f32], context_tokens: &[u32], penalty: f32) {
    let mut seen = context_tokens.to_vec();
    seen.sort_unstable();
    seen.dedup();
    for token_id in seen {
        let idx = token_id as usize;
        if idx < logits.len() {
            if logits[idx] > 0.0 {
                logits[idx] /= penalty;
            } else {
                logits[idx] *= penalty;
            }
        }
    }
}

/// Drop tokens less likely than `min_p` times the most likely one.
fn apply_min_p(logits: &mut [f32], min_p: f32) {
    let probs = softmax(logits);
    let max_prob = probs.iter().copied().fold(0.0f32, f32::max);
    let threshold = max_prob * min_p;
    for (logit, p) in logits.iter_mut().zip(probs) {
        if p < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// Keep the `k` highest logits; ties with the k-th survive.
fn apply_top_k(logits: &mut [f32], k: usize) {
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k.min(sorted.len()) - 1];
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// Nucleus filter over the surviving distribution: walking up from the least
/// likely token, drop every token whose cumulative mass stays within
/// `1 - top_p`. The most likely token is always kept.
fn apply_top_p(logits: &mut [f32], top_p: f32) {
    let probs = softmax(logits);
    let mut ascending: Vec<usize> = (0..probs.len()).collect();
    ascending.sort_unstable_by(|&a, &b| {
        probs[a].partial_cmp(&probs[b]).unwrap_or(std::cmp::Ordering::Equal)
    });

    let drop_mass = 1.0 - top_p;
    let mut cumsum = 0.0f32;
    for &idx in &ascending[..ascending.len().saturating_sub(1)] {
        cumsum += probs[idx];
        if cumsum > drop_mass {
            break;
        }
        logits[idx] = f32::NEG_INFINITY;
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> u32 {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i as u32;
        }
    }
    // Rounding left r above the total: take the last token with mass.
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .map(|i| i as u32)
        .unwrap_or(0)
}

// ─── Generation defaults ──────────────────────────────────────────────────

/// Decoding defaults shipped with a model in `generation_config.json`.
///
/// Missing fields take the HuggingFace `GenerationConfig` defaults, so an
/// absent file means greedy decoding.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default)]
    pub do_sample: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(default)]
    pub min_p: Option<f32>,
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_k() -> u32 {
    50
}

fn default_top_p() -> f32 {
    1.0
}

fn default_repetition_penalty() -> f32 {
    1.0
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            do_sample: false,
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            repetition_penalty: default_repetition_penalty(),
            min_p: None,
            eos_token_id: None,
            bos_token_id: None,
        }
    }
}

impl GenerationDefaults {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Sampling parameters implied by these defaults. Without `do_sample`
    /// every sampling knob is ignored and decoding is greedy.
    pub fn sampling_params(&self) -> SamplingParams {
        if !self.do_sample {
            return SamplingParams {
                repetition_penalty: self.repetition_penalty,
                ..SamplingParams::greedy()
            };
        }
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repetition_penalty: self.repetition_penalty,
            min_p: self.min_p.unwrap_or(0.0),
            seed: None,
        }
    }

    pub fn eos_token_ids(&self) -> Option<Vec<u32>> {
        self.eos_token_id.as_ref().map(TokenIds::to_vec)
    }
}
