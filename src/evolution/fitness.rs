//! Fitness evaluation pipeline for prompt genomes.
//!
//! Each prompt is scored in three stages: the compression model runs the
//! assembled prompt over a corpus sample, every judge model scores the
//! (original, compressed) pair, and the weighted formula folds quality and
//! compression ratio into a single value in `[0, 1]`.
//!
//! Collaborator failures never escape this module. A failed compression is the
//! empty string and a failed judge is excluded from the average; both simply
//! drive fitness towards zero.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::collaborators::{Compressor, CorpusSample, Judge, JudgeRequest, TokenCounter};
use crate::schema::{
    CompressionMetric, Evaluation, EvaluationConfig, FitnessConfig, JudgeOutcome, JudgeResult,
    Prompt, QUALITY_MAX,
};

/// Evaluates prompts against corpus samples.
pub struct FitnessEvaluator {
    config: FitnessConfig,
    compression_model: String,
    judge_models: Vec<String>,
    compressor: Arc<dyn Compressor>,
    judge: Arc<dyn Judge>,
    token_counter: Arc<dyn TokenCounter>,
}

impl FitnessEvaluator {
    /// Create a new fitness evaluator.
    pub fn new(
        config: FitnessConfig,
        evaluation: &EvaluationConfig,
        compressor: Arc<dyn Compressor>,
        judge: Arc<dyn Judge>,
        token_counter: Arc<dyn TokenCounter>,
    ) -> Self {
        Self {
            config,
            compression_model: evaluation.compression_model.clone(),
            judge_models: evaluation.judge_models.clone(),
            compressor,
            judge,
            token_counter,
        }
    }

    /// Replace the token counter used for the token-based ratio.
    pub fn with_token_counter(mut self, token_counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = token_counter;
        self
    }

    /// Run compression, judging and fitness composition for one prompt.
    pub fn evaluate(&self, prompt: &Prompt, sample: &CorpusSample) -> Evaluation {
        let compressed_text = self.compress(prompt, &sample.text);
        let judge_details = self.judge_all(&sample.text, &compressed_text);

        let original_words = count_words(&sample.text);
        let compressed_words = count_words(&compressed_text);
        let original_tokens = self.token_counter.count(&sample.text);
        let compressed_tokens = self.token_counter.count(&compressed_text);

        let word_ratio = compression_ratio(original_words, compressed_words);
        let token_ratio = compression_ratio(original_tokens, compressed_tokens);
        let fitness_metric = self.config.metric();
        let chosen_ratio = match fitness_metric {
            CompressionMetric::Words => word_ratio,
            CompressionMetric::Tokens => token_ratio,
        };

        let quality_score_avg = average_quality(&judge_details);
        let survival = survival_factor(original_words, compressed_words);
        let fitness = compose_fitness(&self.config, quality_score_avg, chosen_ratio, survival);

        if !judge_details.iter().any(|j| j.result.is_success()) {
            log::error!(
                "All {} judges failed for prompt {}; fitness is 0",
                judge_details.len(),
                prompt.prompt_id()
            );
        }
        log::debug!(
            "Prompt {} fitness {:.4} (ratio {:.2}, quality {:.2}, survival {})",
            prompt.prompt_id(),
            fitness,
            chosen_ratio,
            quality_score_avg,
            survival
        );

        let quality_scores: BTreeMap<String, Option<f64>> = judge_details
            .iter()
            .map(|j| (j.model.clone(), j.result.score()))
            .collect();

        Evaluation {
            sample_id: sample.id.clone(),
            compression_model: self.compression_model.clone(),
            compressed_text,
            original_words,
            compressed_words,
            original_tokens,
            compressed_tokens,
            compression_ratio: word_ratio,
            token_compression_ratio: token_ratio,
            fitness_metric,
            quality_scores,
            quality_score_avg,
            survival_factor: survival,
            fitness,
            judge_details,
        }
    }

    /// Compressed text, or the empty string when the model call failed.
    fn compress(&self, prompt: &Prompt, sample_text: &str) -> String {
        let input = prompt.compression_input(sample_text);
        match self.compressor.compress(&self.compression_model, &input) {
            Ok(text) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    log::warn!(
                        "Compression with {} returned nothing for prompt {}",
                        self.compression_model,
                        prompt.prompt_id()
                    );
                }
                text
            }
            Err(e) => {
                log::warn!(
                    "Compression with {} failed for prompt {}: {}",
                    self.compression_model,
                    prompt.prompt_id(),
                    e
                );
                String::new()
            }
        }
    }

    /// Score with every judge model. Judges are independent, so they run in parallel.
    fn judge_all(&self, original: &str, compressed: &str) -> Vec<JudgeOutcome> {
        self.judge_models
            .par_iter()
            .map(|model| self.judge_one(model, original, compressed))
            .collect()
    }

    fn judge_one(&self, model: &str, original: &str, compressed: &str) -> JudgeOutcome {
        let start = Instant::now();
        let request = JudgeRequest {
            model,
            original,
            compressed,
            temperature: 0.0,
        };
        let result = match self.judge.judge(&request) {
            Ok(verdict) => verdict.into_result(),
            Err(e) => JudgeResult::Failure {
                reason: e.to_string(),
            },
        };
        if let JudgeResult::Failure { reason } = &result {
            log::warn!("Judge {model} failed: {reason}");
        }
        JudgeOutcome {
            model: model.to_string(),
            result,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

/// Whitespace-delimited word count.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// `original / compressed`, or 0 when nothing was produced.
pub fn compression_ratio(original: usize, compressed: usize) -> f64 {
    if compressed == 0 {
        0.0
    } else {
        original as f64 / compressed as f64
    }
}

/// 1 if the output is strictly shorter than the input (in words), else 0.
pub fn survival_factor(original_words: usize, compressed_words: usize) -> u8 {
    if compressed_words == 0 || compressed_words >= original_words {
        0
    } else {
        1
    }
}

/// Mean total score over successful judges; 0 when every judge failed.
pub fn average_quality(judge_details: &[JudgeOutcome]) -> f64 {
    let scores: Vec<f64> = judge_details
        .iter()
        .filter_map(|j| j.result.score())
        .collect();
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

/// Weighted fitness: `(wq * quality/10 + wc * min(ratio/cap, 1)) * survival`.
pub fn compose_fitness(
    config: &FitnessConfig,
    quality_score_avg: f64,
    ratio: f64,
    survival_factor: u8,
) -> f64 {
    if survival_factor == 0 {
        return 0.0;
    }
    let quality_norm = (quality_score_avg / QUALITY_MAX).clamp(0.0, 1.0);
    let compression_norm = normalize_compression(ratio, config.compression_cap);
    let raw = config.quality_weight * quality_norm + config.compression_weight * compression_norm;
    raw.clamp(0.0, 1.0)
}

/// Compression ratio scaled by the cap and clamped to `[0, 1]`.
pub fn normalize_compression(ratio: f64, cap: f64) -> f64 {
    if !ratio.is_finite() || ratio <= 0.0 {
        return 0.0;
    }
    (ratio / cap).min(1.0)
}
