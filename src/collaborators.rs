//! Interfaces to the external collaborators the evolution core depends on.
//!
//! Corpus access, tag generation, compression and judging are all provided
//! from outside the crate (LLM API clients, a corpus database). Implementations
//! must be `Send + Sync`: evaluation runs on a worker pool and shares them
//! read-only.

use serde::Deserialize;
use tiktoken_rs::CoreBPE;

use crate::schema::{CLARITY_MAX, FAITHFULNESS_MAX, JudgeResult, READABILITY_MAX, TagRole};

/// A failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{collaborator} failed: {message}")]
pub struct CollaboratorError {
    pub collaborator: &'static str,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self {
            collaborator,
            message: message.into(),
        }
    }
}

/// One evaluation paragraph drawn from the corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusSample {
    pub id: String,
    pub text: String,
}

/// Source of evaluation text.
pub trait CorpusProvider: Send + Sync {
    fn sample(&self, domain: &str) -> Result<CorpusSample, CollaboratorError>;
}

/// Request for freshly written tag text.
///
/// Carries only the role and, for mutation, the tag being replaced. Generation
/// never sees corpus text.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub role: TagRole,
    pub existing_text: Option<String>,
    pub temperature: f64,
}

/// Generated tag text plus the model that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedText {
    pub text: String,
    pub model: String,
}

/// Writes tag text for initial, mutated and immigrant tags.
pub trait TagGenerator: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Result<GeneratedText, CollaboratorError>;
}

/// Runs an assembled compression prompt against a model.
pub trait Compressor: Send + Sync {
    fn compress(&self, model: &str, prompt_text: &str) -> Result<String, CollaboratorError>;
}

/// Request to score one (original, compressed) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeRequest<'a> {
    pub model: &'a str,
    pub original: &'a str,
    pub compressed: &'a str,
    /// Always 0 for deterministic scoring.
    pub temperature: f64,
}

/// Raw verdict returned by a judge model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JudgeVerdict {
    pub faithfulness: f64,
    pub clarity: f64,
    pub readability: f64,
    /// Total reported by the model; recomputed from the sub-scores.
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub comments: String,
}

impl JudgeVerdict {
    /// Parse a judge model's JSON reply, tolerating markdown code fences.
    pub fn parse_response(raw: &str) -> Result<Self, CollaboratorError> {
        let mut body = raw.trim();
        if let Some(rest) = body.strip_prefix("```json") {
            body = rest;
        } else if let Some(rest) = body.strip_prefix("```") {
            body = rest;
        }
        if let Some(rest) = body.strip_suffix("```") {
            body = rest;
        }
        serde_json::from_str(body.trim()).map_err(|e| {
            let preview: String = raw.chars().take(200).collect();
            CollaboratorError::new("judge", format!("unparseable verdict ({e}): {preview}"))
        })
    }

    /// Convert to a [`JudgeResult`], rejecting sub-scores outside their scales.
    pub fn into_result(self) -> JudgeResult {
        let scales = [
            ("faithfulness", self.faithfulness, FAITHFULNESS_MAX),
            ("clarity", self.clarity, CLARITY_MAX),
            ("readability", self.readability, READABILITY_MAX),
        ];
        for (name, value, max) in scales {
            if !value.is_finite() || !(0.0..=max).contains(&value) {
                return JudgeResult::Failure {
                    reason: format!("{name} score {value} outside 0-{max}"),
                };
            }
        }

        let total = self.faithfulness + self.clarity + self.readability;
        if let Some(reported) = self.score
            && (reported - total).abs() > 1e-9
        {
            log::debug!("Judge reported total {reported}, sub-scores sum to {total}");
        }

        JudgeResult::Success {
            faithfulness: self.faithfulness,
            clarity: self.clarity,
            readability: self.readability,
            comments: self.comments,
        }
    }
}

/// Scores a compression on the fixed faithfulness/clarity/readability rubric.
pub trait Judge: Send + Sync {
    fn judge(&self, request: &JudgeRequest<'_>) -> Result<JudgeVerdict, CollaboratorError>;
}

/// Counts tokens for the token-based compression ratio.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Token counts under OpenAI's `cl100k_base` byte-pair encoding.
pub struct Cl100kTokenCounter {
    bpe: CoreBPE,
}

impl Cl100kTokenCounter {
    /// Load the bundled `cl100k_base` ranks.
    pub fn new() -> Result<Self, CollaboratorError> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| CollaboratorError::new("tokenizer", e.to_string()))?;
        Ok(Self { bpe })
    }
}

impl TokenCounter for Cl100kTokenCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}
