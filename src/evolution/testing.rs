//! Fixed-sequence collaborator stubs shared by the evolution tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use uuid::Uuid;

use crate::collaborators::{
    CollaboratorError, Compressor, CorpusProvider, CorpusSample, GeneratedText,
    GenerationRequest, Judge, JudgeRequest, JudgeVerdict, TagGenerator, TokenCounter,
};
use crate::schema::{
    CompressionMetric, Evaluation, JudgeOutcome, JudgeResult, Origin, Prompt, PromptId, Tag,
    TagGuid, TagRole,
};

pub fn pid(n: u128) -> PromptId {
    PromptId::from_uuid(Uuid::from_u128(n))
}

pub fn guid(n: u128) -> TagGuid {
    TagGuid::from_uuid(Uuid::from_u128(n))
}

/// `words` distinct whitespace-separated words.
pub fn sample_text(words: usize) -> String {
    (0..words)
        .map(|i| format!("word{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Unscored gen-0 prompt whose tag guids are derived from `n`.
pub fn initial_prompt(n: u128) -> Prompt {
    let tags = TagRole::ALL
        .iter()
        .enumerate()
        .map(|(i, role)| {
            Tag::fresh(
                *role,
                guid(n * 100 + i as u128),
                format!("{role} instruction {n}"),
                Origin::Initial,
                None,
            )
            .unwrap()
        })
        .collect();
    Prompt::new(pid(n), 0, Origin::Initial, vec![], None, tags).unwrap()
}

/// Evaluation with a given fitness and one successful judge.
pub fn evaluation(fitness: f64) -> Evaluation {
    let mut quality_scores = BTreeMap::new();
    quality_scores.insert("stub".to_string(), Some(8.0));
    Evaluation {
        sample_id: "sample-0".into(),
        compression_model: "stub".into(),
        compressed_text: "short text".into(),
        original_words: 20,
        compressed_words: 2,
        original_tokens: 20,
        compressed_tokens: 2,
        compression_ratio: 10.0,
        token_compression_ratio: 10.0,
        fitness_metric: CompressionMetric::Words,
        quality_scores,
        quality_score_avg: 8.0,
        survival_factor: 1,
        fitness,
        judge_details: vec![JudgeOutcome {
            model: "stub".into(),
            result: JudgeResult::Success {
                faithfulness: 4.0,
                clarity: 2.0,
                readability: 2.0,
                comments: String::new(),
            },
            duration_ms: 0,
        }],
    }
}

/// Gen-0 prompt scored with `fitness`.
pub fn scored_prompt(n: u128, fitness: f64) -> Prompt {
    initial_prompt(n).with_evaluation(evaluation(fitness)).unwrap()
}

/// Gen-0 prompt whose compression failed.
pub fn failed_prompt(n: u128) -> Prompt {
    let mut failed = evaluation(0.0);
    failed.compressed_text = String::new();
    failed.compressed_words = 0;
    failed.survival_factor = 0;
    initial_prompt(n).with_evaluation(failed).unwrap()
}

/// The sample text embedded after the assembled instructions.
fn original_text(prompt_text: &str) -> &str {
    prompt_text
        .split_once("Original Text:\n")
        .map_or(prompt_text, |(_, text)| text)
}

/// Keeps the first `keep` words of the sample.
pub struct WordKeepingCompressor {
    keep: usize,
}

impl WordKeepingCompressor {
    pub fn new(keep: usize) -> Self {
        Self { keep }
    }
}

impl Compressor for WordKeepingCompressor {
    fn compress(&self, _model: &str, prompt_text: &str) -> Result<String, CollaboratorError> {
        Ok(original_text(prompt_text)
            .split_whitespace()
            .take(self.keep)
            .collect::<Vec<_>>()
            .join(" "))
    }
}

/// Keeps between 1 and 12 words, chosen by a checksum of the instructions.
pub struct ChecksumCompressor;

impl Compressor for ChecksumCompressor {
    fn compress(&self, model: &str, prompt_text: &str) -> Result<String, CollaboratorError> {
        let instructions = prompt_text
            .split_once("Original Text:\n")
            .map_or(prompt_text, |(head, _)| head);
        let checksum: usize = instructions.bytes().map(usize::from).sum();
        let keep = 1 + checksum % 12;
        WordKeepingCompressor::new(keep).compress(model, prompt_text)
    }
}

pub struct FailingCompressor;

impl Compressor for FailingCompressor {
    fn compress(&self, model: &str, _prompt_text: &str) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::new("compressor", format!("{model} timed out")))
    }
}

/// `per_word` tokens for every whitespace-separated word.
pub struct WordTokenCounter {
    pub per_word: usize,
}

impl TokenCounter for WordTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count() * self.per_word
    }
}

/// Returns fixed sub-scores per judge model; unknown models fail.
#[derive(Default)]
pub struct FixedJudge {
    default: Option<(f64, f64, f64)>,
    models: HashMap<String, (f64, f64, f64)>,
}

impl FixedJudge {
    pub fn uniform(faithfulness: f64, clarity: f64, readability: f64) -> Self {
        Self {
            default: Some((faithfulness, clarity, readability)),
            models: HashMap::new(),
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn with_model(
        mut self,
        model: &str,
        faithfulness: f64,
        clarity: f64,
        readability: f64,
    ) -> Self {
        self.models
            .insert(model.to_string(), (faithfulness, clarity, readability));
        self
    }
}

impl Judge for FixedJudge {
    fn judge(&self, request: &JudgeRequest<'_>) -> Result<JudgeVerdict, CollaboratorError> {
        let (faithfulness, clarity, readability) = self
            .models
            .get(request.model)
            .copied()
            .or(self.default)
            .ok_or_else(|| CollaboratorError::new("judge", format!("{} refused", request.model)))?;
        Ok(JudgeVerdict {
            faithfulness,
            clarity,
            readability,
            score: None,
            comments: String::new(),
        })
    }
}

/// Writes numbered tag text; optionally echoes the input for the first calls.
pub struct SequenceGenerator {
    calls: AtomicUsize,
    unusable_first: usize,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            unusable_first: 0,
        }
    }

    /// The first `count` calls return the existing text (or nothing).
    pub fn with_unusable_first(count: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            unusable_first: count,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TagGenerator for SequenceGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<GeneratedText, CollaboratorError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let text = if n < self.unusable_first {
            request.existing_text.clone().unwrap_or_default()
        } else {
            match &request.existing_text {
                Some(existing) => format!("{existing} / revision {n}"),
                None => format!("{} instruction {n}", request.role),
            }
        };
        Ok(GeneratedText {
            text,
            model: format!("gen-{}", n % 2),
        })
    }
}

pub struct FailingGenerator;

impl TagGenerator for FailingGenerator {
    fn generate(&self, _request: &GenerationRequest) -> Result<GeneratedText, CollaboratorError> {
        Err(CollaboratorError::new("generator", "missing API key"))
    }
}

/// Hands out the same text under sequential sample ids.
pub struct FixedCorpus {
    words: usize,
    calls: AtomicUsize,
}

impl FixedCorpus {
    pub fn new(words: usize) -> Self {
        Self {
            words,
            calls: AtomicUsize::new(0),
        }
    }
}

impl CorpusProvider for FixedCorpus {
    fn sample(&self, _domain: &str) -> Result<CorpusSample, CollaboratorError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CorpusSample {
            id: format!("sample-{n}"),
            text: sample_text(self.words),
        })
    }
}
