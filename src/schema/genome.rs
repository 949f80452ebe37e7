//! Prompt genome types: tags, prompts and their evaluation records.
//!
//! A [`Prompt`] is an ordered set of exactly five [`Tag`]s, one per
//! [`TagRole`]. Both are write-once: operators build new records instead of
//! editing existing ones, and a prompt receives its [`Evaluation`] exactly once.
//! Identity is keyed on `guid` / `prompt_id` only, never on text.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum faithfulness sub-score a judge may award.
pub const FAITHFULNESS_MAX: f64 = 5.0;
/// Maximum clarity sub-score a judge may award.
pub const CLARITY_MAX: f64 = 3.0;
/// Maximum readability sub-score a judge may award.
pub const READABILITY_MAX: f64 = 2.0;
/// Maximum total quality score (sum of the three sub-scales).
pub const QUALITY_MAX: f64 = FAITHFULNESS_MAX + CLARITY_MAX + READABILITY_MAX;

/// The five tag roles, in composition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagRole {
    /// Expertise and task.
    Role,
    /// Compression strategy.
    CompressionTarget,
    /// What must be preserved.
    Fidelity,
    /// What to leave out.
    Constraints,
    /// Format and style of the result.
    Output,
}

impl TagRole {
    /// All roles in the fixed composition order.
    pub const ALL: [TagRole; 5] = [
        TagRole::Role,
        TagRole::CompressionTarget,
        TagRole::Fidelity,
        TagRole::Constraints,
        TagRole::Output,
    ];

    /// Position of this role inside a prompt.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TagRole::Role => "role",
            TagRole::CompressionTarget => "compression_target",
            TagRole::Fidelity => "fidelity",
            TagRole::Constraints => "constraints",
            TagRole::Output => "output",
        }
    }
}

impl fmt::Display for TagRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a prompt was produced, or how a tag's text was first minted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Written from scratch for generation 0.
    Initial,
    /// Rewritten from one parent.
    Mutation,
    /// Recombined from two parents.
    Crossover,
    /// Written from scratch after generation 0.
    Immigrant,
}

impl Origin {
    /// Number of parent prompts a prompt of this kind must reference.
    pub fn expected_parents(self) -> usize {
        match self {
            Origin::Initial | Origin::Immigrant => 0,
            Origin::Mutation => 1,
            Origin::Crossover => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Initial => "initial",
            Origin::Mutation => "mutation",
            Origin::Crossover => "crossover",
            Origin::Immigrant => "immigrant",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque prompt identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptId(Uuid);

impl PromptId {
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for PromptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque tag identifier. Minted only when tag text is freshly generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagGuid(Uuid);

impl TagGuid {
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TagGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One named component of a prompt genome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    role: TagRole,
    /// Identity; equality and hashing use only this.
    guid: TagGuid,
    /// Instruction text, non-empty.
    text: String,
    /// Operator that minted the text. Never `Crossover`.
    origin: Origin,
    /// Tag this one was rewritten from; set exactly for mutation tags.
    parent_guid: Option<TagGuid>,
}

impl Tag {
    /// Mint a tag with freshly generated text.
    ///
    /// Mutation tags must name the tag they were derived from; initial and
    /// immigrant tags must not. Crossover never mints tags.
    pub fn fresh(
        role: TagRole,
        guid: TagGuid,
        text: impl Into<String>,
        origin: Origin,
        parent_guid: Option<TagGuid>,
    ) -> Result<Self, GenomeError> {
        let tag = Self {
            role,
            guid,
            text: text.into(),
            origin,
            parent_guid,
        };
        tag.validate()?;
        Ok(tag)
    }

    /// Check the origin/parent rules and non-empty text.
    pub fn validate(&self) -> Result<(), GenomeError> {
        if self.text.trim().is_empty() {
            return Err(GenomeError::EmptyTagText { role: self.role });
        }
        match (self.origin, self.parent_guid) {
            (Origin::Crossover, _) => Err(GenomeError::CrossoverMintedTag { role: self.role }),
            (Origin::Mutation, Some(_)) => Ok(()),
            (Origin::Initial | Origin::Immigrant, None) => Ok(()),
            (origin, _) => Err(GenomeError::TagParentMismatch {
                role: self.role,
                origin,
            }),
        }
    }

    pub fn role(&self) -> TagRole {
        self.role
    }

    pub fn guid(&self) -> TagGuid {
        self.guid
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn parent_guid(&self) -> Option<TagGuid> {
        self.parent_guid
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.guid == other.guid
    }
}

impl Eq for Tag {}

impl Hash for Tag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.guid.hash(state);
    }
}

/// A complete prompt genome plus its (optional, write-once) evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    prompt_id: PromptId,
    /// Generation in which this prompt was created. Never re-stamped.
    generation: usize,
    /// Operator that produced the prompt.
    #[serde(rename = "type")]
    kind: Origin,
    /// None for initial and immigrant prompts, one for mutants, two distinct
    /// for crossover children.
    parent_ids: Vec<PromptId>,
    /// Generator model that wrote this prompt's new text; `None` for crossover.
    model_used: Option<String>,
    /// One tag per role, indexed by [`TagRole::index`].
    tags: [Tag; 5],
    /// Set once, by the fitness pipeline.
    evaluation: Option<Evaluation>,
}

impl Prompt {
    /// Build an unscored prompt, validating role coverage and parent cardinality.
    pub fn new(
        prompt_id: PromptId,
        generation: usize,
        kind: Origin,
        parent_ids: Vec<PromptId>,
        model_used: Option<String>,
        tags: Vec<Tag>,
    ) -> Result<Self, GenomeError> {
        let mut slots: [Option<Tag>; 5] = Default::default();
        for tag in tags {
            let slot = &mut slots[tag.role.index()];
            if slot.is_some() {
                return Err(GenomeError::DuplicateRole(tag.role));
            }
            *slot = Some(tag);
        }

        let mut ordered = Vec::with_capacity(5);
        for (role, slot) in TagRole::ALL.into_iter().zip(slots) {
            ordered.push(slot.ok_or(GenomeError::MissingRole(role))?);
        }
        let tags: [Tag; 5] = ordered
            .try_into()
            .map_err(|_| GenomeError::MissingRole(TagRole::Role))?;

        let prompt = Self {
            prompt_id,
            generation,
            kind,
            parent_ids,
            model_used,
            tags,
            evaluation: None,
        };
        prompt.validate()?;
        Ok(prompt)
    }

    /// Re-check structural invariants (used after deserialization).
    pub fn validate(&self) -> Result<(), GenomeError> {
        let expected = self.kind.expected_parents();
        if self.parent_ids.len() != expected {
            return Err(GenomeError::ParentCardinality {
                kind: self.kind,
                expected,
                actual: self.parent_ids.len(),
            });
        }
        if self.kind == Origin::Crossover && self.parent_ids[0] == self.parent_ids[1] {
            return Err(GenomeError::DuplicateParent(self.parent_ids[0]));
        }
        for (role, tag) in TagRole::ALL.into_iter().zip(&self.tags) {
            if tag.role != role {
                return Err(GenomeError::MisplacedTag {
                    slot: role,
                    found: tag.role,
                });
            }
            tag.validate()?;
        }
        Ok(())
    }

    /// Attach the evaluation. A prompt can be scored exactly once.
    pub fn with_evaluation(mut self, evaluation: Evaluation) -> Result<Self, GenomeError> {
        if self.evaluation.is_some() {
            return Err(GenomeError::AlreadyEvaluated(self.prompt_id));
        }
        self.evaluation = Some(evaluation);
        Ok(self)
    }

    /// The five tag texts in composition order, separated by blank lines.
    pub fn instruction_text(&self) -> String {
        self.tags
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Full text sent to the compression model for a given sample.
    pub fn compression_input(&self, sample_text: &str) -> String {
        format!(
            "{}\n\nOriginal Text:\n{}",
            self.instruction_text(),
            sample_text
        )
    }

    pub fn prompt_id(&self) -> PromptId {
        self.prompt_id
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn kind(&self) -> Origin {
        self.kind
    }

    pub fn parent_ids(&self) -> &[PromptId] {
        &self.parent_ids
    }

    pub fn model_used(&self) -> Option<&str> {
        self.model_used.as_deref()
    }

    pub fn tags(&self) -> &[Tag; 5] {
        &self.tags
    }

    pub fn tag(&self, role: TagRole) -> &Tag {
        &self.tags[role.index()]
    }

    pub fn evaluation(&self) -> Option<&Evaluation> {
        self.evaluation.as_ref()
    }

    pub fn is_scored(&self) -> bool {
        self.evaluation.is_some()
    }

    /// Fitness, or `None` while unscored.
    pub fn fitness(&self) -> Option<f64> {
        self.evaluation.as_ref().map(|e| e.fitness)
    }
}

impl PartialEq for Prompt {
    fn eq(&self, other: &Self) -> bool {
        self.prompt_id == other.prompt_id
    }
}

impl Eq for Prompt {}

impl Hash for Prompt {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.prompt_id.hash(state);
    }
}

/// Which compression ratio feeds the fitness formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMetric {
    /// Whitespace-delimited words.
    #[default]
    Words,
    /// `cl100k_base` tokens.
    Tokens,
}

impl CompressionMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionMetric::Words => "words",
            CompressionMetric::Tokens => "tokens",
        }
    }
}

/// Outcome of one judge call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JudgeResult {
    /// In-range sub-scores.
    Success {
        /// 0-5.
        faithfulness: f64,
        /// 0-3.
        clarity: f64,
        /// 0-2.
        readability: f64,
        comments: String,
    },
    /// The call failed, the reply did not parse, or a sub-score was out of range.
    Failure { reason: String },
}

impl JudgeResult {
    /// Total 0-10 score; `None` for failures.
    pub fn score(&self) -> Option<f64> {
        match self {
            JudgeResult::Success {
                faithfulness,
                clarity,
                readability,
                ..
            } => Some(faithfulness + clarity + readability),
            JudgeResult::Failure { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JudgeResult::Success { .. })
    }
}

/// A judge result tagged with the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeOutcome {
    /// Judge model name, as configured.
    pub model: String,
    pub result: JudgeResult,
    /// Wall time of the judge call.
    pub duration_ms: u64,
}

/// Evaluation fields populated once by the fitness pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Corpus sample the prompt was evaluated against.
    pub sample_id: String,
    /// Model that produced `compressed_text`.
    pub compression_model: String,
    /// Empty when compression failed.
    pub compressed_text: String,
    /// Word count of the sample.
    pub original_words: usize,
    /// Word count of the compressed text.
    pub compressed_words: usize,
    /// `cl100k_base` token count of the sample.
    pub original_tokens: usize,
    /// `cl100k_base` token count of the compressed text.
    pub compressed_tokens: usize,
    /// Word-based ratio; 0 when nothing was produced.
    pub compression_ratio: f64,
    /// Token-based ratio; 0 when nothing was produced.
    pub token_compression_ratio: f64,
    /// Ratio that fed the fitness formula.
    pub fitness_metric: CompressionMetric,
    /// Per-judge total score, `None` for failed judges.
    pub quality_scores: BTreeMap<String, Option<f64>>,
    /// Mean 0-10 score over successful judges; 0 when all failed.
    pub quality_score_avg: f64,
    /// 1 when the output has fewer words than the sample, else 0.
    pub survival_factor: u8,
    /// Weighted score in `[0, 1]`.
    pub fitness: f64,
    /// One entry per configured judge, in configuration order.
    pub judge_details: Vec<JudgeOutcome>,
}

impl Evaluation {
    /// Compression produced nothing, or no judge returned a score.
    pub fn is_total_failure(&self) -> bool {
        self.compressed_text.is_empty() || self.successful_judges() == 0
    }

    /// Judges that returned an in-range score.
    pub fn successful_judges(&self) -> usize {
        self.judge_details
            .iter()
            .filter(|j| j.result.is_success())
            .count()
    }
}

/// Structural errors in tags and prompts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenomeError {
    #[error("Tag role '{0}' appears more than once")]
    DuplicateRole(TagRole),
    #[error("Tag role '{0}' is missing")]
    MissingRole(TagRole),
    #[error("Tag '{role}' has empty text")]
    EmptyTagText { role: TagRole },
    #[error("Tag '{role}' cannot be minted by crossover")]
    CrossoverMintedTag { role: TagRole },
    #[error("Tag '{role}' with origin '{origin}' has an inconsistent parent guid")]
    TagParentMismatch { role: TagRole, origin: Origin },
    #[error("Slot '{slot}' holds a tag with role '{found}'")]
    MisplacedTag { slot: TagRole, found: TagRole },
    #[error("A {kind} prompt needs {expected} parent(s), got {actual}")]
    ParentCardinality {
        kind: Origin,
        expected: usize,
        actual: usize,
    },
    #[error("Crossover parents must be distinct, got {0} twice")]
    DuplicateParent(PromptId),
    #[error("Prompt {0} has already been evaluated")]
    AlreadyEvaluated(PromptId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid(n: u128) -> TagGuid {
        TagGuid::from_uuid(Uuid::from_u128(n))
    }

    fn pid(n: u128) -> PromptId {
        PromptId::from_uuid(Uuid::from_u128(n))
    }

    fn initial_tags(base: u128) -> Vec<Tag> {
        TagRole::ALL
            .iter()
            .enumerate()
            .map(|(i, role)| {
                Tag::fresh(
                    *role,
                    guid(base + i as u128),
                    format!("{role} text"),
                    Origin::Initial,
                    None,
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_prompt_orders_tags_by_role() {
        let mut tags = initial_tags(10);
        tags.reverse();
        let prompt = Prompt::new(pid(1), 0, Origin::Initial, vec![], None, tags).unwrap();

        for (role, tag) in TagRole::ALL.iter().zip(prompt.tags()) {
            assert_eq!(tag.role(), *role);
        }
        assert!(prompt.instruction_text().starts_with("role text\n\ncompression_target"));
    }

    #[test]
    fn test_missing_and_duplicate_roles_rejected() {
        let mut tags = initial_tags(10);
        tags.pop();
        assert_eq!(
            Prompt::new(pid(1), 0, Origin::Initial, vec![], None, tags).unwrap_err(),
            GenomeError::MissingRole(TagRole::Output)
        );

        let mut tags = initial_tags(10);
        tags[4] = Tag::fresh(TagRole::Role, guid(99), "again", Origin::Initial, None).unwrap();
        assert_eq!(
            Prompt::new(pid(1), 0, Origin::Initial, vec![], None, tags).unwrap_err(),
            GenomeError::DuplicateRole(TagRole::Role)
        );
    }

    #[test]
    fn test_parent_cardinality_checked() {
        let err = Prompt::new(pid(1), 1, Origin::Mutation, vec![], None, initial_tags(0));
        assert!(matches!(
            err,
            Err(GenomeError::ParentCardinality {
                expected: 1,
                actual: 0,
                ..
            })
        ));

        let err = Prompt::new(pid(1), 1, Origin::Immigrant, vec![pid(2)], None, initial_tags(0));
        assert!(matches!(err, Err(GenomeError::ParentCardinality { .. })));

        let err = Prompt::new(
            pid(1),
            1,
            Origin::Crossover,
            vec![pid(2), pid(2)],
            None,
            initial_tags(0),
        );
        assert_eq!(err.unwrap_err(), GenomeError::DuplicateParent(pid(2)));

        assert!(
            Prompt::new(
                pid(1),
                1,
                Origin::Crossover,
                vec![pid(2), pid(3)],
                None,
                initial_tags(0)
            )
            .is_ok()
        );
    }

    #[test]
    fn test_tag_origin_rules() {
        assert!(matches!(
            Tag::fresh(TagRole::Output, guid(1), "x", Origin::Crossover, None),
            Err(GenomeError::CrossoverMintedTag { .. })
        ));
        assert!(matches!(
            Tag::fresh(TagRole::Output, guid(1), "x", Origin::Mutation, None),
            Err(GenomeError::TagParentMismatch { .. })
        ));
        assert!(matches!(
            Tag::fresh(TagRole::Output, guid(1), "x", Origin::Initial, Some(guid(2))),
            Err(GenomeError::TagParentMismatch { .. })
        ));
        assert!(matches!(
            Tag::fresh(TagRole::Output, guid(1), "   ", Origin::Initial, None),
            Err(GenomeError::EmptyTagText { .. })
        ));
    }

    #[test]
    fn test_identity_ignores_text() {
        let a = Tag::fresh(TagRole::Role, guid(1), "same", Origin::Initial, None).unwrap();
        let b = Tag::fresh(TagRole::Role, guid(2), "same", Origin::Initial, None).unwrap();
        assert_ne!(a, b);

        let c = Tag::fresh(TagRole::Role, guid(1), "different", Origin::Initial, None).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_evaluation_is_write_once() {
        let prompt = Prompt::new(pid(1), 0, Origin::Initial, vec![], None, initial_tags(0)).unwrap();
        let evaluation = Evaluation {
            sample_id: "s".into(),
            compression_model: "m".into(),
            compressed_text: "short".into(),
            original_words: 10,
            compressed_words: 1,
            original_tokens: 12,
            compressed_tokens: 1,
            compression_ratio: 10.0,
            token_compression_ratio: 12.0,
            fitness_metric: CompressionMetric::Words,
            quality_scores: BTreeMap::new(),
            quality_score_avg: 0.0,
            survival_factor: 1,
            fitness: 0.125,
            judge_details: Vec::new(),
        };

        let scored = prompt.with_evaluation(evaluation.clone()).unwrap();
        assert_eq!(scored.fitness(), Some(0.125));
        assert!(scored.evaluation().unwrap().is_total_failure());
        assert_eq!(scored.evaluation().unwrap().successful_judges(), 0);
        assert_eq!(
            scored.with_evaluation(evaluation).unwrap_err(),
            GenomeError::AlreadyEvaluated(pid(1))
        );
    }

    #[test]
    fn test_prompt_serialization_uses_type_key() {
        let prompt = Prompt::new(pid(1), 0, Origin::Initial, vec![], None, initial_tags(0)).unwrap();
        let json = serde_json::to_value(&prompt).unwrap();
        assert_eq!(json["type"], "initial");
        assert_eq!(json["tags"][1]["role"], "compression_target");

        let parsed: Prompt = serde_json::from_value(json).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed, prompt);
    }
}
