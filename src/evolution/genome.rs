//! Genome variation operators for prompt evolution.
//!
//! Provides id minting, crossover, mutation, immigration and gen-0 seeding.
//! Every operator takes its parents by reference and returns a brand new
//! [`Prompt`]; inherited tags are cloned verbatim so their guids survive.

use std::sync::Arc;

use rand::prelude::*;
use uuid::{Builder, Uuid};

use crate::collaborators::{CollaboratorError, GeneratedText, GenerationRequest, TagGenerator};
use crate::schema::{GenomeError, OperatorConfig, Origin, Prompt, PromptId, Tag, TagGuid, TagRole};

/// Random number generator wrapper for genome operations.
pub struct GenomeRng {
    rng: StdRng,
}

impl GenomeRng {
    /// Create from seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Create from OS entropy, for eras run without a fixed seed.
    pub fn random() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Mint a prompt id from the generator's stream.
    pub fn prompt_id(&mut self) -> PromptId {
        PromptId::from_uuid(self.uuid())
    }

    /// Mint a tag guid from the generator's stream.
    pub fn tag_guid(&mut self) -> TagGuid {
        TagGuid::from_uuid(self.uuid())
    }

    fn uuid(&mut self) -> Uuid {
        let mut bytes = [0u8; 16];
        self.rng.fill_bytes(&mut bytes);
        Builder::from_random_bytes(bytes).into_uuid()
    }

    /// Uniform value in `[0, 1)`.
    pub fn unit(&mut self) -> f64 {
        self.rng.r#gen()
    }

    /// Uniform index below `len`.
    pub fn index(&mut self, len: usize) -> usize {
        self.rng.gen_range(0..len)
    }

    /// `count` distinct roles in composition order.
    pub fn pick_roles(&mut self, count: usize) -> Vec<TagRole> {
        let mut roles = TagRole::ALL.to_vec();
        roles.shuffle(&mut self.rng);
        roles.truncate(count.min(TagRole::ALL.len()));
        roles.sort();
        roles
    }

    /// Recombine two parents.
    ///
    /// In single-tag mode one random role comes from `b` and the other four
    /// from `a`; otherwise each role is drawn independently from either parent.
    pub fn crossover(
        &mut self,
        a: &Prompt,
        b: &Prompt,
        single_tag: bool,
        generation: usize,
    ) -> Result<Prompt, GenomeError> {
        let prompt_id = self.prompt_id();
        if single_tag {
            let role = TagRole::ALL[self.index(TagRole::ALL.len())];
            return crossover_with_swap(a, b, role, prompt_id, generation);
        }

        let tags = TagRole::ALL
            .iter()
            .map(|&role| {
                let donor = if self.rng.gen_bool(0.5) { a } else { b };
                donor.tag(role).clone()
            })
            .collect();
        Prompt::new(
            prompt_id,
            generation,
            Origin::Crossover,
            vec![a.prompt_id(), b.prompt_id()],
            None,
            tags,
        )
    }
}

/// Child of `base` with the `swapped` role taken from `donor`.
pub fn crossover_with_swap(
    base: &Prompt,
    donor: &Prompt,
    swapped: TagRole,
    prompt_id: PromptId,
    generation: usize,
) -> Result<Prompt, GenomeError> {
    let tags = TagRole::ALL
        .iter()
        .map(|&role| {
            if role == swapped {
                donor.tag(role).clone()
            } else {
                base.tag(role).clone()
            }
        })
        .collect();
    Prompt::new(
        prompt_id,
        generation,
        Origin::Crossover,
        vec![base.prompt_id(), donor.prompt_id()],
        None,
        tags,
    )
}

/// Errors raised while producing new tag text.
#[derive(Debug, thiserror::Error)]
pub enum VariationError {
    #[error(transparent)]
    Genome(#[from] GenomeError),
    #[error("Tag generator failed for '{role}': {source}")]
    Generator {
        role: TagRole,
        #[source]
        source: CollaboratorError,
    },
    #[error("Tag generator returned unusable '{role}' text {attempts} times")]
    UnusableOutput { role: TagRole, attempts: usize },
}

/// Operators that need freshly generated tag text.
pub struct TagWriter {
    generator: Arc<dyn TagGenerator>,
    temperature: f64,
    max_attempts: usize,
}

impl TagWriter {
    pub fn new(generator: Arc<dyn TagGenerator>, operators: &OperatorConfig) -> Self {
        Self {
            generator,
            temperature: operators.generation_temperature,
            max_attempts: operators.max_generation_attempts.max(1),
        }
    }

    /// A generation-0 prompt with five freshly written tags.
    pub fn seed(&self, rng: &mut GenomeRng) -> Result<Prompt, VariationError> {
        self.fresh(rng, Origin::Initial, 0)
    }

    /// An immigrant for `generation`, written without any parent.
    pub fn immigrant(
        &self,
        rng: &mut GenomeRng,
        generation: usize,
    ) -> Result<Prompt, VariationError> {
        self.fresh(rng, Origin::Immigrant, generation)
    }

    fn fresh(
        &self,
        rng: &mut GenomeRng,
        kind: Origin,
        generation: usize,
    ) -> Result<Prompt, VariationError> {
        let mut tags = Vec::with_capacity(TagRole::ALL.len());
        let mut model_used = None;
        for role in TagRole::ALL {
            let generated = self.write(role, None)?;
            model_used.get_or_insert(generated.model);
            tags.push(Tag::fresh(role, rng.tag_guid(), generated.text, kind, None)?);
        }
        let prompt_id = rng.prompt_id();
        Ok(Prompt::new(
            prompt_id,
            generation,
            kind,
            Vec::new(),
            model_used,
            tags,
        )?)
    }

    /// Rewrite `tags_per_mutation` random roles of `parent`.
    ///
    /// Each rewritten tag gets a new guid pointing at the tag it replaces; the
    /// other roles are copied unchanged.
    pub fn mutate(
        &self,
        rng: &mut GenomeRng,
        parent: &Prompt,
        tags_per_mutation: usize,
        generation: usize,
    ) -> Result<Prompt, VariationError> {
        let roles = rng.pick_roles(tags_per_mutation.max(1));
        let mut tags = Vec::with_capacity(TagRole::ALL.len());
        let mut model_used = None;
        for role in TagRole::ALL {
            let original = parent.tag(role);
            if !roles.contains(&role) {
                tags.push(original.clone());
                continue;
            }
            let generated = self.write(role, Some(original.text()))?;
            model_used.get_or_insert(generated.model);
            tags.push(Tag::fresh(
                role,
                rng.tag_guid(),
                generated.text,
                Origin::Mutation,
                Some(original.guid()),
            )?);
        }
        let prompt_id = rng.prompt_id();
        Ok(Prompt::new(
            prompt_id,
            generation,
            Origin::Mutation,
            vec![parent.prompt_id()],
            model_used,
            tags,
        )?)
    }

    /// Ask the generator for usable text, retrying empty or unchanged output.
    fn write(&self, role: TagRole, existing: Option<&str>) -> Result<GeneratedText, VariationError> {
        let request = GenerationRequest {
            role,
            existing_text: existing.map(str::to_string),
            temperature: self.temperature,
        };
        for attempt in 1..=self.max_attempts {
            let generated = self
                .generator
                .generate(&request)
                .map_err(|source| VariationError::Generator { role, source })?;
            let text = generated.text.trim();
            let unchanged = existing.is_some_and(|e| e.trim() == text);
            if !text.is_empty() && !unchanged {
                return Ok(GeneratedText {
                    text: text.to_string(),
                    model: generated.model,
                });
            }
            log::warn!(
                "Generator {} returned unusable '{}' text (attempt {}/{})",
                generated.model,
                role,
                attempt,
                self.max_attempts
            );
        }
        Err(VariationError::UnusableOutput {
            role,
            attempts: self.max_attempts,
        })
    }
}
