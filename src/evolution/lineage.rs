//! Lineage index over every prompt and tag an era has produced.
//!
//! Prompts link to parents through `parent_ids`; tags link to the tag they
//! were mutated from through `parent_guid`. The index answers ancestry
//! queries for analysis and checks the structural invariants that make the
//! lineage graph trustworthy: resolvable parents, strictly older parents,
//! chains that end at a generation-0 initial prompt or an immigrant, and
//! inherited tags that are reused verbatim.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::schema::{GenomeError, OperatorCounts, Origin, Prompt, PromptId, Tag, TagGuid, TagRole};

/// Lineage invariant violations. All of them are fatal for a running era.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LineageError {
    #[error("Prompt {0} is not in the lineage index")]
    UnknownPrompt(PromptId),
    #[error("Tag {0} is not in the lineage index")]
    UnknownTag(TagGuid),
    #[error("Prompt {child} references unknown parent {parent}")]
    UnresolvedParent { child: PromptId, parent: PromptId },
    #[error(
        "Prompt {child} (generation {child_generation}) has parent {parent} from generation {parent_generation}"
    )]
    ParentNotOlder {
        child: PromptId,
        child_generation: usize,
        parent: PromptId,
        parent_generation: usize,
    },
    #[error("Prompt {prompt} is a parentless {kind} in generation {generation}")]
    InvalidRoot {
        prompt: PromptId,
        kind: Origin,
        generation: usize,
    },
    #[error("Tag {0} was reused with different text or role")]
    TagConflict(TagGuid),
    #[error("Prompt {prompt} carries a '{role}' tag its parents cannot explain")]
    ForeignTag { prompt: PromptId, role: TagRole },
    #[error("Tag ancestry of {0} loops back on itself")]
    CircularTagChain(TagGuid),
    #[error(transparent)]
    Genome(#[from] GenomeError),
}

/// Index of prompts and tags keyed by identity.
#[derive(Debug, Default)]
pub struct LineageIndex {
    prompts: HashMap<PromptId, Prompt>,
    order: Vec<PromptId>,
    children: HashMap<PromptId, Vec<PromptId>>,
    tags: HashMap<TagGuid, Tag>,
    carriers: HashMap<TagGuid, Vec<PromptId>>,
}

impl LineageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a prompt and its tags.
    ///
    /// Re-inserting a known prompt id (an elite seen in a later generation)
    /// is a no-op and returns `false`.
    pub fn insert(&mut self, prompt: Prompt) -> Result<bool, LineageError> {
        let id = prompt.prompt_id();
        if self.prompts.contains_key(&id) {
            return Ok(false);
        }

        for tag in prompt.tags() {
            if let Some(known) = self.tags.get(&tag.guid())
                && (known.text() != tag.text() || known.role() != tag.role())
            {
                return Err(LineageError::TagConflict(tag.guid()));
            }
        }
        for tag in prompt.tags() {
            self.tags.entry(tag.guid()).or_insert_with(|| tag.clone());
            self.carriers.entry(tag.guid()).or_default().push(id);
        }
        for parent in prompt.parent_ids() {
            self.children.entry(*parent).or_default().push(id);
        }

        self.order.push(id);
        self.prompts.insert(id, prompt);
        Ok(true)
    }

    pub fn get(&self, id: PromptId) -> Option<&Prompt> {
        self.prompts.get(&id)
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Prompts in insertion order.
    pub fn prompts(&self) -> impl Iterator<Item = &Prompt> {
        self.order.iter().filter_map(|id| self.prompts.get(id))
    }

    fn require(&self, id: PromptId) -> Result<&Prompt, LineageError> {
        self.prompts.get(&id).ok_or(LineageError::UnknownPrompt(id))
    }

    fn parent_of(&self, child: PromptId, parent: PromptId) -> Result<&Prompt, LineageError> {
        self.prompts
            .get(&parent)
            .ok_or(LineageError::UnresolvedParent { child, parent })
    }

    /// Check one prompt against its direct parents.
    pub fn validate_prompt(&self, id: PromptId) -> Result<(), LineageError> {
        let prompt = self.require(id)?;
        prompt.validate()?;

        let parents = prompt
            .parent_ids()
            .iter()
            .map(|parent| self.parent_of(id, *parent))
            .collect::<Result<Vec<_>, _>>()?;

        for parent in &parents {
            if parent.generation() >= prompt.generation() {
                return Err(LineageError::ParentNotOlder {
                    child: id,
                    child_generation: prompt.generation(),
                    parent: parent.prompt_id(),
                    parent_generation: parent.generation(),
                });
            }
        }

        let foreign = |role| LineageError::ForeignTag { prompt: id, role };
        match prompt.kind() {
            Origin::Initial | Origin::Immigrant => {
                let valid_root = prompt.kind() == Origin::Immigrant || prompt.generation() == 0;
                if !valid_root {
                    return Err(LineageError::InvalidRoot {
                        prompt: id,
                        kind: prompt.kind(),
                        generation: prompt.generation(),
                    });
                }
                if let Some(tag) = prompt.tags().iter().find(|t| t.origin() != prompt.kind()) {
                    return Err(foreign(tag.role()));
                }
            }
            Origin::Crossover => {
                for tag in prompt.tags() {
                    let inherited = parents
                        .iter()
                        .any(|p| p.tag(tag.role()).guid() == tag.guid());
                    if !inherited {
                        return Err(foreign(tag.role()));
                    }
                }
            }
            Origin::Mutation => {
                let parent = parents[0];
                for tag in prompt.tags() {
                    let source = parent.tag(tag.role()).guid();
                    let copied = tag.guid() == source;
                    let rewritten =
                        tag.origin() == Origin::Mutation && tag.parent_guid() == Some(source);
                    if !copied && !rewritten {
                        return Err(foreign(tag.role()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Check every indexed prompt.
    ///
    /// Since every parent is strictly older than its child, passing this check
    /// means every ancestry chain ends at a valid root.
    pub fn validate_all(&self) -> Result<(), LineageError> {
        self.order
            .iter()
            .try_for_each(|id| self.validate_prompt(*id))
    }

    /// All ancestors of a prompt, nearest first.
    pub fn ancestors(&self, id: PromptId) -> Result<Vec<PromptId>, LineageError> {
        self.require(id)?;
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for parent in self.require(current)?.parent_ids() {
                self.parent_of(current, *parent)?;
                if seen.insert(*parent) {
                    result.push(*parent);
                    queue.push_back(*parent);
                }
            }
        }
        Ok(result)
    }

    /// Fewest parent hops from `id` to a generation-0 prompt.
    ///
    /// `None` when every ancestry path ends at an immigrant.
    pub fn hops_to_generation_zero(&self, id: PromptId) -> Result<Option<usize>, LineageError> {
        let mut seen = HashSet::from([id]);
        let mut queue = VecDeque::from([(id, 0usize)]);
        while let Some((current, hops)) = queue.pop_front() {
            let prompt = self.require(current)?;
            if prompt.generation() == 0 {
                return Ok(Some(hops));
            }
            for parent in prompt.parent_ids() {
                self.parent_of(current, *parent)?;
                if seen.insert(*parent) {
                    queue.push_back((*parent, hops + 1));
                }
            }
        }
        Ok(None)
    }

    /// Direct offspring of a prompt.
    pub fn children(&self, id: PromptId) -> &[PromptId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Mutation chain of a tag: the tag itself, then each tag it was derived
    /// from, ending at the tag's first minting.
    pub fn tag_ancestry(&self, guid: TagGuid) -> Result<Vec<TagGuid>, LineageError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(guid);
        while let Some(g) = current {
            if !seen.insert(g) {
                return Err(LineageError::CircularTagChain(guid));
            }
            let tag = self.tags.get(&g).ok_or(LineageError::UnknownTag(g))?;
            chain.push(g);
            current = tag.parent_guid();
        }
        Ok(chain)
    }

    /// Prompts carrying a tag, in insertion order.
    pub fn tag_carriers(&self, guid: TagGuid) -> &[PromptId] {
        self.carriers.get(&guid).map(Vec::as_slice).unwrap_or_default()
    }

    /// Number of indexed prompts of each kind.
    pub fn origin_counts(&self) -> OperatorCounts {
        let mut counts = OperatorCounts::default();
        for prompt in self.prompts.values() {
            match prompt.kind() {
                Origin::Initial => counts.initial += 1,
                Origin::Mutation => counts.mutation += 1,
                Origin::Crossover => counts.crossover += 1,
                Origin::Immigrant => counts.immigrant += 1,
            }
        }
        counts
    }
}
