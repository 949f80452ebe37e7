//! Elitism and fitness-proportional parent sampling.

use std::cmp::Ordering;

use crate::schema::Prompt;

use super::genome::GenomeRng;

/// Whether a scored prompt may be carried forward as an elite.
///
/// Unscored prompts and total evaluation failures are never elites.
pub fn is_elite_eligible(prompt: &Prompt) -> bool {
    prompt
        .evaluation()
        .is_some_and(|evaluation| !evaluation.is_total_failure())
}

/// Indices of the top `count` eligible prompts by fitness, best first.
///
/// Ties keep population order.
pub fn select_elites(population: &[Prompt], count: usize) -> Vec<usize> {
    let mut ranked: Vec<usize> = (0..population.len())
        .filter(|&i| is_elite_eligible(&population[i]))
        .collect();
    ranked.sort_by(|&a, &b| compare_fitness(&population[b], &population[a]));
    ranked.truncate(count);
    ranked
}

fn compare_fitness(a: &Prompt, b: &Prompt) -> Ordering {
    a.fitness()
        .unwrap_or(0.0)
        .total_cmp(&b.fitness().unwrap_or(0.0))
}

/// Roulette-wheel draw over `weights`, skipping `exclude`.
///
/// Falls back to a uniform draw when no candidate has positive weight.
/// Returns `None` when nothing is left to draw.
pub fn roulette_index(
    rng: &mut GenomeRng,
    weights: &[f64],
    exclude: Option<usize>,
) -> Option<usize> {
    let candidates: Vec<usize> = (0..weights.len()).filter(|&i| Some(i) != exclude).collect();
    if candidates.is_empty() {
        return None;
    }

    let weight = |i: usize| {
        let w = weights[i];
        if w.is_finite() && w > 0.0 { w } else { 0.0 }
    };
    let total: f64 = candidates.iter().map(|&i| weight(i)).sum();
    if total <= 0.0 {
        return Some(candidates[rng.index(candidates.len())]);
    }

    let target = rng.unit() * total;
    let mut cumulative = 0.0;
    let mut last_positive = candidates[0];
    for &i in &candidates {
        let w = weight(i);
        if w == 0.0 {
            continue;
        }
        cumulative += w;
        last_positive = i;
        if cumulative > target {
            return Some(i);
        }
    }
    Some(last_positive)
}

/// Non-elite prompts of a scored population, available as parents.
pub struct ParentPool<'a> {
    members: Vec<&'a Prompt>,
    weights: Vec<f64>,
}

impl<'a> ParentPool<'a> {
    /// Every prompt of `population` whose index is not in `elites`.
    pub fn new(population: &'a [Prompt], elites: &[usize]) -> Self {
        let members: Vec<&Prompt> = population
            .iter()
            .enumerate()
            .filter(|(i, _)| !elites.contains(i))
            .map(|(_, p)| p)
            .collect();
        let weights = members.iter().map(|p| p.fitness().unwrap_or(0.0)).collect();
        Self { members, weights }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// One fitness-proportional parent.
    pub fn pick(&self, rng: &mut GenomeRng) -> Option<&'a Prompt> {
        roulette_index(rng, &self.weights, None).map(|i| self.members[i])
    }

    /// Two distinct fitness-proportional parents.
    pub fn pick_pair(&self, rng: &mut GenomeRng) -> Option<(&'a Prompt, &'a Prompt)> {
        let first = roulette_index(rng, &self.weights, None)?;
        let second = roulette_index(rng, &self.weights, Some(first))?;
        Some((self.members[first], self.members[second]))
    }
}
