//! Per-generation fitness statistics and significance tests.
//!
//! The t-test compares a generation with its predecessor; the one-way ANOVA
//! compares every generation recorded so far. Both p-values come from the
//! regularized incomplete beta function.

use std::collections::BTreeMap;

use crate::schema::{AnovaResult, OperatorCounts, Origin, TTestResult};

/// Significance level for both tests.
pub const SIGNIFICANCE_LEVEL: f64 = 0.05;

/// Summary of one generation's fitness values.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FitnessSummary {
    pub mean: f64,
    /// Sample standard deviation (n - 1); 0 for fewer than two values.
    pub std: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

/// Summarize a set of fitness values. Empty input yields all zeros.
pub fn summarize(values: &[f64]) -> FitnessSummary {
    if values.is_empty() {
        return FitnessSummary::default();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };

    FitnessSummary {
        mean: mean(values),
        std: sample_variance(values).sqrt(),
        median,
        min: sorted[0],
        max: sorted[n - 1],
    }
}

/// Count population members by how they entered the generation.
pub fn count_origins(members: impl IntoIterator<Item = (Origin, bool)>) -> OperatorCounts {
    let mut counts = OperatorCounts::default();
    for (kind, elite) in members {
        if elite {
            counts.elite += 1;
            continue;
        }
        match kind {
            Origin::Initial => counts.initial += 1,
            Origin::Mutation => counts.mutation += 1,
            Origin::Crossover => counts.crossover += 1,
            Origin::Immigrant => counts.immigrant += 1,
        }
    }
    counts
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

/// Pooled-variance Student t-test of `current` against `previous`.
///
/// The p-value is one-tailed (half the two-tailed value). Returns `None` when
/// either side has fewer than two values or both are constant.
pub fn t_test_vs_previous(current: &[f64], previous: &[f64]) -> Option<TTestResult> {
    let (n1, n2) = (current.len(), previous.len());
    if n1 < 2 || n2 < 2 {
        return None;
    }
    let (m1, m2) = (mean(current), mean(previous));
    let (v1, v2) = (sample_variance(current), sample_variance(previous));

    let df = (n1 + n2 - 2) as f64;
    let pooled = ((n1 - 1) as f64 * v1 + (n2 - 1) as f64 * v2) / df;
    if pooled <= 0.0 {
        return None;
    }
    let standard_error = (pooled * (1.0 / n1 as f64 + 1.0 / n2 as f64)).sqrt();
    let t_statistic = (m1 - m2) / standard_error;
    let p_value = student_t_two_tailed(t_statistic, df) / 2.0;

    let pooled_std = (v1.sqrt() + v2.sqrt()) / 2.0;
    let effect_size = if pooled_std > 0.0 {
        (m1 - m2) / pooled_std
    } else {
        0.0
    };

    Some(TTestResult {
        p_value,
        significant: p_value < SIGNIFICANCE_LEVEL,
        mean_improvement: m1 - m2,
        effect_size,
        t_statistic,
    })
}

/// One-way ANOVA across generations.
///
/// Groups with fewer than two values are skipped; at least three groups must
/// remain. Returns `None` when the test is undefined.
pub fn anova(groups: &BTreeMap<usize, Vec<f64>>) -> Option<AnovaResult> {
    let usable: Vec<(usize, &Vec<f64>)> = groups
        .iter()
        .filter(|(_, values)| values.len() >= 2)
        .map(|(generation, values)| (*generation, values))
        .collect();
    let k = usable.len();
    if k < 3 {
        return None;
    }

    let total: usize = usable.iter().map(|(_, v)| v.len()).sum();
    let grand_mean = usable
        .iter()
        .flat_map(|(_, v)| v.iter())
        .sum::<f64>()
        / total as f64;

    let mut between = 0.0;
    let mut within = 0.0;
    let mut generation_means = BTreeMap::new();
    for (generation, values) in &usable {
        let m = mean(values);
        generation_means.insert(*generation, m);
        between += values.len() as f64 * (m - grand_mean).powi(2);
        within += values.iter().map(|v| (v - m).powi(2)).sum::<f64>();
    }

    let df_between = (k - 1) as f64;
    let df_within = (total - k) as f64;
    if df_within <= 0.0 || within <= 0.0 {
        return None;
    }
    let f_statistic = (between / df_between) / (within / df_within);
    let p_value = f_survival(f_statistic, df_between, df_within);

    Some(AnovaResult {
        p_value,
        significant: p_value < SIGNIFICANCE_LEVEL,
        f_statistic,
        generation_means,
        num_generations: k,
    })
}

/// Two-tailed p-value of Student's t distribution.
fn student_t_two_tailed(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return 0.0;
    }
    let x = df / (df + t * t);
    regularized_incomplete_beta(x, df / 2.0, 0.5).clamp(0.0, 1.0)
}

/// Upper tail of the F distribution.
fn f_survival(f: f64, d1: f64, d2: f64) -> f64 {
    if !f.is_finite() {
        return 0.0;
    }
    if f <= 0.0 {
        return 1.0;
    }
    let x = d2 / (d2 + d1 * f);
    regularized_incomplete_beta(x, d2 / 2.0, d1 / 2.0).clamp(0.0, 1.0)
}

/// Natural log of the gamma function (Lanczos approximation, g = 7).
fn ln_gamma(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // Reflection formula.
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut sum = COEFFICIENTS[0];
    for (i, c) in COEFFICIENTS.iter().enumerate().skip(1) {
        sum += c / (x + i as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + sum.ln()
}

/// Regularized incomplete beta function I_x(a, b).
fn regularized_incomplete_beta(x: f64, a: f64, b: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    // The continued fraction converges fastest below the mean.
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(x, a, b) / a
    } else {
        1.0 - front * beta_continued_fraction(1.0 - x, b, a) / b
    }
}

/// Lentz evaluation of the incomplete beta continued fraction.
fn beta_continued_fraction(x: f64, a: f64, b: f64) -> f64 {
    const MAX_ITERATIONS: usize = 300;
    const EPSILON: f64 = 1e-14;
    const TINY: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITERATIONS {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPSILON {
            break;
        }
    }
    h
}
