//! Sliding-window convergence detection over generation mean fitness.

use std::collections::VecDeque;

use crate::schema::{ConvergenceConfig, ConvergenceCriterion};

const RELATIVE_EPSILON: f64 = 1e-12;

/// Tracks the most recent generation means and signals a plateau.
#[derive(Debug, Clone)]
pub struct ConvergenceMonitor {
    config: ConvergenceConfig,
    means: VecDeque<f64>,
    converged: bool,
}

impl ConvergenceMonitor {
    pub fn new(config: ConvergenceConfig) -> Self {
        let capacity = config.window.max(1);
        Self {
            config,
            means: VecDeque::with_capacity(capacity),
            converged: false,
        }
    }

    /// Push a generation's mean fitness and return the convergence signal.
    pub fn record(&mut self, mean_fitness: f64) -> bool {
        let window = self.config.window.max(1);
        if self.means.len() == window {
            self.means.pop_front();
        }
        self.means.push_back(mean_fitness);

        self.converged = self
            .spread()
            .is_some_and(|spread| spread <= self.config.threshold);
        self.converged
    }

    /// Spread of the window under the configured criterion; `None` until full.
    pub fn spread(&self) -> Option<f64> {
        if self.means.len() < self.config.window.max(1) {
            return None;
        }
        let max = self.means.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = self.means.iter().copied().fold(f64::INFINITY, f64::min);
        let range = max - min;
        Some(match self.config.criterion {
            ConvergenceCriterion::Range => range,
            ConvergenceCriterion::RelativeChange => {
                let mean = self.means.iter().sum::<f64>() / self.means.len() as f64;
                range / mean.abs().max(RELATIVE_EPSILON)
            }
        })
    }

    /// Signal from the latest [`record`](Self::record) call.
    pub fn is_converged(&self) -> bool {
        self.converged
    }

    /// Whether the orchestrator should stop on the current signal.
    pub fn should_stop(&self) -> bool {
        self.converged && !self.config.no_convergence_stop
    }

    pub fn window(&self) -> impl Iterator<Item = f64> + '_ {
        self.means.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(window: usize, threshold: f64) -> ConvergenceMonitor {
        ConvergenceMonitor::new(ConvergenceConfig {
            window,
            threshold,
            ..Default::default()
        })
    }

    #[test]
    fn test_needs_full_window() {
        let mut m = monitor(3, 0.05);
        assert!(!m.record(0.5));
        assert!(!m.record(0.5));
        assert_eq!(m.spread(), None);
        assert!(m.record(0.5));
        assert!(m.should_stop());
    }

    #[test]
    fn test_window_slides() {
        let mut m = monitor(3, 0.05);
        m.record(0.1);
        m.record(0.4);
        assert!(!m.record(0.42));
        assert!(m.record(0.43));
        assert_eq!(m.window().collect::<Vec<_>>(), vec![0.4, 0.42, 0.43]);
        assert!(!m.record(0.2));
    }

    #[test]
    fn test_relative_change() {
        let mut m = ConvergenceMonitor::new(ConvergenceConfig {
            window: 2,
            threshold: 0.1,
            criterion: ConvergenceCriterion::RelativeChange,
            no_convergence_stop: false,
        });
        m.record(0.50);
        assert!(m.record(0.54));
        assert!(!m.record(0.70));
    }

    #[test]
    fn test_signal_recorded_when_overridden() {
        let mut m = ConvergenceMonitor::new(ConvergenceConfig {
            window: 1,
            no_convergence_stop: true,
            ..Default::default()
        });
        assert!(m.record(0.3));
        assert!(m.is_converged());
        assert!(!m.should_stop());
    }
}
