use ndarray::Array2;

use crate::event::Event;
use crate::pore_model::PoreModel;
use crate::transitions::StateTransitions;
use crate::Float;

/// Streaming log-sum-exp: accumulates terms one at a time while keeping the
/// running maximum, so no intermediate buffer is needed in the DP loops.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogSumExp {
    max: Float,
    sum: Float,
}

impl LogSumExp {
    pub(crate) fn new() -> Self {
        Self {
            max: Float::NEG_INFINITY,
            sum: 0.0,
        }
    }

    #[inline]
    pub(crate) fn add(&mut self, x: Float) {
        if x == Float::NEG_INFINITY {
            return;
        }
        if x > self.max {
            self.sum = self.sum * (self.max - x).exp() + 1.0;
            self.max = x;
        } else {
            self.sum += (x - self.max).exp();
        }
    }

    #[inline]
    pub(crate) fn value(&self) -> Float {
        if self.max == Float::NEG_INFINITY {
            Float::NEG_INFINITY
        } else {
            self.max + self.sum.ln()
        }
    }
}

impl FromIterator<Float> for LogSumExp {
    fn from_iter<I: IntoIterator<Item = Float>>(iter: I) -> Self {
        let mut acc = Self::new();
        for x in iter {
            acc.add(x);
        }
        acc
    }
}

/// Log-space sum-product tables over one event sequence: α, β, the cached
/// per-timestep emission rows, and the data log-evidence.
#[derive(Debug)]
pub(crate) struct ForwardBackward {
    alpha: Array2<Float>,
    beta: Array2<Float>,
    emissions: Array2<Float>,
    log_z: Float,
}

impl ForwardBackward {
    pub(crate) fn fill(
        model: &PoreModel,
        transitions: &StateTransitions,
        events: &[Event],
    ) -> Self {
        let len = events.len();
        let n = model.n_states();
        debug_assert!(len > 0);
        debug_assert_eq!(n, transitions.n_states());

        let mut emissions = Array2::zeros((len, n));
        for (t, event) in events.iter().enumerate() {
            for i in 0..n {
                emissions[(t, i)] = model.log_pr_emission(i, event);
            }
        }

        let prior = -(n as Float).ln();
        let mut alpha = Array2::from_elem((len, n), Float::NEG_INFINITY);
        for i in 0..n {
            alpha[(0, i)] = prior + emissions[(0, i)];
        }
        for t in 1..len {
            for j in 0..n {
                let mut acc = LogSumExp::new();
                transitions.for_each_predecessor(j, |src, _, log_prob| {
                    acc.add(alpha[(t - 1, src)] + log_prob);
                });
                alpha[(t, j)] = acc.value() + emissions[(t, j)];
            }
        }

        let mut beta = Array2::from_elem((len, n), 0.0 as Float);
        for t in (0..len.saturating_sub(1)).rev() {
            for i in 0..n {
                let mut acc = LogSumExp::new();
                transitions.for_each_successor(i, |_, dst, log_prob| {
                    acc.add(log_prob + emissions[(t + 1, dst)] + beta[(t + 1, dst)]);
                });
                beta[(t, i)] = acc.value();
            }
        }

        let log_z = (0..n).map(|i| alpha[(len - 1, i)]).collect::<LogSumExp>().value();
        Self {
            alpha,
            beta,
            emissions,
            log_z,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.alpha.nrows()
    }

    pub(crate) fn n_states(&self) -> usize {
        self.alpha.ncols()
    }

    pub(crate) fn log_z(&self) -> Float {
        self.log_z
    }

    #[inline]
    pub(crate) fn alpha(&self, t: usize, i: usize) -> Float {
        self.alpha[(t, i)]
    }

    #[inline]
    pub(crate) fn beta(&self, t: usize, i: usize) -> Float {
        self.beta[(t, i)]
    }

    #[inline]
    pub(crate) fn emission(&self, t: usize, i: usize) -> Float {
        self.emissions[(t, i)]
    }

    /// Posterior state responsibilities for one timestep.
    pub(crate) fn gamma_row(&self, t: usize, out: &mut [Float]) {
        debug_assert_eq!(out.len(), self.n_states());
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = (self.alpha[(t, i)] + self.beta[(t, i)] - self.log_z).exp();
        }
    }

    /// Log-evidence recomputed from the backward table; agrees with
    /// [`Self::log_z`] up to accumulation error.
    pub(crate) fn backward_log_z(&self) -> Float {
        let n = self.n_states();
        let prior = -(n as Float).ln();
        (0..n)
            .map(|i| prior + self.emissions[(0, i)] + self.beta[(0, i)])
            .collect::<LogSumExp>()
            .value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pore_model::ModelState;

    #[cfg(not(feature = "f32"))]
    const EVIDENCE_TOL: Float = 1e-6;
    #[cfg(feature = "f32")]
    const EVIDENCE_TOL: Float = 1e-2;

    fn four_level_model() -> PoreModel {
        let states = [0.0, 10.0, 20.0, 30.0]
            .iter()
            .map(|&level| ModelState::new(level, 1.5, 1.0, 0.3))
            .collect();
        PoreModel::from_states(1, states)
    }

    fn events_at(means: &[Float]) -> Vec<Event> {
        means
            .iter()
            .enumerate()
            .map(|(t, &mean)| Event::new(mean, 1.0, t as Float * 0.2, 0.2))
            .collect()
    }

    #[test]
    fn logsumexp_matches_naive() {
        let values: [Float; 5] = [-3.0, -1.0, -2.5, -0.5, -10.0];
        let acc: LogSumExp = values.iter().copied().collect();
        let naive = values.iter().map(|x| x.exp()).sum::<Float>().ln();
        assert!((acc.value() - naive).abs() < EVIDENCE_TOL);
    }

    #[test]
    fn logsumexp_of_nothing_is_neg_infinity() {
        assert_eq!(LogSumExp::new().value(), Float::NEG_INFINITY);
        let mut acc = LogSumExp::new();
        acc.add(Float::NEG_INFINITY);
        assert_eq!(acc.value(), Float::NEG_INFINITY);
    }

    #[test]
    fn forward_and_backward_evidence_agree() {
        let model = four_level_model();
        let transitions = StateTransitions::from_probabilities(1, 0.2, 0.2);
        let events = events_at(&[0.5, 9.0, 21.0, 28.0, 28.5]);
        let fb = ForwardBackward::fill(&model, &transitions, &events);
        assert!(fb.log_z().is_finite());
        assert!((fb.log_z() - fb.backward_log_z()).abs() < EVIDENCE_TOL);
    }

    #[test]
    fn gamma_rows_sum_to_one() {
        let model = four_level_model();
        let transitions = StateTransitions::from_probabilities(1, 0.1, 0.3);
        let events = events_at(&[1.0, 19.0, 30.0]);
        let fb = ForwardBackward::fill(&model, &transitions, &events);
        let mut row = vec![0.0; 4];
        for t in 0..events.len() {
            fb.gamma_row(t, &mut row);
            let sum: Float = row.iter().sum();
            assert!((sum - 1.0).abs() < EVIDENCE_TOL);
        }
    }

    #[test]
    fn evidence_matches_exhaustive_enumeration() {
        let model = four_level_model();
        let transitions = StateTransitions::from_probabilities(1, 0.15, 0.2);
        let events = events_at(&[2.0, 12.0, 25.0]);
        let fb = ForwardBackward::fill(&model, &transitions, &events);

        // Dense log transition lookup for the enumeration.
        let n = model.n_states();
        let mut dense = vec![vec![Float::NEG_INFINITY; n]; n];
        for i in 0..n {
            transitions.for_each_successor(i, |src, dst, lp| dense[src][dst] = lp);
        }
        let prior = -(n as Float).ln();
        let mut total = LogSumExp::new();
        for s0 in 0..n {
            for s1 in 0..n {
                for s2 in 0..n {
                    total.add(
                        prior
                            + model.log_pr_emission(s0, &events[0])
                            + dense[s0][s1]
                            + model.log_pr_emission(s1, &events[1])
                            + dense[s1][s2]
                            + model.log_pr_emission(s2, &events[2]),
                    );
                }
            }
        }
        assert!((fb.log_z() - total.value()).abs() < EVIDENCE_TOL);
    }

    #[test]
    fn single_event_evidence() {
        let model = four_level_model();
        let transitions = StateTransitions::from_probabilities(1, 0.1, 0.3);
        let events = events_at(&[10.0]);
        let fb = ForwardBackward::fill(&model, &transitions, &events);
        let prior = -(4.0 as Float).ln();
        let expected = (0..4)
            .map(|i| prior + model.log_pr_emission(i, &events[0]))
            .collect::<LogSumExp>()
            .value();
        assert!((fb.log_z() - expected).abs() < EVIDENCE_TOL);
        assert!((fb.log_z() - fb.backward_log_z()).abs() < EVIDENCE_TOL);
    }
}
