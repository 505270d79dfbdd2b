use std::io::{self, BufRead, Write};

use log::warn;

use crate::kmer;
use crate::Float;

/// Maximum advance (in bases) modelled by a single transition; the
/// geometric tail beyond it is folded into the last level so rows keep
/// summing to one.
pub(crate) const MAX_SKIP: usize = 5;

pub(crate) const DEFAULT_P_SKIP_DECAY: Float = 0.3;

/// Row-normalisation deviation above which a loaded matrix triggers a
/// warning.
const ROW_SUM_WARN_TOL: Float = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct StateTransitionParams {
    pub p_stay: Float,
    pub p_skip: Float,
    pub p_skip_decay: Float,
}

impl StateTransitionParams {
    pub(crate) fn new(p_stay: Float, p_skip: Float, p_skip_decay: Float) -> Self {
        Self {
            p_stay,
            p_skip,
            p_skip_decay,
        }
    }

    pub(crate) fn with_default_decay(p_stay: Float, p_skip: Float) -> Self {
        Self::new(p_stay, p_skip, DEFAULT_P_SKIP_DECAY)
    }
}

impl std::fmt::Display for StateTransitionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.5} {:.5} {:.5}",
            self.p_stay, self.p_skip, self.p_skip_decay
        )
    }
}

/// Probability mass of the skip level advancing `m` bases (m in
/// 2..=MAX_SKIP), before division among the 4^m destinations.
pub(crate) fn skip_level_coeff(params: &StateTransitionParams, m: usize) -> Float {
    let rho = params.p_skip_decay;
    if m < MAX_SKIP {
        params.p_skip * (1.0 - rho) * rho.powi(m as i32 - 2)
    } else {
        params.p_skip * rho.powi(MAX_SKIP as i32 - 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Edge {
    pub state: u32,
    pub log_prob: Float,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransitionsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("transitions file is empty")]
    Empty,

    #[error("invalid parameter header")]
    InvalidHeader,

    #[error("invalid transition triple at line {0}")]
    InvalidTriple(usize),

    #[error("{found} states is not a power of four")]
    BadStateCount { found: usize },

    #[error("state {0} has no outgoing transitions")]
    MissingRow(usize),
}

/// Sparse transition structure over the k-mer states, stored both by source
/// (successors) and by destination (predecessors); the DP kernels iterate
/// predecessors.
#[derive(Debug, Clone)]
pub(crate) struct StateTransitions {
    k: usize,
    params: StateTransitionParams,
    succ: Vec<Vec<Edge>>,
    pred: Vec<Vec<Edge>>,
}

impl StateTransitions {
    /// Materialise the stay/step/skip row structure from two scalar
    /// probabilities and the geometric skip decay.
    pub(crate) fn compute_fast(k: usize, params: &StateTransitionParams) -> Self {
        let n = kmer::n_states(k);
        let p_step = 1.0 - params.p_stay - params.p_skip;
        let mut scratch = vec![0.0 as Float; n];
        let mut rows = Vec::with_capacity(n);
        for i in 0..n {
            scratch.iter_mut().for_each(|p| *p = 0.0);
            scratch[i] += params.p_stay;
            for bits in 0..4 {
                scratch[kmer::advance(i, 1, bits, k)] += p_step * 0.25;
            }
            for m in 2..=MAX_SKIP {
                let destinations = 1usize << (2 * m);
                let per_edge = skip_level_coeff(params, m) / destinations as Float;
                for suffix in 0..destinations {
                    scratch[kmer::advance(i, m, suffix, k)] += per_edge;
                }
            }
            rows.push(
                scratch
                    .iter()
                    .enumerate()
                    .filter(|(_, &p)| p > 0.0)
                    .map(|(j, &p)| (j, p))
                    .collect(),
            );
        }
        Self::from_probability_rows(k, rows, *params)
    }

    pub(crate) fn from_probabilities(k: usize, p_stay: Float, p_skip: Float) -> Self {
        Self::compute_fast(k, &StateTransitionParams::with_default_decay(p_stay, p_skip))
    }

    fn from_probability_rows(
        k: usize,
        rows: Vec<Vec<(usize, Float)>>,
        params: StateTransitionParams,
    ) -> Self {
        let n = rows.len();
        let mut succ: Vec<Vec<Edge>> = Vec::with_capacity(n);
        let mut pred: Vec<Vec<Edge>> = vec![Vec::new(); n];
        for (i, row) in rows.into_iter().enumerate() {
            let mut edges = Vec::with_capacity(row.len());
            for (j, p) in row {
                let log_prob = p.ln();
                edges.push(Edge {
                    state: j as u32,
                    log_prob,
                });
                pred[j].push(Edge {
                    state: i as u32,
                    log_prob,
                });
            }
            succ.push(edges);
        }
        Self {
            k,
            params,
            succ,
            pred,
        }
    }

    pub(crate) fn k(&self) -> usize {
        self.k
    }

    pub(crate) fn n_states(&self) -> usize {
        self.succ.len()
    }

    pub(crate) fn params(&self) -> &StateTransitionParams {
        &self.params
    }

    #[inline]
    pub(crate) fn predecessors(&self, j: usize) -> &[Edge] {
        &self.pred[j]
    }

    #[inline]
    pub(crate) fn successors(&self, i: usize) -> &[Edge] {
        &self.succ[i]
    }

    pub(crate) fn for_each_predecessor<F: FnMut(usize, usize, Float)>(&self, j: usize, mut f: F) {
        for edge in &self.pred[j] {
            f(edge.state as usize, j, edge.log_prob);
        }
    }

    pub(crate) fn for_each_successor<F: FnMut(usize, usize, Float)>(&self, i: usize, mut f: F) {
        for edge in &self.succ[i] {
            f(i, edge.state as usize, edge.log_prob);
        }
    }

    /// Load an arbitrary matrix: a parameter header line followed by
    /// `src dst log_prob` triples grouped by src. Rows are renormalised;
    /// deviations beyond 1e-6 are reported once per load.
    pub(crate) fn from_reader<R: BufRead>(reader: R) -> Result<Self, TransitionsError> {
        let mut lines = reader.lines().enumerate();
        let (_, header) = lines.next().ok_or(TransitionsError::Empty)?;
        let header = header?;
        let header_fields: Vec<Float> = header
            .split_whitespace()
            .map(|field| field.parse())
            .collect::<Result<_, _>>()
            .map_err(|_| TransitionsError::InvalidHeader)?;
        let [p_stay, p_skip, p_skip_decay] = header_fields[..] else {
            return Err(TransitionsError::InvalidHeader);
        };
        let params = StateTransitionParams::new(p_stay, p_skip, p_skip_decay);

        let mut triples: Vec<(usize, usize, Float)> = Vec::new();
        let mut max_state = 0usize;
        for (index, line) in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row = index + 1;
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [src, dst, log_prob] = fields[..] else {
                return Err(TransitionsError::InvalidTriple(row));
            };
            let src: usize = src.parse().map_err(|_| TransitionsError::InvalidTriple(row))?;
            let dst: usize = dst.parse().map_err(|_| TransitionsError::InvalidTriple(row))?;
            let log_prob: Float = log_prob
                .parse()
                .map_err(|_| TransitionsError::InvalidTriple(row))?;
            max_state = max_state.max(src).max(dst);
            triples.push((src, dst, log_prob));
        }
        if triples.is_empty() {
            return Err(TransitionsError::Empty);
        }

        let n = max_state + 1;
        let k = (0..16)
            .find(|k| kmer::n_states(*k) == n)
            .ok_or(TransitionsError::BadStateCount { found: n })?;

        let mut rows: Vec<Vec<(usize, Float)>> = vec![Vec::new(); n];
        for (src, dst, log_prob) in triples {
            rows[src].push((dst, log_prob.exp()));
        }

        let mut max_deviation = 0.0 as Float;
        for (i, row) in rows.iter_mut().enumerate() {
            let sum: Float = row.iter().map(|(_, p)| p).sum();
            if sum <= 0.0 {
                return Err(TransitionsError::MissingRow(i));
            }
            max_deviation = max_deviation.max((sum - 1.0).abs());
            for (_, p) in row.iter_mut() {
                *p /= sum;
            }
        }
        if max_deviation > ROW_SUM_WARN_TOL {
            warn!(
                "renormalised transition rows, worst deviation {:.3e}",
                max_deviation
            );
        }

        Ok(Self::from_probability_rows(k, rows, params))
    }

    pub(crate) fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writeln!(
            writer,
            "{} {} {}",
            self.params.p_stay, self.params.p_skip, self.params.p_skip_decay
        )?;
        for i in 0..self.n_states() {
            for edge in self.successors(i) {
                writeln!(writer, "{} {} {}", i, edge.state, edge.log_prob)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[cfg(not(feature = "f32"))]
    const ROW_TOL: Float = 1e-9;
    #[cfg(feature = "f32")]
    const ROW_TOL: Float = 1e-4;

    fn row_sum(transitions: &StateTransitions, i: usize) -> Float {
        transitions
            .successors(i)
            .iter()
            .map(|e| e.log_prob.exp())
            .sum()
    }

    #[test]
    fn rows_sum_to_one() {
        for k in [1, 2, 3] {
            let transitions = StateTransitions::from_probabilities(k, 0.1, 0.3);
            for i in 0..transitions.n_states() {
                assert!((row_sum(&transitions, i) - 1.0).abs() < ROW_TOL);
            }
        }
    }

    #[test]
    fn rows_sum_to_one_at_full_k() {
        let transitions = StateTransitions::from_probabilities(6, 0.12, 0.28);
        for i in [0, 1, 1000, 4095] {
            assert!((row_sum(&transitions, i) - 1.0).abs() < ROW_TOL);
        }
    }

    #[test]
    fn predecessors_mirror_successors() {
        let transitions = StateTransitions::from_probabilities(2, 0.15, 0.25);
        let mut from_succ = Vec::new();
        let mut from_pred = Vec::new();
        for i in 0..transitions.n_states() {
            transitions.for_each_successor(i, |src, dst, lp| from_succ.push((src, dst, lp)));
            transitions.for_each_predecessor(i, |src, dst, lp| from_pred.push((src, dst, lp)));
        }
        from_succ.sort_by(|a, b| a.partial_cmp(b).unwrap());
        from_pred.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(from_succ, from_pred);
    }

    #[test]
    fn predecessor_lists_are_sorted_by_source() {
        let transitions = StateTransitions::from_probabilities(2, 0.1, 0.3);
        for j in 0..transitions.n_states() {
            let preds = transitions.predecessors(j);
            assert!(preds.windows(2).all(|w| w[0].state < w[1].state));
        }
    }

    #[test]
    fn skip_levels_preserve_total_mass() {
        let params = StateTransitionParams::new(0.1, 0.3, 0.4);
        let total: Float = (2..=MAX_SKIP).map(|m| skip_level_coeff(&params, m)).sum();
        assert!((total - params.p_skip).abs() < ROW_TOL);
    }

    #[test]
    fn zero_stay_keeps_rows_normalised() {
        let transitions =
            StateTransitions::compute_fast(1, &StateTransitionParams::new(0.0, 0.01, 0.3));
        for i in 0..4 {
            assert!((row_sum(&transitions, i) - 1.0).abs() < ROW_TOL);
        }
    }

    #[test]
    fn file_roundtrip() {
        let original = StateTransitions::from_probabilities(2, 0.1, 0.3);
        let mut buf = Vec::new();
        original.write(&mut buf).unwrap();
        let parsed = StateTransitions::from_reader(Cursor::new(&buf)).unwrap();
        assert_eq!(parsed.k(), 2);
        assert_eq!(parsed.n_states(), original.n_states());
        assert_eq!(parsed.params(), original.params());
        for i in 0..original.n_states() {
            let a = original.successors(i);
            let b = parsed.successors(i);
            assert_eq!(a.len(), b.len());
            for (ea, eb) in a.iter().zip(b) {
                assert_eq!(ea.state, eb.state);
                assert!((ea.log_prob - eb.log_prob).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn loaded_rows_are_renormalised() {
        // Two rows deliberately off from a proper distribution.
        let half: Float = 0.5;
        let text = format!(
            "0.1 0.3 0.3\n0 0 {lp}\n0 1 {lp}\n1 0 {lp2}\n1 1 {lp2}\n2 2 0\n3 3 0\n",
            lp = (half * 0.9).ln(),
            lp2 = (half * 1.1).ln(),
        );
        let parsed = StateTransitions::from_reader(Cursor::new(text)).unwrap();
        for i in 0..4 {
            assert!((row_sum(&parsed, i) - 1.0).abs() < ROW_TOL);
        }
    }

    #[test]
    fn missing_row_is_an_error() {
        let text = "0.1 0.3 0.3\n0 3 0\n3 0 0\n";
        let err = StateTransitions::from_reader(Cursor::new(text)).unwrap_err();
        assert!(matches!(err, TransitionsError::MissingRow(1)));
    }

    #[test]
    fn bad_state_count_is_an_error() {
        let text = "0.1 0.3 0.3\n0 0 0\n1 1 0\n2 2 0\n";
        let err = StateTransitions::from_reader(Cursor::new(text)).unwrap_err();
        assert!(matches!(err, TransitionsError::BadStateCount { found: 3 }));
    }
}
