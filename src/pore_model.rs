use std::io::{self, BufRead, Write};

use fnv::FnvHashMap;
use num_traits::Float as NumFloat;
use once_cell::sync::Lazy;

use crate::event::Event;
use crate::kmer;
use crate::{Float, Strand};

/// Variance floor below which a training round is declared singular.
pub(crate) const VARIANCE_FLOOR: Float = 1e-6;

static LOG_2PI: Lazy<f64> = Lazy::new(|| (2.0 * std::f64::consts::PI).ln());

/// Log density of N(mean, stdv²) at `x`, with the log of the standard
/// deviation precomputed by the caller.
#[inline]
pub(crate) fn log_normal_pdf<F: NumFloat>(x: F, mean: F, stdv: F, log_stdv: F) -> F {
    let log_2pi = F::from(*LOG_2PI).unwrap();
    let two = F::from(2.0).unwrap();
    let a = (x - mean) / stdv;
    -log_stdv - (log_2pi + a * a) / two
}

/// Log density of the inverse Gaussian IG(mu, lambda) at `x`, with both
/// logarithms precomputed by the caller.
#[inline]
pub(crate) fn log_invgauss_pdf<F: NumFloat>(x: F, log_x: F, mu: F, lambda: F, log_lambda: F) -> F {
    let log_2pi = F::from(*LOG_2PI).unwrap();
    let two = F::from(2.0).unwrap();
    let three = F::from(3.0).unwrap();
    let a = (x - mu) / mu;
    (log_lambda - log_2pi - three * log_x - lambda * a * a / x) / two
}

/// The six-parameter affine correction applied to a generic pore model for
/// one read. `var`, `scale`, `scale_sd` and `var_sd` stay strictly positive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PoreModelParams {
    pub scale: Float,
    pub shift: Float,
    pub drift: Float,
    pub var: Float,
    pub scale_sd: Float,
    pub var_sd: Float,
}

impl Default for PoreModelParams {
    fn default() -> Self {
        Self {
            scale: 1.0,
            shift: 0.0,
            drift: 0.0,
            var: 1.0,
            scale_sd: 1.0,
            var_sd: 1.0,
        }
    }
}

impl PoreModelParams {
    pub(crate) fn is_identity(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for PoreModelParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.5} {:.5} {:.5} {:.5} {:.5} {:.5}",
            self.scale, self.shift, self.drift, self.var, self.scale_sd, self.var_sd
        )
    }
}

/// Per-state emission parameters: a normal over the event mean and an
/// inverse Gaussian over the event standard deviation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ModelState {
    pub level_mean: Float,
    pub level_stdv: Float,
    pub log_level_stdv: Float,
    pub sd_mean: Float,
    pub sd_stdv: Float,
    pub sd_lambda: Float,
    pub log_sd_lambda: Float,
}

impl ModelState {
    pub(crate) fn new(level_mean: Float, level_stdv: Float, sd_mean: Float, sd_stdv: Float) -> Self {
        let mut state = Self {
            level_mean,
            level_stdv,
            log_level_stdv: 0.0,
            sd_mean,
            sd_stdv,
            sd_lambda: 0.0,
            log_sd_lambda: 0.0,
        };
        state.update_sd_lambda();
        // Normalising sd_stdv through sd_lambda keeps the identity scaling
        // transform bit-exact.
        state.update_sd_stdv();
        state.update_logs();
        state
    }

    fn update_sd_lambda(&mut self) {
        self.sd_lambda = self.sd_mean.powi(3) / self.sd_stdv.powi(2);
    }

    fn update_sd_stdv(&mut self) {
        self.sd_stdv = (self.sd_mean.powi(3) / self.sd_lambda).sqrt();
    }

    fn update_logs(&mut self) {
        self.log_level_stdv = self.level_stdv.ln();
        self.log_sd_lambda = self.sd_lambda.ln();
    }

    fn scale(&mut self, params: &PoreModelParams) {
        self.level_mean = self.level_mean * params.scale + params.shift;
        self.level_stdv *= params.var;
        self.sd_mean *= params.scale_sd;
        self.sd_lambda *= params.var_sd;
        self.update_sd_stdv();
        self.update_logs();
    }

    #[inline]
    pub(crate) fn log_pr_emission(&self, event: &Event) -> Float {
        log_normal_pdf(event.mean, self.level_mean, self.level_stdv, self.log_level_stdv)
            + log_invgauss_pdf(
                event.stdv,
                event.log_stdv,
                self.sd_mean,
                self.sd_lambda,
                self.log_sd_lambda,
            )
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ModelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("model file is empty")]
    Empty,

    #[error("expected 5 tab-separated fields at line {0}")]
    InvalidFieldCount(usize),

    #[error("invalid k-mer at line {0}")]
    InvalidKmer(usize),

    #[error("k-mer out of order at line {line}, expected {expected}")]
    KmerOutOfOrder { line: usize, expected: String },

    #[error("invalid number at line {0}")]
    InvalidNumber(usize),

    #[error("non-positive spread parameter at line {0}")]
    NonPositiveSpread(usize),

    #[error("expected {expected} states, found {found}")]
    WrongStateCount { expected: usize, found: usize },
}

/// A pore model: one emission distribution per k-mer state, plus the strand
/// it is eligible for.
#[derive(Debug, Clone)]
pub(crate) struct PoreModel {
    k: usize,
    strand: Strand,
    states: Vec<ModelState>,
}

impl PoreModel {
    pub(crate) fn from_states(k: usize, states: Vec<ModelState>) -> Self {
        assert_eq!(states.len(), kmer::n_states(k));
        Self {
            k,
            strand: Strand::Both,
            states,
        }
    }

    pub(crate) fn with_strand(mut self, strand: Strand) -> Self {
        self.strand = strand;
        self
    }

    pub(crate) fn k(&self) -> usize {
        self.k
    }

    pub(crate) fn n_states(&self) -> usize {
        self.states.len()
    }

    pub(crate) fn strand(&self) -> Strand {
        self.strand
    }

    pub(crate) fn state(&self, i: usize) -> &ModelState {
        &self.states[i]
    }

    /// Apply the six-parameter transform to every state and refresh the
    /// cached logarithms. Idempotent only for identity parameters.
    pub(crate) fn scale(&mut self, params: &PoreModelParams) {
        for state in &mut self.states {
            state.scale(params);
        }
    }

    pub(crate) fn scaled(&self, params: &PoreModelParams) -> Self {
        let mut model = self.clone();
        model.scale(params);
        model
    }

    #[inline]
    pub(crate) fn log_pr_emission(&self, i: usize, event: &Event) -> Float {
        self.states[i].log_pr_emission(event)
    }

    /// Mean of the level means across states, for sanity checks.
    pub(crate) fn mean(&self) -> Float {
        self.states.iter().map(|s| s.level_mean).sum::<Float>() / self.states.len() as Float
    }

    /// Standard deviation of the level means across states.
    pub(crate) fn stdv(&self) -> Float {
        let mean = self.mean();
        let var = self
            .states
            .iter()
            .map(|s| (s.level_mean - mean) * (s.level_mean - mean))
            .sum::<Float>()
            / self.states.len() as Float;
        var.sqrt()
    }

    /// The smallest spread parameter of any state. Training declares a
    /// singularity when this drops below [`VARIANCE_FLOOR`].
    pub(crate) fn min_spread(&self) -> Float {
        self.states
            .iter()
            .map(|s| s.level_stdv.min(s.sd_lambda))
            .fold(Float::INFINITY, Float::min)
    }

    /// Parse the tab-separated one-line-per-state text format. k is inferred
    /// from the first k-mer; states must appear in integer order.
    pub(crate) fn from_reader<R: BufRead>(reader: R) -> Result<Self, ModelError> {
        let mut states = Vec::new();
        let mut k = 0;
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row = index + 1;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 5 {
                return Err(ModelError::InvalidFieldCount(row));
            }
            if states.is_empty() {
                k = fields[0].len();
                if k == 0 {
                    return Err(ModelError::InvalidKmer(row));
                }
            }
            let state_index =
                kmer::to_int(fields[0].as_bytes()).ok_or(ModelError::InvalidKmer(row))?;
            if fields[0].len() != k || state_index != states.len() {
                return Err(ModelError::KmerOutOfOrder {
                    line: row,
                    expected: kmer::to_string(states.len(), k),
                });
            }
            let mut numbers = [0.0 as Float; 4];
            for (slot, field) in numbers.iter_mut().zip(&fields[1..]) {
                *slot = field.parse().map_err(|_| ModelError::InvalidNumber(row))?;
            }
            let [level_mean, level_stdv, sd_mean, sd_stdv] = numbers;
            if level_stdv <= 0.0 || sd_mean <= 0.0 || sd_stdv <= 0.0 {
                return Err(ModelError::NonPositiveSpread(row));
            }
            states.push(ModelState::new(level_mean, level_stdv, sd_mean, sd_stdv));
        }
        if states.is_empty() {
            return Err(ModelError::Empty);
        }
        let expected = kmer::n_states(k);
        if states.len() != expected {
            return Err(ModelError::WrongStateCount {
                expected,
                found: states.len(),
            });
        }
        Ok(Self {
            k,
            strand: Strand::Both,
            states,
        })
    }

    pub(crate) fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        for (i, state) in self.states.iter().enumerate() {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}",
                kmer::to_string(i, self.k),
                state.level_mean,
                state.level_stdv,
                state.sd_mean,
                state.sd_stdv
            )?;
        }
        Ok(())
    }
}

/// The model dictionary shared read-only by all workers.
pub(crate) type ModelDict = FnvHashMap<String, PoreModel>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[cfg(not(feature = "f32"))]
    const PDF_TOL: Float = 1e-9;
    #[cfg(feature = "f32")]
    const PDF_TOL: Float = 1e-3;

    fn toy_model(k: usize) -> PoreModel {
        let states = (0..kmer::n_states(k))
            .map(|i| {
                let i = i as Float;
                ModelState::new(50.0 + 3.0 * i, 0.8 + 0.01 * i, 1.0 + 0.05 * i, 0.3 + 0.01 * i)
            })
            .collect();
        PoreModel::from_states(k, states)
    }

    #[test]
    fn emission_matches_closed_form() {
        let model = toy_model(2);
        let event = Event::new(55.5, 1.2, 0.0, 0.01);
        for i in 0..model.n_states() {
            let state = model.state(i);
            let normal = log_normal_pdf(
                event.mean,
                state.level_mean,
                state.level_stdv,
                state.log_level_stdv,
            );
            let invgauss = log_invgauss_pdf(
                event.stdv,
                event.log_stdv,
                state.sd_mean,
                state.sd_lambda,
                state.log_sd_lambda,
            );
            let total = model.log_pr_emission(i, &event);
            assert!(total.is_finite());
            let expected = normal + invgauss;
            assert!((total - expected).abs() <= PDF_TOL * expected.abs());
        }
    }

    #[cfg(not(feature = "f32"))]
    #[test]
    fn normal_part_agrees_with_statrs() {
        use statrs::distribution::{Continuous, Normal};

        let (mean, stdv) = (62.5, 1.7);
        let x = 60.1;
        let ours = log_normal_pdf(x, mean, stdv, stdv.ln());
        let theirs = Normal::new(mean, stdv).unwrap().ln_pdf(x);
        assert!((ours - theirs).abs() < 1e-9);
    }

    #[test]
    fn invgauss_part_agrees_with_direct_formula() {
        let (mu, lambda) = (1.3 as Float, 4.2 as Float);
        let x = 0.9 as Float;
        let ours = log_invgauss_pdf(x, x.ln(), mu, lambda, lambda.ln());
        let two_pi = 2.0 * std::f64::consts::PI as Float;
        let direct = 0.5 * (lambda / (two_pi * x.powi(3))).ln()
            - lambda * (x - mu) * (x - mu) / (2.0 * mu * mu * x);
        assert!((ours - direct).abs() <= PDF_TOL * direct.abs());
    }

    #[test]
    fn identity_scaling_is_byte_identical() {
        let mut model = toy_model(2);
        let before = model.states.clone();
        model.scale(&PoreModelParams::default());
        assert_eq!(model.states, before);
    }

    #[test]
    fn scaling_transforms_each_channel() {
        let mut model = toy_model(1);
        let params = PoreModelParams {
            scale: 2.0,
            shift: 5.0,
            drift: 0.1,
            var: 3.0,
            scale_sd: 1.5,
            var_sd: 2.0,
        };
        let before = model.state(1).clone();
        model.scale(&params);
        let after = model.state(1);
        assert!((after.level_mean - (before.level_mean * 2.0 + 5.0)).abs() < PDF_TOL);
        assert!((after.level_stdv - before.level_stdv * 3.0).abs() < PDF_TOL);
        assert!((after.sd_mean - before.sd_mean * 1.5).abs() < PDF_TOL);
        assert!((after.sd_lambda - before.sd_lambda * 2.0).abs() < PDF_TOL);
        // sd_stdv and the log caches follow the scaled parameters.
        let expected_sd_stdv = (after.sd_mean.powi(3) / after.sd_lambda).sqrt();
        assert!((after.sd_stdv - expected_sd_stdv).abs() < PDF_TOL);
        assert!((after.log_level_stdv - after.level_stdv.ln()).abs() < PDF_TOL);
        assert!((after.log_sd_lambda - after.sd_lambda.ln()).abs() < PDF_TOL);
    }

    #[test]
    fn serialisation_roundtrip() {
        let model = toy_model(2);
        let mut buf = Vec::new();
        model.write(&mut buf).unwrap();
        let parsed = PoreModel::from_reader(Cursor::new(&buf)).unwrap();
        assert_eq!(parsed.k(), 2);
        assert_eq!(parsed.n_states(), model.n_states());
        for i in 0..model.n_states() {
            let (a, b) = (parsed.state(i), model.state(i));
            // The text fields round-trip exactly; sd_lambda is recomputed
            // from them and may move by an ulp.
            assert_eq!(a.level_mean, b.level_mean);
            assert_eq!(a.level_stdv, b.level_stdv);
            assert_eq!(a.sd_mean, b.sd_mean);
            assert!((a.sd_stdv - b.sd_stdv).abs() <= PDF_TOL * b.sd_stdv.abs());
            assert!((a.sd_lambda - b.sd_lambda).abs() <= PDF_TOL * b.sd_lambda.abs());
        }
    }

    #[test]
    fn parse_rejects_out_of_order_kmers() {
        let text = "C\t50\t1\t1\t0.3\nA\t60\t1\t1\t0.3\nG\t70\t1\t1\t0.3\nT\t80\t1\t1\t0.3\n";
        let err = PoreModel::from_reader(Cursor::new(text)).unwrap_err();
        assert!(matches!(err, ModelError::KmerOutOfOrder { line: 1, .. }));
    }

    #[test]
    fn parse_rejects_missing_states() {
        let text = "A\t50\t1\t1\t0.3\nC\t60\t1\t1\t0.3\n";
        let err = PoreModel::from_reader(Cursor::new(text)).unwrap_err();
        assert!(matches!(
            err,
            ModelError::WrongStateCount {
                expected: 4,
                found: 2
            }
        ));
    }

    #[test]
    fn parse_rejects_bad_numbers() {
        let text = "A\t50\tx\t1\t0.3\n";
        let err = PoreModel::from_reader(Cursor::new(text)).unwrap_err();
        assert!(matches!(err, ModelError::InvalidNumber(1)));
    }

    #[test]
    fn summary_statistics() {
        let model = toy_model(1);
        // level means are 50, 53, 56, 59
        assert!((model.mean() - 54.5).abs() < 1e-6);
        let expected_var = (4.5f64 * 4.5 + 1.5 * 1.5 + 1.5 * 1.5 + 4.5 * 4.5) / 4.0;
        assert!((model.stdv() - (expected_var as Float).sqrt()).abs() < 1e-6);
    }
}
