use crate::event::Event;
use crate::forward_backward::{ForwardBackward, LogSumExp};
use crate::pore_model::{PoreModel, PoreModelParams, VARIANCE_FLOOR};
use crate::transitions::{skip_level_coeff, StateTransitionParams, StateTransitions, MAX_SKIP};
use crate::{Float, NUM_STRANDS};

/// Floors for the re-estimated transition probabilities and the geometric
/// decay, keeping them inside the open unit interval.
const PROB_FLOOR: Float = 1e-4;
const DECAY_FLOOR: Float = 1e-3;

/// One contiguous run of training events from one strand. `t0` is the start
/// time of the strand's first event, the reference point for drift.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TrainingSegment<'a> {
    pub events: &'a [Event],
    pub strand: usize,
    pub t0: Float,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TrainOptions {
    pub train_scaling: bool,
    pub train_transitions: bool,
}

/// Result of one training round. `fit` is the total log-evidence of the
/// training segments under the round's *input* parameters, so the driver's
/// stop conditions compare values lagged by one round.
#[derive(Debug, Clone)]
pub(crate) struct TrainOutcome {
    pub pm_params: PoreModelParams,
    pub st_params: [StateTransitionParams; NUM_STRANDS],
    pub fit: Float,
    pub done: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct LevelMoments {
    g: Float,
    w: Float,
    wx: Float,
    wxx: Float,
    wm: Float,
    wt: Float,
    wmm: Float,
    wmt: Float,
    wtt: Float,
    wmx: Float,
    wtx: Float,
}

#[derive(Debug, Default, Clone, Copy)]
struct SdMoments {
    s1: Float,
    s2: Float,
    s3: Float,
}

#[derive(Debug, Clone, Copy)]
struct TransStats {
    stay: Float,
    skip: [Float; MAX_SKIP - 1],
    total: Float,
}

impl Default for TransStats {
    fn default() -> Self {
        Self {
            stay: 0.0,
            skip: [0.0; MAX_SKIP - 1],
            total: 0.0,
        }
    }
}

/// One Baum–Welch round over the training segments: responsibilities from
/// Forward–Backward under the current parameters, then closed-form updates
/// for the rescaling transform and the transition probabilities.
pub(crate) fn train_one_round(
    segments: &[TrainingSegment],
    models: [&PoreModel; NUM_STRANDS],
    pm_params: &PoreModelParams,
    st_params: &[StateTransitionParams; NUM_STRANDS],
    options: &TrainOptions,
) -> TrainOutcome {
    debug_assert!(!segments.is_empty());
    let k = models[0].k();
    let n = models[0].n_states();

    let scaled = [models[0].scaled(pm_params), models[1].scaled(pm_params)];
    if scaled.iter().any(|m| m.min_spread() < VARIANCE_FLOOR) {
        return TrainOutcome {
            pm_params: *pm_params,
            st_params: *st_params,
            fit: Float::NEG_INFINITY,
            done: true,
        };
    }

    let transitions = [
        StateTransitions::compute_fast(k, &st_params[0]),
        StateTransitions::compute_fast(k, &st_params[1]),
    ];

    let mut fit = 0.0 as Float;
    let mut level = LevelMoments::default();
    let mut sd = SdMoments::default();
    let mut trans = [TransStats::default(); NUM_STRANDS];
    let mut gamma = vec![0.0 as Float; n];

    for segment in segments {
        let strand = segment.strand;
        let base = models[strand];

        let mut corrected = segment.events.to_vec();
        for event in &mut corrected {
            event.mean -= pm_params.drift * (event.start - segment.t0);
        }

        let fb = ForwardBackward::fill(&scaled[strand], &transitions[strand], &corrected);
        #[cfg(not(feature = "f32"))]
        debug_assert!(
            !fb.log_z().is_finite() || (fb.log_z() - fb.backward_log_z()).abs() < 1e-3,
            "forward/backward evidence mismatch"
        );
        if !fb.log_z().is_finite() {
            return TrainOutcome {
                pm_params: *pm_params,
                st_params: *st_params,
                fit: Float::NEG_INFINITY,
                done: true,
            };
        }
        fit += fb.log_z();

        if options.train_scaling {
            for (t, raw) in segment.events.iter().enumerate() {
                fb.gamma_row(t, &mut gamma);
                let tau = raw.start - segment.t0;
                for (i, &g) in gamma.iter().enumerate() {
                    if g <= 0.0 {
                        continue;
                    }
                    let state = base.state(i);
                    let mu = state.level_mean;
                    let w = g / (state.level_stdv * state.level_stdv);
                    let x = raw.mean;
                    level.g += g;
                    level.w += w;
                    level.wx += w * x;
                    level.wxx += w * x * x;
                    level.wm += w * mu;
                    level.wt += w * tau;
                    level.wmm += w * mu * mu;
                    level.wmt += w * mu * tau;
                    level.wtt += w * tau * tau;
                    level.wmx += w * mu * x;
                    level.wtx += w * tau * x;

                    let m = state.sd_mean;
                    let lambda = state.sd_lambda;
                    let y = raw.stdv;
                    sd.s1 += g * lambda * y / (m * m);
                    sd.s2 += g * lambda / m;
                    sd.s3 += g * lambda / y;
                }
            }
        }

        if options.train_transitions {
            accumulate_transition_stats(&fb, &st_params[strand], k, &mut trans[strand]);
        }
    }

    let mut done = false;
    let mut new_pm = *pm_params;
    if options.train_scaling {
        let (params, clamped) = solve_scaling(&level, &sd, pm_params);
        new_pm = params;
        if clamped >= 2 {
            done = true;
        }
    }

    let mut new_st = *st_params;
    if options.train_transitions {
        for strand in 0..NUM_STRANDS {
            if trans[strand].total > 0.0 {
                new_st[strand] = update_transitions(&trans[strand], &st_params[strand]);
            }
        }
    }

    TrainOutcome {
        pm_params: new_pm,
        st_params: new_st,
        fit,
        done,
    }
}

/// Weighted normal-equation solve for (scale, shift, drift), closed-form
/// `var` from the weighted residual, and closed-form (scale_sd, var_sd)
/// from the inverse-Gaussian moments. Returns the updated parameters and
/// how many of the four positive parameters had to be clamped.
fn solve_scaling(
    level: &LevelMoments,
    sd: &SdMoments,
    old: &PoreModelParams,
) -> (PoreModelParams, usize) {
    let mut params = *old;
    let mut clamped = 0usize;

    let system = [
        [level.wmm, level.wm, level.wmt],
        [level.wm, level.w, level.wt],
        [level.wmt, level.wt, level.wtt],
    ];
    let rhs = [level.wmx, level.wx, level.wtx];
    let (scale, shift, drift) = match solve3(&system, &rhs) {
        Some([a, b, d]) => (a, b, d),
        None => {
            // Degenerate in the drift direction (e.g. all events share a
            // start time); fall back to the 2x2 level-only fit.
            let det = level.wmm * level.w - level.wm * level.wm;
            if det.abs() <= Float::EPSILON * level.wmm.abs().max(level.w.abs()).powi(2) {
                return (params, 4);
            }
            let a = (level.wmx * level.w - level.wm * level.wx) / det;
            let b = (level.wmm * level.wx - level.wm * level.wmx) / det;
            (a, b, old.drift)
        }
    };

    params.shift = shift;
    params.drift = drift;
    params.scale = scale;
    if params.scale < VARIANCE_FLOOR {
        params.scale = VARIANCE_FLOOR;
        clamped += 1;
    }

    let residual = level.wxx - 2.0 * scale * level.wmx - 2.0 * shift * level.wx
        - 2.0 * drift * level.wtx
        + scale * scale * level.wmm
        + 2.0 * scale * shift * level.wm
        + 2.0 * scale * drift * level.wmt
        + shift * shift * level.w
        + 2.0 * shift * drift * level.wt
        + drift * drift * level.wtt;
    if level.g > 0.0 && residual > 0.0 {
        params.var = (residual / level.g).sqrt();
    } else {
        params.var = VARIANCE_FLOOR;
    }
    if params.var < VARIANCE_FLOOR {
        params.var = VARIANCE_FLOOR;
        clamped += 1;
    }

    if sd.s2 > 0.0 {
        params.scale_sd = sd.s1 / sd.s2;
    }
    if params.scale_sd < VARIANCE_FLOOR {
        params.scale_sd = VARIANCE_FLOOR;
        clamped += 1;
    }

    let inv_var_sd =
        (sd.s1 / (params.scale_sd * params.scale_sd) - 2.0 * sd.s2 / params.scale_sd + sd.s3)
            / level.g;
    if inv_var_sd.is_finite() && inv_var_sd > 0.0 {
        params.var_sd = 1.0 / inv_var_sd;
    }
    if params.var_sd < VARIANCE_FLOOR {
        params.var_sd = VARIANCE_FLOOR;
        clamped += 1;
    }

    (params, clamped)
}

fn solve3(m: &[[Float; 3]; 3], rhs: &[Float; 3]) -> Option<[Float; 3]> {
    let det = det3(m);
    let magnitude = m
        .iter()
        .flatten()
        .fold(0.0 as Float, |acc, v| acc.max(v.abs()));
    if det.abs() <= magnitude.powi(3) * 1e-12 {
        return None;
    }
    let mut solution = [0.0 as Float; 3];
    for (col, slot) in solution.iter_mut().enumerate() {
        let mut numerator = *m;
        for row in 0..3 {
            numerator[row][col] = rhs[row];
        }
        *slot = det3(&numerator) / det;
    }
    Some(solution)
}

fn det3(m: &[[Float; 3]; 3]) -> Float {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Accumulate the posterior stay mass and the per-level skip mass for one
/// segment. Edge posteriors are attributed per component type, so the
/// coincident stay/self-step edges of homopolymer states do not bias the
/// statistics. Skip levels use the factorised form: sources sharing a
/// suffix group connect to every destination of the group, so the edge sum
/// is a product of two group sums.
fn accumulate_transition_stats(
    fb: &ForwardBackward,
    params: &StateTransitionParams,
    k: usize,
    stats: &mut TransStats,
) {
    let n = fb.n_states();
    let len = fb.len();
    if len < 2 {
        return;
    }
    stats.total += (len - 1) as Float;

    // Per-timestep maxima keep the shifted exponentials in range.
    let alpha_max: Vec<Float> = (0..len)
        .map(|t| (0..n).map(|i| fb.alpha(t, i)).fold(Float::NEG_INFINITY, Float::max))
        .collect();
    let arrive_max: Vec<Float> = (0..len)
        .map(|t| {
            (0..n)
                .map(|j| fb.emission(t, j) + fb.beta(t, j))
                .fold(Float::NEG_INFINITY, Float::max)
        })
        .collect();

    if params.p_stay > 0.0 {
        let ln_p_stay = params.p_stay.ln();
        for t in 0..len - 1 {
            let mut acc = LogSumExp::new();
            for i in 0..n {
                acc.add(fb.alpha(t, i) + fb.emission(t + 1, i) + fb.beta(t + 1, i));
            }
            stats.stay += (ln_p_stay + acc.value() - fb.log_z()).exp();
        }
    }

    for m in 2..=MAX_SKIP {
        let coeff = skip_level_coeff(params, m);
        if coeff <= 0.0 {
            continue;
        }
        let destinations = (1usize << (2 * m)) as Float;
        let group_bits = 2 * k.saturating_sub(m);
        let groups = 1usize << group_bits;
        let group_mask = groups - 1;
        let multiplicity = if m > k {
            (1usize << (2 * (m - k))) as Float
        } else {
            1.0
        };

        let mut source_sum = vec![0.0 as Float; groups];
        let mut target_sum = vec![0.0 as Float; groups];
        for t in 0..len - 1 {
            if alpha_max[t] == Float::NEG_INFINITY || arrive_max[t + 1] == Float::NEG_INFINITY {
                continue;
            }
            source_sum.iter_mut().for_each(|s| *s = 0.0);
            target_sum.iter_mut().for_each(|s| *s = 0.0);
            for i in 0..n {
                source_sum[i & group_mask] += (fb.alpha(t, i) - alpha_max[t]).exp();
            }
            for j in 0..n {
                target_sum[j >> (2 * k - group_bits)] +=
                    (fb.emission(t + 1, j) + fb.beta(t + 1, j) - arrive_max[t + 1]).exp();
            }
            let pairs: Float = source_sum
                .iter()
                .zip(&target_sum)
                .map(|(s, d)| s * d)
                .sum();
            stats.skip[m - 2] += coeff / destinations
                * multiplicity
                * pairs
                * (alpha_max[t] + arrive_max[t + 1] - fb.log_z()).exp();
        }
    }
}

/// Re-estimate p_stay from the stay mass, p_skip from the total skip mass,
/// and the geometric decay by weighted least squares on the log of the
/// per-level histogram.
fn update_transitions(stats: &TransStats, old: &StateTransitionParams) -> StateTransitionParams {
    let mut p_stay = (stats.stay / stats.total).clamp(PROB_FLOOR, 1.0 - 2.0 * PROB_FLOOR);
    let skip_total: Float = stats.skip.iter().sum();
    let mut p_skip = (skip_total / stats.total).clamp(PROB_FLOOR, 1.0 - 2.0 * PROB_FLOOR);
    if p_stay + p_skip > 1.0 - PROB_FLOOR {
        let rescale = (1.0 - PROB_FLOOR) / (p_stay + p_skip);
        p_stay *= rescale;
        p_skip *= rescale;
    }

    let mut p_skip_decay = old.p_skip_decay;
    let populated = stats.skip.iter().filter(|&&s| s > 0.0).count();
    if populated >= 2 {
        let (mut sw, mut swx, mut swy, mut swxx, mut swxy) =
            (0.0 as Float, 0.0 as Float, 0.0 as Float, 0.0 as Float, 0.0 as Float);
        for (index, &mass) in stats.skip.iter().enumerate() {
            if mass <= 0.0 {
                continue;
            }
            let x = index as Float;
            let y = mass.ln();
            sw += mass;
            swx += mass * x;
            swy += mass * y;
            swxx += mass * x * x;
            swxy += mass * x * y;
        }
        let denom = swxx - swx * swx / sw;
        if denom > 0.0 {
            let slope = (swxy - swx * swy / sw) / denom;
            p_skip_decay = slope.exp().clamp(DECAY_FLOOR, 1.0 - DECAY_FLOOR);
        }
    }

    StateTransitionParams::new(p_stay, p_skip, p_skip_decay)
}
