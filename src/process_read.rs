use anyhow::Context;
use itertools::Itertools;
use log::{debug, info, warn};

use crate::cli::Cli;
use crate::event::EventSequence;
use crate::fasta;
use crate::pairwise;
use crate::pore_model::{ModelDict, PoreModelParams};
use crate::read_summary::{model_key_name, ModelKey, ReadSummary};
use crate::trainer::{train_one_round, TrainOptions, TrainOutcome, TrainingSegment};
use crate::transitions::{StateTransitionParams, StateTransitions};
use crate::viterbi::{Viterbi, ViterbiError};
use crate::{Float, NUM_STRANDS};

/// Shared read-only state handed to every worker.
pub(crate) struct Ctx<'a> {
    pub cli: &'a Cli,
    pub models: &'a ModelDict,
    pub default_transitions: &'a StateTransitions,
    pub default_st_params: StateTransitionParams,
}

pub(crate) struct LoopOutcome {
    pub pm_params: PoreModelParams,
    pub st_params: [StateTransitionParams; NUM_STRANDS],
    pub fit: Float,
    pub rounds: u32,
}

/// Iterate training rounds until the round cap, insufficient progress, a
/// singularity, or a regression (which rolls back to the previous
/// parameters).
pub(crate) fn training_loop<F>(
    label: &str,
    max_rounds: u32,
    min_progress: Float,
    initial_pm: PoreModelParams,
    initial_st: [StateTransitionParams; NUM_STRANDS],
    mut round_fn: F,
) -> LoopOutcome
where
    F: FnMut(&PoreModelParams, &[StateTransitionParams; NUM_STRANDS]) -> TrainOutcome,
{
    let mut crt_pm = initial_pm;
    let mut crt_st = initial_st;
    let mut crt_fit = Float::NEG_INFINITY;
    let mut rounds = 0u32;
    loop {
        let old_pm = crt_pm;
        let old_st = crt_st;
        let old_fit = crt_fit;
        let outcome = round_fn(&crt_pm, &crt_st);
        crt_pm = outcome.pm_params;
        crt_st = outcome.st_params;
        crt_fit = outcome.fit;
        debug!(
            "scaling_round {label} round [{rounds}] old_fit [{old_fit:.3}] crt_fit [{crt_fit:.3}]"
        );
        if outcome.done {
            if !crt_fit.is_finite() {
                crt_pm = old_pm;
                crt_st = old_st;
                crt_fit = old_fit;
            }
            break;
        }
        if crt_fit < old_fit {
            info!(
                "scaling_regression {label} old_fit [{old_fit:.3}] crt_fit [{crt_fit:.3}]; \
                 rolling back"
            );
            crt_pm = old_pm;
            crt_st = old_st;
            crt_fit = old_fit;
            break;
        }
        rounds += 1;
        if rounds >= max_rounds || (rounds > 1 && crt_fit < old_fit + min_progress) {
            break;
        }
    }
    LoopOutcome {
        pm_params: crt_pm,
        st_params: crt_st,
        fit: crt_fit,
        rounds,
    }
}

/// Names of the candidate models for each strand: the locked-in choice if
/// one exists, otherwise every model eligible for the strand, in name
/// order.
fn candidate_models(ctx: &Ctx, summary: &ReadSummary, strand: usize) -> Vec<String> {
    if let Some(name) = summary.preferred_model[strand]
        .as_ref()
        .map(|key| &key[strand])
        .filter(|name| !name.is_empty())
    {
        return vec![name.clone()];
    }
    ctx.models
        .iter()
        .filter(|(_, model)| model.strand().applies_to(strand))
        .map(|(name, _)| name.clone())
        .sorted()
        .collect()
}

fn build_training_segments<'a>(
    ctx: &Ctx,
    events: &'a [EventSequence; NUM_STRANDS],
    strand: usize,
) -> Vec<TrainingSegment<'a>> {
    let all = events[strand].as_slice();
    if all.len() < ctx.cli.read_filter_args.min_len {
        return Vec::new();
    }
    let n_train = ctx.cli.scaling_args.scaling_num_events.min(all.len());
    let half = n_train / NUM_STRANDS;
    if half == 0 {
        return Vec::new();
    }
    let t0 = events[strand].start_time();
    vec![
        TrainingSegment {
            events: &all[..half],
            strand,
            t0,
        },
        TrainingSegment {
            events: &all[all.len() - half..],
            strand,
            t0,
        },
    ]
}

/// Lock in the highest-fit candidate when it leads every other one by at
/// least the selection threshold; smaller gaps (including exact fit ties)
/// stay ambiguous.
fn select_preferred(fits: &[(ModelKey, Float, u32)], threshold: Float) -> Option<ModelKey> {
    let (best_key, best_fit, _) = fits
        .iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| b.0.cmp(&a.0)))?;
    fits.iter()
        .all(|(key, fit, _)| key == best_key || fit + threshold <= *best_fit)
        .then(|| best_key.clone())
}

/// Training phase for one read: fit scaling and transition parameters for
/// every candidate model, then attempt to lock in a preferred model.
pub(crate) fn train_read(ctx: &Ctx, summary: &mut ReadSummary) -> anyhow::Result<()> {
    if summary.total_events() == 0 {
        return Ok(());
    }
    let events = summary
        .load_events(ctx.cli.read_filter_args.max_len)
        .context("loading events")?;
    let options = TrainOptions {
        train_scaling: ctx.cli.train_scaling(),
        train_transitions: ctx.cli.train_transitions(),
    };
    let max_rounds = ctx.cli.scaling_args.scaling_max_rounds;
    let min_progress = ctx.cli.scaling_args.scaling_min_progress;
    let threshold = ctx.cli.scaling_args.scaling_select_threshold;

    if summary.scale_strands_together {
        let segments: Vec<TrainingSegment> = (0..NUM_STRANDS)
            .flat_map(|strand| build_training_segments(ctx, &events, strand))
            .collect();
        if segments.is_empty() {
            return Ok(());
        }
        let model_names: [Vec<String>; NUM_STRANDS] = [
            candidate_models(ctx, summary, 0),
            candidate_models(ctx, summary, 1),
        ];
        let mut fits: Vec<(ModelKey, Float, u32)> = Vec::new();
        for name_0 in &model_names[0] {
            for name_1 in &model_names[1] {
                let key: ModelKey = [name_0.clone(), name_1.clone()];
                let models = [
                    ctx.models.get(name_0).context("unknown model")?,
                    ctx.models.get(name_1).context("unknown model")?,
                ];
                let initial_pm = summary.pm_params.get(&key).copied().unwrap_or_default();
                let initial_st = summary
                    .st_params
                    .get(&key)
                    .copied()
                    .unwrap_or([ctx.default_st_params; NUM_STRANDS]);
                let label = format!(
                    "read [{}] strand [2] model [{}]",
                    summary.read_id,
                    model_key_name(&key)
                );
                // Each joint round updates fewer parameters per strand, so
                // the round cap is doubled.
                let outcome = training_loop(
                    &label,
                    2 * max_rounds,
                    min_progress,
                    initial_pm,
                    initial_st,
                    |pm, st| train_one_round(&segments, models, pm, st, &options),
                );
                info!(
                    "scaling_result {label} pm_params [{}] st_params [{},{}] fit [{:.3}] \
                     rounds [{}]",
                    outcome.pm_params,
                    outcome.st_params[0],
                    outcome.st_params[1],
                    outcome.fit,
                    outcome.rounds
                );
                summary.pm_params.insert(key.clone(), outcome.pm_params);
                summary.st_params.insert(key.clone(), outcome.st_params);
                fits.push((key, outcome.fit, outcome.rounds));
            }
        }
        if let Some((_, fit, rounds)) = fits
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| b.0.cmp(&a.0)))
        {
            summary.record_training(NUM_STRANDS, *rounds, *fit);
        }
        if threshold < Float::INFINITY {
            if let Some(key) = select_preferred(&fits, threshold) {
                info!(
                    "selected_model read [{}] strand [2] model [{}]",
                    summary.read_id,
                    model_key_name(&key)
                );
                summary.preferred_model[NUM_STRANDS] = Some(key);
            }
        }
    } else {
        for strand in 0..NUM_STRANDS {
            let segments = build_training_segments(ctx, &events, strand);
            if segments.is_empty() {
                continue;
            }
            let mut fits: Vec<(ModelKey, Float, u32)> = Vec::new();
            for name in candidate_models(ctx, summary, strand) {
                let mut key: ModelKey = Default::default();
                key[strand] = name.clone();
                let model = ctx.models.get(&name).context("unknown model")?;
                let initial_pm = summary.pm_params.get(&key).copied().unwrap_or_default();
                let initial_st = summary
                    .st_params
                    .get(&key)
                    .copied()
                    .unwrap_or([ctx.default_st_params; NUM_STRANDS]);
                let label =
                    format!("read [{}] strand [{strand}] model [{name}]", summary.read_id);
                let outcome = training_loop(
                    &label,
                    max_rounds,
                    min_progress,
                    initial_pm,
                    initial_st,
                    |pm, st| train_one_round(&segments, [model, model], pm, st, &options),
                );
                info!(
                    "scaling_result {label} pm_params [{}] st_params [{}] fit [{:.3}] rounds [{}]",
                    outcome.pm_params, outcome.st_params[strand], outcome.fit, outcome.rounds
                );
                summary.pm_params.insert(key.clone(), outcome.pm_params);
                summary.st_params.insert(key.clone(), outcome.st_params);
                fits.push((key, outcome.fit, outcome.rounds));
            }
            if let Some((_, fit, rounds)) = fits
                .iter()
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| b.0.cmp(&a.0)))
            {
                summary.record_training(strand, *rounds, *fit);
            }
            if threshold < Float::INFINITY {
                if let Some(key) = select_preferred(&fits, threshold) {
                    info!(
                        "selected_model read [{}] strand [{strand}] model [{}]",
                        summary.read_id,
                        model_key_name(&key)
                    );
                    summary.preferred_model[strand] = Some(key);
                }
            }
        }
    }
    Ok(())
}

struct StrandCall {
    log_prob: Float,
    base_seq: String,
}

/// Decoding phase for one read: run Viterbi under every applicable
/// candidate, keep the best-scoring one per strand (ties by model name),
/// and emit FASTA records into the per-read output buffer.
pub(crate) fn basecall_read(
    ctx: &Ctx,
    summary: &mut ReadSummary,
    out: &mut String,
) -> anyhow::Result<()> {
    if summary.total_events() == 0 {
        return Ok(());
    }
    let events = summary
        .load_events(ctx.cli.read_filter_args.max_len)
        .context("loading events")?;
    // A strand needs at least one event to decode at all.
    let min_len = ctx.cli.read_filter_args.min_len.max(1);
    let line_width = ctx.cli.read_filter_args.fasta_line_width;
    let read_id = summary.read_id.clone();
    let base_file_name = summary.base_file_name.clone();

    let mut r_stats = [(0.0 as Float, 0.0 as Float); NUM_STRANDS];
    for strand in 0..NUM_STRANDS {
        if events[strand].len() >= min_len {
            r_stats[strand] = events[strand].mean_stdv();
            debug!(
                "mean_stdv read [{read_id}] strand [{strand}] ev_mean [{:.3}] ev_stdv [{:.3}]",
                r_stats[strand].0, r_stats[strand].1
            );
        }
    }

    let can_do_2d = (0..NUM_STRANDS).all(|strand| summary.strand_eligible(strand, min_len));
    let do_2d = ctx.cli.read_filter_args.two_d_hmm && can_do_2d;
    if ctx.cli.read_filter_args.two_d_hmm && !can_do_2d {
        debug!("read [{read_id}]: 2d consensus skipped, a strand is below min-len");
    }

    let basecall_strand = {
        let read_id = read_id.clone();
        let events = &events;
        move |strand: usize,
              name: &str,
              pm: &PoreModelParams,
              st: &StateTransitionParams|
         -> anyhow::Result<Option<StrandCall>> {
            let model = ctx.models.get(name).context("unknown model")?;
            let scaled = model.scaled(pm);
            info!(
                "basecalling read [{read_id}] strand [{strand}] model [{name}] pm_params \
                 [{pm}] st_params [{st}]"
            );
            if (r_stats[strand].0 - scaled.mean()).abs() > 5.0 {
                warn!(
                    "means_apart read [{read_id}] strand [{strand}] model [{name}] \
                     model_mean [{:.3}] events_mean [{:.3}]",
                    scaled.mean(),
                    r_stats[strand].0
                );
            }
            let custom;
            let transitions = if *st == ctx.default_st_params {
                ctx.default_transitions
            } else {
                custom = StateTransitions::compute_fast(model.k(), st);
                &custom
            };
            let mut corrected = events[strand].clone();
            corrected.apply_drift_correction(pm.drift);
            match Viterbi::decode(&scaled, transitions, corrected.as_slice()) {
                Ok(decoded) => Ok(Some(StrandCall {
                    log_prob: decoded.path_log_prob(),
                    base_seq: decoded.base_seq(),
                })),
                Err(ViterbiError::Underflow) => {
                    debug!("decode_underflow read [{read_id}] strand [{strand}] model [{name}]");
                    Ok(None)
                }
                Err(err @ ViterbiError::EmptyEvents) => Err(err.into()),
            }
        }
    };

    let mut strand_seqs: [Option<String>; NUM_STRANDS] = Default::default();
    let emit = {
        let read_id = read_id.clone();
        let base_file_name = base_file_name.clone();
        move |out: &mut String,
              strand_seqs: &mut [Option<String>; NUM_STRANDS],
              strand: usize,
              seq: String|
         -> anyhow::Result<()> {
            if do_2d {
                strand_seqs[strand] = Some(seq);
            } else {
                let description = format!("{read_id}:{base_file_name}:{strand}");
                fasta::write_record(out, &description, &seq, line_width)?;
            }
            Ok(())
        }
    };

    if summary.scale_strands_together {
        let mut candidates: Vec<ModelKey> =
            if let Some(key) = &summary.preferred_model[NUM_STRANDS] {
                vec![key.clone()]
            } else {
                summary
                    .pm_params
                    .keys()
                    .filter(|key| !key[0].is_empty() && !key[1].is_empty())
                    .cloned()
                    .collect()
            };
        candidates.sort();

        let mut best: Option<(Float, ModelKey, [Option<StrandCall>; NUM_STRANDS])> = None;
        for key in candidates {
            let pm = summary.pm_params.get(&key).copied().unwrap_or_default();
            let st = summary
                .st_params
                .get(&key)
                .copied()
                .unwrap_or([ctx.default_st_params; NUM_STRANDS]);
            let mut calls: [Option<StrandCall>; NUM_STRANDS] = Default::default();
            let mut total = 0.0 as Float;
            let mut failed = false;
            for strand in 0..NUM_STRANDS {
                if events[strand].len() < min_len {
                    continue;
                }
                match basecall_strand(strand, &key[strand], &pm, &st[strand])? {
                    Some(call) => {
                        total += call.log_prob;
                        calls[strand] = Some(call);
                    }
                    None => {
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                continue;
            }
            if best.as_ref().map_or(true, |(score, ..)| total > *score) {
                best = Some((total, key, calls));
            }
        }

        match best {
            Some((_, key, mut calls)) => {
                for strand in 0..NUM_STRANDS {
                    let Some(call) = calls[strand].take() else {
                        continue;
                    };
                    info!(
                        "best_model read [{}] strand [{strand}] model [{}] log_path_prob \
                         [{:.3}]",
                        summary.read_id,
                        model_key_name(&key),
                        call.log_prob
                    );
                    summary.preferred_model[strand] = Some(key.clone());
                    emit(out, &mut strand_seqs, strand, call.base_seq)?;
                }
            }
            None => {
                warn!(
                    "read [{}]: every candidate model underflowed; emitting empty sequences",
                    summary.read_id
                );
                for strand in 0..NUM_STRANDS {
                    if events[strand].len() >= min_len {
                        emit(out, &mut strand_seqs, strand, String::new())?;
                    }
                }
            }
        }
    } else {
        for strand in 0..NUM_STRANDS {
            if events[strand].len() < min_len {
                continue;
            }
            let mut candidates: Vec<ModelKey> =
                if let Some(key) = &summary.preferred_model[strand] {
                    vec![key.clone()]
                } else {
                    summary
                        .pm_params
                        .keys()
                        .filter(|key| !key[strand].is_empty() && key[1 - strand].is_empty())
                        .cloned()
                        .collect()
                };
            candidates.sort();

            let mut best: Option<(Float, ModelKey, StrandCall)> = None;
            for key in candidates {
                let pm = summary.pm_params.get(&key).copied().unwrap_or_default();
                let st = summary
                    .st_params
                    .get(&key)
                    .copied()
                    .unwrap_or([ctx.default_st_params; NUM_STRANDS]);
                if let Some(call) = basecall_strand(strand, &key[strand], &pm, &st[strand])? {
                    if best
                        .as_ref()
                        .map_or(true, |(score, ..)| call.log_prob > *score)
                    {
                        best = Some((call.log_prob, key, call));
                    }
                }
            }

            match best {
                Some((_, key, call)) => {
                    info!(
                        "best_model read [{}] strand [{strand}] model [{}] log_path_prob \
                         [{:.3}]",
                        summary.read_id,
                        model_key_name(&key),
                        call.log_prob
                    );
                    summary.preferred_model[strand] = Some(key);
                    emit(out, &mut strand_seqs, strand, call.base_seq)?;
                }
                None => {
                    warn!(
                        "read [{}] strand [{strand}]: every candidate model underflowed; \
                         emitting an empty sequence",
                        summary.read_id
                    );
                    emit(out, &mut strand_seqs, strand, String::new())?;
                }
            }
        }
    }

    if do_2d {
        if let (Some(template), Some(complement)) = (&strand_seqs[0], &strand_seqs[1]) {
            let consensus = pairwise::align_2d(template, complement);
            let description =
                format!("{read_id}:{base_file_name}:2d score={}", consensus.score);
            fasta::write_record(out, &description, &consensus.sequence, line_width)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pore_model::{ModelState, PoreModel};
    use crate::read_summary::SummaryOptions;
    use crate::Strand;
    use clap::Parser;
    use std::io::Write;
    use std::path::PathBuf;

    fn default_st() -> [StateTransitionParams; NUM_STRANDS] {
        [StateTransitionParams::with_default_decay(0.1, 0.3); NUM_STRANDS]
    }

    fn fixed_outcome(pm: PoreModelParams, fit: Float, done: bool) -> TrainOutcome {
        TrainOutcome {
            pm_params: pm,
            st_params: default_st(),
            fit,
            done,
        }
    }

    #[test]
    fn regression_rolls_back_parameters() {
        let fits = [100.0, 50.0];
        let mut call = 0usize;
        let outcome = training_loop(
            "test",
            10,
            1.0,
            PoreModelParams::default(),
            default_st(),
            |pm, _st| {
                let fit = fits[call];
                call += 1;
                let mut new_pm = *pm;
                new_pm.shift += 1.0;
                fixed_outcome(new_pm, fit, false)
            },
        );
        // The second round regressed, so the first round's state survives.
        assert_eq!(outcome.rounds, 1);
        assert!((outcome.fit - 100.0).abs() < 1e-9);
        assert!((outcome.pm_params.shift - 1.0).abs() < 1e-9);
    }

    #[test]
    fn singular_first_round_keeps_initial_parameters() {
        let initial = PoreModelParams {
            shift: 7.0,
            ..PoreModelParams::default()
        };
        let outcome = training_loop("test", 10, 1.0, initial, default_st(), |pm, _st| {
            fixed_outcome(*pm, Float::NEG_INFINITY, true)
        });
        assert_eq!(outcome.rounds, 0);
        assert!((outcome.pm_params.shift - 7.0).abs() < 1e-9);
        assert_eq!(outcome.fit, Float::NEG_INFINITY);
    }

    #[test]
    fn insufficient_progress_stops_the_loop() {
        let fits = [10.0, 10.5, 10.8, 11.0];
        let mut call = 0usize;
        let outcome = training_loop(
            "test",
            10,
            1.0,
            PoreModelParams::default(),
            default_st(),
            |pm, _st| {
                let fit = fits[call];
                call += 1;
                fixed_outcome(*pm, fit, false)
            },
        );
        assert_eq!(outcome.rounds, 2);
        assert!((outcome.fit - 10.5).abs() < 1e-9);
    }

    #[test]
    fn round_cap_stops_the_loop() {
        let mut fit = 0.0;
        let outcome = training_loop(
            "test",
            3,
            1.0,
            PoreModelParams::default(),
            default_st(),
            |pm, _st| {
                fit += 100.0;
                fixed_outcome(*pm, fit, false)
            },
        );
        assert_eq!(outcome.rounds, 3);
    }

    #[test]
    fn selection_locks_in_at_the_exact_threshold() {
        let key_a: ModelKey = ["a".to_string(), String::new()];
        let key_b: ModelKey = ["b".to_string(), String::new()];
        let threshold = 20.0 as Float;

        // A lead of exactly the threshold is enough to lock in.
        let fits = [
            (key_a.clone(), -100.0 as Float, 3),
            (key_b.clone(), -120.0 as Float, 3),
        ];
        assert_eq!(select_preferred(&fits, threshold), Some(key_a.clone()));

        // A lead just under the threshold stays ambiguous.
        let fits = [
            (key_a.clone(), -100.0 as Float, 3),
            (key_b.clone(), -119.5 as Float, 3),
        ];
        assert_eq!(select_preferred(&fits, threshold), None);

        // Exact fit ties stay ambiguous too.
        let fits = [
            (key_a, -100.0 as Float, 3),
            (key_b, -100.0 as Float, 3),
        ];
        assert_eq!(select_preferred(&fits, threshold), None);
    }

    fn four_level_model() -> PoreModel {
        let states = (0..4)
            .map(|i| ModelState::new(10.0 * i as Float, 0.4, 1.0, 0.3))
            .collect();
        PoreModel::from_states(1, states).with_strand(Strand::Both)
    }

    fn write_events_file(name: &str, strands: &[usize]) -> PathBuf {
        let dir = std::env::temp_dir().join("porecall-test-process");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for (t, &strand) in strands.iter().enumerate() {
            let mean = 10.0 * ((t % 4) as f64);
            writeln!(
                file,
                "{strand}\t{mean}\t1.0\t{}\t0.01",
                t as f64 * 0.01
            )
            .unwrap();
        }
        file.flush().unwrap();
        path
    }

    fn test_cli(path: &PathBuf) -> Cli {
        Cli::try_parse_from([
            "porecall",
            "--single-strand-scaling",
            "--min-len",
            "4",
            "--scaling-num-events",
            "8",
            "--scaling-max-rounds",
            "2",
            path.to_str().unwrap(),
        ])
        .unwrap()
    }

    fn summary_options(cli: &Cli) -> SummaryOptions {
        SummaryOptions {
            double_strand_scaling: cli.double_strand_scaling(),
            min_len: cli.read_filter_args.min_len,
            max_len: cli.read_filter_args.max_len,
            default_st: cli.default_st_params(),
        }
    }

    #[test]
    fn tied_models_stay_ambiguous_and_decode_picks_by_name() {
        let path = write_events_file("tied.events", &[0; 12]);
        let cli = test_cli(&path);

        let mut models = ModelDict::default();
        models.insert("a".to_string(), four_level_model());
        models.insert("b".to_string(), four_level_model());
        let default_st_params = cli.default_st_params();
        let default_transitions = StateTransitions::compute_fast(1, &default_st_params);
        let ctx = Ctx {
            cli: &cli,
            models: &models,
            default_transitions: &default_transitions,
            default_st_params,
        };

        let mut summary =
            ReadSummary::summarize(&path, &models, &summary_options(&cli)).unwrap();
        train_read(&ctx, &mut summary).unwrap();
        // Identical models fit identically, so no winner is locked in.
        assert!(summary.preferred_model[0].is_none());

        let mut out = String::new();
        basecall_read(&ctx, &mut summary, &mut out).unwrap();
        let preferred = summary.preferred_model[0].as_ref().unwrap();
        assert_eq!(preferred[0], "a");
        assert!(out.starts_with(">tied:tied.events:0\n"));
    }

    #[test]
    fn unique_winner_is_locked_in() {
        let path = write_events_file("unique.events", &[0; 12]);
        let cli = test_cli(&path);

        // A flat model cannot separate the four event levels no matter how
        // it is rescaled, so the level-resolving model wins decisively.
        let flat_states = (0..4).map(|_| ModelState::new(15.0, 0.4, 1.0, 0.3)).collect();
        let flat = PoreModel::from_states(1, flat_states).with_strand(Strand::Both);
        let mut models = ModelDict::default();
        models.insert("good".to_string(), four_level_model());
        models.insert("flat".to_string(), flat);
        let default_st_params = cli.default_st_params();
        let default_transitions = StateTransitions::compute_fast(1, &default_st_params);
        let ctx = Ctx {
            cli: &cli,
            models: &models,
            default_transitions: &default_transitions,
            default_st_params,
        };

        let mut summary =
            ReadSummary::summarize(&path, &models, &summary_options(&cli)).unwrap();
        train_read(&ctx, &mut summary).unwrap();
        let preferred = summary.preferred_model[0].as_ref().unwrap();
        assert_eq!(preferred[0], "good");
    }

    #[test]
    fn two_d_consensus_record_replaces_strand_records() {
        let strands: Vec<usize> = (0..24).map(|t| t % 2).collect();
        let path = write_events_file("twod.events", &strands);
        let cli = Cli::try_parse_from([
            "porecall",
            "--single-strand-scaling",
            "--no-train",
            "--min-len",
            "4",
            "--2d-hmm",
            path.to_str().unwrap(),
        ])
        .unwrap();

        let mut models = ModelDict::default();
        models.insert("m".to_string(), four_level_model());
        let default_st_params = cli.default_st_params();
        let default_transitions = StateTransitions::compute_fast(1, &default_st_params);
        let ctx = Ctx {
            cli: &cli,
            models: &models,
            default_transitions: &default_transitions,
            default_st_params,
        };

        let mut summary =
            ReadSummary::summarize(&path, &models, &summary_options(&cli)).unwrap();
        let mut out = String::new();
        basecall_read(&ctx, &mut summary, &mut out).unwrap();
        assert!(out.starts_with(">twod:twod.events:2d score="));
        assert!(!out.contains(":0\n"));
        assert!(!out.contains(":1\n"));
    }
}

