mod cli;
mod event;
mod event_file;
mod fasta;
mod forward_backward;
mod kmer;
mod pairwise;
mod pore_model;
mod process_read;
mod read_summary;
mod trainer;
mod transitions;
mod viterbi;

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use rayon::prelude::*;

use crate::cli::Cli;
use crate::pore_model::{ModelDict, PoreModel};
use crate::read_summary::{ReadSummary, SummaryOptions};
use crate::transitions::StateTransitions;

// The whole pipeline runs in a single float width, chosen at compile time.
#[cfg(not(feature = "f32"))]
pub(crate) type Float = f64;
#[cfg(feature = "f32")]
pub(crate) type Float = f32;

pub(crate) const NUM_STRANDS: usize = 2;

/// Which strand(s) of a read a pore model is eligible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Strand {
    Template,
    Complement,
    Both,
}

impl Strand {
    pub(crate) fn index(self) -> usize {
        match self {
            Strand::Template => 0,
            Strand::Complement => 1,
            Strand::Both => 2,
        }
    }

    pub(crate) fn applies_to(self, strand: usize) -> bool {
        self == Strand::Both || self.index() == strand
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

fn init_logging(specs: &[String]) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log::LevelFilter::Info);
    for spec in specs {
        match spec.split_once(':') {
            Some((channel, level)) => {
                let level = level
                    .parse()
                    .with_context(|| format!("invalid log level in [{spec}]"))?;
                builder.filter_module(channel, level);
            }
            None => {
                let level = spec
                    .parse()
                    .with_context(|| format!("invalid log level [{spec}]"))?;
                builder.filter_level(level);
            }
        }
    }
    builder.try_init().context("installing logger")?;
    Ok(())
}

fn init_models(cli: &Cli) -> anyhow::Result<ModelDict> {
    let mut specs = cli.model_args.models.clone();
    if let Some(fofn) = &cli.model_args.model_fofn {
        let reader = event_file::open_text(fofn)
            .with_context(|| format!("opening model fofn [{}]", fofn.display()))?;
        for line in reader.lines() {
            let line = line.context("reading model fofn")?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            specs.push(
                trimmed
                    .parse()
                    .map_err(|err| anyhow::anyhow!("in model fofn: {err}"))?,
            );
        }
    }
    if specs.is_empty() {
        anyhow::bail!("no pore models given; use -m or --model-fofn");
    }

    let for_strand =
        |strand: Strand| specs.iter().any(|spec: &cli::ModelArg| spec.strand == strand);
    if !for_strand(Strand::Both) && (for_strand(Strand::Template) != for_strand(Strand::Complement))
    {
        let specified = if for_strand(Strand::Template) { 0 } else { 1 };
        anyhow::bail!(
            "models were specified only for strand {specified}; give models for both strands, \
             or for neither"
        );
    }

    let mut models = ModelDict::default();
    let mut k = None;
    for spec in specs {
        let reader = event_file::open_text(&spec.path)
            .with_context(|| format!("opening model file [{}]", spec.path.display()))?;
        let model = PoreModel::from_reader(reader)
            .with_context(|| format!("parsing model file [{}]", spec.path.display()))?
            .with_strand(spec.strand);
        match k {
            None => k = Some(model.k()),
            Some(k) if k != model.k() => {
                anyhow::bail!(
                    "model [{}] has k = {}, but earlier models have k = {k}",
                    spec.path.display(),
                    model.k()
                );
            }
            Some(_) => {}
        }
        let name = spec.path.display().to_string();
        info!(
            "loaded model [{name}] for strand [{}] statistics [mean={:.3}, stdv={:.3}]",
            spec.strand,
            model.mean(),
            model.stdv()
        );
        models.insert(name, model);
    }
    Ok(models)
}

fn init_transitions(cli: &Cli, k: usize) -> anyhow::Result<StateTransitions> {
    if let Some(path) = &cli.model_args.transitions {
        let reader = event_file::open_text(path)
            .with_context(|| format!("opening transitions file [{}]", path.display()))?;
        let transitions = StateTransitions::from_reader(reader)
            .with_context(|| format!("parsing transitions file [{}]", path.display()))?;
        if transitions.k() != k {
            anyhow::bail!(
                "transitions file [{}] has k = {}, but the models have k = {k}",
                path.display(),
                transitions.k()
            );
        }
        info!("loaded state transitions from [{}]", path.display());
        Ok(transitions)
    } else {
        info!(
            "init_state_transitions pr_skip [{}] pr_stay [{}]",
            cli.transition_args.pr_skip, cli.transition_args.pr_stay
        );
        Ok(StateTransitions::from_probabilities(
            k,
            cli.transition_args.pr_stay,
            cli.transition_args.pr_skip,
        ))
    }
}

fn init_reads(cli: &Cli, models: &ModelDict) -> anyhow::Result<Vec<ReadSummary>> {
    let files = event_file::expand_inputs(&cli.inputs)?;
    let options = SummaryOptions {
        double_strand_scaling: cli.double_strand_scaling(),
        min_len: cli.read_filter_args.min_len,
        max_len: cli.read_filter_args.max_len,
        default_st: cli.default_st_params(),
    };
    let mut reads = Vec::with_capacity(files.len());
    for file in &files {
        match ReadSummary::summarize(file, models, &options) {
            Ok(summary) => {
                info!(
                    "summary read [{}] file [{}] n_events [{}, {}]",
                    summary.read_id,
                    summary.base_file_name,
                    summary.n_events[0],
                    summary.n_events[1]
                );
                reads.push(summary);
            }
            Err(err) => {
                error!("skipping unreadable input [{}]: {err}", file.display());
            }
        }
    }
    if reads.is_empty() {
        anyhow::bail!("no readable event files");
    }
    Ok(reads)
}

fn train_reads(ctx: &process_read::Ctx, reads: &mut [ReadSummary], stop: &AtomicBool) {
    let total = reads.len();
    let processed = AtomicUsize::new(0);
    let chunk_size = ctx.cli.chunk_size;
    reads.par_chunks_mut(chunk_size).for_each(|chunk| {
        for summary in chunk.iter_mut() {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            if summary.total_events() == 0 {
                continue;
            }
            if let Err(err) = process_read::train_read(ctx, summary) {
                error!("read [{}]: training failed: {err:#}", summary.read_id);
                summary.error = Some(format!("training failed: {err:#}"));
            }
        }
        let done = processed.fetch_add(chunk.len(), Ordering::Relaxed) + chunk.len();
        info!("trained {done} / {total} reads");
    });
}

fn basecall_reads(
    ctx: &process_read::Ctx,
    reads: &mut [ReadSummary],
    writer: &Mutex<Box<dyn Write + Send>>,
    stop: &AtomicBool,
) {
    let total = reads.len();
    let processed = AtomicUsize::new(0);
    let chunk_size = ctx.cli.chunk_size;
    reads.par_chunks_mut(chunk_size).for_each(|chunk| {
        let mut buffer = String::new();
        for summary in chunk.iter_mut() {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            if summary.total_events() == 0 {
                continue;
            }
            buffer.clear();
            match process_read::basecall_read(ctx, summary, &mut buffer) {
                Ok(()) => {
                    // Whole-read flush under the writer mutex keeps records
                    // from different reads from interleaving.
                    let mut writer = writer.lock().expect("output writer mutex poisoned");
                    if let Err(err) = writer.write_all(buffer.as_bytes()) {
                        error!("writing output failed: {err}");
                        stop.store(true, Ordering::Relaxed);
                        return;
                    }
                }
                Err(err) => {
                    error!("read [{}]: basecalling failed: {err:#}", summary.read_id);
                    summary.error = Some(format!("basecalling failed: {err:#}"));
                }
            }
        }
        let done = processed.fetch_add(chunk.len(), Ordering::Relaxed) + chunk.len();
        info!("basecalled {done} / {total} reads");
    });
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_levels)?;
    cli.validate()?;

    info!("num_threads [{}]", cli.threads);
    info!("train [{}]", cli.train_enabled());
    if cli.train_enabled() {
        info!("only_train [{}]", cli.training_args.only_train);
        info!("train_scaling [{}]", cli.train_scaling());
        info!("train_transitions [{}]", cli.train_transitions());
        if cli.train_scaling() {
            info!("double_strand_scaling [{}]", cli.double_strand_scaling());
            info!(
                "scaling_num_events [{}] scaling_max_rounds [{}] scaling_min_progress [{}] \
                 scaling_select_threshold [{}]",
                cli.scaling_args.scaling_num_events,
                cli.scaling_args.scaling_max_rounds,
                cli.scaling_args.scaling_min_progress,
                cli.scaling_args.scaling_select_threshold
            );
        }
    }

    let models = init_models(&cli)?;
    let k = models
        .values()
        .next()
        .map(PoreModel::k)
        .context("no models loaded")?;
    let default_transitions = init_transitions(&cli, k)?;
    let default_st_params = *default_transitions.params();
    let mut reads = init_reads(&cli, &models)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cli.threads)
        .build()
        .context("building worker pool")?;
    let ctx = process_read::Ctx {
        cli: &cli,
        models: &models,
        default_transitions: &default_transitions,
        default_st_params,
    };
    let stop = AtomicBool::new(false);

    if cli.train_enabled() {
        pool.install(|| train_reads(&ctx, &mut reads, &stop));
    }

    if !cli.training_args.only_train {
        let output: Box<dyn Write + Send> = match &cli.output {
            Some(path) => Box::new(BufWriter::new(File::create(path).with_context(|| {
                format!("creating output file [{}]", path.display())
            })?)),
            None => Box::new(BufWriter::new(io::stdout())),
        };
        let writer = Mutex::new(output);
        pool.install(|| basecall_reads(&ctx, &mut reads, &writer, &stop));
        writer
            .into_inner()
            .expect("output writer mutex poisoned")
            .flush()
            .context("flushing output")?;
        if stop.load(Ordering::Relaxed) {
            anyhow::bail!("output writer failed");
        }
    }

    if let Some(path) = &cli.stats {
        let mut writer = BufWriter::new(
            File::create(path)
                .with_context(|| format!("creating stats file [{}]", path.display()))?,
        );
        ReadSummary::write_tsv_header(&mut writer).context("writing stats header")?;
        for summary in &reads {
            summary.write_tsv(&mut writer).context("writing stats row")?;
        }
        writer.flush().context("flushing stats")?;
    }

    Ok(())
}
