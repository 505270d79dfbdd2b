use std::{fmt, path::PathBuf, str::FromStr};

use clap::{Args, Parser};

use crate::transitions::StateTransitionParams;
use crate::{Float, Strand};

/// Call bases in Oxford Nanopore reads.
#[derive(Debug, Parser)]
#[clap(author, version, about)]
pub(crate) struct Cli {
    /// Inputs: directories, event files, or files of event-file names
    /// (use "-" to read a file list from standard input)
    #[clap(required = true, value_name = "path")]
    pub inputs: Vec<String>,

    /// Number of parallel threads
    #[clap(short = 't', long, default_value_t = 1, value_name = "int")]
    pub threads: usize,

    /// Thread chunk size
    #[clap(long, default_value_t = 1, value_name = "int")]
    pub chunk_size: usize,

    /// Output file (standard output if not given)
    #[clap(short, long, value_name = "file")]
    pub output: Option<PathBuf>,

    /// Per-read stats TSV file
    #[clap(long, value_name = "file")]
    pub stats: Option<PathBuf>,

    /// Log level, repeatable; "channel:level" adjusts a single channel
    #[clap(long = "log", value_name = "level")]
    pub log_levels: Vec<String>,

    #[clap(flatten, next_help_heading = "Model options")]
    pub model_args: ModelArgs,

    #[clap(flatten, next_help_heading = "Training options")]
    pub training_args: TrainingArgs,

    #[clap(flatten, next_help_heading = "Scaling options")]
    pub scaling_args: ScalingArgs,

    #[clap(flatten, next_help_heading = "Transition options")]
    pub transition_args: TransitionArgs,

    #[clap(flatten, next_help_heading = "Read filters")]
    pub read_filter_args: ReadFilterArgs,
}

#[derive(Debug, Args)]
pub(crate) struct ModelArgs {
    /// Candidate pore model, as strand:file with strand one of 0, 1, 2
    #[clap(short = 'm', long = "model", value_name = "strand:file")]
    pub models: Vec<ModelArg>,

    /// File of candidate pore models, one strand:file per line
    #[clap(long, value_name = "file")]
    pub model_fofn: Option<PathBuf>,

    /// Custom initial state transitions
    #[clap(short = 's', long = "trans", value_name = "file")]
    pub transitions: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub(crate) struct TrainingArgs {
    /// Enable training (the default)
    #[clap(long, conflicts_with = "no-train")]
    pub train: bool,

    /// Disable all training
    #[clap(long)]
    pub no_train: bool,

    /// Stop after training
    #[clap(long)]
    pub only_train: bool,

    /// Do not train pore model scaling
    #[clap(long)]
    pub no_train_scaling: bool,

    /// Do not train state transitions
    #[clap(long)]
    pub no_train_transitions: bool,

    /// Train scaling parameters per strand
    #[clap(long, conflicts_with = "double-strand-scaling")]
    pub single_strand_scaling: bool,

    /// Train scaling parameters per read (the default)
    #[clap(long)]
    pub double_strand_scaling: bool,
}

#[derive(Debug, Args)]
pub(crate) struct ScalingArgs {
    /// Lock in the best model per strand when its training fit beats the
    /// runner-up by this much
    #[clap(long, default_value_t = 20.0, value_name = "float")]
    pub scaling_select_threshold: Float,

    /// Minimum training fit progress
    #[clap(long, default_value_t = 1.0, value_name = "float")]
    pub scaling_min_progress: Float,

    /// Maximum training rounds
    #[clap(long, default_value_t = 10, value_name = "int")]
    pub scaling_max_rounds: u32,

    /// Number of events used for model scaling
    #[clap(long, default_value_t = 200, value_name = "int")]
    pub scaling_num_events: usize,
}

#[derive(Debug, Args)]
pub(crate) struct TransitionArgs {
    /// Transition probability of skipping at least one state
    #[clap(long, default_value_t = 0.3, value_name = "float")]
    pub pr_skip: Float,

    /// Transition probability of staying in the same state
    #[clap(long, default_value_t = 0.1, value_name = "float")]
    pub pr_stay: Float,
}

#[derive(Debug, Args)]
pub(crate) struct ReadFilterArgs {
    /// Minimum read length (events)
    #[clap(long = "min-len", default_value_t = 10, value_name = "int")]
    pub min_len: usize,

    /// Maximum read length (events)
    #[clap(long = "max-len", default_value_t = 50_000, value_name = "int")]
    pub max_len: usize,

    /// Maximum FASTA line width
    #[clap(long, default_value_t = 80, value_name = "int")]
    pub fasta_line_width: usize,

    /// Pairwise-align the two strand basecalls into a 2D consensus record
    #[clap(long = "2d-hmm")]
    pub two_d_hmm: bool,
}

/// A `strand:file` candidate-model argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ModelArg {
    pub strand: Strand,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParseModelArgError;

impl fmt::Display for ParseModelArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected \"strand:file\" with strand one of 0, 1, 2")
    }
}

impl std::error::Error for ParseModelArgError {}

impl FromStr for ModelArg {
    type Err = ParseModelArgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (strand, path) = s.split_once(':').ok_or(ParseModelArgError)?;
        if path.is_empty() {
            return Err(ParseModelArgError);
        }
        let strand = match strand {
            "0" => Strand::Template,
            "1" => Strand::Complement,
            "2" => Strand::Both,
            _ => return Err(ParseModelArgError),
        };
        Ok(Self {
            strand,
            path: PathBuf::from(path),
        })
    }
}

impl fmt::Display for ModelArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.strand.index(), self.path.display())
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("either --only-train or --no-train may be used, but not both")]
    OnlyTrainWithoutTraining,

    #[error("invalid {name}: {value}")]
    NegativeTuneable { name: &'static str, value: Float },

    #[error("pr-stay and pr-skip must be non-negative and sum below one")]
    InvalidTransitionProbabilities,

    #[error("{0} must be positive")]
    ZeroTuneable(&'static str),

    #[error("min-len may not exceed max-len")]
    BadLengthWindow,
}

impl Cli {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.training_args.only_train && self.training_args.no_train {
            return Err(ConfigError::OnlyTrainWithoutTraining);
        }
        if self.scaling_args.scaling_select_threshold < 0.0 {
            return Err(ConfigError::NegativeTuneable {
                name: "scaling-select-threshold",
                value: self.scaling_args.scaling_select_threshold,
            });
        }
        if self.scaling_args.scaling_min_progress < 0.0 {
            return Err(ConfigError::NegativeTuneable {
                name: "scaling-min-progress",
                value: self.scaling_args.scaling_min_progress,
            });
        }
        let (p_stay, p_skip) = (self.transition_args.pr_stay, self.transition_args.pr_skip);
        if p_stay < 0.0 || p_skip < 0.0 || p_stay + p_skip >= 1.0 {
            return Err(ConfigError::InvalidTransitionProbabilities);
        }
        if self.threads == 0 {
            return Err(ConfigError::ZeroTuneable("threads"));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroTuneable("chunk-size"));
        }
        if self.read_filter_args.fasta_line_width == 0 {
            return Err(ConfigError::ZeroTuneable("fasta-line-width"));
        }
        if self.read_filter_args.min_len > self.read_filter_args.max_len {
            return Err(ConfigError::BadLengthWindow);
        }
        Ok(())
    }

    pub(crate) fn train_enabled(&self) -> bool {
        !self.training_args.no_train
    }

    pub(crate) fn double_strand_scaling(&self) -> bool {
        !self.training_args.single_strand_scaling
    }

    pub(crate) fn train_scaling(&self) -> bool {
        self.train_enabled() && !self.training_args.no_train_scaling
    }

    pub(crate) fn train_transitions(&self) -> bool {
        self.train_enabled() && !self.training_args.no_train_transitions
    }

    pub(crate) fn default_st_params(&self) -> StateTransitionParams {
        StateTransitionParams::with_default_decay(
            self.transition_args.pr_stay,
            self.transition_args.pr_skip,
        )
    }
}
