use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fnv::FnvHashMap;

use crate::event::EventSequence;
use crate::event_file::{self, EventFileError, ReadEvents};
use crate::pore_model::{ModelDict, PoreModelParams};
use crate::transitions::StateTransitionParams;
use crate::{Float, NUM_STRANDS};

/// Key into the per-read parameter maps: one model name per strand, with an
/// empty slot for a strand the key does not cover.
pub(crate) type ModelKey = [String; NUM_STRANDS];

pub(crate) fn model_key_name(key: &ModelKey) -> String {
    match (key[0].is_empty(), key[1].is_empty()) {
        (false, false) => format!("{}+{}", key[0], key[1]),
        (false, true) => key[0].clone(),
        (true, false) => key[1].clone(),
        (true, true) => String::new(),
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SummaryOptions {
    pub double_strand_scaling: bool,
    pub min_len: usize,
    pub max_len: usize,
    pub default_st: StateTransitionParams,
}

/// Per-read bookkeeping: event counts, the per-model scaling and transition
/// parameters, the locked-in model choice, and the training diagnostics
/// reported by `--stats`. Events themselves are loaded on demand and never
/// stored here.
#[derive(Debug)]
pub(crate) struct ReadSummary {
    pub read_id: String,
    pub path: PathBuf,
    pub base_file_name: String,
    pub scale_strands_together: bool,
    pub n_events: [usize; NUM_STRANDS],
    pub pm_params: FnvHashMap<ModelKey, PoreModelParams>,
    pub st_params: FnvHashMap<ModelKey, [StateTransitionParams; NUM_STRANDS]>,
    /// Indexed by strand, with slot 2 holding the joint choice made under
    /// double-strand scaling.
    pub preferred_model: [Option<ModelKey>; NUM_STRANDS + 1],
    pub training_rounds: [u32; NUM_STRANDS + 1],
    pub training_fit: [Float; NUM_STRANDS + 1],
    pub error: Option<String>,
}

impl ReadSummary {
    pub(crate) fn summarize(
        path: &Path,
        models: &ModelDict,
        options: &SummaryOptions,
    ) -> Result<Self, EventFileError> {
        let read = event_file::read_file(path)?;
        Ok(Self::from_read_events(path, &read, models, options))
    }

    pub(crate) fn from_read_events(
        path: &Path,
        read: &ReadEvents,
        models: &ModelDict,
        options: &SummaryOptions,
    ) -> Self {
        let n_events = [
            read.strands[0].len().min(options.max_len),
            read.strands[1].len().min(options.max_len),
        ];

        let mut pm_params = FnvHashMap::default();
        let mut st_params = FnvHashMap::default();
        let mut insert = |key: ModelKey| {
            pm_params.insert(key.clone(), PoreModelParams::default());
            st_params.insert(key, [options.default_st; NUM_STRANDS]);
        };
        if options.double_strand_scaling {
            for (name_0, model_0) in models {
                if !model_0.strand().applies_to(0) {
                    continue;
                }
                for (name_1, model_1) in models {
                    if model_1.strand().applies_to(1) {
                        insert([name_0.clone(), name_1.clone()]);
                    }
                }
            }
        } else {
            for strand in 0..NUM_STRANDS {
                for (name, model) in models {
                    if model.strand().applies_to(strand) {
                        let mut key: ModelKey = Default::default();
                        key[strand] = name.clone();
                        insert(key);
                    }
                }
            }
        }

        Self {
            read_id: read.read_id.clone(),
            path: path.to_path_buf(),
            base_file_name: path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_string(),
            scale_strands_together: options.double_strand_scaling,
            n_events,
            pm_params,
            st_params,
            preferred_model: Default::default(),
            training_rounds: [0; NUM_STRANDS + 1],
            training_fit: [Float::NEG_INFINITY; NUM_STRANDS + 1],
            error: None,
        }
    }

    /// Total events across strands; a read with none is skipped outright.
    pub(crate) fn total_events(&self) -> usize {
        self.n_events.iter().sum()
    }

    pub(crate) fn strand_eligible(&self, strand: usize, min_len: usize) -> bool {
        self.n_events[strand] >= min_len
    }

    /// Re-read the event file, truncating each strand to the configured
    /// maximum. The caller owns the result and drops it when the read is
    /// done, which bounds memory to the active working set.
    pub(crate) fn load_events(
        &self,
        max_len: usize,
    ) -> Result<[EventSequence; NUM_STRANDS], EventFileError> {
        let read = event_file::read_file(&self.path)?;
        let mut strands = read.strands;
        for strand in &mut strands {
            strand.truncate(max_len);
        }
        Ok(strands)
    }

    fn strand_slot(&self, strand: usize) -> usize {
        if self.scale_strands_together {
            NUM_STRANDS
        } else {
            strand
        }
    }

    pub(crate) fn record_training(&mut self, strand_slot: usize, rounds: u32, fit: Float) {
        self.training_rounds[strand_slot] = rounds;
        self.training_fit[strand_slot] = fit;
    }

    pub(crate) fn write_tsv_header<W: Write>(mut writer: W) -> io::Result<()> {
        write!(writer, "read_id\tfile")?;
        for strand in 0..NUM_STRANDS {
            write!(
                writer,
                "\tn_events_{strand}\tmodel_{strand}\
                 \tscale_{strand}\tshift_{strand}\tdrift_{strand}\
                 \tvar_{strand}\tscale_sd_{strand}\tvar_sd_{strand}\
                 \tp_stay_{strand}\tp_skip_{strand}\tp_skip_decay_{strand}\
                 \trounds_{strand}\tfit_{strand}"
            )?;
        }
        writeln!(writer, "\terror")
    }

    pub(crate) fn write_tsv<W: Write>(&self, mut writer: W) -> io::Result<()> {
        write!(writer, "{}\t{}", self.read_id, self.base_file_name)?;
        for strand in 0..NUM_STRANDS {
            let key = self.preferred_model[strand]
                .as_ref()
                .or(self.preferred_model[NUM_STRANDS].as_ref());
            let model_name = key.map(model_key_name).unwrap_or_default();
            let pm = key
                .and_then(|key| self.pm_params.get(key))
                .copied()
                .unwrap_or_default();
            let st = key
                .and_then(|key| self.st_params.get(key))
                .map(|params| params[strand])
                .unwrap_or(StateTransitionParams::with_default_decay(0.0, 0.0));
            let slot = self.strand_slot(strand);
            write!(
                writer,
                "\t{}\t{}\t{:.5}\t{:.5}\t{:.5}\t{:.5}\t{:.5}\t{:.5}\t{:.5}\t{:.5}\t{:.5}\t{}\t{:.3}",
                self.n_events[strand],
                if model_name.is_empty() { "-" } else { model_name.as_str() },
                pm.scale,
                pm.shift,
                pm.drift,
                pm.var,
                pm.scale_sd,
                pm.var_sd,
                st.p_stay,
                st.p_skip,
                st.p_skip_decay,
                self.training_rounds[slot],
                self.training_fit[slot],
            )?;
        }
        writeln!(writer, "\t{}", self.error.as_deref().unwrap_or("-"))
    }
}
