use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Context;
use flate2::bufread::MultiGzDecoder;
use log::{info, warn};

use crate::event::{Event, EventSequence};
use crate::{Float, NUM_STRANDS};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Open a text input, transparently decompressing when the gzip magic
/// matches.
pub(crate) fn open_text(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let mut reader = BufReader::new(File::open(path)?);
    let head = reader.fill_buf()?;
    if head.starts_with(&GZIP_MAGIC) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

/// The events of one read, one sequence per strand.
#[derive(Debug)]
pub(crate) struct ReadEvents {
    pub read_id: String,
    pub strands: [EventSequence; NUM_STRANDS],
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EventFileError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("expected 5 fields (strand mean stdv start length) at line {0}")]
    InvalidFieldCount(usize),

    #[error("invalid strand at line {0}")]
    InvalidStrand(usize),

    #[error("invalid number at line {0}")]
    InvalidNumber(usize),

    #[error("non-positive event stdv at line {0}")]
    NonPositiveStdv(usize),
}

/// Parse an event file: optional `#read_id <id>` header, then
/// `strand mean stdv start length` rows. The read id falls back to the
/// file stem.
pub(crate) fn read_file(path: &Path) -> Result<ReadEvents, EventFileError> {
    let reader = open_text(path)?;
    read_events(reader, read_id_from_path(path))
}

fn read_events<R: BufRead>(reader: R, default_id: String) -> Result<ReadEvents, EventFileError> {
    let mut read_id = default_id;
    let mut strands: [Vec<Event>; NUM_STRANDS] = Default::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let row = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix('#') {
            let mut words = rest.split_whitespace();
            if words.next() == Some("read_id") {
                if let Some(id) = words.next() {
                    read_id = id.to_string();
                }
            }
            continue;
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let [strand, mean, stdv, start, length] = fields[..] else {
            return Err(EventFileError::InvalidFieldCount(row));
        };
        let strand: usize = strand
            .parse()
            .map_err(|_| EventFileError::InvalidStrand(row))?;
        if strand >= NUM_STRANDS {
            return Err(EventFileError::InvalidStrand(row));
        }
        let mut numbers = [0.0 as Float; 4];
        for (slot, field) in numbers.iter_mut().zip([mean, stdv, start, length]) {
            *slot = field
                .parse()
                .map_err(|_| EventFileError::InvalidNumber(row))?;
        }
        let [mean, stdv, start, length] = numbers;
        if stdv <= 0.0 {
            return Err(EventFileError::NonPositiveStdv(row));
        }
        strands[strand].push(Event::new(mean, stdv, start, length));
    }
    Ok(ReadEvents {
        read_id,
        strands: strands.map(EventSequence::new),
    })
}

pub(crate) fn is_event_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(".events") || name.ends_with(".events.gz"))
        .unwrap_or(false)
}

pub(crate) fn read_id_from_path(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("read");
    let name = name.strip_suffix(".gz").unwrap_or(name);
    let name = name.strip_suffix(".events").unwrap_or(name);
    name.to_string()
}

/// Expand the positional inputs: directories are enumerated non-recursively
/// for event files, event files are taken as-is, anything else is read as a
/// file of filenames, and `-` reads a fofn from standard input.
pub(crate) fn expand_inputs(inputs: &[String]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input == "-" {
            collect_fofn(io::stdin().lock(), &mut files)
                .context("reading file list from standard input")?;
            continue;
        }
        let path = Path::new(input);
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
                .with_context(|| format!("listing directory [{input}]"))?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<Result<_, _>>()
                .with_context(|| format!("listing directory [{input}]"))?;
            entries.sort();
            for entry in entries {
                if entry.is_dir() {
                    info!("ignoring subdirectory [{}]", entry.display());
                } else if is_event_file(&entry) {
                    info!("adding input file [{}]", entry.display());
                    files.push(entry);
                } else {
                    info!("ignoring file [{}]", entry.display());
                }
            }
        } else if is_event_file(path) {
            info!("adding input file [{input}]");
            files.push(path.to_path_buf());
        } else {
            info!("interpreting [{input}] as fofn");
            let reader =
                open_text(path).with_context(|| format!("opening file list [{input}]"))?;
            collect_fofn(reader, &mut files)
                .with_context(|| format!("reading file list [{input}]"))?;
        }
    }
    if files.is_empty() {
        anyhow::bail!("no event files to process");
    }
    Ok(files)
}

fn collect_fofn<R: BufRead>(reader: R, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let path = PathBuf::from(trimmed);
        if is_event_file(&path) {
            info!("adding input file [{}]", path.display());
            files.push(path);
        } else {
            warn!("ignoring non-event file [{trimmed}]");
        }
    }
    Ok(())
}
