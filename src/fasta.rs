use std::fmt;

/// One FASTA record with line-width wrapping, rendered through `Display` so
/// callers can write into any formatter-backed buffer.
pub(crate) struct Entry<'a> {
    pub(crate) description: &'a str,
    pub(crate) sequence: &'a str,
    pub(crate) line_width: usize,
}

impl fmt::Display for Entry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, ">{}", self.description)?;
        let width = self.line_width.max(1);
        for chunk in self.sequence.as_bytes().chunks(width) {
            // Base sequences are ASCII by construction.
            writeln!(f, "{}", std::str::from_utf8(chunk).unwrap())?;
        }
        Ok(())
    }
}

pub(crate) fn write_record<W: fmt::Write>(
    writer: &mut W,
    description: &str,
    sequence: &str,
    line_width: usize,
) -> fmt::Result {
    write!(
        writer,
        "{}",
        Entry {
            description,
            sequence,
            line_width,
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_at_line_width() {
        let mut out = String::new();
        write_record(&mut out, "read1:file:0", "ACGTACGTAC", 4).unwrap();
        assert_eq!(out, ">read1:file:0\nACGT\nACGT\nAC\n");
    }

    #[test]
    fn exact_multiple_has_no_trailing_blank() {
        let mut out = String::new();
        write_record(&mut out, "r", "ACGTACGT", 4).unwrap();
        assert_eq!(out, ">r\nACGT\nACGT\n");
    }

    #[test]
    fn empty_sequence_is_header_only() {
        let mut out = String::new();
        write_record(&mut out, "r", "", 80).unwrap();
        assert_eq!(out, ">r\n");
    }
}
