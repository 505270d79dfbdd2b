use ndarray::Array2;

/// Global alignment scoring: match 0, mismatch -1, gap -1.
const MISMATCH: i32 = -1;
const GAP: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Diagonal,
    Up,
    Left,
}

/// Consensus view of the template and complement basecalls, built from a
/// global pairwise alignment of the two sequences.
#[derive(Debug)]
pub(crate) struct Consensus {
    pub score: i32,
    pub sequence: String,
}

/// Align the two strand sequences globally and collapse the alignment into
/// a consensus: matched columns keep the base, mismatched columns keep the
/// template base, gap columns are dropped.
pub(crate) fn align_2d(template: &str, complement: &str) -> Consensus {
    let t = template.as_bytes();
    let c = complement.as_bytes();
    let rows = t.len() + 1;
    let cols = c.len() + 1;

    let mut score = Array2::<i32>::zeros((rows, cols));
    let mut step = Array2::from_elem((rows, cols), Step::Diagonal);
    for i in 1..rows {
        score[(i, 0)] = i as i32 * GAP;
        step[(i, 0)] = Step::Up;
    }
    for j in 1..cols {
        score[(0, j)] = j as i32 * GAP;
        step[(0, j)] = Step::Left;
    }
    for i in 1..rows {
        for j in 1..cols {
            let sub = if t[i - 1] == c[j - 1] { 0 } else { MISMATCH };
            let diagonal = score[(i - 1, j - 1)] + sub;
            let up = score[(i - 1, j)] + GAP;
            let left = score[(i, j - 1)] + GAP;
            let (best, from) = if diagonal >= up && diagonal >= left {
                (diagonal, Step::Diagonal)
            } else if up >= left {
                (up, Step::Up)
            } else {
                (left, Step::Left)
            };
            score[(i, j)] = best;
            step[(i, j)] = from;
        }
    }

    let mut sequence = Vec::new();
    let (mut i, mut j) = (t.len(), c.len());
    while i > 0 || j > 0 {
        match step[(i, j)] {
            Step::Diagonal if i > 0 && j > 0 => {
                sequence.push(t[i - 1]);
                i -= 1;
                j -= 1;
            }
            Step::Up | Step::Diagonal if i > 0 => {
                i -= 1;
            }
            _ => {
                j -= 1;
            }
        }
    }
    sequence.reverse();

    Consensus {
        score: score[(t.len(), c.len())],
        // Alignment only ever rearranges ASCII bases.
        sequence: String::from_utf8(sequence).unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_sequences_align_perfectly() {
        let consensus = align_2d("ACGTACGT", "ACGTACGT");
        assert_eq!(consensus.score, 0);
        assert_eq!(consensus.sequence, "ACGTACGT");
    }

    #[test]
    fn mismatches_keep_the_template_base() {
        let consensus = align_2d("ACGT", "AGGT");
        assert_eq!(consensus.score, -1);
        assert_eq!(consensus.sequence, "ACGT");
    }

    #[test]
    fn gap_columns_are_dropped_from_the_consensus() {
        let consensus = align_2d("ACGT", "AGT");
        assert_eq!(consensus.score, -1);
        assert_eq!(consensus.sequence, "AGT");
    }

    #[test]
    fn empty_inputs() {
        let consensus = align_2d("", "");
        assert_eq!(consensus.score, 0);
        assert_eq!(consensus.sequence, "");

        let consensus = align_2d("ACG", "");
        assert_eq!(consensus.score, -3);
        assert_eq!(consensus.sequence, "");
    }
}
