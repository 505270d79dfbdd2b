use ndarray::Array2;

use crate::event::Event;
use crate::kmer;
use crate::pore_model::PoreModel;
use crate::transitions::StateTransitions;
use crate::Float;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ViterbiError {
    #[error("empty event sequence")]
    EmptyEvents,

    #[error("no reachable state at the final timestep")]
    Underflow,
}

/// Result of the log-space max-product decode: the best path probability,
/// the state path, and the base sequence it spells.
#[derive(Debug)]
pub(crate) struct Viterbi {
    k: usize,
    path_log_prob: Float,
    path: Vec<u32>,
}

impl Viterbi {
    /// Decode the most probable state path. Ties between predecessors and
    /// between terminal states resolve to the lower state index.
    pub(crate) fn decode(
        model: &PoreModel,
        transitions: &StateTransitions,
        events: &[Event],
    ) -> Result<Self, ViterbiError> {
        let len = events.len();
        if len == 0 {
            return Err(ViterbiError::EmptyEvents);
        }
        let n = model.n_states();
        debug_assert_eq!(n, transitions.n_states());
        debug_assert!(n <= usize::from(u16::MAX) + 1);

        let mut emissions = vec![0.0 as Float; n];
        let mut prev = vec![Float::NEG_INFINITY; n];
        let mut cur = vec![Float::NEG_INFINITY; n];
        let mut backptr = Array2::<u16>::zeros((len, n));

        let prior = -(n as Float).ln();
        for (i, slot) in prev.iter_mut().enumerate() {
            *slot = prior + model.log_pr_emission(i, &events[0]);
        }

        for (t, event) in events.iter().enumerate().skip(1) {
            for (i, slot) in emissions.iter_mut().enumerate() {
                *slot = model.log_pr_emission(i, event);
            }
            for (j, slot) in cur.iter_mut().enumerate() {
                let mut best = Float::NEG_INFINITY;
                let mut best_src = 0u16;
                for edge in transitions.predecessors(j) {
                    let cand = prev[edge.state as usize] + edge.log_prob;
                    if cand > best {
                        best = cand;
                        best_src = edge.state as u16;
                    }
                }
                *slot = if best == Float::NEG_INFINITY {
                    Float::NEG_INFINITY
                } else {
                    best + emissions[j]
                };
                backptr[(t, j)] = best_src;
            }
            std::mem::swap(&mut prev, &mut cur);
        }

        let mut best_state = 0usize;
        let mut best = Float::NEG_INFINITY;
        for (j, &score) in prev.iter().enumerate() {
            if score > best {
                best = score;
                best_state = j;
            }
        }
        if best == Float::NEG_INFINITY {
            return Err(ViterbiError::Underflow);
        }

        let mut path = vec![0u32; len];
        let mut state = best_state;
        for t in (0..len).rev() {
            path[t] = state as u32;
            if t > 0 {
                state = usize::from(backptr[(t, state)]);
            }
        }

        Ok(Self {
            k: model.k(),
            path_log_prob: best,
            path,
        })
    }

    pub(crate) fn path_log_prob(&self) -> Float {
        self.path_log_prob
    }

    pub(crate) fn path(&self) -> &[u32] {
        &self.path
    }

    /// Spell out the decoded path: the whole first k-mer, then per
    /// transition the trailing bases of the new state (none for a stay,
    /// one for a step, the shifted-in bases for a skip).
    pub(crate) fn base_seq(&self) -> String {
        let path = self.path();
        let mut seq = kmer::to_bytes(path[0] as usize, self.k).to_vec();
        for window in path.windows(2) {
            let (state, next) = (window[0] as usize, window[1] as usize);
            let advance = kmer::advance_len(state, next, self.k);
            for pos in (0..advance).rev() {
                seq.push(kmer::bits_to_base(next >> (2 * pos)));
            }
        }
        // 2-bit decoding only ever yields ASCII.
        String::from_utf8(seq).unwrap()
    }
}
