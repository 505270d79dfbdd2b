use crate::Float;

/// One measured current segment. `log_stdv` is precomputed at construction
/// so the emission kernels never take a logarithm per state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Event {
    pub mean: Float,
    pub stdv: Float,
    pub log_stdv: Float,
    pub start: Float,
    pub length: Float,
}

impl Event {
    pub(crate) fn new(mean: Float, stdv: Float, start: Float, length: Float) -> Self {
        Self {
            mean,
            stdv,
            log_stdv: stdv.ln(),
            start,
            length,
        }
    }
}

/// An ordered sequence of events for one strand of one read.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSequence {
    events: Vec<Event>,
}

impl EventSequence {
    pub(crate) fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub(crate) fn as_slice(&self) -> &[Event] {
        &self.events
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.events.truncate(len);
    }

    /// Start time of the first event, the reference point for drift.
    pub(crate) fn start_time(&self) -> Float {
        self.events.first().map_or(0.0, |e| e.start)
    }

    /// Subtract a linear-in-time drift from the mean channel. The other
    /// fields are left untouched.
    pub(crate) fn apply_drift_correction(&mut self, drift: Float) {
        let t0 = self.start_time();
        for event in &mut self.events {
            event.mean -= drift * (event.start - t0);
        }
    }

    /// Mean and standard deviation of the mean channel.
    pub(crate) fn mean_stdv(&self) -> (Float, Float) {
        if self.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.events.len() as Float;
        let mean = self.events.iter().map(|e| e.mean).sum::<Float>() / n;
        let var = self
            .events
            .iter()
            .map(|e| (e.mean - mean) * (e.mean - mean))
            .sum::<Float>()
            / n;
        (mean, var.sqrt())
    }
}
