//! Reference-time delta encoding
//!
//! Each logical timeline keeps the last absolute timestamp it saw; records
//! carry the signed difference. Both ends run the same state machine, so the
//! collector rebuilds absolute times by summing.
//!
//! Arithmetic wraps, which keeps the round trip exact for any `i64` input.

/// Logical timelines with independent reference times
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeline {
    /// Records drained from the per-thread queue
    Thread,
    /// Lock, memory and GPU CPU-side records from the serial queue
    Serial,
    /// Context switches and wakeups reported by the system tracer
    Context,
    /// GPU-side timestamps
    Gpu,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceTime {
    last: i64,
}

impl ReferenceTime {
    /// Absolute → delta
    pub fn encode(&mut self, absolute: i64) -> i64 {
        let delta = absolute.wrapping_sub(self.last);
        self.last = absolute;
        delta
    }

    /// Delta → absolute
    pub fn decode(&mut self, delta: i64) -> i64 {
        self.last = self.last.wrapping_add(delta);
        self.last
    }

    #[must_use]
    pub fn last(&self) -> i64 {
        self.last
    }
}

/// One reference time per [`Timeline`]
#[derive(Debug, Clone, Default)]
pub struct Timelines {
    thread: ReferenceTime,
    serial: ReferenceTime,
    context: ReferenceTime,
    gpu: ReferenceTime,
}

impl Timelines {
    pub fn get_mut(&mut self, timeline: Timeline) -> &mut ReferenceTime {
        match timeline {
            Timeline::Thread => &mut self.thread,
            Timeline::Serial => &mut self.serial,
            Timeline::Context => &mut self.context,
            Timeline::Gpu => &mut self.gpu,
        }
    }

    pub fn encode(&mut self, timeline: Timeline, absolute: i64) -> i64 {
        self.get_mut(timeline).encode(absolute)
    }

    pub fn decode(&mut self, timeline: Timeline, delta: i64) -> i64 {
        self.get_mut(timeline).decode(delta)
    }

    /// Start over, as at the beginning of a session
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Encode a sequence on a fresh timeline
#[must_use]
pub fn delta_encode(timestamps: &[i64]) -> Vec<i64> {
    let mut reference = ReferenceTime::default();
    timestamps.iter().map(|&t| reference.encode(t)).collect()
}

/// Decode a sequence produced by [`delta_encode`]
#[must_use]
pub fn delta_decode(deltas: &[i64]) -> Vec<i64> {
    let mut reference = ReferenceTime::default();
    deltas.iter().map(|&d| reference.decode(d)).collect()
}
