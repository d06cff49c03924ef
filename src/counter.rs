//! Throughput accounting, used per peer session and per torrent.
//!
//! A counter is advanced by the owner's one second tick; the rolling
//! average it maintains is what the upload choker ranks peers by and what
//! `status()` reports as the current rate.

/// Counts bytes over one second rounds and keeps a running average.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Counter {
    total: u64,
    round: u64,
    last_round: u64,
    /// A weighted rolling average over roughly the last five rounds.
    avg: f64,
    peak: u64,
}

impl Counter {
    pub fn add(&mut self, bytes: u64) {
        self.total += bytes;
        self.round += bytes;
    }

    /// Closes the current round, folding it into the rolling average.
    pub fn tick(&mut self) {
        self.avg = if self.total == self.round {
            // the very first round seeds the average
            self.round as f64
        } else {
            self.avg * 4.0 / 5.0 + self.round as f64 / 5.0
        };
        self.peak = self.peak.max(self.round);
        self.last_round = self.round;
        self.round = 0;
    }

    /// The total number of bytes counted.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// The bytes counted in the last completed round.
    pub fn round(&self) -> u64 {
        self.last_round
    }

    /// The rolling average rate, in bytes per round (i.e. per second).
    pub fn avg(&self) -> u64 {
        self.avg as u64
    }

    pub fn peak(&self) -> u64 {
        self.peak
    }
}

/// The pair of counters every transfer direction needs.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ThruputCounters {
    pub down: Counter,
    pub up: Counter,
}

impl ThruputCounters {
    pub fn tick(&mut self) {
        self.down.tick();
        self.up.tick();
    }
}
