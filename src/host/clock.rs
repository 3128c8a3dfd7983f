//! Shared musical-time state.
//!
//! One clock per host, read by every instance's render loop each block.
//! Tempo and beat position are f64 bit patterns in atomics so render-thread
//! reads are wait-free; the writer side is assumed externally serialized
//! (one transport owner at a time). Pausing freezes beat advancement for all
//! instances simultaneously.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub struct BeatClock {
    bpm_bits: AtomicU64,
    beat_bits: AtomicU64,
    paused: AtomicBool,
}

impl BeatClock {
    pub fn new(bpm: f64) -> Self {
        Self {
            bpm_bits: AtomicU64::new(bpm.to_bits()),
            beat_bits: AtomicU64::new(0.0f64.to_bits()),
            paused: AtomicBool::new(false),
        }
    }

    pub fn bpm(&self) -> f64 {
        f64::from_bits(self.bpm_bits.load(Ordering::Relaxed))
    }

    pub fn set_bpm(&self, bpm: f64) {
        self.bpm_bits.store(bpm.max(0.0).to_bits(), Ordering::Relaxed);
    }

    /// Current global beat position.
    pub fn beat(&self) -> f64 {
        f64::from_bits(self.beat_bits.load(Ordering::Relaxed))
    }

    /// External transport write; instances resynchronize their local beat
    /// projection when they next observe the changed value.
    pub fn set_beat(&self, beat: f64) {
        self.beat_bits.store(beat.max(0.0).to_bits(), Ordering::Relaxed);
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    /// Beats advanced per second of wall time at the current tempo.
    pub fn beats_per_second(&self) -> f64 {
        self.bpm() / crate::SECONDS_PER_MINUTE
    }
}

impl Default for BeatClock {
    fn default() -> Self {
        Self::new(120.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tempo_and_beat_round_trip() {
        let clock = BeatClock::new(120.0);
        assert_eq!(clock.bpm(), 120.0);

        clock.set_bpm(93.5);
        assert_eq!(clock.bpm(), 93.5);

        clock.set_beat(17.25);
        assert_eq!(clock.beat(), 17.25);
    }

    #[test]
    fn test_negative_writes_clamp_to_zero() {
        let clock = BeatClock::default();
        clock.set_bpm(-10.0);
        assert_eq!(clock.bpm(), 0.0);
        clock.set_beat(-1.0);
        assert_eq!(clock.beat(), 0.0);
    }

    #[test]
    fn test_pause_flag() {
        let clock = BeatClock::default();
        assert!(!clock.paused());
        clock.set_paused(true);
        assert!(clock.paused());
    }
}
