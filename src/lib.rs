//! Real-time core of a polyphonic software-synthesizer host.
//!
//! `polyhost` manages concurrent synthesizer instances behind a
//! channel-addressed broadcast API, routes control events from arbitrary
//! threads into each instance's render loop through lock-free queues, and
//! drives beat-synchronized step sequencers from one shared clock. The
//! synthesis engine itself sits behind the [`engine::SynthEngine`] trait;
//! a minimal sine engine ([`engine::basic::BasicEngine`]) backs the demo
//! binary and the test suite.

pub mod engine; // Synthesis-engine boundary contract
pub mod host; // Instances, event routing, render loop
pub mod sequencing; // Beat-quantized note patterns

pub const MAX_BLOCK_SIZE: usize = 2048;
pub const MAX_HOST_CHANNELS: usize = 2;
pub const MAX_CHANNELS: i32 = 16;
pub const MAX_MODULATIONS: usize = 16;
pub const VALUES_PER_MODULATION: usize = 3;
pub const MODULATION_RANGE: f32 = 1_000_000.0;

pub(crate) const SIXTEENTHS_PER_BEAT: f64 = 4.0;
pub(crate) const SECONDS_PER_MINUTE: f64 = 60.0;
