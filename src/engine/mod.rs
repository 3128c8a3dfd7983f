//! Boundary contract with the synthesis engine.
//!
//! The host core never generates audio itself; it drives an engine through
//! this trait: note edges in, control changes in, rendered blocks out. Any
//! synthesizer that can expose a flat control catalogue and a modulation
//! routing set can sit behind it.

pub mod basic;

/// Resolved handle to one engine control.
///
/// The ordinal of the control in the engine's catalogue (sorted by name).
/// Resolving names happens once at instance creation; the render thread only
/// ever passes handles.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ControlId(pub usize);

/// Static description of one engine control.
#[derive(Debug, Clone)]
pub struct ControlInfo {
    pub name: String,
    pub display_units: String,
    pub min: f32,
    pub max: f32,
    pub default_value: f32,
}

/// The engine's control catalogue, ordered by control name.
///
/// Iteration order is the canonical ordinal order used for flat parameter
/// indices, so it must be stable for the lifetime of the engine type.
#[derive(Debug, Clone, Default)]
pub struct ControlCatalog {
    entries: Vec<ControlInfo>,
}

impl ControlCatalog {
    /// Build a catalogue from unordered entries, sorting by name.
    pub fn new(mut entries: Vec<ControlInfo>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ControlInfo> {
        self.entries.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<ControlId> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(ControlId)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ControlInfo> {
        self.entries.iter()
    }
}

/// One modulation route: source output feeding a destination control.
///
/// Identity is the slot index inside the owning instance's modulation bank.
/// A connection must be disconnected from the engine before its source or
/// destination is rewritten; it is reconnected only by a non-zero amount
/// write.
#[derive(Debug, Clone)]
pub struct ModulationConnection {
    pub slot: usize,
    pub source: String,
    pub destination: String,
    pub amount: f32,
}

impl ModulationConnection {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            source: String::new(),
            destination: String::new(),
            amount: 0.0,
        }
    }
}

/// Contract the host core holds every synthesis engine to.
///
/// All calls arrive either on the render thread or under the owning
/// instance's lock, so implementations need interior consistency but no
/// internal synchronization. `process()` renders `buffer_size()` samples
/// into the fixed output buffers returned by `output()`.
pub trait SynthEngine: Send {
    fn set_sample_rate(&mut self, sample_rate: f32);
    fn set_buffer_size(&mut self, size: usize);
    fn buffer_size(&self) -> usize;

    /// Largest sub-block `process()` can render in one call.
    fn max_buffer_size(&self) -> usize;

    fn set_bpm(&mut self, bpm: f64);

    /// Start a note. Pitch is a (possibly fractional) MIDI note number.
    fn note_on(&mut self, note: f32, velocity: f32);
    fn note_off(&mut self, note: f32);
    fn all_notes_off(&mut self);

    /// Number of voices currently sounding (held or releasing).
    fn active_voices(&self) -> usize;

    fn set_pitch_wheel(&mut self, value: f32);
    fn set_mod_wheel(&mut self, value: f32);
    fn set_aftertouch(&mut self, note: f32, value: f32);

    /// The engine's control catalogue, ordered by name.
    fn controls(&self) -> &ControlCatalog;
    fn set_control(&mut self, id: ControlId, value: f32);

    /// Modulation source names, in catalogue order.
    fn modulation_sources(&self) -> &[String];
    /// Per-voice ("mono") modulation destination names, in catalogue order.
    fn mono_modulations(&self) -> &[String];
    /// Per-note ("poly") modulation destination names, in catalogue order.
    fn poly_modulations(&self) -> &[String];

    fn connect_modulation(&mut self, connection: &ModulationConnection);
    fn disconnect_modulation(&mut self, connection: &ModulationConnection);
    fn is_modulation_active(&self, connection: &ModulationConnection) -> bool;

    /// Render `buffer_size()` samples into the internal output buffers.
    fn process(&mut self);

    /// Rendered output for `channel` (0 = left, 1 = right), valid for the
    /// first `buffer_size()` samples after `process()`.
    fn output(&self, channel: usize) -> &[f32];
}

/// Creates engines for new instances and describes their shared catalogue.
///
/// The catalogue must match what `create()`'s engines report, since static
/// parameter range queries go through the factory without an instance.
/// Fresh engines carry a placeholder sample rate; the host configures the
/// real one through [`SynthEngine::set_sample_rate`] at instance creation.
pub trait EngineFactory: Send + Sync {
    fn catalog(&self) -> &ControlCatalog;
    fn create(&self) -> Box<dyn SynthEngine>;
}

/// Convert MIDI note number to frequency in Hz.
/// A4 = 440 Hz = MIDI note 69
#[inline]
pub fn midi_note_to_frequency(note: f32) -> f32 {
    440.0 * 2.0_f32.powf((note - 69.0) / 12.0)
}

/// Convert a frequency in Hz to a fractional MIDI note number.
#[inline]
pub fn frequency_to_midi_note(frequency: f32) -> f32 {
    69.0 + 12.0 * (frequency / 440.0).log2()
}
