//! A minimal built-in engine: a handful of sine voices.
//!
//! This is the reference collaborator for the demo binary and the test
//! suite, not a serious synthesizer. It implements the full `SynthEngine`
//! surface — control catalogue, modulation bookkeeping, voice tracking — with
//! the cheapest possible signal path.

use std::collections::HashSet;
use std::f32::consts::TAU;
use std::sync::Arc;

use super::{
    midi_note_to_frequency, ControlCatalog, ControlId, ControlInfo, EngineFactory,
    ModulationConnection, SynthEngine,
};

const MAX_VOICES: usize = 16;
const ENGINE_BUFFER_SIZE: usize = 256;
const RELEASE_TIME: f32 = 0.05;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum VoiceState {
    Free,
    Held,
    Releasing,
}

struct Voice {
    state: VoiceState,
    note: f32,
    velocity: f32,
    phase: f32,
    release_gain: f32,
    age: u64,
}

impl Voice {
    fn new() -> Self {
        Self {
            state: VoiceState::Free,
            note: 0.0,
            velocity: 0.0,
            phase: 0.0,
            release_gain: 1.0,
            age: 0,
        }
    }

    fn start(&mut self, note: f32, velocity: f32, age: u64) {
        self.state = VoiceState::Held;
        self.note = note;
        self.velocity = velocity;
        self.phase = 0.0;
        self.release_gain = 1.0;
        self.age = age;
    }

    fn release(&mut self) {
        if self.state == VoiceState::Held {
            self.state = VoiceState::Releasing;
        }
    }
}

/// Sine-voice engine with a three-entry control catalogue.
pub struct BasicEngine {
    sample_rate: f32,
    buffer_size: usize,
    bpm: f64,
    voices: Vec<Voice>,
    frame_counter: u64,
    catalog: Arc<ControlCatalog>,
    control_values: Vec<f32>,
    mod_sources: Vec<String>,
    mono_mods: Vec<String>,
    poly_mods: Vec<String>,
    active_modulations: HashSet<usize>,
    pitch_wheel: f32,
    out_left: Vec<f32>,
    out_right: Vec<f32>,
}

fn basic_catalog() -> ControlCatalog {
    ControlCatalog::new(vec![
        ControlInfo {
            name: "volume".into(),
            display_units: "dB".into(),
            min: 0.0,
            max: 1.0,
            default_value: 0.7,
        },
        ControlInfo {
            name: "osc_transpose".into(),
            display_units: "semitones".into(),
            min: -48.0,
            max: 48.0,
            default_value: 0.0,
        },
        ControlInfo {
            name: "filter_cutoff".into(),
            display_units: "Hz".into(),
            min: 20.0,
            max: 20000.0,
            default_value: 8000.0,
        },
    ])
}

impl BasicEngine {
    pub fn new(sample_rate: f32) -> Self {
        Self::with_catalog(sample_rate, Arc::new(basic_catalog()))
    }

    fn with_catalog(sample_rate: f32, catalog: Arc<ControlCatalog>) -> Self {
        let control_values = catalog.iter().map(|c| c.default_value).collect();
        Self {
            sample_rate,
            buffer_size: ENGINE_BUFFER_SIZE,
            bpm: 120.0,
            voices: (0..MAX_VOICES).map(|_| Voice::new()).collect(),
            frame_counter: 0,
            catalog,
            control_values,
            mod_sources: vec!["envelope".into(), "lfo".into()],
            mono_mods: vec!["filter_cutoff".into()],
            poly_mods: vec!["amplitude".into()],
            active_modulations: HashSet::new(),
            pitch_wheel: 0.0,
            out_left: vec![0.0; ENGINE_BUFFER_SIZE],
            out_right: vec![0.0; ENGINE_BUFFER_SIZE],
        }
    }

    fn allocate_voice(&mut self) -> Option<&mut Voice> {
        // First pass: free voice. Second pass: steal the oldest releasing one.
        if let Some(idx) = self.voices.iter().position(|v| v.state == VoiceState::Free) {
            return Some(&mut self.voices[idx]);
        }

        let steal_idx = self
            .voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.state == VoiceState::Releasing)
            .min_by_key(|(_, v)| v.age)
            .map(|(idx, _)| idx)?;

        Some(&mut self.voices[steal_idx])
    }

    fn control_value(&self, name: &str) -> f32 {
        self.catalog
            .index_of(name)
            .map(|ControlId(i)| self.control_values[i])
            .unwrap_or(0.0)
    }
}

impl SynthEngine for BasicEngine {
    fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
    }

    fn set_buffer_size(&mut self, size: usize) {
        self.buffer_size = size.min(ENGINE_BUFFER_SIZE);
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn max_buffer_size(&self) -> usize {
        ENGINE_BUFFER_SIZE
    }

    fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm;
    }

    fn note_on(&mut self, note: f32, velocity: f32) {
        let age = self.frame_counter;
        if let Some(voice) = self.allocate_voice() {
            voice.start(note, velocity, age);
        }
    }

    fn note_off(&mut self, note: f32) {
        for voice in &mut self.voices {
            if voice.state == VoiceState::Held && (voice.note - note).abs() < 0.5 {
                voice.release();
            }
        }
    }

    fn all_notes_off(&mut self) {
        for voice in &mut self.voices {
            voice.state = VoiceState::Free;
        }
    }

    fn active_voices(&self) -> usize {
        self.voices
            .iter()
            .filter(|v| v.state != VoiceState::Free)
            .count()
    }

    fn set_pitch_wheel(&mut self, value: f32) {
        self.pitch_wheel = value;
    }

    fn set_mod_wheel(&mut self, _value: f32) {}

    fn set_aftertouch(&mut self, _note: f32, _value: f32) {}

    fn controls(&self) -> &ControlCatalog {
        &self.catalog
    }

    fn set_control(&mut self, ControlId(index): ControlId, value: f32) {
        if let Some(slot) = self.control_values.get_mut(index) {
            *slot = value;
        }
    }

    fn modulation_sources(&self) -> &[String] {
        &self.mod_sources
    }

    fn mono_modulations(&self) -> &[String] {
        &self.mono_mods
    }

    fn poly_modulations(&self) -> &[String] {
        &self.poly_mods
    }

    fn connect_modulation(&mut self, connection: &ModulationConnection) {
        self.active_modulations.insert(connection.slot);
    }

    fn disconnect_modulation(&mut self, connection: &ModulationConnection) {
        self.active_modulations.remove(&connection.slot);
    }

    fn is_modulation_active(&self, connection: &ModulationConnection) -> bool {
        self.active_modulations.contains(&connection.slot)
    }

    fn process(&mut self) {
        let samples = self.buffer_size;
        self.out_left[..samples].fill(0.0);

        let volume = self.control_value("volume");
        let transpose = self.control_value("osc_transpose");
        let release_step = 1.0 / (RELEASE_TIME * self.sample_rate);

        for voice in &mut self.voices {
            if voice.state == VoiceState::Free {
                continue;
            }

            let pitch = voice.note + transpose + 2.0 * self.pitch_wheel;
            let phase_step = midi_note_to_frequency(pitch) / self.sample_rate;
            let gain = volume * voice.velocity;

            for out in self.out_left[..samples].iter_mut() {
                if voice.state == VoiceState::Releasing {
                    voice.release_gain -= release_step;
                    if voice.release_gain <= 0.0 {
                        voice.state = VoiceState::Free;
                        break;
                    }
                }

                *out += gain * voice.release_gain * (TAU * voice.phase).sin();
                voice.phase += phase_step;
                if voice.phase >= 1.0 {
                    voice.phase -= 1.0;
                }
            }
        }

        self.out_right[..samples].copy_from_slice(&self.out_left[..samples]);
        self.frame_counter += samples as u64;
    }

    fn output(&self, channel: usize) -> &[f32] {
        if channel % 2 == 0 {
            &self.out_left[..self.buffer_size]
        } else {
            &self.out_right[..self.buffer_size]
        }
    }
}

/// Factory for [`BasicEngine`] instances sharing one catalogue.
pub struct BasicEngineFactory {
    catalog: Arc<ControlCatalog>,
}

impl BasicEngineFactory {
    pub fn new() -> Self {
        Self {
            catalog: Arc::new(basic_catalog()),
        }
    }
}

impl Default for BasicEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineFactory for BasicEngineFactory {
    fn catalog(&self) -> &ControlCatalog {
        &self.catalog
    }

    fn create(&self) -> Box<dyn SynthEngine> {
        // Placeholder rate; the host sets the real one on the new instance.
        Box::new(BasicEngine::with_catalog(44100.0, self.catalog.clone()))
    }
}
