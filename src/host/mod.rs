//! The host core: instance registry, sequencer registry, beat clock, and the
//! channel-addressed broadcast API.
//!
//! A [`SynthHost`] is an owned value, not a hidden global: embedders create
//! one per process (or per test) and route every control call through it.
//! Broadcast calls address instances by logical channel number (0..15), not
//! by instance id. Control signals addressed to an inactive instance are
//! dropped, except note-off, all-notes-off, and silence, which are safety
//! operations and apply regardless.

pub mod clock;
pub mod events;
pub mod instance;
pub mod params;
mod render;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::engine::{frequency_to_midi_note, EngineFactory};
use crate::sequencing::{Arena, Handle, NoteId, Sequencer};
use crate::MAX_MODULATIONS;

pub use clock::BeatClock;
pub use instance::{Instance, InstanceId, ParamError};
pub use params::{ParamDef, FIXED_PARAMS, PARAM_CHANNEL};

/// Opaque handle to a registered sequencer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SequencerId(Handle);

pub(crate) struct SequencerEntry {
    pub(crate) sequencer: Sequencer,
    /// Disabled sequencers keep their state but produce no edges.
    pub(crate) enabled: bool,
}

struct InstanceRegistry {
    next_id: InstanceId,
    map: BTreeMap<InstanceId, Arc<Instance>>,
}

/// Process-scoped host core. See module docs.
pub struct SynthHost {
    factory: Box<dyn EngineFactory>,
    pub(crate) clock: BeatClock,
    instances: Mutex<InstanceRegistry>,
    pub(crate) sequencers: Mutex<Arena<SequencerEntry>>,
}

impl SynthHost {
    pub fn new(factory: Box<dyn EngineFactory>) -> Self {
        Self {
            factory,
            clock: BeatClock::default(),
            instances: Mutex::new(InstanceRegistry {
                next_id: 0,
                map: BTreeMap::new(),
            }),
            sequencers: Mutex::new(Arena::new()),
        }
    }

    fn lock_instances(&self) -> MutexGuard<'_, InstanceRegistry> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_sequencers(&self) -> MutexGuard<'_, Arena<SequencerEntry>> {
        self.sequencers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ----- instance lifecycle -------------------------------------------

    /// Create and register a new instance. The returned handle is what the
    /// render thread drives through [`SynthHost::process_block`].
    pub fn create_instance(&self, sample_rate: f32) -> Arc<Instance> {
        let mut engine = self.factory.create();
        engine.set_sample_rate(sample_rate);
        let mut registry = self.lock_instances();
        let id = registry.next_id;
        registry.next_id += 1;

        let instance = Arc::new(Instance::new(id, engine));
        registry.map.insert(id, instance.clone());
        log::debug!("created instance {id}");
        instance
    }

    /// Deregister and tear down an instance. Voices are forced off and the
    /// entry is erased under the registry lock, so no broadcast can observe
    /// a half-destroyed instance.
    pub fn destroy_instance(&self, id: InstanceId) -> bool {
        let mut registry = self.lock_instances();
        let Some(instance) = registry.map.remove(&id) else {
            return false;
        };

        let mut state = instance.lock_state();
        state.engine.all_notes_off();
        state.clear_modulations();
        drop(state);
        log::debug!("destroyed instance {id}");
        true
    }

    pub fn num_instances(&self) -> usize {
        self.lock_instances().map.len()
    }

    pub fn instance(&self, id: InstanceId) -> Option<Arc<Instance>> {
        self.lock_instances().map.get(&id).cloned()
    }

    /// Iterate instances on `channel` under the registry lock.
    /// `require_active` implements the broadcast filtering policy.
    fn for_each_on_channel<F>(&self, channel: i32, require_active: bool, mut f: F)
    where
        F: FnMut(&Instance),
    {
        let registry = self.lock_instances();
        for instance in registry.map.values() {
            if instance.channel() != channel {
                continue;
            }
            if require_active && !instance.is_active() {
                continue;
            }
            f(instance);
        }
    }

    // ----- note broadcasts ----------------------------------------------

    pub fn note_on(&self, channel: i32, note: u8, velocity: f32) {
        self.for_each_on_channel(channel, true, |instance| {
            instance.enqueue_note(note as f32, velocity);
        });
    }

    pub fn frequency_on(&self, channel: i32, frequency: f32, velocity: f32) {
        let note = frequency_to_midi_note(frequency);
        self.for_each_on_channel(channel, true, |instance| {
            instance.enqueue_note(note, velocity);
        });
    }

    /// Scheduled variant of [`SynthHost::note_on`]. The start/end times are
    /// accepted but not yet honored; the note fires immediately.
    pub fn note_on_scheduled(
        &self,
        channel: i32,
        note: u8,
        velocity: f32,
        _start_time: f64,
        _end_time: f64,
    ) {
        self.note_on(channel, note, velocity);
    }

    /// Note-off is a safety operation: it reaches inactive instances too so
    /// no note is left stuck.
    pub fn note_off(&self, channel: i32, note: u8) {
        self.for_each_on_channel(channel, false, |instance| {
            instance.enqueue_note(note as f32, 0.0);
        });
    }

    pub fn frequency_off(&self, channel: i32, frequency: f32) {
        let note = frequency_to_midi_note(frequency);
        self.for_each_on_channel(channel, false, |instance| {
            instance.enqueue_note(note, 0.0);
        });
    }

    /// Discard pending note events and force every voice off, active or not.
    pub fn all_notes_off(&self, channel: i32) {
        self.for_each_on_channel(channel, false, |instance| {
            let mut state = instance.lock_state();
            instance.queues.discard_notes();
            state.engine.all_notes_off();
        });
    }

    // ----- performance controls -----------------------------------------

    pub fn set_pitch_wheel(&self, channel: i32, value: f32) {
        self.for_each_on_channel(channel, true, |instance| {
            instance.lock_state().engine.set_pitch_wheel(value);
        });
    }

    pub fn set_mod_wheel(&self, channel: i32, value: f32) {
        self.for_each_on_channel(channel, true, |instance| {
            instance.lock_state().engine.set_mod_wheel(value);
        });
    }

    pub fn set_aftertouch(&self, channel: i32, note: u8, value: f32) {
        self.for_each_on_channel(channel, true, |instance| {
            instance.lock_state().engine.set_aftertouch(note as f32, value);
        });
    }

    /// Mute or unmute a channel. Rendering continues while muted; only the
    /// output is suppressed. Applies to inactive instances as well.
    pub fn set_silence(&self, channel: i32, silent: bool) {
        self.for_each_on_channel(channel, false, |instance| {
            instance.set_silent(silent);
        });
    }

    // ----- parameters ----------------------------------------------------

    /// Registration table for the host boundary: channel parameter, engine
    /// catalogue, modulation bank.
    pub fn parameter_definitions(&self) -> Vec<ParamDef> {
        params::parameter_definitions(self.factory.catalog())
    }

    /// Static catalogue minimum for a flat engine-parameter index.
    pub fn parameter_minimum(&self, index: usize) -> Option<f32> {
        index
            .checked_sub(FIXED_PARAMS)
            .and_then(|i| self.factory.catalog().get(i))
            .map(|c| c.min)
    }

    /// Static catalogue maximum for a flat engine-parameter index.
    pub fn parameter_maximum(&self, index: usize) -> Option<f32> {
        index
            .checked_sub(FIXED_PARAMS)
            .and_then(|i| self.factory.catalog().get(i))
            .map(|c| c.max)
    }

    /// Broadcast a clamped parameter write to every active instance on the
    /// channel. Returns false for the fixed channel parameter or when any
    /// addressed instance rejects the index. Does not touch modulation
    /// routing; that is the per-instance [`Instance::set_parameter`] path.
    pub fn set_parameter_value(&self, channel: i32, index: usize, value: f32) -> bool {
        if index < FIXED_PARAMS {
            return false;
        }

        let mut success = true;
        self.for_each_on_channel(channel, true, |instance| {
            let mut state = instance.lock_state();
            if index >= state.parameters.len() {
                success = false;
                return;
            }

            let (min, max) = state.range_lookup[index];
            let clamped = value.clamp(min, max);
            state.parameters[index] = clamped;
            if state.value_lookup[index].is_some() {
                instance.queues.push_value(index, clamped);
            }
        });
        success
    }

    /// Raw readback from the first active instance on the channel.
    pub fn get_parameter_value(&self, channel: i32, index: usize) -> f32 {
        if index < FIXED_PARAMS {
            return 0.0;
        }

        let mut result = None;
        self.for_each_on_channel(channel, true, |instance| {
            if result.is_some() {
                return;
            }
            let state = instance.lock_state();
            if let Some(value) = state.parameters.get(index) {
                result = Some(*value);
            }
        });
        result.unwrap_or(0.0)
    }

    /// Set a parameter from a normalized [0, 1] percent. The range comes
    /// from the first registered instance's table.
    pub fn set_parameter_percent(&self, channel: i32, index: usize, percent: f32) -> bool {
        if index < FIXED_PARAMS {
            return false;
        }

        // Resolve the range outside the registry lock before delegating.
        let Some((min, max)) = self.first_instance_range(index) else {
            return false;
        };
        let value = params::value_from_percent(min, max, percent);
        self.set_parameter_value(channel, index, value)
    }

    /// Read a parameter as a normalized [0, 1] percent.
    pub fn get_parameter_percent(&self, channel: i32, index: usize) -> f32 {
        if index < FIXED_PARAMS {
            return 0.0;
        }

        let Some((min, max)) = self.first_instance_range(index) else {
            return 0.0;
        };
        let value = self.get_parameter_value(channel, index);
        params::percent_from_value(min, max, value)
    }

    fn first_instance_range(&self, index: usize) -> Option<(f32, f32)> {
        let registry = self.lock_instances();
        let instance = registry.map.values().next()?;
        let state = instance.lock_state();
        state.range_lookup.get(index).copied()
    }

    // ----- modulations ---------------------------------------------------

    /// Disconnect every modulation slot on active instances of the channel.
    pub fn clear_modulations(&self, channel: i32) {
        self.for_each_on_channel(channel, true, |instance| {
            instance.lock_state().clear_modulations();
        });
    }

    /// Install and connect an explicit modulation route on one slot of
    /// every active instance on the channel.
    pub fn add_modulation(
        &self,
        channel: i32,
        slot: usize,
        source: &str,
        destination: &str,
        amount: f32,
    ) {
        if slot >= MAX_MODULATIONS {
            return;
        }
        self.for_each_on_channel(channel, true, |instance| {
            instance
                .lock_state()
                .add_modulation(slot, source, destination, amount);
        });
    }

    // ----- readback ------------------------------------------------------

    /// Copy the last rendered block of the first active instance on the
    /// channel into `buffer`. Snapshot channels are broadcast by modulo
    /// mapping when counts differ. Leaves `buffer` untouched if nothing on
    /// the channel has rendered yet.
    pub fn read_buffer(&self, channel: i32, buffer: &mut [f32], samples: usize, channels: usize) {
        let registry = self.lock_instances();
        for instance in registry.map.values() {
            if instance.channel() != channel || !instance.is_active() {
                continue;
            }

            let state = instance.lock_state();
            let send_channels = state.send_channels;
            if send_channels == 0 {
                continue;
            }

            if channels == send_channels {
                let len = (samples * channels).min(state.send_data.len()).min(buffer.len());
                buffer[..len].copy_from_slice(&state.send_data[..len]);
            } else {
                for i in 0..samples {
                    for c in 0..channels {
                        let send_channel = c % send_channels;
                        let src = i * send_channels + send_channel;
                        let dst = i * channels + c;
                        if dst < buffer.len() && src < state.send_data.len() {
                            buffer[dst] = state.send_data[src];
                        }
                    }
                }
            }
            return;
        }
    }

    // ----- transport -----------------------------------------------------

    pub fn set_bpm(&self, bpm: f64) {
        self.clock.set_bpm(bpm);
    }

    pub fn bpm(&self) -> f64 {
        self.clock.bpm()
    }

    /// External beat-time write; instances resync their local projection on
    /// their next block.
    pub fn set_beat_time(&self, beat: f64) {
        self.clock.set_beat(beat);
    }

    pub fn beat_time(&self) -> f64 {
        self.clock.beat()
    }

    /// Freeze beat advancement and sequencer playback for all instances.
    /// Queued events still drain and audio still renders.
    pub fn set_paused(&self, paused: bool) {
        self.clock.set_paused(paused);
    }

    pub fn is_paused(&self) -> bool {
        self.clock.paused()
    }

    // ----- sequencer lifecycle ------------------------------------------

    /// Register a new sequencer, initially disabled.
    pub fn create_sequencer(&self) -> SequencerId {
        let id = SequencerId(self.lock_sequencers().insert(SequencerEntry {
            sequencer: Sequencer::new(),
            enabled: false,
        }));
        log::debug!("created sequencer {id:?}");
        id
    }

    pub fn delete_sequencer(&self, id: SequencerId) -> bool {
        let removed = self.lock_sequencers().remove(id.0).is_some();
        if removed {
            log::debug!("deleted sequencer {id:?}");
        }
        removed
    }

    /// Toggle playback participation without touching pattern state.
    pub fn enable_sequencer(&self, id: SequencerId, enabled: bool) {
        if let Some(entry) = self.lock_sequencers().get_mut(id.0) {
            entry.enabled = enabled;
        }
    }

    pub fn num_sequencers(&self) -> usize {
        self.lock_sequencers().len()
    }

    /// Assign the sequencer's channel. Returns false if another sequencer
    /// already targets that channel; the assignment happens either way and
    /// the caller decides policy.
    pub fn set_sequencer_channel(&self, id: SequencerId, channel: i32) -> bool {
        let mut sequencers = self.lock_sequencers();
        if sequencers.get_mut(id.0).is_none() {
            return false;
        }

        let collision = sequencers
            .iter()
            .any(|(handle, entry)| handle != id.0 && entry.sequencer.channel() == channel);

        if let Some(entry) = sequencers.get_mut(id.0) {
            entry.sequencer.set_channel(channel);
        }
        !collision
    }

    pub fn set_sequencer_start(&self, id: SequencerId, start_beat: f64) {
        if let Some(entry) = self.lock_sequencers().get_mut(id.0) {
            entry.sequencer.set_start_beat(start_beat);
        }
    }

    /// Pattern length in sixteenths.
    pub fn set_sequencer_length(&self, id: SequencerId, length: f64) {
        if let Some(entry) = self.lock_sequencers().get_mut(id.0) {
            entry.sequencer.set_length(length);
        }
    }

    pub fn set_sequencer_loop(&self, id: SequencerId, looping: bool) {
        if let Some(entry) = self.lock_sequencers().get_mut(id.0) {
            entry.sequencer.set_looping(looping);
        }
    }

    // ----- sequencer notes ----------------------------------------------

    /// Add a note; start/end are in sixteenths.
    pub fn create_note(
        &self,
        id: SequencerId,
        midi_key: u8,
        velocity: f32,
        start: f64,
        end: f64,
    ) -> Option<NoteId> {
        self.lock_sequencers()
            .get_mut(id.0)
            .map(|entry| entry.sequencer.add_note(midi_key, velocity, start, end))
    }

    /// Delete a note. A currently sounding note is forced off on the
    /// sequencer's channel so the engine never holds a stuck voice.
    pub fn delete_note(&self, id: SequencerId, note: NoteId) {
        let off = {
            let mut sequencers = self.lock_sequencers();
            let Some(entry) = sequencers.get_mut(id.0) else {
                return;
            };
            let was_playing = entry.sequencer.is_note_playing(note);
            let deleted = entry.sequencer.delete_note(note);
            match (was_playing, deleted) {
                (true, Some(n)) => Some((entry.sequencer.channel(), n.midi_key)),
                _ => None,
            }
        };

        // Broadcast outside the sequencer lock.
        if let Some((channel, key)) = off {
            self.note_off(channel, key);
        }
    }

    pub fn change_note_start(&self, id: SequencerId, note: NoteId, start: f64) {
        self.edit_note(id, note, |sequencer| sequencer.change_note_start(note, start));
    }

    pub fn change_note_end(&self, id: SequencerId, note: NoteId, end: f64) {
        self.edit_note(id, note, |sequencer| sequencer.change_note_end(note, end));
    }

    /// Rewrite key, start, end, and velocity in one edit.
    pub fn change_note_values(
        &self,
        id: SequencerId,
        note: NoteId,
        midi_key: u8,
        start: f64,
        end: f64,
        velocity: f32,
    ) {
        self.edit_note(id, note, |sequencer| {
            sequencer.change_note_key(note, midi_key);
            sequencer.change_note_start(note, start);
            sequencer.change_note_end(note, end);
            sequencer.change_note_velocity(note, velocity);
        });
    }

    pub fn change_note_velocity(&self, id: SequencerId, note: NoteId, velocity: f32) {
        if let Some(entry) = self.lock_sequencers().get_mut(id.0) {
            entry.sequencer.change_note_velocity(note, velocity);
        }
    }

    /// Change a note's key. A sounding note is forced off under its old key
    /// first.
    pub fn change_note_key(&self, id: SequencerId, note: NoteId, midi_key: u8) {
        let off = {
            let mut sequencers = self.lock_sequencers();
            let Some(entry) = sequencers.get_mut(id.0) else {
                return;
            };
            let off = if entry.sequencer.is_note_playing(note) {
                entry
                    .sequencer
                    .note(note)
                    .map(|n| (entry.sequencer.channel(), n.midi_key))
            } else {
                None
            };
            entry.sequencer.change_note_key(note, midi_key);
            off
        };

        if let Some((channel, key)) = off {
            self.note_off(channel, key);
        }
    }

    /// Shared edit path: apply `edit`, and if a sounding note stopped being
    /// current as a result, force it off on the sequencer's channel.
    fn edit_note<F>(&self, id: SequencerId, note: NoteId, edit: F)
    where
        F: FnOnce(&mut Sequencer),
    {
        let off = {
            let mut sequencers = self.lock_sequencers();
            let Some(entry) = sequencers.get_mut(id.0) else {
                return;
            };
            let was_playing = entry.sequencer.is_note_playing(note);
            edit(&mut entry.sequencer);

            if was_playing && !entry.sequencer.is_note_playing(note) {
                entry
                    .sequencer
                    .note(note)
                    .map(|n| (entry.sequencer.channel(), n.midi_key))
            } else {
                None
            }
        };

        if let Some((channel, key)) = off {
            self.note_off(channel, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::basic::BasicEngineFactory;

    fn host() -> SynthHost {
        SynthHost::new(Box::new(BasicEngineFactory::new()))
    }

    #[test]
    fn test_create_destroy_leaves_no_entries() {
        let host = host();
        assert_eq!(host.num_instances(), 0);

        let instance = host.create_instance(48000.0);
        assert_eq!(host.num_instances(), 1);

        assert!(host.destroy_instance(instance.id()));
        assert_eq!(host.num_instances(), 0);
        // Idempotent against a second destroy.
        assert!(!host.destroy_instance(instance.id()));
    }

    #[test]
    fn test_instance_ids_are_monotonic() {
        let host = host();
        let a = host.create_instance(48000.0);
        host.destroy_instance(a.id());
        let b = host.create_instance(48000.0);
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_broadcast_to_empty_channel_is_noop() {
        let host = host();
        host.note_off(5, 60);
        host.all_notes_off(5);
        host.set_silence(5, true);
        host.clear_modulations(5);
        assert_eq!(host.get_parameter_value(5, 1), 0.0);
    }

    #[test]
    fn test_note_off_reaches_inactive_instances() {
        let host = host();
        let instance = host.create_instance(48000.0);
        assert!(!instance.is_active());

        host.note_on(0, 60, 1.0); // dropped: instance inactive
        assert!(instance.queues.pop_note().is_none());

        host.note_off(0, 60); // safety op: enqueued anyway
        let event = instance.queues.pop_note().unwrap();
        assert_eq!(event.velocity, 0.0);
    }

    #[test]
    fn test_set_parameter_value_rejects_channel_index() {
        let host = host();
        host.create_instance(48000.0);
        assert!(!host.set_parameter_value(0, PARAM_CHANNEL, 1.0));
    }

    #[test]
    fn test_parameter_range_queries_are_static() {
        let host = host();
        // No instances needed; index 1 is the first catalogue entry
        // ("filter_cutoff" after name sorting).
        assert_eq!(host.parameter_minimum(1), Some(20.0));
        assert_eq!(host.parameter_maximum(1), Some(20000.0));
        assert_eq!(host.parameter_minimum(0), None);
        assert_eq!(host.parameter_minimum(9999), None);
    }

    #[test]
    fn test_sequencer_lifecycle_and_stale_handles() {
        let host = host();
        let id = host.create_sequencer();
        assert_eq!(host.num_sequencers(), 1);

        host.enable_sequencer(id, true);
        assert!(host.delete_sequencer(id));
        assert!(!host.delete_sequencer(id));
        assert_eq!(host.num_sequencers(), 0);

        // Stale handle operations are no-ops.
        host.enable_sequencer(id, true);
        assert!(host.create_note(id, 60, 1.0, 0.0, 4.0).is_none());
    }

    #[test]
    fn test_sequencer_channel_collision() {
        let host = host();
        let a = host.create_sequencer();
        let b = host.create_sequencer();

        assert!(host.set_sequencer_channel(a, 2));
        // Second sequencer on the same channel reports the collision but
        // keeps the assignment.
        assert!(!host.set_sequencer_channel(b, 2));
        // Re-assigning the same sequencer's own channel is not a collision
        // with itself.
        assert!(host.set_sequencer_channel(a, 3));
    }

    #[test]
    fn test_frequency_broadcast_converts_to_midi() {
        let host = host();
        let instance = host.create_instance(48000.0);
        instance.set_active(true);

        host.frequency_on(0, 440.0, 1.0);
        let event = instance.queues.pop_note().unwrap();
        assert!((event.note - 69.0).abs() < 1e-4);

        host.frequency_off(0, 440.0);
        let event = instance.queues.pop_note().unwrap();
        assert_eq!(event.velocity, 0.0);
    }

    #[test]
    fn test_scheduled_note_fires_immediately() {
        let host = host();
        let instance = host.create_instance(48000.0);
        instance.set_active(true);

        host.note_on_scheduled(0, 64, 0.7, 8.0, 12.0);
        let event = instance.queues.pop_note().unwrap();
        assert_eq!(event.note, 64.0);
        assert_eq!(event.velocity, 0.7);
    }
}
