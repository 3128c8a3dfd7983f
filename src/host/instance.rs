//! One running synthesizer instance.
//!
//! An instance owns its engine, the flat parameter table, the modulation
//! slot bank, and the pair of event queues feeding its render loop. The
//! `Mutex<InstanceState>` is the coarse per-instance critical section: the
//! render loop holds it for one block, control threads hold it for direct
//! parameter/modulation edits. Channel, active, and silent live in atomics
//! so broadcast filtering never contends with a rendering block.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::engine::{ControlId, ModulationConnection, SynthEngine};
use crate::host::events::EventQueues;
use crate::host::params::{self, FIXED_PARAMS, PARAM_CHANNEL};
use crate::{MAX_BLOCK_SIZE, MAX_HOST_CHANNELS, MAX_MODULATIONS, VALUES_PER_MODULATION};

pub type InstanceId = u64;

/// Failure modes of the per-instance parameter interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    /// Flat index outside the instance's parameter table.
    UnsupportedIndex { index: usize, count: usize },
}

impl fmt::Display for ParamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamError::UnsupportedIndex { index, count } => {
                write!(f, "unsupported parameter index {index} (have {count})")
            }
        }
    }
}

impl Error for ParamError {}

/// State guarded by the instance lock.
pub(crate) struct InstanceState {
    pub(crate) engine: Box<dyn SynthEngine>,
    /// Raw last-written value per flat index, for readback.
    pub(crate) parameters: Vec<f32>,
    /// Flat index -> live engine control, where one exists.
    pub(crate) value_lookup: Vec<Option<ControlId>>,
    /// (min, max) per flat index; (0, 0) outside the engine range.
    pub(crate) range_lookup: Vec<(f32, f32)>,
    pub(crate) modulations: Vec<ModulationConnection>,
    /// Local projection of the global beat at the end of the last block.
    pub(crate) current_beat: f64,
    /// Global beat value observed at the last resync.
    pub(crate) last_global_beat_sync: f64,
    /// Channel count of the last rendered block snapshot (0 = none yet).
    pub(crate) send_channels: usize,
    /// Snapshot of the last rendered block, for external readback.
    pub(crate) send_data: Vec<f32>,
}

pub struct Instance {
    id: InstanceId,
    channel: AtomicI32,
    active: AtomicBool,
    silent: AtomicBool,
    pub(crate) queues: EventQueues,
    pub(crate) state: Mutex<InstanceState>,
}

impl Instance {
    pub(crate) fn new(id: InstanceId, engine: Box<dyn SynthEngine>) -> Self {
        let catalog = engine.controls();
        let num_engine_params = catalog.len();
        let total = params::total_params(num_engine_params);

        let mut parameters = vec![0.0; total];
        let mut value_lookup = vec![None; total];
        let mut range_lookup = vec![(0.0, 0.0); total];
        for (i, control) in catalog.iter().enumerate() {
            let index = FIXED_PARAMS + i;
            parameters[index] = control.default_value;
            value_lookup[index] = Some(ControlId(i));
            range_lookup[index] = (control.min, control.max);
        }

        let modulations = (0..MAX_MODULATIONS).map(ModulationConnection::new).collect();

        Self {
            id,
            channel: AtomicI32::new(0),
            active: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            queues: EventQueues::new(),
            state: Mutex::new(InstanceState {
                engine,
                parameters,
                value_lookup,
                range_lookup,
                modulations,
                current_beat: 0.0,
                last_global_beat_sync: 0.0,
                send_channels: 0,
                send_data: vec![0.0; MAX_HOST_CHANNELS * MAX_BLOCK_SIZE],
            }),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Logical channel this instance answers broadcasts on.
    pub fn channel(&self) -> i32 {
        self.channel.load(Ordering::Relaxed)
    }

    /// Whether the instance rendered audio in its last block.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn is_silent(&self) -> bool {
        self.silent.load(Ordering::Relaxed)
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::Relaxed);
    }

    /// Enqueue a note event for the render thread. Velocity 0 = note-off.
    pub fn enqueue_note(&self, note: f32, velocity: f32) {
        self.queues.push_note(note, velocity);
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, InstanceState> {
        // Critical sections are short and never panic in release paths.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set a parameter by flat index (host parameter-callback path).
    ///
    /// The raw value is always stored for readback; clamping is the caller's
    /// responsibility here. A mapped engine control is updated through the
    /// value queue so only the render thread touches engine control state.
    /// Modulation-range indices decode to (slot, field) and run the
    /// connection state machine: source and destination writes leave the
    /// slot disconnected, only a non-zero amount write connects it.
    pub fn set_parameter(&self, index: usize, value: f32) -> Result<(), ParamError> {
        let mut state = self.lock_state();
        if index >= state.parameters.len() {
            return Err(ParamError::UnsupportedIndex {
                index,
                count: state.parameters.len(),
            });
        }

        state.parameters[index] = value;
        if index == PARAM_CHANNEL {
            self.channel.store(value as i32, Ordering::Relaxed);
        }

        if state.value_lookup[index].is_some() {
            self.queues.push_value(index, value);
        }

        let num_engine_params = state.engine.controls().len();
        let modulation_start = params::modulation_start(num_engine_params);
        if index >= modulation_start {
            state.apply_modulation_write(index - modulation_start, value);
        }

        Ok(())
    }

    /// Read back the raw stored value for a flat index.
    pub fn get_parameter(&self, index: usize) -> Result<f32, ParamError> {
        let state = self.lock_state();
        state
            .parameters
            .get(index)
            .copied()
            .ok_or(ParamError::UnsupportedIndex {
                index,
                count: state.parameters.len(),
            })
    }

    pub fn num_parameters(&self) -> usize {
        self.lock_state().parameters.len()
    }

    /// Number of engine voices currently sounding.
    pub fn active_voices(&self) -> usize {
        self.lock_state().engine.active_voices()
    }

    /// Whether the modulation slot is currently connected in the engine.
    pub fn is_modulation_active(&self, slot: usize) -> bool {
        let state = self.lock_state();
        match state.modulations.get(slot) {
            Some(connection) => state.engine.is_modulation_active(connection),
            None => false,
        }
    }
}

impl InstanceState {
    /// Apply a write to the modulation index range.
    ///
    /// `mod_param` is the offset from the start of the modulation range;
    /// slot = offset / 3, field = offset % 3 (0 source, 1 destination,
    /// 2 amount). Unresolvable source/destination ordinals are ignored.
    fn apply_modulation_write(&mut self, mod_param: usize, value: f32) {
        let slot = mod_param / VALUES_PER_MODULATION;
        let field = mod_param % VALUES_PER_MODULATION;
        let Some(connection) = self.modulations.get_mut(slot) else {
            return;
        };
        let engine = &mut self.engine;

        match field {
            0 => {
                if engine.is_modulation_active(connection) {
                    engine.disconnect_modulation(connection);
                }
                let ordinal = value as usize;
                if let Some(source) = engine.modulation_sources().get(ordinal) {
                    connection.source = source.clone();
                }
            }
            1 => {
                if engine.is_modulation_active(connection) {
                    engine.disconnect_modulation(connection);
                }
                let ordinal = value as usize;
                let mono = engine.mono_modulations();
                if let Some(destination) = mono.get(ordinal) {
                    connection.destination = destination.clone();
                } else {
                    let ordinal = ordinal - mono.len();
                    if let Some(destination) = engine.poly_modulations().get(ordinal) {
                        connection.destination = destination.clone();
                    }
                }
            }
            _ => {
                if value == 0.0 {
                    if engine.is_modulation_active(connection) {
                        engine.disconnect_modulation(connection);
                    }
                } else {
                    connection.amount = value;
                    if !engine.is_modulation_active(connection) {
                        engine.connect_modulation(connection);
                    }
                }
            }
        }
    }

    /// Disconnect every active modulation slot.
    pub(crate) fn clear_modulations(&mut self) {
        for connection in &self.modulations {
            if self.engine.is_modulation_active(connection) {
                self.engine.disconnect_modulation(connection);
            }
        }
    }

    /// Overwrite one slot with an explicit route and connect it.
    pub(crate) fn add_modulation(&mut self, slot: usize, source: &str, destination: &str, amount: f32) {
        let Some(connection) = self.modulations.get_mut(slot) else {
            return;
        };
        // Fields may only change while disconnected.
        if self.engine.is_modulation_active(connection) {
            self.engine.disconnect_modulation(connection);
        }
        connection.source = source.to_string();
        connection.destination = destination.to_string();
        connection.amount = amount;
        self.engine.connect_modulation(connection);
    }

    /// Apply all pending parameter-value events to engine controls, FIFO.
    pub(crate) fn drain_values(&mut self, queues: &EventQueues) {
        while let Some(event) = queues.pop_value() {
            if let Some(Some(id)) = self.value_lookup.get(event.index) {
                self.engine.set_control(*id, event.value);
            }
        }
    }

    /// Translate all pending note events into engine calls, FIFO.
    /// Velocity 0 dispatches note-off.
    pub(crate) fn drain_notes(&mut self, queues: &EventQueues) {
        while let Some(event) = queues.pop_note() {
            if event.velocity != 0.0 {
                self.engine.note_on(event.note, event.velocity);
            } else {
                self.engine.note_off(event.note);
            }
        }
    }
}
