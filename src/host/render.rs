//! The per-block render driver.
//!
//! Runs on the instance's real-time thread under the host's audio callback:
//! advances the beat projection, drains queued events, dispatches sequencer
//! edges, renders the engine in sub-blocks, and maps engine channels onto
//! the host's interleaved output buffer. Nothing here blocks on unbounded
//! work; the instance lock is held for exactly one block.

use super::instance::{Instance, InstanceState};
use super::SynthHost;
use crate::sequencing::NoteEdge;
use crate::{MAX_BLOCK_SIZE, MAX_HOST_CHANNELS};

fn is_silent(buffer: &[f32]) -> bool {
    buffer.iter().all(|s| s.abs() < 1e-9)
}

impl SynthHost {
    /// Render one host audio block for `instance`.
    ///
    /// `in_buffer` and `out_buffer` are interleaved with `in_channels` /
    /// `out_channels` frames of `num_samples`. The input buffer acts as a
    /// per-sample gain applied to the engine output. `host_paused` is the
    /// host's transport flag; a paused host or silent input deactivates the
    /// instance and zeroes the block without touching the engine.
    #[allow(clippy::too_many_arguments)]
    pub fn process_block(
        &self,
        instance: &Instance,
        in_buffer: &[f32],
        out_buffer: &mut [f32],
        num_samples: usize,
        in_channels: usize,
        out_channels: usize,
        host_paused: bool,
        sample_rate: f64,
    ) {
        let mut state = instance.lock_state();

        let last_beat = state.current_beat;
        let delta_time = num_samples as f64 / sample_rate;
        let mut delta_beat = delta_time * self.clock.beats_per_second();
        let mut next_beat = last_beat + delta_beat;
        let global_paused = self.clock.paused();

        if !global_paused {
            let global_beat = self.clock.beat();
            if state.last_global_beat_sync != global_beat {
                // External resync: jump the phase, keep this block's span.
                next_beat = global_beat + delta_beat;
                delta_beat = next_beat - last_beat;
                state.last_global_beat_sync = global_beat;
            }
            state.current_beat = next_beat;
        }

        if host_paused || is_silent(in_buffer) {
            instance.set_active(false);
            out_buffer[..num_samples * out_channels].fill(0.0);
            return;
        }
        instance.set_active(true);

        let synth_samples = num_samples.min(state.engine.max_buffer_size());
        state.drain_values(&instance.queues);

        let mut offset = 0;
        while offset < num_samples {
            let current_samples = synth_samples.min(num_samples - offset);

            let start_beat = last_beat + (delta_beat * offset as f64) / num_samples as f64;
            let mut end_beat = last_beat
                + (delta_beat * (offset + current_samples) as f64) / num_samples as f64;
            if offset + synth_samples >= num_samples {
                end_beat = next_beat;
            }

            if end_beat > start_beat && !global_paused {
                self.process_sequencer_notes(&mut state, instance.channel(), start_beat, end_beat);
            }
            state.drain_notes(&instance.queues);
            render_sub_block(
                &mut state,
                in_buffer,
                out_buffer,
                in_channels,
                out_channels,
                current_samples,
                offset,
                self.clock.bpm(),
            );

            offset += synth_samples;
        }

        // Snapshot for external readback, then apply the mute flag post-hoc
        // so rendering stays continuous while silenced. Wider outputs keep
        // only the first MAX_HOST_CHANNELS channels of each frame, so the
        // stored stride always matches `send_channels`.
        let send_channels = out_channels.min(MAX_HOST_CHANNELS);
        let frames = num_samples.min(MAX_BLOCK_SIZE);
        if send_channels == out_channels {
            let len = frames * out_channels;
            state.send_data[..len].copy_from_slice(&out_buffer[..len]);
        } else {
            for i in 0..frames {
                for c in 0..send_channels {
                    state.send_data[i * send_channels + c] = out_buffer[i * out_channels + c];
                }
            }
        }
        state.send_channels = send_channels;

        if instance.is_silent() {
            out_buffer[..num_samples * out_channels].fill(0.0);
        }
    }

    /// Feed edges from every enabled sequencer on `channel` into the engine
    /// for the beat window [start_beat, end_beat).
    fn process_sequencer_notes(
        &self,
        state: &mut InstanceState,
        channel: i32,
        start_beat: f64,
        end_beat: f64,
    ) {
        let mut sequencers = self.lock_sequencers();
        for (_, entry) in sequencers.iter_mut() {
            if !entry.enabled || entry.sequencer.channel() != channel {
                continue;
            }

            let engine = &mut state.engine;
            entry
                .sequencer
                .process_window(start_beat, end_beat, &mut |edge| match edge {
                    NoteEdge::Off { key } => engine.note_off(key as f32),
                    NoteEdge::On { key, velocity } => engine.note_on(key as f32, velocity),
                });
        }
    }
}

/// Render one engine sub-block and fan it out to the host buffer.
///
/// Engine left/right outputs map onto arbitrary host channel counts by
/// `channel % 2`; the input gain channel is chosen by `channel %
/// in_channels`.
#[allow(clippy::too_many_arguments)]
fn render_sub_block(
    state: &mut InstanceState,
    in_buffer: &[f32],
    out_buffer: &mut [f32],
    in_channels: usize,
    out_channels: usize,
    samples: usize,
    offset: usize,
    bpm: f64,
) {
    let engine = &mut state.engine;
    if engine.buffer_size() != samples {
        engine.set_buffer_size(samples);
    }
    engine.set_bpm(bpm);
    engine.process();

    for channel in 0..out_channels {
        let synth_output = engine.output(channel % 2);
        let in_channel = channel % in_channels;

        for i in 0..samples {
            let sample = i + offset;
            let gain = in_buffer[sample * in_channels + in_channel];
            out_buffer[sample * out_channels + channel] = gain * synth_output[i];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::basic::BasicEngineFactory;
    use crate::host::SynthHost;

    const SAMPLE_RATE: f64 = 48000.0;
    const BLOCK: usize = 512;

    fn host() -> SynthHost {
        SynthHost::new(Box::new(BasicEngineFactory::new()))
    }

    fn run_block(host: &SynthHost, instance: &Instance, out: &mut [f32]) {
        let input = vec![1.0f32; BLOCK * 2];
        host.process_block(instance, &input, out, BLOCK, 2, 2, false, SAMPLE_RATE);
    }

    #[test]
    fn test_silent_input_bypasses_engine() {
        let host = host();
        let instance = host.create_instance(SAMPLE_RATE as f32);
        instance.set_active(true);

        let input = vec![0.0f32; BLOCK * 2];
        let mut out = vec![0.5f32; BLOCK * 2];
        host.process_block(&instance, &input, &mut out, BLOCK, 2, 2, false, SAMPLE_RATE);

        assert!(!instance.is_active());
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_host_pause_bypasses_engine() {
        let host = host();
        let instance = host.create_instance(SAMPLE_RATE as f32);

        let input = vec![1.0f32; BLOCK * 2];
        let mut out = vec![0.5f32; BLOCK * 2];
        host.process_block(&instance, &input, &mut out, BLOCK, 2, 2, true, SAMPLE_RATE);

        assert!(!instance.is_active());
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_queued_note_renders_audio() {
        let host = host();
        let instance = host.create_instance(SAMPLE_RATE as f32);
        instance.enqueue_note(60.0, 1.0);

        let mut out = vec![0.0f32; BLOCK * 2];
        run_block(&host, &instance, &mut out);

        assert!(instance.is_active());
        let peak = out.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!(peak > 0.01);
    }

    #[test]
    fn test_beat_advances_with_tempo() {
        let host = host();
        host.set_bpm(120.0);
        let instance = host.create_instance(SAMPLE_RATE as f32);

        let mut out = vec![0.0f32; BLOCK * 2];
        run_block(&host, &instance, &mut out);

        let expected = (BLOCK as f64 / SAMPLE_RATE) * 2.0; // 120 bpm = 2 beats/sec
        let state = instance.lock_state();
        assert!((state.current_beat - expected).abs() < 1e-9);
    }

    #[test]
    fn test_pause_freezes_beat_but_still_renders() {
        let host = host();
        host.set_paused(true);
        let instance = host.create_instance(SAMPLE_RATE as f32);
        instance.enqueue_note(60.0, 1.0);

        let mut out = vec![0.0f32; BLOCK * 2];
        run_block(&host, &instance, &mut out);

        let state = instance.lock_state();
        assert_eq!(state.current_beat, 0.0);
        drop(state);

        // Queued events still drained and rendered while paused.
        let peak = out.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!(peak > 0.01);
    }

    #[test]
    fn test_global_resync_changes_phase_not_span() {
        let host = host();
        host.set_bpm(120.0);
        let instance = host.create_instance(SAMPLE_RATE as f32);

        let mut out = vec![0.0f32; BLOCK * 2];
        run_block(&host, &instance, &mut out);

        host.set_beat_time(100.0);
        run_block(&host, &instance, &mut out);

        let span = (BLOCK as f64 / SAMPLE_RATE) * 2.0;
        let state = instance.lock_state();
        assert!((state.current_beat - (100.0 + span)).abs() < 1e-9);
        assert_eq!(state.last_global_beat_sync, 100.0);
    }

    #[test]
    fn test_sequencer_drives_engine_through_render() {
        let host = host();
        host.set_bpm(120.0);
        let instance = host.create_instance(SAMPLE_RATE as f32);

        let id = host.create_sequencer();
        host.set_sequencer_channel(id, 0);
        host.set_sequencer_loop(id, false);
        // A long note starting at sixteenth 0.
        host.create_note(id, 60, 1.0, 0.0, 64.0);
        host.enable_sequencer(id, true);

        let mut out = vec![0.0f32; BLOCK * 2];
        run_block(&host, &instance, &mut out);

        let state = instance.lock_state();
        assert_eq!(state.engine.active_voices(), 1);
    }

    #[test]
    fn test_mute_suppresses_output_but_keeps_rendering() {
        let host = host();
        let instance = host.create_instance(SAMPLE_RATE as f32);
        instance.enqueue_note(60.0, 1.0);
        instance.set_silent(true);

        let mut out = vec![0.0f32; BLOCK * 2];
        run_block(&host, &instance, &mut out);

        // Output muted, but the snapshot captured the rendered audio.
        assert!(out.iter().all(|&s| s == 0.0));
        let state = instance.lock_state();
        let peak = state.send_data[..BLOCK * 2]
            .iter()
            .fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!(peak > 0.01);
    }

    #[test]
    fn test_readback_with_wide_output() {
        let host = host();
        let instance = host.create_instance(SAMPLE_RATE as f32);
        instance.enqueue_note(60.0, 1.0);

        // Four output channels: the snapshot keeps the first two of each
        // frame, and readback expands them back by modulo mapping.
        let input = vec![1.0f32; BLOCK];
        let mut out = vec![0.0f32; BLOCK * 4];
        host.process_block(&instance, &input, &mut out, BLOCK, 1, 4, false, SAMPLE_RATE);

        let mut readback = vec![0.0f32; BLOCK * 4];
        host.read_buffer(0, &mut readback, BLOCK, 4);
        assert_eq!(&readback[..], &out[..]);
    }

    #[test]
    fn test_instance_sample_rate_reaches_engine() {
        // Release tails are specified in seconds, so their sample length
        // depends on the rate the instance was created with.
        let host = host();
        let fast = host.create_instance(4800.0);
        let slow = host.create_instance(SAMPLE_RATE as f32);

        for instance in [&fast, &slow] {
            let mut state = instance.lock_state();
            state.engine.note_on(60.0, 1.0);
            state.engine.note_off(60.0);
            for _ in 0..4 {
                state.engine.process();
            }
        }

        assert_eq!(fast.lock_state().engine.active_voices(), 0);
        assert_eq!(slow.lock_state().engine.active_voices(), 1);
    }

    #[test]
    fn test_readback_after_render() {
        let host = host();
        let instance = host.create_instance(SAMPLE_RATE as f32);
        instance.enqueue_note(60.0, 1.0);

        let mut out = vec![0.0f32; BLOCK * 2];
        run_block(&host, &instance, &mut out);

        let mut readback = vec![0.0f32; BLOCK * 2];
        host.read_buffer(0, &mut readback, BLOCK, 2);
        assert_eq!(&readback[..64], &out[..64]);
    }
}
