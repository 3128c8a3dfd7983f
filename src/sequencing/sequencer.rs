//! Beat-quantized note pattern playback.
//!
//! A sequencer owns an editable set of notes with start/end positions in
//! sixteenth notes (the native resolution; one beat = four sixteenths) and
//! converts render-window beat spans into discrete note-on/note-off edges.
//! Sequencers live in a process-wide registry independent of any synth
//! instance; every instance listening on the sequencer's channel receives
//! its edges.

use super::arena::{Arena, Handle};
use crate::SIXTEENTHS_PER_BEAT;

/// Handle to one note inside a sequencer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NoteId(Handle);

/// One note: MIDI key, velocity, and start/end in sixteenths.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub midi_key: u8,
    pub velocity: f32,
    pub start: f64,
    pub end: f64,
}

/// A note-on or note-off edge produced by window processing.
///
/// Within one window all offs are emitted strictly before any ons, so a key
/// shared by an ending and a starting note re-triggers instead of racing.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum NoteEdge {
    Off { key: u8 },
    On { key: u8, velocity: f32 },
}

/// An editable, loopable note pattern addressed by logical channel.
pub struct Sequencer {
    channel: i32,
    looping: bool,
    /// Pattern length in sixteenths.
    length: f64,
    /// Earliest global beat at which the pattern may play.
    start_beat: f64,
    /// Playback cursor: end of the last processed span, in sixteenths.
    position: f64,
    notes: Arena<Note>,
}

fn wrap(value: f64, length: f64) -> (f64, i64) {
    let num_wraps = (value / length) as i64;
    (value - num_wraps as f64 * length, num_wraps)
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            channel: 0,
            looping: true,
            length: 16.0,
            start_beat: 0.0,
            position: 0.0,
            notes: Arena::new(),
        }
    }

    pub fn channel(&self) -> i32 {
        self.channel
    }

    pub fn set_channel(&mut self, channel: i32) {
        self.channel = channel;
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    pub fn set_length(&mut self, length: f64) {
        self.length = length;
    }

    pub fn start_beat(&self) -> f64 {
        self.start_beat
    }

    pub fn set_start_beat(&mut self, start_beat: f64) {
        self.start_beat = start_beat;
    }

    /// Playback cursor in sixteenths.
    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn num_notes(&self) -> usize {
        self.notes.len()
    }

    pub fn add_note(&mut self, midi_key: u8, velocity: f32, start: f64, end: f64) -> NoteId {
        NoteId(self.notes.insert(Note {
            midi_key,
            velocity,
            start,
            end,
        }))
    }

    pub fn delete_note(&mut self, id: NoteId) -> Option<Note> {
        self.notes.remove(id.0)
    }

    pub fn note(&self, id: NoteId) -> Option<&Note> {
        self.notes.get(id.0)
    }

    pub fn change_note_start(&mut self, id: NoteId, start: f64) {
        if let Some(note) = self.notes.get_mut(id.0) {
            note.start = start;
        }
    }

    pub fn change_note_end(&mut self, id: NoteId, end: f64) {
        if let Some(note) = self.notes.get_mut(id.0) {
            note.end = end;
        }
    }

    pub fn change_note_key(&mut self, id: NoteId, midi_key: u8) {
        if let Some(note) = self.notes.get_mut(id.0) {
            note.midi_key = midi_key;
        }
    }

    pub fn change_note_velocity(&mut self, id: NoteId, velocity: f32) {
        if let Some(note) = self.notes.get_mut(id.0) {
            note.velocity = velocity;
        }
    }

    /// Whether the playback cursor currently sits inside the note.
    ///
    /// Edit operations check this before and after a mutation to decide if a
    /// sounding note must be forced off.
    pub fn is_note_playing(&self, id: NoteId) -> bool {
        match self.notes.get(id.0) {
            Some(note) => note.start <= self.position && self.position < note.end,
            None => false,
        }
    }

    /// Process the render window [`window_start_beat`, `window_end_beat`),
    /// given in global beats, emitting note edges.
    ///
    /// Skips entirely until the configured start beat has been reached, then
    /// clamps the window start to it.
    pub fn process_window(
        &mut self,
        window_start_beat: f64,
        window_end_beat: f64,
        emit: &mut dyn FnMut(NoteEdge),
    ) {
        if self.start_beat >= window_end_beat {
            return;
        }

        let start_beat = self.start_beat.max(window_start_beat);
        let start = SIXTEENTHS_PER_BEAT * start_beat;
        let end = (SIXTEENTHS_PER_BEAT * window_end_beat).max(start);
        self.process_span(start, end, emit);
    }

    /// Process a span given directly in sixteenths.
    ///
    /// When looping, both endpoints wrap modulo the pattern length. If the
    /// endpoints land in different loop iterations the span is cut at the
    /// end of the pattern for this pass; a note sitting exactly on the
    /// boundary of a crossing window may be skipped. Downstream timing
    /// depends on this exact policy, so it is deliberate.
    pub fn process_span(&mut self, start: f64, end: f64, emit: &mut dyn FnMut(NoteEdge)) {
        let mut start = start;
        let mut end = end.max(start);

        if self.looping {
            let (wrapped_start, start_wraps) = wrap(start, self.length);
            let (wrapped_end, end_wraps) = wrap(end, self.length);
            start = wrapped_start;
            if start_wraps == end_wraps {
                end = wrapped_end.max(start);
            } else {
                end = self.length;
            }
        }

        // Offs strictly before ons, each in storage order.
        for (_, note) in self.notes.iter() {
            if note.end >= start && note.end < end {
                emit(NoteEdge::Off { key: note.midi_key });
            }
        }

        for (_, note) in self.notes.iter() {
            if note.start >= start && note.start < end {
                emit(NoteEdge::On {
                    key: note.midi_key,
                    velocity: note.velocity,
                });
            }
        }

        self.position = end;
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_span(sequencer: &mut Sequencer, start: f64, end: f64) -> Vec<NoteEdge> {
        let mut edges = Vec::new();
        sequencer.process_span(start, end, &mut |edge| edges.push(edge));
        edges
    }

    #[test]
    fn test_single_note_on_then_off_across_windows() {
        let mut sequencer = Sequencer::new();
        sequencer.set_looping(false);
        sequencer.add_note(60, 0.8, 0.0, 4.0);

        let first = collect_span(&mut sequencer, 0.0, 4.0);
        assert_eq!(
            first,
            vec![NoteEdge::On {
                key: 60,
                velocity: 0.8
            }]
        );

        let second = collect_span(&mut sequencer, 4.0, 8.0);
        assert_eq!(second, vec![NoteEdge::Off { key: 60 }]);
    }

    #[test]
    fn test_looping_window_emits_one_on_one_off_per_pass() {
        let mut sequencer = Sequencer::new();
        sequencer.set_length(8.0);
        sequencer.add_note(64, 1.0, 0.0, 1.0);

        for window in [(0.0, 8.0), (8.0, 16.0)] {
            let edges = collect_span(&mut sequencer, window.0, window.1);
            let ons = edges
                .iter()
                .filter(|e| matches!(e, NoteEdge::On { .. }))
                .count();
            let offs = edges
                .iter()
                .filter(|e| matches!(e, NoteEdge::Off { .. }))
                .count();
            assert_eq!(ons, 1, "window {:?}", window);
            assert_eq!(offs, 1, "window {:?}", window);
        }
    }

    #[test]
    fn test_crossing_window_drops_note_past_the_boundary() {
        let mut sequencer = Sequencer::new();
        sequencer.set_length(8.0);
        sequencer.add_note(60, 1.0, 1.0, 2.0);

        // First pass plays the note normally.
        collect_span(&mut sequencer, 0.0, 6.0);

        // The crossing window [6, 10) is cut at the pattern end, so its span
        // is [6, 8): the note-on at sixteenth 1 of the next pass falls in
        // the cut-off region and is dropped for good.
        assert!(collect_span(&mut sequencer, 6.0, 10.0).is_empty());

        // The following window resumes past it; only the off at sixteenth 2
        // is seen.
        assert_eq!(
            collect_span(&mut sequencer, 10.0, 12.0),
            vec![NoteEdge::Off { key: 60 }]
        );
    }

    #[test]
    fn test_offs_emitted_before_ons() {
        let mut sequencer = Sequencer::new();
        sequencer.set_looping(false);
        sequencer.add_note(60, 1.0, 0.0, 4.0);
        sequencer.add_note(60, 1.0, 4.0, 8.0);

        collect_span(&mut sequencer, 0.0, 4.0);
        let edges = collect_span(&mut sequencer, 4.0, 8.0);
        assert_eq!(
            edges,
            vec![
                NoteEdge::Off { key: 60 },
                NoteEdge::On {
                    key: 60,
                    velocity: 1.0
                }
            ]
        );
    }

    #[test]
    fn test_window_before_start_beat_is_skipped() {
        let mut sequencer = Sequencer::new();
        sequencer.set_looping(false);
        sequencer.set_start_beat(8.0);
        sequencer.add_note(60, 1.0, 0.0, 4.0);

        let mut edges = Vec::new();
        sequencer.process_window(0.0, 2.0, &mut |edge| edges.push(edge));
        assert!(edges.is_empty());
        assert_eq!(sequencer.position(), 0.0);
    }

    #[test]
    fn test_window_clamps_to_start_beat() {
        let mut sequencer = Sequencer::new();
        sequencer.set_looping(false);
        sequencer.set_start_beat(1.0);
        // Starts at sixteenth 2, before the start beat (sixteenth 4).
        sequencer.add_note(60, 1.0, 2.0, 3.0);
        sequencer.add_note(62, 1.0, 5.0, 6.0);

        let mut edges = Vec::new();
        sequencer.process_window(0.0, 2.0, &mut |edge| edges.push(edge));
        let ons: Vec<_> = edges
            .iter()
            .filter_map(|e| match e {
                NoteEdge::On { key, .. } => Some(*key),
                _ => None,
            })
            .collect();
        assert_eq!(ons, vec![62]);
    }

    #[test]
    fn test_is_note_playing_tracks_cursor() {
        let mut sequencer = Sequencer::new();
        sequencer.set_looping(false);
        let note = sequencer.add_note(60, 1.0, 0.0, 4.0);

        collect_span(&mut sequencer, 0.0, 2.0);
        assert!(sequencer.is_note_playing(note));

        collect_span(&mut sequencer, 2.0, 4.0);
        assert!(!sequencer.is_note_playing(note));
    }

    #[test]
    fn test_note_edits_take_effect() {
        let mut sequencer = Sequencer::new();
        let note = sequencer.add_note(60, 1.0, 0.0, 4.0);

        sequencer.change_note_key(note, 72);
        sequencer.change_note_velocity(note, 0.5);
        sequencer.change_note_start(note, 1.0);
        sequencer.change_note_end(note, 2.0);

        let updated = sequencer.note(note).unwrap();
        assert_eq!(updated.midi_key, 72);
        assert_eq!(updated.velocity, 0.5);
        assert_eq!(updated.start, 1.0);
        assert_eq!(updated.end, 2.0);
    }

    #[test]
    fn test_deleted_note_handle_is_stale() {
        let mut sequencer = Sequencer::new();
        let note = sequencer.add_note(60, 1.0, 0.0, 4.0);
        assert_eq!(sequencer.num_notes(), 1);

        assert!(sequencer.delete_note(note).is_some());
        assert!(sequencer.delete_note(note).is_none());
        assert!(sequencer.note(note).is_none());
        assert!(!sequencer.is_note_playing(note));
    }
}
