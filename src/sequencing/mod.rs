pub mod arena;
pub mod sequencer;

pub use arena::{Arena, Handle};
pub use sequencer::{Note, NoteEdge, NoteId, Sequencer};
