mod arena;
mod controller;
mod store;

pub use arena::EventKind;
pub use controller::Controller;
pub use store::{NoteIter, Pattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatternId(pub u32);

impl std::fmt::Display for PatternId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Refers to a note's NoteOn in one pattern. Goes stale once the note is
/// deleted or its slot is reused, and never resolves in another pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoteHandle {
    pattern: u64,
    index: u32,
    generation: u32,
}

/// Snapshot of a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Note {
    pub handle: NoteHandle,
    pub step: u32,
    pub pitch: u8,
    pub velocity: u8,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternChange {
    NoteAdded { step: u32, pitch: u8, length: u32 },
    NoteChanged { step: u32, pitch: u8, length: u32 },
    NoteRemoved { step: u32, pitch: u8 },
    CcSet { controller: u8, step: u32, value: u8 },
    CcRemoved { controller: u8, step: u32 },
    ControllerAdded { controller: u8 },
    ControllerRemoved { controller: u8 },
    NameChanged(String),
}
