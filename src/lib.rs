pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod notify;
pub mod pattern;
pub mod project;
pub mod song;
pub mod sync;
pub mod timing;

pub use config::EngineConfig;
pub use engine::{Engine, EngineCommand, EngineHandle, EngineUpdate, RealtimeDriver};
pub use error::{ConfigError, IndexError, PatternError, ProjectError, RegistryError, SongError};
pub use events::{
    EventSink, MidiBlock, MidiMessage, PortEvent, PortId, RingSink, TimedEvent, ring_sink,
};
pub use pattern::{Note, NoteHandle, Pattern, PatternChange, PatternId};
pub use project::{NoteRecord, PatternRecord, SongRecord, TrackRecord};
pub use song::{Song, SongChange, TempoMap, Track, TrackId};
pub use sync::{Reclaimer, SkipList};
pub use timing::{BlockInfo, BlockReport, PortWriter, Registry, Scheduler, Sequencable, Span};
