use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("step {step} is outside the pattern ({total} steps)")]
    StepOutOfRange { step: u32, total: u32 },
    #[error("pitch {0} is not a MIDI note number")]
    InvalidPitch(u8),
    #[error("velocity {0} is out of range")]
    InvalidVelocity(u8),
    #[error("note length must be at least one step")]
    ZeroLength,
    #[error("controller value {0} is out of range")]
    InvalidValue(u8),
    #[error("a pattern needs at least one beat and one step per beat")]
    InvalidDimensions,
    #[error("controller {0} is not part of the pattern")]
    UnknownController(u8),
    #[error("controller {0} already exists")]
    DuplicateController(u8),
    #[error("pattern has no free event slots")]
    Full,
    #[error("a note extends past beat {0}")]
    NotesBeyondEnd(u32),
    #[error("a control change sits past beat {0}")]
    CcBeyondEnd(u32),
}

impl PatternError {
    /// Errors caused by an argument the caller should not have passed.
    pub fn is_invalid_argument(&self) -> bool {
        !matches!(
            self,
            PatternError::Full | PatternError::NotesBeyondEnd(_) | PatternError::CcBeyondEnd(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("key does not fit the ordering at the requested position")]
    OutOfOrder,
    #[error("position refers to a node that is not in the list")]
    UnknownNode,
}

#[derive(Debug, Error)]
pub enum SongError {
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("no track with id {0}")]
    UnknownTrack(u32),
    #[error("no pattern with id {0}")]
    UnknownPattern(u32),
    #[error("pattern {pattern} would overlap another placement at beat {beat}")]
    Overlap { pattern: u32, beat: u32 },
    #[error("no placement starts at beat {0}")]
    UnknownPlacement(u32),
    #[error("invalid tempo {0} bpm")]
    InvalidTempo(f64),
    #[error("the tempo change at beat 0 cannot be removed")]
    FirstTempo,
    #[error("MIDI channel {0} is out of range")]
    InvalidChannel(u8),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("sequencable is already registered as port {0}")]
    AlreadyRegistered(u32),
    #[error("all {0} ports are in use")]
    NoFreePorts(usize),
}

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("project io: {0}")]
    Io(#[from] std::io::Error),
    #[error("project parse: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("project serialize: {0}")]
    Serialize(#[from] ron::Error),
    #[error(transparent)]
    Song(#[from] SongError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}
