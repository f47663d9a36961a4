mod tempo;
mod track;

pub use tempo::{TempoMap, TempoView};
pub use track::{Placement, Track};

use crate::error::SongError;
use crate::notify::Notifier;
use crate::pattern::PatternId;
use crate::sync::Reclaimer;
use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum SongChange {
    TitleChanged(String),
    LengthChanged(u32),
    LoopChanged { start: Option<u32>, end: Option<u32> },
    TempoChanged { beat: u32, bpm: Option<f64> },
    TrackAdded(TrackId),
    TrackRemoved(TrackId),
    TrackRenamed { track: TrackId, name: String },
    PatternAdded { track: TrackId, pattern: PatternId },
    PatternRemoved { track: TrackId, pattern: PatternId },
    PatternResized { track: TrackId, pattern: PatternId, length: u32 },
    PlacementAdded { track: TrackId, pattern: PatternId, beat: u32 },
    PlacementRemoved { track: TrackId, beat: u32 },
}

const UNSET: u32 = u32::MAX;

fn pack_loop(start: Option<u32>, end: Option<u32>) -> u64 {
    (u64::from(start.unwrap_or(UNSET)) << 32) | u64::from(end.unwrap_or(UNSET))
}

fn unpack_loop(packed: u64) -> (Option<u32>, Option<u32>) {
    let start = (packed >> 32) as u32;
    let end = packed as u32;
    ((start != UNSET).then_some(start), (end != UNSET).then_some(end))
}

struct SongState {
    title: String,
    tracks: BTreeMap<TrackId, Arc<Track>>,
    next_track: u32,
}

/// Everything that is played: tempo map, loop points and tracks.
pub struct Song {
    state: Mutex<SongState>,
    length: AtomicU32,
    loop_points: AtomicU64,
    tempo: TempoMap,
    pattern_capacity: usize,
    reclaimer: Reclaimer,
    changes: Arc<Notifier<SongChange>>,
}

impl Song {
    /// `length` is in beats.
    pub fn new(
        title: impl Into<String>,
        length: u32,
        bpm: f64,
        pattern_capacity: usize,
        reclaimer: Reclaimer,
    ) -> Result<Self, SongError> {
        Ok(Self {
            state: Mutex::new(SongState {
                title: title.into(),
                tracks: BTreeMap::new(),
                next_track: 1,
            }),
            length: AtomicU32::new(length),
            loop_points: AtomicU64::new(pack_loop(None, None)),
            tempo: TempoMap::new(bpm, reclaimer.clone())?,
            pattern_capacity,
            reclaimer,
            changes: Arc::new(Notifier::new()),
        })
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    pub fn subscribe(&self) -> Receiver<SongChange> {
        self.changes.subscribe()
    }

    pub fn title(&self) -> String {
        self.state.lock().title.clone()
    }

    pub fn set_title(&self, title: impl Into<String>) {
        let title = title.into();
        let mut state = self.state.lock();
        if state.title != title {
            state.title = title.clone();
            self.changes.notify(SongChange::TitleChanged(title));
        }
    }

    pub fn length(&self) -> u32 {
        self.length.load(Ordering::Relaxed)
    }

    pub fn set_length(&self, length: u32) {
        if self.length.swap(length, Ordering::Relaxed) != length {
            self.changes.notify(SongChange::LengthChanged(length));
        }
    }

    pub fn loop_start(&self) -> Option<u32> {
        unpack_loop(self.loop_points.load(Ordering::Relaxed)).0
    }

    pub fn loop_end(&self) -> Option<u32> {
        unpack_loop(self.loop_points.load(Ordering::Relaxed)).1
    }

    /// Both points are updated together, so the real-time thread never sees
    /// half a change.
    pub fn set_loop(&self, start: Option<u32>, end: Option<u32>) {
        let old = self.loop_points.swap(pack_loop(start, end), Ordering::Relaxed);
        if unpack_loop(old) != (start, end) {
            debug!(?start, ?end, "loop changed");
            self.changes.notify(SongChange::LoopChanged { start, end });
        }
    }

    /// `(start, end)` when looping is on: both points set and distinct.
    pub fn loop_range(&self) -> Option<(f64, f64)> {
        match unpack_loop(self.loop_points.load(Ordering::Relaxed)) {
            (Some(start), Some(end)) if start != end => Some((f64::from(start), f64::from(end))),
            _ => None,
        }
    }

    pub fn tempo_map(&self) -> &TempoMap {
        &self.tempo
    }

    pub fn add_tempo_change(&self, beat: u32, bpm: f64) -> Result<(), SongError> {
        self.tempo.add_tempo_change(beat, bpm)?;
        self.changes.notify(SongChange::TempoChanged {
            beat,
            bpm: Some(bpm),
        });
        Ok(())
    }

    pub fn remove_tempo_change(&self, beat: u32) -> Result<bool, SongError> {
        let removed = self.tempo.remove_tempo_change(beat)?;
        if removed {
            self.changes
                .notify(SongChange::TempoChanged { beat, bpm: None });
        }
        Ok(removed)
    }

    pub fn add_track(&self, name: impl Into<String>) -> Arc<Track> {
        let mut state = self.state.lock();
        let id = TrackId(state.next_track);
        state.next_track += 1;
        let track = Arc::new(Track::new(
            id,
            name,
            self.pattern_capacity,
            self.reclaimer.clone(),
            self.changes.clone(),
        ));
        state.tracks.insert(id, track.clone());
        self.changes.notify(SongChange::TrackAdded(id));
        track
    }

    pub fn remove_track(&self, id: TrackId) -> Option<Arc<Track>> {
        let removed = self.state.lock().tracks.remove(&id)?;
        self.changes.notify(SongChange::TrackRemoved(id));
        Some(removed)
    }

    pub fn track(&self, id: TrackId) -> Option<Arc<Track>> {
        self.state.lock().tracks.get(&id).cloned()
    }

    pub fn tracks(&self) -> Vec<Arc<Track>> {
        self.state.lock().tracks.values().cloned().collect()
    }

    /// Whether any pattern has unsaved edits.
    pub fn is_dirty(&self) -> bool {
        self.tracks()
            .iter()
            .any(|track| track.patterns().iter().any(|pattern| pattern.is_dirty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MidiBlock, MidiMessage, PortId};
    use crate::timing::{PortWriter, Sequencable, Span};

    fn song() -> Song {
        Song::new("test", 64, 120.0, 128, Reclaimer::new()).unwrap()
    }

    #[test]
    fn loop_points_travel_together() {
        let song = song();
        assert_eq!(song.loop_range(), None);
        song.set_loop(Some(4), Some(4));
        assert_eq!(song.loop_range(), None);
        song.set_loop(Some(4), Some(8));
        assert_eq!(song.loop_range(), Some((4.0, 8.0)));
        assert_eq!((song.loop_start(), song.loop_end()), (Some(4), Some(8)));
        song.set_loop(None, Some(8));
        assert_eq!(song.loop_range(), None);
    }

    #[test]
    fn track_changes_are_published() {
        let song = song();
        let changes = song.subscribe();
        let track = song.add_track("drums");
        let pattern = track.add_pattern("beat", 2, 4).unwrap();
        track.place(pattern.id(), 0).unwrap();
        assert_eq!(
            changes.try_iter().collect::<Vec<_>>(),
            vec![
                SongChange::TrackAdded(track.id()),
                SongChange::PatternAdded {
                    track: track.id(),
                    pattern: pattern.id()
                },
                SongChange::PlacementAdded {
                    track: track.id(),
                    pattern: pattern.id(),
                    beat: 0
                },
            ]
        );
        assert!(song.remove_track(track.id()).is_some());
        assert!(song.tracks().is_empty());
    }

    #[test]
    fn placements_never_overlap() {
        let song = song();
        let track = song.add_track("bass");
        let two = track.add_pattern("two", 2, 4).unwrap();
        let four = track.add_pattern("four", 4, 4).unwrap();

        track.place(two.id(), 4).unwrap();
        track.place(two.id(), 6).unwrap();
        assert!(matches!(track.place(four.id(), 1), Err(SongError::Overlap { .. })));
        assert!(matches!(track.place(two.id(), 5), Err(SongError::Overlap { .. })));
        track.place(four.id(), 0).unwrap();
        assert!(matches!(
            track.place(PatternId(99), 20),
            Err(SongError::UnknownPattern(99))
        ));
        assert_eq!(
            track.placements(),
            vec![(0, four.id()), (4, two.id()), (6, two.id())]
        );

        assert!(matches!(track.unplace(5), Err(SongError::UnknownPlacement(5))));
        track.unplace(4).unwrap();
        assert!(track.remove_pattern(two.id()));
        assert_eq!(track.placements(), vec![(0, four.id())]);
    }

    #[test]
    fn resizing_a_pattern_moves_its_placements() {
        let song = song();
        let track = song.add_track("lead");
        let pattern = track.add_pattern("riff", 2, 4).unwrap();
        pattern.add_note(0, 60, 100, 8).unwrap();
        track.place(pattern.id(), 0).unwrap();
        track.place(pattern.id(), 4).unwrap();

        let longer = track.resize_pattern(pattern.id(), 4).unwrap();
        assert_eq!(longer.length(), 4);
        assert_eq!(track.pattern(pattern.id()).map(|p| p.length()), Some(4));
        assert_eq!(track.placements(), vec![(0, pattern.id()), (4, pattern.id())]);

        assert!(matches!(
            track.resize_pattern(pattern.id(), 5),
            Err(SongError::Overlap { .. })
        ));
        assert!(matches!(
            track.resize_pattern(pattern.id(), 1),
            Err(SongError::Pattern(crate::error::PatternError::NotesBeyondEnd(1)))
        ));
    }

    #[test]
    fn track_emits_pattern_events_at_song_beats() {
        let reclaimer = Reclaimer::new();
        let mut reader = reclaimer.reader().unwrap();
        let song = Song::new("seq", 16, 120.0, 64, reclaimer).unwrap();
        let track = song.add_track("keys");
        track.set_channel(3).unwrap();
        let pattern = track.add_pattern("p", 1, 4).unwrap();
        pattern.add_note(3, 60, 100, 1).unwrap();
        track.place(pattern.id(), 2).unwrap();
        track.place(pattern.id(), 3).unwrap();

        let mut block = MidiBlock::new(1, 16);
        let span = Span {
            start: 2.5,
            end: 4.0,
            bpm: 120.0,
            frame_offset: 0,
            frame_rate: 1000,
            nframes: 1000,
        };
        let cycle = reader.confirm();
        let mut writer = PortWriter::new(PortId(0), span, &mut block);
        track.sequence(&cycle, &mut writer);

        let events: Vec<(u32, MidiMessage)> = block
            .events(PortId(0))
            .iter()
            .map(|event| (event.offset, event.message))
            .collect();
        assert_eq!(
            events,
            vec![
                (125, MidiMessage::NoteOn { channel: 3, pitch: 60, velocity: 100 }),
                (250, MidiMessage::NoteOff { channel: 3, pitch: 60, velocity: 100 }),
                (625, MidiMessage::NoteOn { channel: 3, pitch: 60, velocity: 100 }),
            ]
        );
        assert!(matches!(track.set_channel(16), Err(SongError::InvalidChannel(16))));
    }
}
