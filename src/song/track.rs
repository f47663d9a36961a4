use super::{SongChange, TrackId};
use crate::error::SongError;
use crate::notify::Notifier;
use crate::pattern::{Pattern, PatternId};
use crate::sync::{Cycle, NodeId, Reclaimer, SkipList};
use crate::timing::{PortWriter, Sequencable};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::debug;

/// A pattern placed on the track. Keyed by its start beat.
pub struct Placement {
    pub pattern: Arc<Pattern>,
}

impl Placement {
    pub fn length(&self) -> u32 {
        self.pattern.length()
    }
}

struct TrackState {
    name: String,
    patterns: BTreeMap<PatternId, Arc<Pattern>>,
    next_pattern: u32,
}

/// A sequence of non-overlapping pattern placements on one MIDI channel.
pub struct Track {
    id: TrackId,
    channel: AtomicU8,
    muted: AtomicBool,
    state: Mutex<TrackState>,
    placements: SkipList<u32, Placement>,
    pattern_capacity: usize,
    reclaimer: Reclaimer,
    changes: Arc<Notifier<SongChange>>,
}

impl Track {
    pub(crate) fn new(
        id: TrackId,
        name: impl Into<String>,
        pattern_capacity: usize,
        reclaimer: Reclaimer,
        changes: Arc<Notifier<SongChange>>,
    ) -> Self {
        let name = name.into();
        debug!(track = id.0, %name, "creating track");
        Self {
            id,
            channel: AtomicU8::new(0),
            muted: AtomicBool::new(false),
            state: Mutex::new(TrackState {
                name,
                patterns: BTreeMap::new(),
                next_pattern: 1,
            }),
            placements: SkipList::new(reclaimer.clone()),
            pattern_capacity,
            reclaimer,
            changes,
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        let mut state = self.state.lock();
        if state.name != name {
            state.name = name.clone();
            self.changes.notify(SongChange::TrackRenamed { track: self.id, name });
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel.load(Ordering::Relaxed)
    }

    pub fn set_channel(&self, channel: u8) -> Result<(), SongError> {
        if channel > 15 {
            return Err(SongError::InvalidChannel(channel));
        }
        self.channel.store(channel, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Creates an empty pattern owned by this track.
    pub fn add_pattern(
        &self,
        name: impl Into<String>,
        length: u32,
        steps: u32,
    ) -> Result<Arc<Pattern>, SongError> {
        let mut state = self.state.lock();
        let id = PatternId(state.next_pattern);
        let pattern = Arc::new(Pattern::new(
            id,
            name,
            length,
            steps,
            self.pattern_capacity,
            self.reclaimer.clone(),
        )?);
        state.next_pattern += 1;
        state.patterns.insert(id, pattern.clone());
        self.changes.notify(SongChange::PatternAdded {
            track: self.id,
            pattern: id,
        });
        Ok(pattern)
    }

    pub fn pattern(&self, id: PatternId) -> Option<Arc<Pattern>> {
        self.state.lock().patterns.get(&id).cloned()
    }

    pub fn patterns(&self) -> Vec<Arc<Pattern>> {
        self.state.lock().patterns.values().cloned().collect()
    }

    /// Drops the pattern and every placement of it.
    pub fn remove_pattern(&self, id: PatternId) -> bool {
        let mut state = self.state.lock();
        if state.patterns.remove(&id).is_none() {
            return false;
        }
        let mut editor = self.placements.edit();
        let mut doomed = Vec::new();
        {
            let mut cursor = editor.view().first();
            while let Some((_, placement)) = cursor.entry() {
                if placement.pattern.id() == id {
                    doomed.extend(cursor.id());
                }
                cursor = cursor.next();
            }
        }
        for node in doomed {
            editor.remove(node);
        }
        self.changes.notify(SongChange::PatternRemoved {
            track: self.id,
            pattern: id,
        });
        true
    }

    /// Places a pattern at `beat`. Placements may touch but not overlap.
    pub fn place(&self, pattern: PatternId, beat: u32) -> Result<(), SongError> {
        let pattern = self
            .pattern(pattern)
            .ok_or(SongError::UnknownPattern(pattern.0))?;
        let mut editor = self.placements.edit();
        {
            let view = editor.view();
            let overlap = SongError::Overlap {
                pattern: pattern.id().0,
                beat,
            };
            let before = view.find_less_or_equal(&beat);
            if let Some((start, placed)) = before.entry() {
                if *start + placed.length() > beat {
                    return Err(overlap);
                }
            }
            if let Some(next) = view.upper_bound(&beat).key() {
                if beat.saturating_add(pattern.length()) > *next {
                    return Err(overlap);
                }
            }
        }
        let id = pattern.id();
        editor.insert_sorted(beat, Placement { pattern });
        self.changes.notify(SongChange::PlacementAdded {
            track: self.id,
            pattern: id,
            beat,
        });
        Ok(())
    }

    pub fn unplace(&self, beat: u32) -> Result<(), SongError> {
        let mut editor = self.placements.edit();
        let node = {
            let found = editor.view().find_less_or_equal(&beat);
            (found.key() == Some(&beat)).then(|| found.id()).flatten()
        };
        let node = node.ok_or(SongError::UnknownPlacement(beat))?;
        editor.remove(node);
        self.changes.notify(SongChange::PlacementRemoved {
            track: self.id,
            beat,
        });
        Ok(())
    }

    /// `(start beat, pattern)` pairs in order.
    pub fn placements(&self) -> Vec<(u32, PatternId)> {
        let editor = self.placements.edit();
        editor
            .view()
            .iter()
            .map(|(beat, placement)| (*beat, placement.pattern.id()))
            .collect()
    }

    /// Replaces the pattern with a copy of a different length and moves every
    /// placement over to it. Fails if notes would be cut or a placement would
    /// run into the next one.
    pub fn resize_pattern(&self, id: PatternId, length: u32) -> Result<Arc<Pattern>, SongError> {
        let mut state = self.state.lock();
        let old = state
            .patterns
            .get(&id)
            .cloned()
            .ok_or(SongError::UnknownPattern(id.0))?;
        let resized = Arc::new(old.with_length(id, length)?);

        let mut editor = self.placements.edit();
        let starts: Vec<(u32, NodeId)> = {
            let view = editor.view();
            let mut starts = Vec::new();
            let mut cursor = view.first();
            while let Some((start, placement)) = cursor.entry() {
                if placement.pattern.id() == id {
                    if let Some(next) = cursor.next().key() {
                        if start.saturating_add(length) > *next {
                            return Err(SongError::Overlap {
                                pattern: id.0,
                                beat: *start,
                            });
                        }
                    }
                    if let Some(node) = cursor.id() {
                        starts.push((*start, node));
                    }
                }
                cursor = cursor.next();
            }
            starts
        };
        for (start, node) in starts {
            editor.insert_sorted(
                start,
                Placement {
                    pattern: resized.clone(),
                },
            );
            editor.remove(node);
        }
        state.patterns.insert(id, resized.clone());
        debug!(track = self.id.0, pattern = id.0, length, "resized pattern");
        self.changes.notify(SongChange::PatternResized {
            track: self.id,
            pattern: id,
            length,
        });
        Ok(resized)
    }
}

impl Sequencable for Track {
    fn label(&self) -> String {
        self.name()
    }

    fn channel(&self) -> u8 {
        Track::channel(self)
    }

    fn sequence(&self, cycle: &Cycle<'_>, out: &mut PortWriter<'_>) {
        let span = *out.span();
        let channel = Track::channel(self);
        let muted = self.is_muted();
        let view = self.placements.view(cycle);
        // the placement before the span may still owe NoteOffs at its end
        let key = span.start.max(0.0).floor().min(f64::from(u32::MAX)) as u32;
        let mut cursor = view.find_less(&key);
        if cursor.is_head() {
            cursor = cursor.next();
        }
        // a resize briefly links the new placement next to the old one
        let mut last = None;
        while let Some((&beat, placement)) = cursor.entry() {
            cursor = cursor.next();
            if last == Some(beat) {
                continue;
            }
            last = Some(beat);
            let start = f64::from(beat);
            if start >= span.end {
                break;
            }
            placement.pattern.sequence(
                cycle,
                channel,
                span.start - start,
                span.end - start,
                muted,
                |at, message| out.emit(start + at, message),
            );
        }
    }
}

impl Drop for Track {
    fn drop(&mut self) {
        debug!(track = self.id.0, "destroying track");
    }
}
