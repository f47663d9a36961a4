use crate::error::SongError;
use crate::sync::{Cycle, Reclaimer, SkipList, View};

/// Tempo changes keyed by beat. A change at beat 0 always exists.
pub struct TempoMap {
    changes: SkipList<u32, f64>,
}

fn check_bpm(bpm: f64) -> Result<(), SongError> {
    if bpm.is_finite() && bpm > 0.0 {
        Ok(())
    } else {
        Err(SongError::InvalidTempo(bpm))
    }
}

impl TempoMap {
    pub fn new(bpm: f64, reclaimer: Reclaimer) -> Result<Self, SongError> {
        check_bpm(bpm)?;
        let changes = SkipList::new(reclaimer);
        changes.edit().insert_sorted(0, bpm);
        Ok(Self { changes })
    }

    /// Sets the tempo from `beat` on. An existing change at `beat` is
    /// replaced: the new entry goes in after it before the old one is removed,
    /// so a concurrent reader always finds one of the two.
    pub fn add_tempo_change(&self, beat: u32, bpm: f64) -> Result<(), SongError> {
        check_bpm(bpm)?;
        let mut editor = self.changes.edit();
        let existing = {
            let found = editor.view().find_less_or_equal(&beat);
            (found.key() == Some(&beat)).then(|| found.id()).flatten()
        };
        editor.insert_sorted(beat, bpm);
        if let Some(old) = existing {
            editor.remove(old);
        }
        Ok(())
    }

    /// Returns whether a change existed at `beat`.
    pub fn remove_tempo_change(&self, beat: u32) -> Result<bool, SongError> {
        if beat == 0 {
            return Err(SongError::FirstTempo);
        }
        let mut editor = self.changes.edit();
        let existing = {
            let found = editor.view().find_less_or_equal(&beat);
            (found.key() == Some(&beat)).then(|| found.id()).flatten()
        };
        Ok(existing.is_some_and(|id| editor.remove(id)))
    }

    pub fn changes(&self) -> Vec<(u32, f64)> {
        let editor = self.changes.edit();
        editor
            .view()
            .iter()
            .map(|(beat, bpm)| (*beat, *bpm))
            .collect()
    }

    /// Real-time access.
    pub fn read<'c>(&'c self, cycle: &'c Cycle<'_>) -> TempoView<'c> {
        TempoView {
            view: self.changes.view(cycle),
        }
    }

    /// Runs `f` on a consistent view from an editing thread.
    pub fn inspect<R>(&self, f: impl FnOnce(TempoView<'_>) -> R) -> R {
        let editor = self.changes.edit();
        f(TempoView {
            view: editor.view(),
        })
    }

    pub fn tempo_at(&self, beat: f64) -> f64 {
        self.inspect(|tempo| tempo.tempo_at(beat))
    }

    pub fn timebase(&self, frame: u64, frame_rate: u32) -> (f64, f64) {
        self.inspect(|tempo| tempo.timebase(frame, frame_rate))
    }

    pub fn frame_at(&self, beat: f64, frame_rate: u32) -> f64 {
        self.inspect(|tempo| tempo.frame_at(beat, frame_rate))
    }
}

/// One constant-tempo stretch of the map.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Section {
    start: f64,
    bpm: f64,
    end: Option<f64>,
}

/// Read access to a [`TempoMap`]. All conversions integrate the map piecewise.
#[derive(Clone, Copy)]
pub struct TempoView<'g> {
    view: View<'g, u32, f64>,
}

impl<'g> TempoView<'g> {
    /// Sections from the one containing `beat` onwards.
    fn sections_from(&self, beat: f64) -> impl Iterator<Item = Section> + 'g {
        let key = beat.max(0.0).floor().min(f64::from(u32::MAX)) as u32;
        let found = self.view.find_less_or_equal(&key);
        let mut cursor = if found.is_head() { found.next() } else { found };
        std::iter::from_fn(move || {
            let (start, bpm) = cursor.entry()?;
            cursor = cursor.next();
            Some(Section {
                start: f64::from(*start),
                bpm: *bpm,
                end: cursor.key().map(|next| f64::from(*next)),
            })
        })
        .filter(|section| section.end.is_none_or(|end| end > section.start))
    }

    pub fn tempo_at(&self, beat: f64) -> f64 {
        self.sections_from(beat)
            .next()
            .map_or(120.0, |section| section.bpm)
    }

    /// Beat and tempo at `frame`, integrating from beat 0.
    pub fn timebase(&self, frame: u64, frame_rate: u32) -> (f64, f64) {
        let rate = f64::from(frame_rate);
        let target = frame as f64;
        let mut elapsed = 0.0;
        let mut last = (0.0, 120.0);
        for section in self.sections_from(0.0) {
            let per_beat = 60.0 * rate / section.bpm;
            let beat = section.start + (target - elapsed) / per_beat;
            match section.end {
                Some(end) if beat >= end => {
                    elapsed += (end - section.start) * per_beat;
                    last = (end, section.bpm);
                }
                _ => return (beat, section.bpm),
            }
        }
        last
    }

    /// Frames from beat 0 to `beat`.
    pub fn frame_at(&self, beat: f64, frame_rate: u32) -> f64 {
        self.frames_between(0.0, beat, frame_rate)
    }

    /// Frames it takes to play from `from` to `to`.
    pub fn frames_between(&self, from: f64, to: f64, frame_rate: u32) -> f64 {
        if to <= from {
            return 0.0;
        }
        let rate = f64::from(frame_rate);
        let mut frames = 0.0;
        for section in self.sections_from(from) {
            let start = section.start.max(from);
            let end = section.end.map_or(to, |end| end.min(to));
            if end > start {
                frames += (end - start) * 60.0 * rate / section.bpm;
            }
            if section.end.is_none_or(|end| end >= to) {
                break;
            }
        }
        frames
    }

    /// Beat reached after playing `frames` frames from `beat` with every tempo
    /// multiplied by `scale`.
    pub fn advance(&self, beat: f64, frames: f64, frame_rate: u32, scale: f64) -> f64 {
        let rate = f64::from(frame_rate);
        let mut position = beat;
        let mut left = frames;
        for section in self.sections_from(beat) {
            let per_beat = 60.0 * rate / (section.bpm * scale);
            let reach = position + left / per_beat;
            match section.end {
                Some(end) if reach > end => {
                    left -= (end - position) * per_beat;
                    position = end;
                }
                _ => return reach,
            }
        }
        position
    }

    /// Cuts `[start, end)` at tempo changes and calls `f(from, to, bpm)` for
    /// each piece, with tempos multiplied by `scale`.
    pub fn segments(&self, start: f64, end: f64, scale: f64, mut f: impl FnMut(f64, f64, f64)) {
        for section in self.sections_from(start) {
            if section.start >= end {
                break;
            }
            let from = section.start.max(start);
            let to = section.end.map_or(end, |next| next.min(end));
            if to > from {
                f(from, to, section.bpm * scale);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> TempoMap {
        let tempo = TempoMap::new(120.0, Reclaimer::new()).unwrap();
        tempo.add_tempo_change(4, 60.0).unwrap();
        tempo
    }

    #[test]
    fn replacing_a_change_keeps_one_entry() {
        let tempo = map();
        tempo.add_tempo_change(4, 90.0).unwrap();
        tempo.add_tempo_change(0, 100.0).unwrap();
        assert_eq!(tempo.changes(), vec![(0, 100.0), (4, 90.0)]);
        assert!(matches!(tempo.remove_tempo_change(0), Err(SongError::FirstTempo)));
        assert!(tempo.remove_tempo_change(4).unwrap());
        assert!(!tempo.remove_tempo_change(4).unwrap());
        assert!(matches!(
            tempo.add_tempo_change(2, 0.0),
            Err(SongError::InvalidTempo(_))
        ));
    }

    #[test]
    fn integrates_across_changes() {
        let tempo = map();
        // 4 beats at 120 bpm take 2 seconds
        assert_eq!(tempo.frame_at(4.0, 1000), 2000.0);
        assert_eq!(tempo.frame_at(5.0, 1000), 3000.0);
        assert_eq!(tempo.timebase(1000, 1000), (2.0, 120.0));
        assert_eq!(tempo.timebase(2500, 1000), (4.5, 60.0));
        assert_eq!(tempo.tempo_at(3.9), 120.0);
        assert_eq!(tempo.tempo_at(4.0), 60.0);
    }

    #[test]
    fn advance_and_segments_split_at_changes() {
        let tempo = map();
        tempo.inspect(|view| {
            assert_eq!(view.frames_between(3.0, 5.0, 1000), 1500.0);
            assert_eq!(view.advance(3.0, 1500.0, 1000, 1.0), 5.0);
            assert_eq!(view.advance(0.0, 500.0, 1000, 2.0), 2.0);

            let mut pieces = Vec::new();
            view.segments(3.5, 4.5, 1.0, |from, to, bpm| pieces.push((from, to, bpm)));
            assert_eq!(pieces, vec![(3.5, 4.0, 120.0), (4.0, 4.5, 60.0)]);
        });
    }
}
