use crate::error::{ProjectError, SongError};
use crate::pattern::{Pattern, PatternId};
use crate::song::{Song, Track};
use crate::sync::Reclaimer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

fn default_velocity() -> u8 {
    64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub step: u32,
    /// MIDI note number.
    pub value: u8,
    pub length: u32,
    #[serde(default = "default_velocity")]
    pub velocity: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerRecord {
    pub number: u8,
    pub name: String,
    pub events: Vec<(u32, u8)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub name: String,
    pub length: u32,
    pub steps: u32,
    pub notes: Vec<NoteRecord>,
    #[serde(default)]
    pub controllers: Vec<ControllerRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub beat: u32,
    /// Index into the track's `patterns`.
    pub pattern: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub name: String,
    #[serde(default)]
    pub channel: u8,
    #[serde(default)]
    pub muted: bool,
    pub patterns: Vec<PatternRecord>,
    #[serde(default)]
    pub placements: Vec<PlacementRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongRecord {
    pub title: String,
    pub length: u32,
    #[serde(default)]
    pub loop_start: Option<u32>,
    #[serde(default)]
    pub loop_end: Option<u32>,
    /// `(beat, bpm)` pairs; the first one sits at beat 0.
    pub tempo: Vec<(u32, f64)>,
    pub tracks: Vec<TrackRecord>,
}

impl PatternRecord {
    pub fn from_pattern(pattern: &Pattern) -> Self {
        let mut notes: Vec<NoteRecord> = pattern
            .notes()
            .into_iter()
            .map(|note| NoteRecord {
                step: note.step,
                value: note.pitch,
                length: note.length,
                velocity: note.velocity,
            })
            .collect();
        // bucket order depends on insertion history
        notes.sort_by_key(|note| (note.step, note.value, note.length, note.velocity));
        Self {
            name: pattern.name(),
            length: pattern.length(),
            steps: pattern.steps(),
            notes,
            controllers: pattern
                .controllers()
                .iter()
                .map(|controller| ControllerRecord {
                    number: controller.number(),
                    name: controller.name().to_string(),
                    events: controller.events().collect(),
                })
                .collect(),
        }
    }

    /// Fills a freshly created pattern. Leaves it clean.
    pub fn fill(&self, pattern: &Pattern) -> Result<(), ProjectError> {
        for note in &self.notes {
            pattern
                .add_note(note.step, note.value, note.velocity, note.length)
                .map_err(SongError::from)?;
        }
        for controller in &self.controllers {
            pattern
                .add_controller(controller.number, controller.name.clone())
                .map_err(SongError::from)?;
            for &(step, value) in &controller.events {
                pattern
                    .set_cc(controller.number, step, value)
                    .map_err(SongError::from)?;
            }
        }
        pattern.make_clean();
        Ok(())
    }
}

impl TrackRecord {
    pub fn from_track(track: &Track) -> Self {
        let patterns = track.patterns();
        let index: HashMap<PatternId, usize> = patterns
            .iter()
            .enumerate()
            .map(|(i, pattern)| (pattern.id(), i))
            .collect();
        Self {
            name: track.name(),
            channel: track.channel(),
            muted: track.is_muted(),
            patterns: patterns
                .iter()
                .map(|pattern| PatternRecord::from_pattern(pattern))
                .collect(),
            placements: track
                .placements()
                .into_iter()
                .filter_map(|(beat, id)| {
                    index.get(&id).map(|&pattern| PlacementRecord { beat, pattern })
                })
                .collect(),
        }
    }
}

impl SongRecord {
    pub fn from_song(song: &Song) -> Self {
        Self {
            title: song.title(),
            length: song.length(),
            loop_start: song.loop_start(),
            loop_end: song.loop_end(),
            tempo: song.tempo_map().changes(),
            tracks: song
                .tracks()
                .iter()
                .map(|track| TrackRecord::from_track(track))
                .collect(),
        }
    }

    pub fn to_song(&self, pattern_capacity: usize, reclaimer: Reclaimer) -> Result<Song, ProjectError> {
        let first_bpm = self
            .tempo
            .iter()
            .find(|(beat, _)| *beat == 0)
            .map_or(120.0, |(_, bpm)| *bpm);
        let song = Song::new(
            self.title.clone(),
            self.length,
            first_bpm,
            pattern_capacity,
            reclaimer,
        )?;
        for &(beat, bpm) in self.tempo.iter().filter(|(beat, _)| *beat != 0) {
            song.add_tempo_change(beat, bpm)?;
        }
        song.set_loop(self.loop_start, self.loop_end);

        for record in &self.tracks {
            let track = song.add_track(record.name.clone());
            track.set_channel(record.channel)?;
            track.set_muted(record.muted);
            let mut ids = Vec::with_capacity(record.patterns.len());
            for pattern_record in &record.patterns {
                let pattern = track.add_pattern(
                    pattern_record.name.clone(),
                    pattern_record.length,
                    pattern_record.steps,
                )?;
                pattern_record.fill(&pattern)?;
                ids.push(pattern.id());
            }
            for placement in &record.placements {
                let id = ids
                    .get(placement.pattern)
                    .copied()
                    .ok_or(SongError::UnknownPattern(placement.pattern as u32))?;
                track.place(id, placement.beat)?;
            }
            debug!(track = %record.name, patterns = ids.len(), "loaded track");
        }
        Ok(song)
    }

    pub fn to_ron(&self) -> Result<String, ProjectError> {
        Ok(ron::ser::to_string_pretty(
            self,
            ron::ser::PrettyConfig::default(),
        )?)
    }

    pub fn from_ron(text: &str) -> Result<Self, ProjectError> {
        Ok(ron::from_str(text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ProjectError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, self.to_ron()?)?;
        info!(path = %path.display(), "saved song");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ProjectError> {
        let text = fs::read_to_string(path)?;
        let record = Self::from_ron(&text)?;
        info!(path = %path.display(), title = %record.title, "loaded song");
        Ok(record)
    }
}
