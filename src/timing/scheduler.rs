use super::sequence::{PortWriter, Registry, Span};
use crate::events::{EventSink, MidiMessage, TimedEvent};
use crate::song::Song;
use crate::sync::Cycle;
use std::sync::Arc;

/// What the audio host says about the block about to be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Transport frame at the first frame of the block.
    pub frame: u64,
    pub frame_rate: u32,
    pub nframes: u32,
    pub rolling: bool,
    /// The host jumped since the last block.
    pub relocated: bool,
}

/// What the scheduler did with a block and what it wants from the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockReport {
    pub start: f64,
    pub end: f64,
    /// Effective tempo at `start`, loop scaling included.
    pub bpm: f64,
    /// Frame the transport should jump to before the next block.
    pub locate: Option<u64>,
    /// The song ran out; the transport should stop.
    pub stop: bool,
}

/// Splits the time left before the loop end into whole blocks.
///
/// `periods` is that time measured in blocks. Returns the rounded block count,
/// never below one, and the tempo factor that makes exactly that many blocks
/// reach the loop end.
pub fn loop_periods(periods: f64) -> (u32, f64) {
    let whole = (periods + 0.5).floor().max(1.0);
    (whole as u32, periods / whole)
}

/// Turns transport blocks into beat ranges and has every registered
/// sequencable write its events for them.
pub struct Scheduler {
    song: Arc<Song>,
    registry: Arc<Registry>,
    next_beat: f64,
    next_frame: u64,
    was_rolling: bool,
    sent_all_off: bool,
    pending_locate: Option<u64>,
}

impl Scheduler {
    pub fn new(song: Arc<Song>, registry: Arc<Registry>) -> Self {
        Self {
            song,
            registry,
            next_beat: 0.0,
            next_frame: 0,
            was_rolling: false,
            sent_all_off: false,
            pending_locate: None,
        }
    }

    pub fn song(&self) -> &Arc<Song> {
        &self.song
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Beat the next contiguous block will start at.
    pub fn next_beat(&self) -> f64 {
        self.next_beat
    }

    /// Runs once per audio callback. Never blocks or allocates.
    pub fn process(
        &mut self,
        cycle: &Cycle<'_>,
        block: BlockInfo,
        sink: &mut dyn EventSink,
    ) -> BlockReport {
        sink.begin_block(block.frame, block.nframes);
        let tempo = self.song.tempo_map().read(cycle);

        if !block.rolling || block.nframes == 0 || block.frame_rate == 0 {
            if !block.rolling && !self.sent_all_off {
                self.all_notes_off(cycle, sink);
                self.sent_all_off = true;
            }
            self.was_rolling = self.was_rolling && block.rolling;
            self.pending_locate = None;
            let beat = if block.frame_rate == 0 {
                self.next_beat
            } else {
                tempo.timebase(block.frame, block.frame_rate).0
            };
            self.next_beat = beat;
            self.next_frame = block.frame;
            return BlockReport {
                start: beat,
                end: beat,
                bpm: tempo.tempo_at(beat),
                locate: None,
                stop: false,
            };
        }

        let continuous =
            self.was_rolling && !block.relocated && block.frame == self.next_frame;
        let requested = block.relocated && self.pending_locate == Some(block.frame);
        let start = if continuous || requested {
            self.next_beat
        } else {
            tempo.timebase(block.frame, block.frame_rate).0
        };
        if self.was_rolling && !continuous {
            self.all_notes_off(cycle, sink);
        }
        self.was_rolling = true;
        self.sent_all_off = false;
        self.pending_locate = None;
        self.next_frame = block.frame + u64::from(block.nframes);

        if start >= f64::from(self.song.length()) {
            self.next_beat = 0.0;
            return BlockReport {
                start,
                end: start,
                bpm: tempo.tempo_at(start),
                locate: Some(0),
                stop: true,
            };
        }

        let nframes = f64::from(block.nframes);
        let mut scale = 1.0;
        let mut locate = None;
        let end = match self.song.loop_range() {
            Some((loop_start, loop_end)) if start < loop_end => {
                let periods = tempo.frames_between(start, loop_end, block.frame_rate) / nframes;
                let (whole, factor) = loop_periods(periods);
                scale = factor;
                if whole == 1 {
                    let frame = tempo.frame_at(loop_start, block.frame_rate).round() as u64;
                    locate = Some(frame);
                    self.pending_locate = locate;
                    self.next_beat = loop_start;
                    loop_end
                } else {
                    let end = tempo
                        .advance(start, nframes, block.frame_rate, scale)
                        .min(loop_end);
                    self.next_beat = end;
                    end
                }
            }
            _ => {
                let end = tempo.advance(start, nframes, block.frame_rate, 1.0);
                self.next_beat = end;
                end
            }
        };

        let rate = f64::from(block.frame_rate);
        let registry = &self.registry;
        let mut elapsed: f64 = 0.0;
        tempo.segments(start, end, scale, |from, to, bpm| {
            let span = Span {
                start: from,
                end: to,
                bpm,
                frame_offset: elapsed.round().min(nframes - 1.0) as u32,
                frame_rate: block.frame_rate,
                nframes: block.nframes,
            };
            registry.for_each(cycle, |port, item| {
                let mut writer = PortWriter::new(port, span, &mut *sink);
                item.sequence(cycle, &mut writer);
            });
            elapsed += (to - from) * 60.0 * rate / bpm;
        });

        BlockReport {
            start,
            end,
            bpm: tempo.tempo_at(start) * scale,
            locate,
            stop: false,
        }
    }

    fn all_notes_off(&self, cycle: &Cycle<'_>, sink: &mut dyn EventSink) {
        self.registry.for_each(cycle, |port, item| {
            sink.push(
                port,
                TimedEvent {
                    offset: 0,
                    message: MidiMessage::all_notes_off(item.channel()),
                },
            );
        });
    }
}
