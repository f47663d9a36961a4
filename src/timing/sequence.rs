use crate::error::RegistryError;
use crate::events::{EventSink, MidiMessage, PortId, TimedEvent};
use crate::sync::{Cycle, Reclaimer};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Anything that can emit MIDI for a range of song beats.
pub trait Sequencable: Send + Sync {
    fn label(&self) -> String;

    fn channel(&self) -> u8 {
        0
    }

    /// Called on the real-time thread for every constant-tempo segment of a
    /// block. Must not block or allocate.
    fn sequence(&self, cycle: &Cycle<'_>, out: &mut PortWriter<'_>);
}

/// A constant-tempo stretch of the current block, `[start, end)` in beats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Span {
    pub start: f64,
    pub end: f64,
    pub bpm: f64,
    pub frame_offset: u32,
    pub frame_rate: u32,
    pub nframes: u32,
}

impl Span {
    pub fn contains(&self, beat: f64) -> bool {
        beat >= self.start && beat < self.end
    }

    /// Frame offset of `beat` inside the block.
    pub fn offset_of(&self, beat: f64) -> u32 {
        let frames = ((beat - self.start) * 60.0 * f64::from(self.frame_rate) / self.bpm)
            .round()
            .max(0.0);
        let last = f64::from(self.nframes.saturating_sub(1));
        (f64::from(self.frame_offset) + frames).min(last) as u32
    }
}

/// Writes one port's events for one [`Span`].
pub struct PortWriter<'a> {
    port: PortId,
    span: Span,
    sink: &'a mut dyn EventSink,
    last_offset: u32,
}

impl<'a> PortWriter<'a> {
    pub fn new(port: PortId, span: Span, sink: &'a mut dyn EventSink) -> Self {
        Self {
            port,
            span,
            sink,
            last_offset: span.frame_offset,
        }
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Emits `message` at song beat `beat`. The caller picks which beats
    /// belong to the span; offsets are clamped to the block and never go
    /// backwards.
    pub fn emit(&mut self, beat: f64, message: MidiMessage) {
        let offset = self.span.offset_of(beat).max(self.last_offset);
        self.last_offset = offset;
        self.sink.push(self.port, TimedEvent { offset, message });
    }
}

#[derive(Clone)]
struct Entry {
    port: PortId,
    item: Arc<dyn Sequencable>,
}

fn same_object(a: &Arc<dyn Sequencable>, b: &Arc<dyn Sequencable>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Sequencables the scheduler drives, one output port each.
pub struct Registry {
    entries: ArcSwap<Vec<Entry>>,
    edit: Mutex<()>,
    max_ports: usize,
    reclaimer: Reclaimer,
}

impl Registry {
    pub fn new(max_ports: usize, reclaimer: Reclaimer) -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            edit: Mutex::new(()),
            max_ports,
            reclaimer,
        }
    }

    /// Assigns the lowest free port. The same object cannot be registered
    /// twice.
    pub fn register(&self, item: Arc<dyn Sequencable>) -> Result<PortId, RegistryError> {
        let _edit = self.edit.lock();
        let current = self.entries.load_full();
        if let Some(entry) = current.iter().find(|entry| same_object(&entry.item, &item)) {
            return Err(RegistryError::AlreadyRegistered(entry.port.0));
        }
        let port = (0..self.max_ports as u32)
            .map(PortId)
            .find(|port| current.iter().all(|entry| entry.port != *port))
            .ok_or(RegistryError::NoFreePorts(self.max_ports))?;

        debug!(%port, label = %item.label(), "registering sequencable");
        let mut table: Vec<Entry> = current.iter().cloned().collect();
        table.push(Entry { port, item });
        table.sort_by_key(|entry| entry.port);
        self.publish(table);
        Ok(port)
    }

    pub fn unregister(&self, port: PortId) -> Option<Arc<dyn Sequencable>> {
        let _edit = self.edit.lock();
        let current = self.entries.load_full();
        let removed = current.iter().find(|entry| entry.port == port)?.item.clone();
        debug!(%port, label = %removed.label(), "unregistering sequencable");
        self.publish(
            current
                .iter()
                .filter(|entry| entry.port != port)
                .cloned()
                .collect(),
        );
        Some(removed)
    }

    fn publish(&self, table: Vec<Entry>) {
        let old = self.entries.swap(Arc::new(table));
        self.reclaimer.retire(old);
    }

    pub fn port_of(&self, item: &Arc<dyn Sequencable>) -> Option<PortId> {
        self.entries
            .load()
            .iter()
            .find(|entry| same_object(&entry.item, item))
            .map(|entry| entry.port)
    }

    pub fn ports(&self) -> Vec<(PortId, String)> {
        self.entries
            .load()
            .iter()
            .map(|entry| (entry.port, entry.item.label()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every registered sequencable in port order.
    pub fn for_each(&self, _cycle: &Cycle<'_>, mut f: impl FnMut(PortId, &dyn Sequencable)) {
        let entries = self.entries.load();
        for entry in entries.iter() {
            f(entry.port, entry.item.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MidiBlock;

    struct Metronome;

    impl Sequencable for Metronome {
        fn label(&self) -> String {
            "click".into()
        }

        fn channel(&self) -> u8 {
            9
        }

        fn sequence(&self, _cycle: &Cycle<'_>, out: &mut PortWriter<'_>) {
            let span = *out.span();
            let mut beat = span.start.ceil();
            while beat < span.end {
                out.emit(
                    beat,
                    MidiMessage::NoteOn {
                        channel: 9,
                        pitch: 37,
                        velocity: 100,
                    },
                );
                beat += 1.0;
            }
        }
    }

    #[test]
    fn offsets_follow_the_span_tempo() {
        let span = Span {
            start: 1.0,
            end: 1.5,
            bpm: 120.0,
            frame_offset: 100,
            frame_rate: 48_000,
            nframes: 20_000,
        };
        assert_eq!(span.offset_of(1.0), 100);
        assert_eq!(span.offset_of(1.25), 100 + 6000);
        assert_eq!(span.offset_of(0.5), 100);
        assert_eq!(span.offset_of(3.0), 19_999);
        assert!(span.contains(1.0));
        assert!(!span.contains(1.5));
    }

    #[test]
    fn block_starting_mid_step_keeps_events_on_their_frame() {
        // 0.4 beats at 120 bpm and 1 kHz is 200 frames; beat 0.5 is frame 250
        let span = Span {
            start: 0.4,
            end: 0.6,
            bpm: 120.0,
            frame_offset: 0,
            frame_rate: 1000,
            nframes: 100,
        };
        assert_eq!(span.offset_of(0.5), 50);
        assert_eq!(span.offset_of(0.45), 25);
    }

    #[test]
    fn writer_offsets_never_go_backwards() {
        let mut block = MidiBlock::new(1, 8);
        let span = Span {
            start: 0.0,
            end: 1.0,
            bpm: 60.0,
            frame_offset: 0,
            frame_rate: 100,
            nframes: 100,
        };
        let message = MidiMessage::all_notes_off(0);
        let mut writer = PortWriter::new(PortId(0), span, &mut block);
        writer.emit(0.5, message);
        writer.emit(0.25, message);
        writer.emit(1.0, message);
        let offsets: Vec<u32> = block.events(PortId(0)).iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![50, 50, 99]);
    }

    #[test]
    fn registry_assigns_lowest_free_port_and_refuses_duplicates() {
        let registry = Registry::new(2, Reclaimer::new());
        let click: Arc<dyn Sequencable> = Arc::new(Metronome);
        let other: Arc<dyn Sequencable> = Arc::new(Metronome);

        assert_eq!(registry.register(click.clone()).unwrap(), PortId(0));
        assert!(matches!(
            registry.register(click.clone()),
            Err(RegistryError::AlreadyRegistered(0))
        ));
        assert_eq!(registry.register(other.clone()).unwrap(), PortId(1));
        assert!(matches!(
            registry.register(Arc::new(Metronome)),
            Err(RegistryError::NoFreePorts(2))
        ));

        assert!(registry.unregister(PortId(0)).is_some());
        assert!(registry.unregister(PortId(0)).is_none());
        assert_eq!(registry.port_of(&other), Some(PortId(1)));
        assert_eq!(registry.register(click).unwrap(), PortId(0));
        assert_eq!(
            registry.ports(),
            vec![(PortId(0), "click".to_string()), (PortId(1), "click".to_string())]
        );
    }

    #[test]
    fn registered_items_write_to_their_port() {
        let reclaimer = Reclaimer::new();
        let mut reader = reclaimer.reader().unwrap();
        let registry = Registry::new(4, reclaimer);
        registry.register(Arc::new(Metronome)).unwrap();

        let mut block = MidiBlock::new(4, 8);
        let span = Span {
            start: 0.5,
            end: 2.5,
            bpm: 120.0,
            frame_offset: 0,
            frame_rate: 48_000,
            nframes: 48_000,
        };
        let cycle = reader.confirm();
        registry.for_each(&cycle, |port, item| {
            let mut writer = PortWriter::new(port, span, &mut block);
            item.sequence(&cycle, &mut writer);
        });
        let offsets: Vec<u32> = block.events(PortId(0)).iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![12_000, 36_000]);
    }
}
