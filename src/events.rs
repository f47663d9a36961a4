use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Producer, Split},
};

/// Output port of one registered sequencable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub u32);

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const ALL_NOTES_OFF: u8 = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    NoteOff { channel: u8, pitch: u8, velocity: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
}

impl MidiMessage {
    pub fn all_notes_off(channel: u8) -> Self {
        MidiMessage::ControlChange {
            channel,
            controller: ALL_NOTES_OFF,
            value: 0,
        }
    }

    /// Raw three-byte channel message.
    pub fn to_bytes(&self) -> [u8; 3] {
        match *self {
            MidiMessage::NoteOn {
                channel,
                pitch,
                velocity,
            } => [0x90 | (channel & 0x0f), pitch & 0x7f, velocity & 0x7f],
            MidiMessage::NoteOff {
                channel,
                pitch,
                velocity,
            } => [0x80 | (channel & 0x0f), pitch & 0x7f, velocity & 0x7f],
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => [0xb0 | (channel & 0x0f), controller & 0x7f, value & 0x7f],
        }
    }
}

/// A message at a frame offset inside the current block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedEvent {
    pub offset: u32,
    pub message: MidiMessage,
}

/// Where the scheduler writes a block's events. Called from the real-time
/// thread, so implementations must not block or allocate.
pub trait EventSink {
    fn begin_block(&mut self, _frame: u64, _nframes: u32) {}

    fn push(&mut self, port: PortId, event: TimedEvent);
}

/// Per-port buffers sized once up front, the shape a MIDI port buffer has in
/// an audio callback.
pub struct MidiBlock {
    ports: Vec<Vec<TimedEvent>>,
    capacity: usize,
    overflowed: usize,
}

impl MidiBlock {
    pub fn new(max_ports: usize, events_per_port: usize) -> Self {
        Self {
            ports: (0..max_ports)
                .map(|_| Vec::with_capacity(events_per_port))
                .collect(),
            capacity: events_per_port,
            overflowed: 0,
        }
    }

    pub fn events(&self, port: PortId) -> &[TimedEvent] {
        self.ports
            .get(port.0 as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Events dropped because a port buffer or the port table was full.
    pub fn overflowed(&self) -> usize {
        self.overflowed
    }

    pub fn clear(&mut self) {
        for port in &mut self.ports {
            port.clear();
        }
    }
}

impl EventSink for MidiBlock {
    fn begin_block(&mut self, _frame: u64, _nframes: u32) {
        self.clear();
    }

    fn push(&mut self, port: PortId, event: TimedEvent) {
        match self.ports.get_mut(port.0 as usize) {
            Some(buffer) if buffer.len() < self.capacity => buffer.push(event),
            _ => self.overflowed += 1,
        }
    }
}

/// An event with its absolute frame, as it travels through a [`RingSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortEvent {
    pub port: PortId,
    pub frame: u64,
    pub message: MidiMessage,
}

/// Hands events to another thread through a lock-free ring buffer.
pub struct RingSink {
    producer: HeapProd<PortEvent>,
    block_frame: u64,
    dropped: usize,
}

impl RingSink {
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

pub fn ring_sink(capacity: usize) -> (RingSink, HeapCons<PortEvent>) {
    let (producer, consumer) = HeapRb::<PortEvent>::new(capacity).split();
    (
        RingSink {
            producer,
            block_frame: 0,
            dropped: 0,
        },
        consumer,
    )
}

impl EventSink for RingSink {
    fn begin_block(&mut self, frame: u64, _nframes: u32) {
        self.block_frame = frame;
    }

    fn push(&mut self, port: PortId, event: TimedEvent) {
        let event = PortEvent {
            port,
            frame: self.block_frame + event.offset as u64,
            message: event.message,
        };
        if self.producer.try_push(event).is_err() {
            self.dropped += 1;
        }
    }
}
