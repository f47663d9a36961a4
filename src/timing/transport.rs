use super::scheduler::{BlockInfo, BlockReport};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const NO_LOCATE: u64 = u64::MAX;

/// Transport requests and position, shared between the control side and the
/// real-time driver.
pub struct Transport {
    rolling: AtomicBool,
    locate: AtomicU64,
    frame: AtomicU64,
    beat: AtomicU64,
    bpm: AtomicU64,
}

impl Transport {
    pub fn new() -> Self {
        Self {
            rolling: AtomicBool::new(false),
            locate: AtomicU64::new(NO_LOCATE),
            frame: AtomicU64::new(0),
            beat: AtomicU64::new(0.0f64.to_bits()),
            bpm: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    pub fn start(&self) {
        self.rolling.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.rolling.store(false, Ordering::Release);
    }

    pub fn is_rolling(&self) -> bool {
        self.rolling.load(Ordering::Acquire)
    }

    /// Asks the driver to jump to `frame` at the start of its next block.
    pub fn locate(&self, frame: u64) {
        self.locate.store(frame.min(NO_LOCATE - 1), Ordering::Release);
    }

    fn take_locate(&self) -> Option<u64> {
        match self.locate.swap(NO_LOCATE, Ordering::AcqRel) {
            NO_LOCATE => None,
            frame => Some(frame),
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    /// Beat at the start of the last processed block.
    pub fn beat(&self) -> f64 {
        f64::from_bits(self.beat.load(Ordering::Relaxed))
    }

    pub fn bpm(&self) -> f64 {
        f64::from_bits(self.bpm.load(Ordering::Relaxed))
    }

    fn publish(&self, frame: u64, beat: f64, bpm: f64) {
        self.frame.store(frame, Ordering::Relaxed);
        self.beat.store(beat.to_bits(), Ordering::Relaxed);
        self.bpm.store(bpm.to_bits(), Ordering::Relaxed);
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame counter of a driver that has no host transport of its own. Turns the
/// shared [`Transport`] into one [`BlockInfo`] per callback and feeds the
/// scheduler's requests back.
pub struct TransportClock {
    transport: Arc<Transport>,
    frame: u64,
    frame_rate: u32,
    nframes: u32,
}

impl TransportClock {
    pub fn new(transport: Arc<Transport>, frame_rate: u32, nframes: u32) -> Self {
        Self {
            transport,
            frame: 0,
            frame_rate,
            nframes,
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn next_block(&mut self) -> BlockInfo {
        let relocated = match self.transport.take_locate() {
            Some(frame) => {
                self.frame = frame;
                true
            }
            None => false,
        };
        BlockInfo {
            frame: self.frame,
            frame_rate: self.frame_rate,
            nframes: self.nframes,
            rolling: self.transport.is_rolling(),
            relocated,
        }
    }

    pub fn apply(&mut self, block: &BlockInfo, report: &BlockReport) {
        if block.rolling {
            self.frame = block.frame + u64::from(block.nframes);
        }
        if report.stop {
            self.transport.stop();
        }
        if let Some(frame) = report.locate {
            self.transport.locate(frame);
        }
        self.transport.publish(block.frame, report.start, report.bpm);
    }
}
