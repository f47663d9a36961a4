use crate::sync::{Generation, Reclaimer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

/// End of a chain.
pub const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NoteOn,
    NoteOff,
}

const FREE: u8 = 0;
const NOTE_ON: u8 = 1;
const NOTE_OFF: u8 = 2;

/// One note event. Every field is atomic so the real-time thread can read a
/// slot while an editor rewrites its neighbours.
pub struct Slot {
    kind: AtomicU8,
    step: AtomicU32,
    pitch: AtomicU8,
    velocity: AtomicU8,
    length: AtomicU32,
    next: AtomicU32,
    prev: AtomicU32,
    assoc: AtomicU32,
    generation: AtomicU32,
}

impl Slot {
    fn empty() -> Self {
        Self {
            kind: AtomicU8::new(FREE),
            step: AtomicU32::new(0),
            pitch: AtomicU8::new(0),
            velocity: AtomicU8::new(0),
            length: AtomicU32::new(0),
            next: AtomicU32::new(NIL),
            prev: AtomicU32::new(NIL),
            assoc: AtomicU32::new(NIL),
            generation: AtomicU32::new(0),
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        match self.kind.load(Ordering::Relaxed) {
            NOTE_ON => Some(EventKind::NoteOn),
            NOTE_OFF => Some(EventKind::NoteOff),
            _ => None,
        }
    }

    pub fn step(&self) -> u32 {
        self.step.load(Ordering::Relaxed)
    }

    pub fn pitch(&self) -> u8 {
        self.pitch.load(Ordering::Relaxed)
    }

    pub fn velocity(&self) -> u8 {
        self.velocity.load(Ordering::Relaxed)
    }

    pub fn set_velocity(&self, velocity: u8) {
        self.velocity.store(velocity, Ordering::Relaxed);
    }

    pub fn length(&self) -> u32 {
        self.length.load(Ordering::Relaxed)
    }

    pub fn set_length(&self, length: u32) {
        self.length.store(length, Ordering::Relaxed);
    }

    pub fn next(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }

    pub fn assoc(&self) -> u32 {
        self.assoc.load(Ordering::Relaxed)
    }

    pub fn set_assoc(&self, assoc: u32) {
        self.assoc.store(assoc, Ordering::Relaxed);
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }
}

/// Fixed-capacity slot storage plus the step buckets that chain slots
/// together. Never reallocates, so reads are memory safe from any thread;
/// the reclaimer only guards against following a recycled slot.
pub struct EventArena {
    slots: Box<[Slot]>,
    note_ons: Box<[AtomicU32]>,
    note_offs: Box<[AtomicU32]>,
}

impl EventArena {
    pub fn new(capacity: usize, total_steps: usize) -> Self {
        let buckets = || (0..total_steps).map(|_| AtomicU32::new(NIL)).collect();
        Self {
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
            note_ons: buckets(),
            note_offs: buckets(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn total_steps(&self) -> u32 {
        self.note_ons.len() as u32
    }

    pub fn slot(&self, index: u32) -> &Slot {
        &self.slots[index as usize]
    }

    fn bucket(&self, kind: EventKind, step: u32) -> &AtomicU32 {
        match kind {
            EventKind::NoteOn => &self.note_ons[step as usize],
            EventKind::NoteOff => &self.note_offs[step as usize],
        }
    }

    /// Chain of events of one kind at `step`, newest first.
    pub fn chain(&self, kind: EventKind, step: u32) -> Chain<'_> {
        let head = if step < self.total_steps() {
            self.bucket(kind, step).load(Ordering::Acquire)
        } else {
            NIL
        };
        Chain {
            arena: self,
            current: head,
        }
    }

    /// First slot of `kind` at `step` that carries `pitch`.
    pub fn find(&self, kind: EventKind, step: u32, pitch: u8) -> Option<u32> {
        self.chain(kind, step)
            .find(|&index| self.slot(index).pitch() == pitch)
    }

    /// Fills a free slot and pushes it at the head of its bucket. The release
    /// store on the bucket publishes the filled fields.
    pub fn link(&self, index: u32, event: NewEvent) {
        let slot = self.slot(index);
        slot.kind.store(
            match event.kind {
                EventKind::NoteOn => NOTE_ON,
                EventKind::NoteOff => NOTE_OFF,
            },
            Ordering::Relaxed,
        );
        slot.step.store(event.step, Ordering::Relaxed);
        slot.pitch.store(event.pitch, Ordering::Relaxed);
        slot.velocity.store(event.velocity, Ordering::Relaxed);
        slot.length.store(event.length, Ordering::Relaxed);
        slot.assoc.store(event.assoc, Ordering::Relaxed);

        let bucket = self.bucket(event.kind, event.step);
        let head = bucket.load(Ordering::Relaxed);
        slot.next.store(head, Ordering::Relaxed);
        slot.prev.store(NIL, Ordering::Relaxed);
        if head != NIL {
            self.slot(head).prev.store(index, Ordering::Relaxed);
        }
        bucket.store(index, Ordering::Release);
    }

    /// Takes the slot out of its bucket. Its own `next` link is left intact
    /// for a reader that is standing on it. Bumps the generation so handles
    /// to it go stale.
    pub fn unlink(&self, index: u32) {
        let slot = self.slot(index);
        let Some(kind) = slot.kind() else {
            return;
        };
        let next = slot.next.load(Ordering::Relaxed);
        let prev = slot.prev.load(Ordering::Relaxed);
        if prev == NIL {
            self.bucket(kind, slot.step()).store(next, Ordering::Release);
        } else {
            self.slot(prev).next.store(next, Ordering::Release);
        }
        if next != NIL {
            self.slot(next).prev.store(prev, Ordering::Relaxed);
        }
        slot.generation.fetch_add(1, Ordering::Relaxed);
    }
}

/// Values for a slot about to be linked.
#[derive(Debug, Clone, Copy)]
pub struct NewEvent {
    pub kind: EventKind,
    pub step: u32,
    pub pitch: u8,
    pub velocity: u8,
    pub length: u32,
    pub assoc: u32,
}

pub struct Chain<'a> {
    arena: &'a EventArena,
    current: u32,
}

impl Iterator for Chain<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.current == NIL {
            return None;
        }
        let index = self.current;
        self.current = self.arena.slot(index).next();
        Some(index)
    }
}

/// Slots waiting to be reused. Unlinked slots cool down until the real-time
/// thread has confirmed a later generation.
pub struct FreeSlots {
    ready: Vec<u32>,
    cooling: VecDeque<(u32, Generation)>,
}

impl FreeSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            ready: (0..capacity as u32).rev().collect(),
            cooling: VecDeque::new(),
        }
    }

    fn thaw(&mut self, reclaimer: &Reclaimer) {
        while let Some(&(index, stamp)) = self.cooling.front() {
            if !reclaimer.is_quiescent(stamp) {
                break;
            }
            self.cooling.pop_front();
            self.ready.push(index);
        }
    }

    /// Makes sure `count` slots can be taken right now.
    pub fn reserve(&mut self, count: usize, reclaimer: &Reclaimer) -> bool {
        if self.ready.len() < count {
            self.thaw(reclaimer);
        }
        self.ready.len() >= count
    }

    pub fn take(&mut self, reclaimer: &Reclaimer) -> Option<u32> {
        if self.ready.is_empty() {
            self.thaw(reclaimer);
        }
        self.ready.pop()
    }

    pub fn release(&mut self, index: u32, reclaimer: &Reclaimer) {
        self.cooling.push_back((index, reclaimer.generation()));
    }

    #[cfg(test)]
    pub fn cooling(&self) -> usize {
        self.cooling.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on(step: u32, pitch: u8) -> NewEvent {
        NewEvent {
            kind: EventKind::NoteOn,
            step,
            pitch,
            velocity: 100,
            length: 1,
            assoc: NIL,
        }
    }

    #[test]
    fn chains_are_newest_first_and_survive_unlink() {
        let arena = EventArena::new(4, 8);
        arena.link(0, note_on(2, 60));
        arena.link(1, note_on(2, 62));
        arena.link(2, note_on(2, 64));
        assert_eq!(arena.chain(EventKind::NoteOn, 2).collect::<Vec<_>>(), vec![2, 1, 0]);

        let generation = arena.slot(1).generation();
        arena.unlink(1);
        assert_eq!(arena.chain(EventKind::NoteOn, 2).collect::<Vec<_>>(), vec![2, 0]);
        assert_eq!(arena.slot(1).next(), 0);
        assert_eq!(arena.slot(1).generation(), generation + 1);

        arena.unlink(2);
        assert_eq!(arena.find(EventKind::NoteOn, 2, 60), Some(0));
        assert_eq!(arena.find(EventKind::NoteOn, 2, 64), None);
        assert_eq!(arena.chain(EventKind::NoteOn, 99).count(), 0);
    }

    #[test]
    fn freed_slots_cool_down_while_a_reader_is_attached() {
        let reclaimer = Reclaimer::new();
        let mut reader = reclaimer.reader().unwrap();
        let mut free = FreeSlots::new(1);

        let index = free.take(&reclaimer).unwrap();
        assert!(!free.reserve(1, &reclaimer));
        free.release(index, &reclaimer);
        assert_eq!(free.take(&reclaimer), None);
        assert_eq!(free.cooling(), 1);

        let _ = reader.confirm();
        assert!(free.reserve(1, &reclaimer));
        assert_eq!(free.take(&reclaimer), Some(index));
    }
}
