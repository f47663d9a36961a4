use super::arena::{EventArena, EventKind, FreeSlots, NIL, NewEvent};
use super::{Controller, Note, NoteHandle, PatternChange, PatternId};
use crate::error::PatternError;
use crate::events::MidiMessage;
use crate::notify::Notifier;
use crate::sync::{Cycle, Reclaimer};
use arc_swap::ArcSwap;
use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Velocity of a NoteOff created by shortening or lengthening a note.
const RESIZE_OFF_VELOCITY: u8 = 64;

/// Source of per-instance tokens stamped into note handles.
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

struct EditState {
    name: String,
    free: FreeSlots,
    notes: usize,
}

/// Step-indexed note and control change storage.
///
/// A note is a NoteOn in the bucket of its first step and a NoteOff in the
/// bucket of its last step, linked to each other. Editors serialise on an
/// internal lock; the real-time thread reads the buckets without locking from
/// inside a [`Cycle`].
pub struct Pattern {
    id: PatternId,
    instance: u64,
    length: u32,
    steps: u32,
    arena: EventArena,
    controllers: ArcSwap<Vec<Arc<Controller>>>,
    edit: Mutex<EditState>,
    dirty: AtomicBool,
    changes: Notifier<PatternChange>,
    reclaimer: Reclaimer,
}

impl Pattern {
    /// `length` is in beats, `steps` per beat. `capacity` is the number of
    /// event slots; every note takes two.
    pub fn new(
        id: PatternId,
        name: impl Into<String>,
        length: u32,
        steps: u32,
        capacity: usize,
        reclaimer: Reclaimer,
    ) -> Result<Self, PatternError> {
        let total = length
            .checked_mul(steps)
            .filter(|total| *total > 0 && *total < NIL)
            .ok_or(PatternError::InvalidDimensions)?;
        let capacity = capacity.min(NIL as usize);
        let name = name.into();
        debug!(pattern = %name, length, steps, "creating pattern");
        Ok(Self {
            id,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            length,
            steps,
            arena: EventArena::new(capacity, total as usize),
            controllers: ArcSwap::from_pointee(Vec::new()),
            edit: Mutex::new(EditState {
                name,
                free: FreeSlots::new(capacity),
                notes: 0,
            }),
            dirty: AtomicBool::new(false),
            changes: Notifier::new(),
            reclaimer,
        })
    }

    pub fn id(&self) -> PatternId {
        self.id
    }

    pub fn name(&self) -> String {
        self.edit.lock().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        let mut edit = self.edit.lock();
        if edit.name != name {
            debug!(from = %edit.name, to = %name, "renaming pattern");
            edit.name = name.clone();
            self.touch();
            self.changes.notify(PatternChange::NameChanged(name));
        }
    }

    /// Length in beats.
    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn total_steps(&self) -> u32 {
        self.arena.total_steps()
    }

    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn note_count(&self) -> usize {
        self.edit.lock().notes
    }

    pub fn subscribe(&self) -> Receiver<PatternChange> {
        self.changes.subscribe()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn make_clean(&self) {
        self.dirty.store(false, Ordering::Relaxed);
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    fn check_step(&self, step: u32) -> Result<(), PatternError> {
        let total = self.total_steps();
        if step >= total {
            return Err(PatternError::StepOutOfRange { step, total });
        }
        Ok(())
    }

    /// NoteOn slot behind `handle`, if the note still exists.
    fn resolve(&self, handle: NoteHandle) -> Option<u32> {
        if handle.pattern != self.instance || handle.index as usize >= self.arena.capacity() {
            return None;
        }
        let slot = self.arena.slot(handle.index);
        (slot.kind() == Some(EventKind::NoteOn) && slot.generation() == handle.generation)
            .then_some(handle.index)
    }

    fn handle(&self, index: u32) -> NoteHandle {
        NoteHandle {
            pattern: self.instance,
            index,
            generation: self.arena.slot(index).generation(),
        }
    }

    fn note_at(&self, index: u32) -> Note {
        let slot = self.arena.slot(index);
        Note {
            handle: self.handle(index),
            step: slot.step(),
            pitch: slot.pitch(),
            velocity: slot.velocity(),
            length: slot.length(),
        }
    }

    /// The NoteOn of `pitch` sounding at `step`. Walks backwards: a matching
    /// NoteOff at an earlier step means the pitch is silent.
    fn find_active(&self, step: u32, pitch: u8) -> Option<u32> {
        for i in (0..=step).rev() {
            if i < step && self.arena.find(EventKind::NoteOff, i, pitch).is_some() {
                return None;
            }
            if let Some(on) = self.arena.find(EventKind::NoteOn, i, pitch) {
                return Some(on);
            }
        }
        None
    }

    /// Longest length up to `wanted` that starts at `step` without running
    /// into a later NoteOn of the same pitch or past the end.
    fn fit(&self, step: u32, pitch: u8, wanted: u32) -> u32 {
        let length = wanted.clamp(1, self.total_steps() - step);
        (step + 1..step + length)
            .find(|&i| self.arena.find(EventKind::NoteOn, i, pitch).is_some())
            .map_or(length, |i| i - step)
    }

    fn unlink(&self, edit: &mut EditState, index: u32) {
        self.arena.unlink(index);
        edit.free.release(index, &self.reclaimer);
    }

    /// Points the NoteOn at a fresh NoteOff for `length` and drops the old
    /// one. The new NoteOff is linked before the old one goes away.
    fn move_note_off(&self, edit: &mut EditState, on: u32, length: u32) -> Result<(), PatternError> {
        let new_off = edit.free.take(&self.reclaimer).ok_or(PatternError::Full)?;
        let slot = self.arena.slot(on);
        let old_off = slot.assoc();
        self.arena.link(
            new_off,
            NewEvent {
                kind: EventKind::NoteOff,
                step: slot.step() + length - 1,
                pitch: slot.pitch(),
                velocity: RESIZE_OFF_VELOCITY,
                length: 0,
                assoc: on,
            },
        );
        slot.set_assoc(new_off);
        slot.set_length(length);
        self.unlink(edit, old_off);
        Ok(())
    }

    /// Adds a note. A same-pitch note starting at `step` is replaced; one that
    /// started earlier and still sounds at `step` is cut short. The new note is
    /// clipped at the next same-pitch NoteOn and at the pattern end.
    pub fn add_note(
        &self,
        step: u32,
        pitch: u8,
        velocity: u8,
        length: u32,
    ) -> Result<NoteHandle, PatternError> {
        self.check_step(step)?;
        if pitch > 127 {
            return Err(PatternError::InvalidPitch(pitch));
        }
        if velocity > 127 {
            return Err(PatternError::InvalidVelocity(velocity));
        }
        if length == 0 {
            return Err(PatternError::ZeroLength);
        }

        let mut edit = self.edit.lock();
        let playing = self.find_active(step, pitch);
        let truncating = playing.is_some_and(|on| self.arena.slot(on).step() != step);
        let needed = if truncating { 3 } else { 2 };
        if !edit.free.reserve(needed, &self.reclaimer) {
            return Err(PatternError::Full);
        }

        if let Some(on) = playing {
            let start = self.arena.slot(on).step();
            if start == step {
                let off = self.arena.slot(on).assoc();
                self.unlink(&mut edit, on);
                self.unlink(&mut edit, off);
                edit.notes -= 1;
                self.changes.notify(PatternChange::NoteRemoved { step, pitch });
            } else {
                let length = step - start;
                self.move_note_off(&mut edit, on, length)?;
                self.changes.notify(PatternChange::NoteChanged {
                    step: start,
                    pitch,
                    length,
                });
            }
        }

        let length = self.fit(step, pitch, length);
        let off = edit.free.take(&self.reclaimer).ok_or(PatternError::Full)?;
        let on = edit.free.take(&self.reclaimer).ok_or(PatternError::Full)?;
        self.arena.link(
            off,
            NewEvent {
                kind: EventKind::NoteOff,
                step: step + length - 1,
                pitch,
                velocity,
                length: 0,
                assoc: on,
            },
        );
        self.arena.link(
            on,
            NewEvent {
                kind: EventKind::NoteOn,
                step,
                pitch,
                velocity,
                length,
                assoc: off,
            },
        );
        edit.notes += 1;
        self.touch();
        self.changes.notify(PatternChange::NoteAdded {
            step,
            pitch,
            length,
        });
        Ok(self.handle(on))
    }

    /// Removes the note and returns the step it started on. Stale handles are
    /// ignored.
    pub fn delete_note(&self, handle: NoteHandle) -> Option<u32> {
        let mut edit = self.edit.lock();
        let on = self.resolve(handle)?;
        let slot = self.arena.slot(on);
        let (step, pitch, off) = (slot.step(), slot.pitch(), slot.assoc());
        self.unlink(&mut edit, on);
        self.unlink(&mut edit, off);
        edit.notes -= 1;
        self.touch();
        self.changes.notify(PatternChange::NoteRemoved { step, pitch });
        Some(step)
    }

    /// Changes the length of a note, clamped to the pattern end and to the
    /// next same-pitch note. Returns the resulting length, or `None` for a
    /// stale handle.
    pub fn resize_note(&self, handle: NoteHandle, length: u32) -> Result<Option<u32>, PatternError> {
        let mut edit = self.edit.lock();
        let Some(on) = self.resolve(handle) else {
            return Ok(None);
        };
        let slot = self.arena.slot(on);
        let (step, pitch) = (slot.step(), slot.pitch());
        let length = self.fit(step, pitch, length);
        if length != slot.length() {
            self.move_note_off(&mut edit, on, length)?;
            self.touch();
            self.changes.notify(PatternChange::NoteChanged {
                step,
                pitch,
                length,
            });
        }
        Ok(Some(length))
    }

    /// Returns whether the note still exists.
    pub fn set_velocity(&self, handle: NoteHandle, velocity: u8) -> Result<bool, PatternError> {
        if velocity > 127 {
            return Err(PatternError::InvalidVelocity(velocity));
        }
        let _edit = self.edit.lock();
        let Some(on) = self.resolve(handle) else {
            return Ok(false);
        };
        let slot = self.arena.slot(on);
        slot.set_velocity(velocity);
        self.touch();
        self.changes.notify(PatternChange::NoteChanged {
            step: slot.step(),
            pitch: slot.pitch(),
            length: slot.length(),
        });
        Ok(true)
    }

    /// The note of `pitch` sounding at `step`, if any.
    pub fn find_note(&self, step: u32, pitch: u8) -> Option<NoteHandle> {
        if step >= self.total_steps() {
            return None;
        }
        let _edit = self.edit.lock();
        self.find_active(step, pitch).map(|on| self.handle(on))
    }

    pub fn note(&self, handle: NoteHandle) -> Option<Note> {
        let _edit = self.edit.lock();
        self.resolve(handle).map(|on| self.note_at(on))
    }

    /// All notes in step order.
    pub fn notes(&self) -> Vec<Note> {
        let _edit = self.edit.lock();
        self.walk().collect()
    }

    /// Lock-free note iteration for the real-time thread.
    pub fn iter_notes<'c>(&'c self, cycle: &'c Cycle<'_>) -> NoteIter<'c> {
        assert!(
            cycle.covers(&self.reclaimer),
            "cycle belongs to another reclaimer"
        );
        self.walk()
    }

    fn walk(&self) -> NoteIter<'_> {
        NoteIter {
            pattern: self,
            step: 0,
            current: NIL,
        }
    }

    pub fn add_controller(&self, number: u8, name: impl Into<String>) -> Result<(), PatternError> {
        if number > 127 {
            return Err(PatternError::InvalidValue(number));
        }
        let _edit = self.edit.lock();
        let current = self.controllers.load_full();
        if current.iter().any(|cc| cc.number() == number) {
            return Err(PatternError::DuplicateController(number));
        }
        let mut table: Vec<Arc<Controller>> = current.iter().cloned().collect();
        table.push(Arc::new(Controller::new(number, name, self.total_steps())));
        table.sort_by_key(|cc| cc.number());
        self.swap_controllers(table);
        self.touch();
        self.changes
            .notify(PatternChange::ControllerAdded { controller: number });
        Ok(())
    }

    pub fn remove_controller(&self, number: u8) -> bool {
        let _edit = self.edit.lock();
        let current = self.controllers.load_full();
        if !current.iter().any(|cc| cc.number() == number) {
            return false;
        }
        let table = current
            .iter()
            .filter(|cc| cc.number() != number)
            .cloned()
            .collect();
        self.swap_controllers(table);
        self.touch();
        self.changes
            .notify(PatternChange::ControllerRemoved { controller: number });
        true
    }

    fn swap_controllers(&self, table: Vec<Arc<Controller>>) {
        let old = self.controllers.swap(Arc::new(table));
        // the real-time thread may hold the old table until its next cycle
        self.reclaimer.retire(old);
    }

    fn controller(&self, number: u8) -> Result<Arc<Controller>, PatternError> {
        self.controllers
            .load()
            .iter()
            .find(|cc| cc.number() == number)
            .cloned()
            .ok_or(PatternError::UnknownController(number))
    }

    /// Overwrites the value of one step of a controller curve.
    pub fn set_cc(&self, controller: u8, step: u32, value: u8) -> Result<(), PatternError> {
        self.check_step(step)?;
        if value > 127 {
            return Err(PatternError::InvalidValue(value));
        }
        let _edit = self.edit.lock();
        self.controller(controller)?.set(step, value);
        self.touch();
        self.changes.notify(PatternChange::CcSet {
            controller,
            step,
            value,
        });
        Ok(())
    }

    pub fn remove_cc(&self, controller: u8, step: u32) -> Result<(), PatternError> {
        self.check_step(step)?;
        let _edit = self.edit.lock();
        let cc = self.controller(controller)?;
        if cc.get(step).is_some() {
            cc.clear(step);
            self.touch();
            self.changes
                .notify(PatternChange::CcRemoved { controller, step });
        }
        Ok(())
    }

    pub fn cc(&self, controller: u8, step: u32) -> Option<u8> {
        self.controller(controller).ok()?.get(step)
    }

    pub fn controllers(&self) -> Vec<Arc<Controller>> {
        self.controllers.load().iter().cloned().collect()
    }

    /// Copy of this pattern with a different length. Refuses to cut through a
    /// note or to drop a control change.
    pub fn with_length(&self, id: PatternId, length: u32) -> Result<Pattern, PatternError> {
        let notes = self.notes();
        let pattern = Pattern::new(
            id,
            self.name(),
            length,
            self.steps,
            self.capacity(),
            self.reclaimer.clone(),
        )?;
        let total = pattern.total_steps();
        if notes.iter().any(|note| note.step + note.length > total) {
            return Err(PatternError::NotesBeyondEnd(length));
        }
        let controllers = self.controllers.load();
        if controllers
            .iter()
            .any(|cc| cc.events().any(|(step, _)| step >= total))
        {
            return Err(PatternError::CcBeyondEnd(length));
        }
        for note in notes {
            pattern.add_note(note.step, note.pitch, note.velocity, note.length)?;
        }
        let controllers = controllers
            .iter()
            .map(|cc| Arc::new(cc.resized(total)))
            .collect();
        pattern.controllers.store(Arc::new(controllers));
        Ok(pattern)
    }

    /// Emits the events between local beats `from` (inclusive) and `to`
    /// (exclusive). A step's NoteOffs sound at the start of the following
    /// step. A muted pattern only emits NoteOffs.
    pub fn sequence(
        &self,
        cycle: &Cycle<'_>,
        channel: u8,
        from: f64,
        to: f64,
        muted: bool,
        mut emit: impl FnMut(f64, MidiMessage),
    ) {
        debug_assert!(cycle.covers(&self.reclaimer));
        let steps = f64::from(self.steps);
        let total = self.total_steps();
        let first = (from * steps).ceil().max(0.0) as u32;
        let last = ((to * steps).ceil().max(0.0) as u32).min(total.saturating_add(1));
        let controllers = self.controllers.load();

        for i in first..last {
            let beat = f64::from(i) / steps;
            if i > 0 {
                for off in self.arena.chain(EventKind::NoteOff, i - 1) {
                    let slot = self.arena.slot(off);
                    emit(
                        beat,
                        MidiMessage::NoteOff {
                            channel,
                            pitch: slot.pitch(),
                            velocity: slot.velocity(),
                        },
                    );
                }
            }
            if muted || i >= total {
                continue;
            }
            for cc in controllers.iter() {
                if let Some(value) = cc.get(i) {
                    emit(
                        beat,
                        MidiMessage::ControlChange {
                            channel,
                            controller: cc.number(),
                            value,
                        },
                    );
                }
            }
            for on in self.arena.chain(EventKind::NoteOn, i) {
                let slot = self.arena.slot(on);
                emit(
                    beat,
                    MidiMessage::NoteOn {
                        channel,
                        pitch: slot.pitch(),
                        velocity: slot.velocity(),
                    },
                );
            }
        }
    }
}

impl Drop for Pattern {
    fn drop(&mut self) {
        debug!(pattern = %self.edit.get_mut().name, "destroying pattern");
    }
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pattern")
            .field("id", &self.id)
            .field("length", &self.length)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

/// Notes in step order: the rest of the current bucket, then the next
/// non-empty bucket.
pub struct NoteIter<'a> {
    pattern: &'a Pattern,
    step: u32,
    current: u32,
}

impl Iterator for NoteIter<'_> {
    type Item = Note;

    fn next(&mut self) -> Option<Note> {
        let arena = &self.pattern.arena;
        while self.current == NIL {
            if self.step >= arena.total_steps() {
                return None;
            }
            self.current = arena
                .chain(EventKind::NoteOn, self.step)
                .next()
                .unwrap_or(NIL);
            self.step += 1;
        }
        let index = self.current;
        self.current = arena.slot(index).next();
        Some(self.pattern.note_at(index))
    }
}
