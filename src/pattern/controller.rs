use std::sync::atomic::{AtomicU8, Ordering};

const UNSET: u8 = u8::MAX;

/// A control change curve: at most one value per step, no interpolation.
pub struct Controller {
    number: u8,
    name: String,
    values: Box<[AtomicU8]>,
}

impl Controller {
    pub fn new(number: u8, name: impl Into<String>, total_steps: u32) -> Self {
        Self {
            number,
            name: name.into(),
            values: (0..total_steps).map(|_| AtomicU8::new(UNSET)).collect(),
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u32 {
        self.values.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, step: u32) -> Option<u8> {
        let value = self.values.get(step as usize)?.load(Ordering::Relaxed);
        (value != UNSET).then_some(value)
    }

    pub(crate) fn set(&self, step: u32, value: u8) {
        if let Some(slot) = self.values.get(step as usize) {
            slot.store(value & 0x7f, Ordering::Relaxed);
        }
    }

    pub(crate) fn clear(&self, step: u32) {
        if let Some(slot) = self.values.get(step as usize) {
            slot.store(UNSET, Ordering::Relaxed);
        }
    }

    /// Steps holding a value, in step order.
    pub fn events(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        (0..self.len()).filter_map(|step| self.get(step).map(|value| (step, value)))
    }

    /// Copy with `total_steps` steps, keeping the values that still fit.
    pub(crate) fn resized(&self, total_steps: u32) -> Self {
        let copy = Controller::new(self.number, self.name.clone(), total_steps);
        for (step, value) in self.events() {
            copy.set(step, value);
        }
        copy
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("number", &self.number)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
