use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;

/// Fan-out of change notifications to any number of subscribers.
pub struct Notifier<T> {
    subscribers: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone> Notifier<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Sends `change` to every live subscriber and forgets the ones that went
    /// away.
    pub fn notify(&self, change: T) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<T: Clone> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}
