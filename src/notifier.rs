use std::{
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc, PoisonError, RwLock,
    },
    thread,
};

/// Fan-out of staging events to any number of observers. Observers whose
/// receiver has been dropped are removed on the next notification.
#[derive(Clone)]
pub struct Notifier<Event: Send + Sync + Clone + 'static> {
    senders: Arc<RwLock<Vec<Sender<Event>>>>,
}

impl<Event: Send + Sync + Clone + 'static> Default for Notifier<Event> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Event: Send + Sync + Clone + 'static> Notifier<Event> {
    pub fn new() -> Self {
        Self {
            senders: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn notify(&self, event: Event) {
        let mut senders = self.senders.write().unwrap_or_else(PoisonError::into_inner);
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn observer(&self) -> Receiver<Event> {
        let (tx, rx) = channel();
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Runs `callback` for every event on a background thread until the
    /// notifier and all its clones are dropped.
    pub fn observe(&self, mut callback: impl FnMut(Event) + Send + 'static) {
        let rx = self.observer();
        thread::spawn(move || {
            rx.iter().for_each(|e| callback(e));
        });
    }

    pub fn observer_count(&self) -> usize {
        self.senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
