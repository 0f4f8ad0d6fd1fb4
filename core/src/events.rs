// Fan-out of UI-facing events to any number of subscribers.

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use parking_lot::Mutex;

pub(crate) struct Subscribers<E> {
    senders: Mutex<Vec<UnboundedSender<E>>>,
}

impl<E: Clone> Subscribers<E> {
    pub(crate) fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded();
        self.senders.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber; receivers that were dropped are pruned.
    pub(crate) fn emit(&self, event: E) {
        self.senders
            .lock()
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.senders.lock().len()
    }
}
