use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Fan-out of lifecycle events to any number of listeners.
///
/// Every subscriber gets its own unbounded queue, so a slow consumer never
/// loses an edge-triggered event. Closed receivers are pruned on emit.
pub struct EventEmitter<E> {
    listeners: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E: Clone> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live listener and return how many got it.
    pub fn emit(&self, event: E) -> usize {
        let mut listeners = self.listeners.lock();
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
        listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        let mut listeners = self.listeners.lock();
        listeners.retain(|tx| !tx.is_closed());
        listeners.len()
    }
}

impl<E: Clone> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}
