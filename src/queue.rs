//! Bounded, closable multi-producer queue.
//!
//! Workers push into the run's connection and counter queues; the controller
//! closes them once during stop and then drains what was published.

use std::sync::Mutex;

use tokio::sync::mpsc;

/// A queue of fixed capacity that can be closed exactly once.
///
/// Pushing never blocks: with capacity equal to the number of producers a
/// full queue only happens on misuse, and a closed queue hands the item back.
#[derive(Debug)]
pub struct RunQueue<T> {
    sender: Mutex<Option<mpsc::Sender<T>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<T>>,
}

impl<T> RunQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
        }
    }

    /// Publishes `item`, returning it back if the queue is closed or full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(_) => return Err(item),
        };
        match guard.as_ref() {
            Some(tx) => tx.try_send(item).map_err(|e| e.into_inner()),
            None => Err(item),
        }
    }

    /// Closes the queue. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        match self.sender.lock() {
            Ok(mut guard) => guard.take().is_some(),
            Err(_) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.sender.lock() {
            Ok(guard) => guard.is_none(),
            Err(_) => true,
        }
    }

    /// Waits until the queue is closed and returns everything published.
    pub async fn drain(&self) -> Vec<T> {
        let mut receiver = self.receiver.lock().await;
        let mut items = Vec::new();
        while let Some(item) = receiver.recv().await {
            items.push(item);
        }
        items
    }
}
