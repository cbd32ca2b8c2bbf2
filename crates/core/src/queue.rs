//! Non-blocking FIFO between a producer and a possibly slow consumer.
//!
//! Pushing never blocks and never drops: items land in an unbounded backing
//! list. A background task hands the oldest item to the consumer whenever
//! the consumer has room, and keeps accepting new items in the meantime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Producer half of a queue. Cheap to clone.
#[derive(Debug)]
pub struct QueueSender<T> {
    inbound: mpsc::UnboundedSender<T>,
    pending: Arc<AtomicUsize>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            inbound: self.inbound.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueue an item. Returns the item back if the queue has shut down.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.inbound.send(item).map_err(|err| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            err.0
        })
    }

    /// Number of items pushed but not yet received
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consumer half of a queue.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    outbound: mpsc::Receiver<T>,
    pending: Arc<AtomicUsize>,
}

impl<T> QueueReceiver<T> {
    /// Wait for the oldest item. `None` once the queue has shut down and drained.
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.outbound.recv().await?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Create a queue whose forwarding task runs until `cancel` fires or every
/// sender is dropped and the buffer is drained.
pub fn channel<T: Send + 'static>(cancel: CancellationToken) -> (QueueSender<T>, QueueReceiver<T>) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::channel(1);
    let pending = Arc::new(AtomicUsize::new(0));

    tokio::spawn(forward(cancel, inbound_rx, outbound_tx));

    (
        QueueSender {
            inbound: inbound_tx,
            pending: pending.clone(),
        },
        QueueReceiver {
            outbound: outbound_rx,
            pending,
        },
    )
}

async fn forward<T>(
    cancel: CancellationToken,
    mut inbound: mpsc::UnboundedReceiver<T>,
    outbound: mpsc::Sender<T>,
) {
    let mut buffer: VecDeque<T> = VecDeque::new();
    let mut inbound_open = true;

    loop {
        if !inbound_open && buffer.is_empty() {
            return;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => return,

            item = inbound.recv(), if inbound_open => match item {
                Some(item) => buffer.push_back(item),
                None => inbound_open = false,
            },

            permit = outbound.reserve(), if !buffer.is_empty() => match permit {
                Ok(permit) => {
                    if let Some(item) = buffer.pop_front() {
                        permit.send(item);
                    }
                }
                // consumer is gone
                Err(_) => return,
            },
        }
    }
}
