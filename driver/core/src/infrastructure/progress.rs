// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Progress Stream - Pub/Sub for Upgrade Narratives
//
// Upgrade coordinators publish human-readable progress lines; the control
// socket subscribes and forwards them to the client. A batch run keeps one
// reporter so a second client can attach to the run in flight.
//
// Every subscriber owns an unbounded queue: a slow client never loses a
// per-pod outcome line, it only reads it later.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Clone, Default)]
pub struct ProgressReporter {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<String>>>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish one line to every open subscriber. Lines published before a
    /// subscriber attaches are not seen by it.
    pub fn publish(&self, line: impl Into<String>) {
        let line = line.into();
        debug!(progress = %line);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(line.clone()).is_ok());
        if subscribers.is_empty() {
            debug!("no progress subscribers");
        }
    }

    pub fn subscribe(&self) -> ProgressReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        ProgressReceiver { receiver: rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().iter().filter(|tx| !tx.is_closed()).count()
    }
}

pub struct ProgressReceiver {
    receiver: mpsc::UnboundedReceiver<String>,
}

impl ProgressReceiver {
    /// Next line, or `None` once every reporter handle is gone and the
    /// queued lines are drained.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}
