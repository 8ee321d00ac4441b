//! Broadcast sink boundary.
//!
//! Downstream consumers (the user-facing API, chat bots) subscribe to the
//! bus and receive every [`ScanEvent`]. Sending never blocks the pipeline:
//! with no subscribers the event is dropped, and slow subscribers observe a
//! lagged receiver rather than backpressure.

use crate::domain::alerts::ScanEvent;
use crate::domain::ports::AlertSink;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ScanEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ScanEvent) {
        // An Err here only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertSink for EventBus {
    async fn deliver(&self, event: ScanEvent) -> Result<()> {
        self.publish(event);
        Ok(())
    }
}
