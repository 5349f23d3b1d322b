//! In-process broker.
//!
//! [`LocalBroker`] is a channel → subscriber table shared by any number of
//! [`LocalConnection`]s. Publishing pushes the payload into every subscribed
//! sink synchronously, so each subscriber sees a channel's messages in
//! publish order. The relay server routes all of its TCP clients through one
//! of these.

use crate::broker::{Broker, BrokerMessage, MessageSink, WireError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Shared subscription table.
#[derive(Debug, Clone, Default)]
pub struct LocalBroker {
    channels: Arc<RwLock<HashMap<String, HashMap<u64, MessageSink>>>>,
    next_connection: Arc<AtomicU64>,
    published: Arc<AtomicU64>,
}

impl LocalBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to this broker.
    pub fn connection(&self) -> LocalConnection {
        LocalConnection {
            id: self.next_connection.fetch_add(1, Ordering::Relaxed),
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of connections subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.get(channel).map(|subs| subs.len()).unwrap_or(0)
    }

    /// Total number of payloads published through this broker.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn publish(&self, channel: &str, payload: Vec<u8>) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        let Some(subscribers) = channels.get(channel) else {
            return 0;
        };
        let mut delivered = 0;
        for sink in subscribers.values() {
            let message = BrokerMessage {
                channel: channel.to_string(),
                payload: payload.clone(),
            };
            if sink.send(message).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn subscribe(&self, connection: u64, channels: &[String], sink: MessageSink) {
        let mut table = self.channels.write().unwrap_or_else(|e| e.into_inner());
        for channel in channels {
            table
                .entry(channel.clone())
                .or_default()
                .insert(connection, sink.clone());
        }
    }

    fn unsubscribe(&self, connection: u64, channels: &[String]) {
        let mut table = self.channels.write().unwrap_or_else(|e| e.into_inner());
        for channel in channels {
            if let Some(subscribers) = table.get_mut(channel) {
                subscribers.remove(&connection);
                if subscribers.is_empty() {
                    table.remove(channel);
                }
            }
        }
    }

    fn unsubscribe_all(&self, connection: u64) {
        let mut table = self.channels.write().unwrap_or_else(|e| e.into_inner());
        table.retain(|_, subscribers| {
            subscribers.remove(&connection);
            !subscribers.is_empty()
        });
    }
}

/// A single subscriber/publisher on a [`LocalBroker`].
#[derive(Debug)]
pub struct LocalConnection {
    id: u64,
    broker: LocalBroker,
    closed: AtomicBool,
}

impl LocalConnection {
    fn ensure_open(&self) -> Result<(), WireError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WireError::ConnectionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for LocalConnection {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), WireError> {
        self.ensure_open()?;
        let delivered = self.broker.publish(channel, payload);
        debug!(channel, delivered, "local publish");
        Ok(())
    }

    async fn subscribe(&self, channels: &[String], sink: MessageSink) -> Result<(), WireError> {
        self.ensure_open()?;
        self.broker.subscribe(self.id, channels, sink);
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), WireError> {
        self.broker.unsubscribe(self.id, channels);
        Ok(())
    }

    async fn close(&self) -> Result<(), WireError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.broker.unsubscribe_all(self.id);
        }
        Ok(())
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.broker.unsubscribe_all(self.id);
    }
}
