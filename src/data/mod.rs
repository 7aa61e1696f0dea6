//! Measurement pub/sub hub.
//!
//! The [`DataHub`] decouples producers of measurement records from observers:
//! `publish` never waits on a subscriber, and every subscriber owns an
//! independent bounded queue so one slow observer cannot stall producers or
//! its peers.
//!
//! # Ordering
//!
//! Records within one stream are assigned consecutive sequence numbers at
//! publish time and delivered to each subscriber in that order. A lagging
//! subscriber loses the **oldest** queued records (drop-oldest policy): what
//! it still sees is a subsequence in publish order, never reordered and never
//! duplicated. No ordering is defined across different streams.
//!
//! # Stream Modes
//!
//! With `predeclared_streams` configured, only those streams exist and any
//! other name fails with an unknown-stream error. Otherwise streams are
//! created on first use.

pub mod server;

use crate::config::DataServerSettings;
use crate::error::{LabError, LabResult};
use crate::proto::Record;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tracing::trace;

struct SubscriberQueue {
    buffer: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

struct QueueState {
    records: VecDeque<Record>,
    dropped: u64,
    closed: bool,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(QueueState {
                records: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Drop-oldest on overflow; never blocks the publisher.
    fn push(&self, record: Record) {
        if let Ok(mut state) = self.buffer.lock() {
            if state.records.len() >= self.capacity {
                state.records.pop_front();
                state.dropped += 1;
            }
            state.records.push_back(record);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        if let Ok(mut state) = self.buffer.lock() {
            state.closed = true;
        }
        self.notify.notify_one();
    }
}

/// A live subscription to one stream.
///
/// Dropping the subscription detaches it from the hub; re-subscribing starts
/// a fresh cursor at the current head of the stream.
pub struct Subscription {
    stream: String,
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Next record in publish order. `None` once the hub shut down and the
    /// queue drained.
    pub async fn recv(&mut self) -> Option<Record> {
        loop {
            {
                if let Ok(mut state) = self.queue.buffer.lock() {
                    if let Some(record) = state.records.pop_front() {
                        return Some(record);
                    }
                    if state.closed {
                        return None;
                    }
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Records this subscriber lost to the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.queue
            .buffer
            .lock()
            .map(|state| state.dropped)
            .unwrap_or(0)
    }

    /// Stream this subscription follows.
    pub fn stream(&self) -> &str {
        &self.stream
    }
}

struct StreamState {
    next_seq: u64,
    backlog: VecDeque<Record>,
    subscribers: Vec<Weak<SubscriberQueue>>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            next_seq: 0,
            backlog: VecDeque::new(),
            subscribers: Vec::new(),
        }
    }
}

/// The pub/sub hub. Cheap to clone via [`Arc`]; the data server front-end and
/// in-process producers share one instance.
pub struct DataHub {
    queue_capacity: usize,
    backlog_capacity: usize,
    static_streams: bool,
    streams: Mutex<HashMap<String, StreamState>>,
}

impl DataHub {
    /// Builds a hub from data-server settings. With predeclared streams the
    /// hub is static: publishing or subscribing elsewhere fails.
    pub fn new(settings: &DataServerSettings) -> Arc<Self> {
        let mut streams = HashMap::new();
        for name in &settings.predeclared_streams {
            streams.insert(name.clone(), StreamState::new());
        }
        Arc::new(Self {
            queue_capacity: settings.subscriber_queue_capacity,
            backlog_capacity: settings.backlog_capacity,
            static_streams: !settings.predeclared_streams.is_empty(),
            streams: Mutex::new(streams),
        })
    }

    /// Publishes one record, assigning its sequence number.
    ///
    /// Never blocks on subscriber delivery; a full subscriber queue drops its
    /// oldest entry instead.
    pub fn publish(&self, mut record: Record) -> LabResult<u64> {
        let mut streams = self
            .streams
            .lock()
            .map_err(|_| LabError::RemoteCall("data hub lock poisoned".to_string()))?;

        if self.static_streams && !streams.contains_key(&record.stream) {
            return Err(LabError::UnknownStream(record.stream));
        }
        let state = streams
            .entry(record.stream.clone())
            .or_insert_with(StreamState::new);

        record.seq = state.next_seq;
        state.next_seq += 1;

        if self.backlog_capacity > 0 {
            if state.backlog.len() >= self.backlog_capacity {
                state.backlog.pop_front();
            }
            state.backlog.push_back(record.clone());
        }

        // Deliver to live subscribers; prune the ones that went away.
        state.subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(record.clone());
                true
            }
            None => false,
        });

        trace!(stream = %record.stream, seq = record.seq, "record published");
        Ok(record.seq)
    }

    /// Subscribes to `stream`, optionally replaying the bounded backlog
    /// before live records.
    pub fn subscribe(&self, stream: &str, backlog: bool) -> LabResult<Subscription> {
        let mut streams = self
            .streams
            .lock()
            .map_err(|_| LabError::RemoteCall("data hub lock poisoned".to_string()))?;

        if self.static_streams && !streams.contains_key(stream) {
            return Err(LabError::UnknownStream(stream.to_string()));
        }
        let state = streams
            .entry(stream.to_string())
            .or_insert_with(StreamState::new);

        let queue = Arc::new(SubscriberQueue::new(self.queue_capacity));
        if backlog {
            for record in &state.backlog {
                queue.push(record.clone());
            }
        }
        state.subscribers.push(Arc::downgrade(&queue));
        Ok(Subscription {
            stream: stream.to_string(),
            queue,
        })
    }

    /// Streams the hub currently knows.
    pub fn stream_names(&self) -> Vec<String> {
        self.streams
            .lock()
            .map(|streams| streams.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Wakes every subscriber with end-of-stream.
    pub fn shutdown(&self) {
        if let Ok(streams) = self.streams.lock() {
            for state in streams.values() {
                for weak in &state.subscribers {
                    if let Some(queue) = weak.upgrade() {
                        queue.close();
                    }
                }
            }
        }
    }
}
