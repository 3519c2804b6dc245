//! Event bus contract
//!
//! A durable publish/subscribe transport with manual acknowledgment and
//! at-least-once delivery. Durable subscribers join a named queue group:
//! members of one group split the messages between them, while every
//! group receives every message. Ephemeral subscriptions see only what is
//! published after they were opened.

pub mod journal;
pub mod memory;

pub use journal::{BusJournal, SqliteJournal};
pub use memory::{BusOptions, ConsumerInfo, MemoryBus, StreamConfig, StreamInfo};

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Stream holding every log event
pub const LOG_STREAM: &str = "LOGS";

/// Subject all log records are published on
pub const LOG_SUBJECT: &str = "log.events";

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no stream captures subject '{0}'")]
    NoStream(String),

    #[error("durable consumer '{durable}' already exists with a different binding ({existing})")]
    ConsumerMismatch { durable: String, existing: String },

    #[error("invalid subject '{0}'")]
    InvalidSubject(String),

    #[error("event bus is closed")]
    Closed,

    #[error("bus journal error: {0}")]
    Journal(#[from] crate::storage::StoreError),
}

/// Acknowledgment decision for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    /// Negative acknowledgment; redeliver after the optional delay
    Nak(Option<Duration>),
}

/// Receives the ack/nak decision for messages of one durable consumer
pub trait AckSink: Send + Sync {
    fn acknowledge(&self, sequence: u64, decision: AckDecision);
}

/// A delivered message awaiting an ack/nak decision
///
/// The decision methods consume the message, so each delivery is decided
/// at most once. A message dropped without a decision is redelivered once
/// its ack deadline passes.
pub struct Message {
    subject: String,
    payload: Vec<u8>,
    sequence: u64,
    delivery_count: u32,
    sink: Arc<dyn AckSink>,
}

impl Message {
    pub fn new(
        subject: impl Into<String>,
        payload: Vec<u8>,
        sequence: u64,
        delivery_count: u32,
        sink: Arc<dyn AckSink>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            sequence,
            delivery_count,
            sink,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Stream sequence number of the message
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// 1 on first delivery, incremented on every redelivery
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn ack(self) {
        self.sink.acknowledge(self.sequence, AckDecision::Ack);
    }

    pub fn nak(self) {
        self.sink.acknowledge(self.sequence, AckDecision::Nak(None));
    }

    pub fn nak_with_delay(self, delay: Duration) {
        self.sink
            .acknowledge(self.sequence, AckDecision::Nak(Some(delay)));
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("delivery_count", &self.delivery_count)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Callback invoked for every message delivered to a durable subscription
///
/// Invocations run concurrently; implementations must not assume ordering.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message);
}

type Detach = Box<dyn FnOnce() + Send>;

/// Membership of one process in a durable queue group
///
/// Dropping or unsubscribing leaves the group; the durable cursor and any
/// unacknowledged messages stay with the bus.
pub struct Subscription {
    durable: String,
    detach: Option<Detach>,
}

impl Subscription {
    pub fn new(durable: impl Into<String>, detach: Detach) -> Self {
        Self {
            durable: durable.into(),
            detach: Some(detach),
        }
    }

    pub fn durable_name(&self) -> &str {
        &self.durable
    }

    pub fn unsubscribe(mut self) {
        self.leave();
    }

    fn leave(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.leave();
    }
}

/// Non-durable, deliver-new subscription with a bounded buffer
///
/// Dropping it is the only teardown path: the bus registration is removed
/// and the buffer released.
pub struct EphemeralSubscription {
    receiver: mpsc::Receiver<Vec<u8>>,
    dropped: Arc<AtomicU64>,
    detach: Option<Detach>,
}

impl EphemeralSubscription {
    /// `dropped` is bumped by the bus for every message discarded because
    /// the buffer was full
    pub fn new(
        receiver: mpsc::Receiver<Vec<u8>>,
        dropped: Arc<AtomicU64>,
        detach: Detach,
    ) -> Self {
        Self {
            receiver,
            dropped,
            detach: Some(detach),
        }
    }

    /// Next payload, or `None` once the bus side has gone away
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }

    /// Messages dropped since the previous call
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::AcqRel)
    }
}

impl Drop for EphemeralSubscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
        self.receiver.close();
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Join (creating if needed) the durable consumer `durable_name` as a
    /// member of `queue_group`
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        durable_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError>;

    async fn subscribe_ephemeral(
        &self,
        subject: &str,
        buffer: usize,
    ) -> Result<EphemeralSubscription, BusError>;
}

/// NATS-style subject matching: `*` matches one token, a trailing `>`
/// matches one or more
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return filter_tokens.next().is_none(),
            (Some("*"), Some(_)) => continue,
            (Some(f), Some(s)) if f == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn validate_subject(subject: &str) -> Result<(), BusError> {
    if subject.is_empty() || subject.split('.').any(|t| t.is_empty() || t.contains(' ')) {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("log.events", "log.events"));
        assert!(!subject_matches("log.events", "log.other"));
        assert!(subject_matches("log.*", "log.events"));
        assert!(!subject_matches("log.*", "log.events.extra"));
        assert!(subject_matches("log.>", "log.events.extra"));
        assert!(!subject_matches("log.>", "log"));
        assert!(!subject_matches("log.events", "log"));
    }

    #[test]
    fn test_validate_subject() {
        assert!(validate_subject("log.events").is_ok());
        assert!(validate_subject("").is_err());
        assert!(validate_subject("log..events").is_err());
        assert!(validate_subject("log events").is_err());
    }

    #[test]
    fn test_message_decisions_reach_sink() {
        let sink = Arc::new(RecordingSink::default());

        Message::new("log.events", vec![], 1, 1, sink.clone()).ack();
        Message::new("log.events", vec![], 2, 1, sink.clone()).nak();
        Message::new("log.events", vec![], 3, 2, sink.clone())
            .nak_with_delay(Duration::from_millis(5));

        let decisions = sink.decisions();
        assert_eq!(
            decisions,
            vec![
                (1, AckDecision::Ack),
                (2, AckDecision::Nak(None)),
                (3, AckDecision::Nak(Some(Duration::from_millis(5)))),
            ]
        );
    }

    #[tokio::test]
    async fn test_ephemeral_dropped_count_resets_on_take() {
        let (_sender, receiver) = mpsc::channel(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let sub = EphemeralSubscription::new(receiver, dropped.clone(), Box::new(|| {}));

        dropped.fetch_add(3, Ordering::AcqRel);
        assert_eq!(sub.take_dropped(), 3);
        assert_eq!(sub.take_dropped(), 0);
    }

    #[test]
    fn test_subscription_drop_detaches_once() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let sub = Subscription::new(
            "archiver-processor",
            Box::new(move || *counter.lock().unwrap() += 1),
        );
        sub.unsubscribe();
        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
