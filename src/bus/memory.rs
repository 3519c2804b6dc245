//! Embedded in-process broker
//!
//! Streams retain messages under an interest policy: a message is kept
//! only while some durable consumer that matched it at publish time has
//! not acknowledged it. Each durable consumer owns a cursor, a pending
//! set with ack deadlines and a redelivery queue, and a dispatcher task
//! that hands deliveries to its queue-group members round robin.
//!
//! With a journal attached, retained messages and consumer bindings are
//! written through before a publish returns, so a reopened bus replays
//! everything that was never acknowledged.

use super::journal::{BusJournal, JournalHandle, JournaledConsumer};
use super::{
    subject_matches, validate_subject, AckDecision, AckSink, BusError, EphemeralSubscription,
    EventBus, Message, MessageHandler, Subscription,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How often dispatchers re-check ack deadlines and delayed redeliveries
const DISPATCH_TICK: Duration = Duration::from_millis(50);

/// Delivery settings applied to every durable consumer
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Time a delivery may stay unacknowledged before it is redelivered
    pub ack_wait: Duration,
    /// Max unacknowledged deliveries per durable consumer
    pub max_ack_pending: usize,
    /// Max deliveries per message; 0 means unlimited
    pub max_deliver: u32,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_secs(30),
            max_ack_pending: 1000,
            max_deliver: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub name: String,
    pub subjects: Vec<String>,
    /// Messages currently retained
    pub messages: usize,
    pub last_sequence: u64,
    pub consumers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub durable: String,
    pub queue_group: String,
    pub members: usize,
    pub pending: usize,
    pub redeliveries_waiting: usize,
}

// ============================================================
// Broker state
// ============================================================

struct StoredMessage {
    subject: String,
    payload: Vec<u8>,
    interest: HashSet<String>,
}

struct PendingDelivery {
    deadline: Instant,
    deliveries: u32,
}

struct Redelivery {
    ready_at: Instant,
    deliveries: u32,
}

struct Member {
    id: u64,
    handler: Arc<dyn MessageHandler>,
}

struct DurableConsumer {
    subject: String,
    queue_group: String,
    delivered_through: u64,
    pending: HashMap<u64, PendingDelivery>,
    redeliver: BTreeMap<u64, Redelivery>,
    members: Vec<Member>,
    next_member: usize,
    wake: Arc<Notify>,
    dispatcher_running: bool,
}

impl DurableConsumer {
    fn new(subject: String, queue_group: String, delivered_through: u64) -> Self {
        Self {
            subject,
            queue_group,
            delivered_through,
            pending: HashMap::new(),
            redeliver: BTreeMap::new(),
            members: Vec::new(),
            next_member: 0,
            wake: Arc::new(Notify::new()),
            dispatcher_running: false,
        }
    }

    fn binding_matches(&self, subject: &str, queue_group: &str) -> Result<(), String> {
        if self.subject == subject && self.queue_group == queue_group {
            Ok(())
        } else {
            Err(format!(
                "subject '{}', queue group '{}'",
                self.subject, self.queue_group
            ))
        }
    }
}

struct EphemeralSub {
    id: u64,
    subject: String,
    sender: mpsc::Sender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

struct Stream {
    config: StreamConfig,
    messages: BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    consumers: HashMap<String, DurableConsumer>,
    ephemerals: Vec<EphemeralSub>,
}

impl Stream {
    fn new(config: StreamConfig, last_sequence: u64) -> Self {
        Self {
            config,
            messages: BTreeMap::new(),
            last_sequence,
            consumers: HashMap::new(),
            ephemerals: Vec::new(),
        }
    }

    fn captures(&self, subject: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|filter| subject_matches(filter, subject))
    }

    fn interest_for(&self, subject: &str) -> HashSet<String> {
        self.consumers
            .iter()
            .filter(|(_, c)| subject_matches(&c.subject, subject))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[derive(Default)]
struct BusState {
    streams: HashMap<String, Stream>,
    next_id: u64,
}

impl BusState {
    fn stream_for_subject_mut(&mut self, subject: &str) -> Option<&mut Stream> {
        self.streams.values_mut().find(|s| s.captures(subject))
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Inner {
    state: Mutex<BusState>,
    options: BusOptions,
    shutdown: CancellationToken,
    journal: Option<JournalHandle>,
    /// Serializes sequence assignment with the journal write
    publish_lock: tokio::sync::Mutex<()>,
    /// In-flight handler invocations
    handlers: TaskTracker,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process event bus
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    /// Volatile bus; retained messages are lost with the process
    pub fn new(options: BusOptions) -> Self {
        Self::with_state(options, BusState::default(), None)
    }

    /// Bus backed by `journal`, restoring the streams, durable consumers
    /// and unacknowledged messages it holds
    ///
    /// Restored consumers start from the beginning of what is retained, so
    /// every message still owed an ack is redelivered once a member joins.
    pub async fn open(options: BusOptions, journal: Arc<dyn BusJournal>) -> Result<Self, BusError> {
        let snapshot = journal.load().await?;
        let mut state = BusState::default();

        for stream in snapshot.streams {
            state.streams.insert(
                stream.config.name.clone(),
                Stream::new(stream.config, stream.last_sequence),
            );
        }

        let mut consumers = 0;
        for consumer in snapshot.consumers {
            if let Some(stream) = state.streams.get_mut(&consumer.stream) {
                stream.consumers.insert(
                    consumer.durable,
                    DurableConsumer::new(consumer.subject, consumer.queue_group, 0),
                );
                consumers += 1;
            }
        }

        let mut messages = 0;
        for message in snapshot.messages {
            let Some(stream) = state.streams.get_mut(&message.stream) else {
                continue;
            };
            let interest: HashSet<String> = message
                .interest
                .into_iter()
                .filter(|durable| stream.consumers.contains_key(durable))
                .collect();
            if interest.is_empty() {
                continue;
            }
            stream.last_sequence = stream.last_sequence.max(message.sequence);
            stream.messages.insert(
                message.sequence,
                StoredMessage {
                    subject: message.subject,
                    payload: message.payload,
                    interest,
                },
            );
            messages += 1;
        }

        info!(
            streams = state.streams.len(),
            consumers = consumers,
            messages = messages,
            "Bus state restored from journal"
        );

        Ok(Self::with_state(
            options,
            state,
            Some(JournalHandle::spawn(journal)),
        ))
    }

    fn with_state(options: BusOptions, state: BusState, journal: Option<JournalHandle>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                options,
                shutdown: CancellationToken::new(),
                journal,
                publish_lock: tokio::sync::Mutex::new(()),
                handlers: TaskTracker::new(),
            }),
        }
    }

    /// Create the stream, or update its subjects if it already exists
    ///
    /// Returns true when the stream was created.
    pub async fn ensure_stream(&self, config: StreamConfig) -> Result<bool, BusError> {
        for subject in &config.subjects {
            validate_subject(subject)?;
        }

        if let Some(journal) = &self.inner.journal {
            journal.journal().save_stream(&config).await?;
        }

        let mut state = self.inner.lock();
        match state.streams.get_mut(&config.name) {
            Some(stream) => {
                info!(
                    stream = %config.name,
                    subjects = ?config.subjects,
                    "Stream already exists, configuration updated"
                );
                stream.config = config;
                Ok(false)
            }
            None => {
                info!(stream = %config.name, subjects = ?config.subjects, "Stream created");
                state
                    .streams
                    .insert(config.name.clone(), Stream::new(config, 0));
                Ok(true)
            }
        }
    }

    pub fn stream_info(&self, name: &str) -> Option<StreamInfo> {
        let state = self.inner.lock();
        state.streams.get(name).map(|stream| {
            let mut consumers: Vec<String> = stream.consumers.keys().cloned().collect();
            consumers.sort();
            StreamInfo {
                name: stream.config.name.clone(),
                subjects: stream.config.subjects.clone(),
                messages: stream.messages.len(),
                last_sequence: stream.last_sequence,
                consumers,
            }
        })
    }

    pub fn consumer_info(&self, stream: &str, durable: &str) -> Option<ConsumerInfo> {
        let state = self.inner.lock();
        let consumer = state.streams.get(stream)?.consumers.get(durable)?;
        Some(ConsumerInfo {
            durable: durable.to_string(),
            queue_group: consumer.queue_group.clone(),
            members: consumer.members.len(),
            pending: consumer.pending.len(),
            redeliveries_waiting: consumer.redeliver.len(),
        })
    }

    /// Number of live ephemeral subscriptions on a stream
    pub fn ephemeral_count(&self, stream: &str) -> usize {
        let state = self.inner.lock();
        state
            .streams
            .get(stream)
            .map(|s| s.ephemerals.len())
            .unwrap_or(0)
    }

    /// Stop all dispatchers and reject further publishes
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Close the bus, then wait up to `drain_timeout` for in-flight
    /// handlers to finish and for their acknowledgments to reach the
    /// journal
    ///
    /// Handlers still running after the timeout keep their messages
    /// unacknowledged; a journaled bus redelivers them on the next open.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.close();
        self.inner.handlers.close();

        if tokio::time::timeout(drain_timeout, self.inner.handlers.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.inner.handlers.len(),
                "Timed out waiting for message handlers to finish"
            );
        }

        if let Some(journal) = &self.inner.journal {
            journal.flush().await;
        }
        debug!("Event bus drained");
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        validate_subject(subject)?;

        let _serial = self.inner.publish_lock.lock().await;

        let (stream_name, sequence, interest) = {
            let mut state = self.inner.lock();
            let stream = state
                .stream_for_subject_mut(subject)
                .ok_or_else(|| BusError::NoStream(subject.to_string()))?;
            (
                stream.config.name.clone(),
                stream.last_sequence + 1,
                stream.interest_for(subject),
            )
        };

        // Interest policy: nothing to retain without a durable consumer
        if let Some(journal) = self.inner.journal.as_ref().filter(|_| !interest.is_empty()) {
            let durables: Vec<String> = interest.iter().cloned().collect();
            journal
                .journal()
                .append(&stream_name, sequence, subject, &payload, &durables)
                .await?;
        }

        let mut state = self.inner.lock();
        let stream = state
            .streams
            .get_mut(&stream_name)
            .ok_or_else(|| BusError::NoStream(subject.to_string()))?;
        stream.last_sequence = sequence;

        for name in &interest {
            if let Some(consumer) = stream.consumers.get(name) {
                consumer.wake.notify_one();
            }
        }

        stream.ephemerals.retain(|sub| {
            if !subject_matches(&sub.subject, subject) {
                return true;
            }
            match sub.sender.try_send(payload.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscription = sub.id, "Ephemeral buffer full, dropping newest message");
                    sub.dropped.fetch_add(1, Ordering::AcqRel);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        if !interest.is_empty() {
            stream.messages.insert(
                sequence,
                StoredMessage {
                    subject: subject.to_string(),
                    payload,
                    interest,
                },
            );
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        durable_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        validate_subject(subject)?;

        let (stream_name, known) = {
            let mut state = self.inner.lock();
            let stream = state
                .stream_for_subject_mut(subject)
                .ok_or_else(|| BusError::NoStream(subject.to_string()))?;
            (
                stream.config.name.clone(),
                stream.consumers.contains_key(durable_name),
            )
        };

        if let Some(journal) = self.inner.journal.as_ref().filter(|_| !known) {
            journal
                .journal()
                .save_consumer(&JournaledConsumer {
                    stream: stream_name.clone(),
                    durable: durable_name.to_string(),
                    subject: subject.to_string(),
                    queue_group: queue_group.to_string(),
                })
                .await?;
        }

        let (member_id, spawn_dispatcher) = {
            let mut state = self.inner.lock();
            let member_id = state.allocate_id();
            let stream = state
                .streams
                .get_mut(&stream_name)
                .ok_or_else(|| BusError::NoStream(subject.to_string()))?;
            let last_sequence = stream.last_sequence;

            let consumer = stream
                .consumers
                .entry(durable_name.to_string())
                .or_insert_with(|| {
                    info!(
                        durable = durable_name,
                        queue_group = queue_group,
                        subject = subject,
                        "Durable consumer created"
                    );
                    DurableConsumer::new(
                        subject.to_string(),
                        queue_group.to_string(),
                        last_sequence,
                    )
                });

            if let Err(existing) = consumer.binding_matches(subject, queue_group) {
                return Err(BusError::ConsumerMismatch {
                    durable: durable_name.to_string(),
                    existing,
                });
            }

            consumer.members.push(Member {
                id: member_id,
                handler,
            });
            let spawn_dispatcher = !consumer.dispatcher_running;
            consumer.dispatcher_running = true;
            consumer.wake.notify_one();

            (member_id, spawn_dispatcher)
        };

        if spawn_dispatcher {
            tokio::spawn(run_dispatcher(
                self.inner.clone(),
                stream_name.clone(),
                durable_name.to_string(),
            ));
        }

        let weak = Arc::downgrade(&self.inner);
        let durable = durable_name.to_string();
        let detach = Box::new(move || leave_queue_group(&weak, &stream_name, &durable, member_id));

        Ok(Subscription::new(durable_name, detach))
    }

    async fn subscribe_ephemeral(
        &self,
        subject: &str,
        buffer: usize,
    ) -> Result<EphemeralSubscription, BusError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        validate_subject(subject)?;

        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let (stream_name, id) = {
            let mut state = self.inner.lock();
            let id = state.allocate_id();
            let stream = state
                .stream_for_subject_mut(subject)
                .ok_or_else(|| BusError::NoStream(subject.to_string()))?;
            stream.ephemerals.push(EphemeralSub {
                id,
                subject: subject.to_string(),
                sender,
                dropped: dropped.clone(),
            });
            (stream.config.name.clone(), id)
        };

        debug!(subscription = id, subject = subject, "Ephemeral subscription opened");

        let weak = Arc::downgrade(&self.inner);
        let detach = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.lock();
                if let Some(stream) = state.streams.get_mut(&stream_name) {
                    stream.ephemerals.retain(|sub| sub.id != id);
                }
                debug!(subscription = id, "Ephemeral subscription closed");
            }
        });

        Ok(EphemeralSubscription::new(receiver, dropped, detach))
    }
}

fn leave_queue_group(inner: &Weak<Inner>, stream: &str, durable: &str, member_id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut state = inner.lock();
    if let Some(consumer) = state
        .streams
        .get_mut(stream)
        .and_then(|s| s.consumers.get_mut(durable))
    {
        consumer.members.retain(|m| m.id != member_id);
        consumer.wake.notify_one();
        debug!(durable = durable, member = member_id, "Left queue group");
    }
}

// ============================================================
// Dispatch
// ============================================================

/// Acknowledgment target for one durable consumer
struct ConsumerAcker {
    inner: Weak<Inner>,
    stream: String,
    durable: String,
}

impl AckSink for ConsumerAcker {
    fn acknowledge(&self, sequence: u64, decision: AckDecision) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut state = inner.lock();
        let Some(stream) = state.streams.get_mut(&self.stream) else {
            return;
        };
        let Stream {
            messages,
            consumers,
            ..
        } = stream;
        let Some(consumer) = consumers.get_mut(&self.durable) else {
            return;
        };

        match decision {
            AckDecision::Ack => {
                let known = consumer.pending.remove(&sequence).is_some()
                    || consumer.redeliver.remove(&sequence).is_some();
                if known {
                    release_interest(
                        messages,
                        inner.journal.as_ref(),
                        &self.stream,
                        sequence,
                        &self.durable,
                    );
                }
            }
            AckDecision::Nak(delay) => {
                if let Some(pending) = consumer.pending.remove(&sequence) {
                    consumer.redeliver.insert(
                        sequence,
                        Redelivery {
                            ready_at: Instant::now() + delay.unwrap_or_default(),
                            deliveries: pending.deliveries,
                        },
                    );
                }
            }
        }

        consumer.wake.notify_one();
    }
}

fn release_interest(
    messages: &mut BTreeMap<u64, StoredMessage>,
    journal: Option<&JournalHandle>,
    stream: &str,
    sequence: u64,
    durable: &str,
) {
    let fully_acked = match messages.get_mut(&sequence) {
        Some(message) => {
            message.interest.remove(durable);
            message.interest.is_empty()
        }
        None => false,
    };
    if fully_acked {
        messages.remove(&sequence);
    }
    if let Some(journal) = journal {
        journal.release(stream, sequence, durable);
    }
}

async fn run_dispatcher(inner: Arc<Inner>, stream: String, durable: String) {
    let acker: Arc<dyn AckSink> = Arc::new(ConsumerAcker {
        inner: Arc::downgrade(&inner),
        stream: stream.clone(),
        durable: durable.clone(),
    });

    let wake = {
        let state = inner.lock();
        match state
            .streams
            .get(&stream)
            .and_then(|s| s.consumers.get(&durable))
        {
            Some(consumer) => consumer.wake.clone(),
            None => return,
        }
    };

    debug!(durable = %durable, "Dispatcher started");

    loop {
        let deliveries = {
            let mut state = inner.lock();
            let Some(s) = state.streams.get_mut(&stream) else {
                break;
            };
            let Stream {
                messages,
                consumers,
                last_sequence,
                ..
            } = s;
            let Some(consumer) = consumers.get_mut(&durable) else {
                break;
            };
            if consumer.members.is_empty() {
                consumer.dispatcher_running = false;
                break;
            }
            collect_deliveries(
                messages,
                *last_sequence,
                consumer,
                &Target {
                    stream: &stream,
                    durable: &durable,
                    journal: inner.journal.as_ref(),
                },
                &inner.options,
                &acker,
            )
        };

        for (handler, message) in deliveries {
            inner.handlers.spawn(async move {
                handler.handle(message).await;
            });
        }

        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(DISPATCH_TICK) => {}
            _ = inner.shutdown.cancelled() => break,
        }
    }

    debug!(durable = %durable, "Dispatcher stopped");
}

/// The durable consumer a dispatch pass works for
struct Target<'a> {
    stream: &'a str,
    durable: &'a str,
    journal: Option<&'a JournalHandle>,
}

fn collect_deliveries(
    messages: &mut BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    consumer: &mut DurableConsumer,
    target: &Target<'_>,
    options: &BusOptions,
    acker: &Arc<dyn AckSink>,
) -> Vec<(Arc<dyn MessageHandler>, Message)> {
    let durable = target.durable;
    let now = Instant::now();

    let expired: Vec<u64> = consumer
        .pending
        .iter()
        .filter(|(_, p)| p.deadline <= now)
        .map(|(seq, _)| *seq)
        .collect();
    for sequence in expired {
        if let Some(pending) = consumer.pending.remove(&sequence) {
            debug!(durable = durable, sequence = sequence, "Ack deadline passed, redelivering");
            consumer.redeliver.insert(
                sequence,
                Redelivery {
                    ready_at: now,
                    deliveries: pending.deliveries,
                },
            );
        }
    }

    let mut out = Vec::new();
    while consumer.pending.len() < options.max_ack_pending {
        let ready = consumer
            .redeliver
            .iter()
            .find(|(_, r)| r.ready_at <= now)
            .map(|(seq, r)| (*seq, r.deliveries));

        let (sequence, previous_deliveries) = match ready {
            Some((sequence, deliveries)) => {
                consumer.redeliver.remove(&sequence);
                (sequence, deliveries)
            }
            None => {
                let next = messages
                    .range(consumer.delivered_through + 1..)
                    .find(|(_, m)| m.interest.contains(durable))
                    .map(|(seq, _)| *seq);
                match next {
                    Some(sequence) => {
                        consumer.delivered_through = sequence;
                        (sequence, 0)
                    }
                    None => {
                        consumer.delivered_through = consumer.delivered_through.max(last_sequence);
                        break;
                    }
                }
            }
        };

        let Some(stored) = messages.get(&sequence) else {
            continue;
        };

        let deliveries = previous_deliveries + 1;
        if options.max_deliver > 0 && deliveries > options.max_deliver {
            warn!(
                durable = durable,
                sequence = sequence,
                max_deliver = options.max_deliver,
                "Max deliveries reached, giving up on message"
            );
            release_interest(messages, target.journal, target.stream, sequence, durable);
            continue;
        }

        let member = &consumer.members[consumer.next_member % consumer.members.len()];
        consumer.next_member = consumer.next_member.wrapping_add(1);

        out.push((
            member.handler.clone(),
            Message::new(
                stored.subject.clone(),
                stored.payload.clone(),
                sequence,
                deliveries,
                acker.clone(),
            ),
        ));
        consumer.pending.insert(
            sequence,
            PendingDelivery {
                deadline: now + options.ack_wait,
                deliveries,
            },
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SqliteJournal;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn logs_stream() -> StreamConfig {
        StreamConfig {
            name: "LOGS".to_string(),
            subjects: vec!["log.events".to_string()],
        }
    }

    async fn test_bus(options: BusOptions) -> MemoryBus {
        let bus = MemoryBus::new(options);
        bus.ensure_stream(logs_stream()).await.unwrap();
        bus
    }

    /// Collects payloads, acking (or nak-ing the first `nak_first` deliveries)
    struct Collector {
        received: Mutex<Vec<Vec<u8>>>,
        nak_first: AtomicUsize,
        ack: bool,
    }

    impl Collector {
        fn acking() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                nak_first: AtomicUsize::new(0),
                ack: true,
            })
        }

        fn silent() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                nak_first: AtomicUsize::new(0),
                ack: false,
            })
        }

        fn count(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MessageHandler for Collector {
        async fn handle(&self, message: Message) {
            self.received.lock().unwrap().push(message.payload().to_vec());
            if self.nak_first.load(Ordering::SeqCst) > 0 {
                self.nak_first.fetch_sub(1, Ordering::SeqCst);
                message.nak();
            } else if self.ack {
                message.ack();
            }
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_ensure_stream_is_idempotent() {
        let bus = MemoryBus::new(BusOptions::default());
        let created = bus
            .ensure_stream(StreamConfig {
                name: "LOGS".to_string(),
                subjects: vec!["old.subject".to_string()],
            })
            .await
            .unwrap();
        assert!(created);

        let created = bus.ensure_stream(logs_stream()).await.unwrap();
        assert!(!created);

        let info = bus.stream_info("LOGS").unwrap();
        assert_eq!(info.subjects, vec!["log.events".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_without_stream_fails() {
        let bus = MemoryBus::new(BusOptions::default());
        let err = bus.publish("log.events", b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, BusError::NoStream(_)));
    }

    #[tokio::test]
    async fn test_different_queue_groups_each_receive_every_message() {
        let bus = test_bus(BusOptions::default()).await;
        let archiver = Collector::acking();
        let hot = Collector::acking();

        let _a = bus
            .subscribe("log.events", "archiver", "archiver", archiver.clone())
            .await
            .unwrap();
        let _h = bus
            .subscribe("log.events", "hot", "hot", hot.clone())
            .await
            .unwrap();

        for i in 0..5 {
            bus.publish("log.events", vec![i]).await.unwrap();
        }

        wait_until(|| archiver.count() == 5 && hot.count() == 5).await;
    }

    #[tokio::test]
    async fn test_same_queue_group_splits_messages() {
        let bus = test_bus(BusOptions::default()).await;
        let first = Collector::acking();
        let second = Collector::acking();

        let _s1 = bus
            .subscribe("log.events", "workers", "workers", first.clone())
            .await
            .unwrap();
        let _s2 = bus
            .subscribe("log.events", "workers", "workers", second.clone())
            .await
            .unwrap();

        for i in 0..10 {
            bus.publish("log.events", vec![i]).await.unwrap();
        }

        wait_until(|| first.count() + second.count() == 10).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(first.count() + second.count(), 10);
        assert!(first.count() > 0 && second.count() > 0);
    }

    #[tokio::test]
    async fn test_interest_retention_discards_after_all_acks() {
        let bus = test_bus(BusOptions::default()).await;
        let fast = Collector::acking();
        let silent = Collector::silent();

        let _f = bus
            .subscribe("log.events", "fast", "fast", fast.clone())
            .await
            .unwrap();
        let _s = bus
            .subscribe("log.events", "silent", "silent", silent.clone())
            .await
            .unwrap();

        bus.publish("log.events", b"one".to_vec()).await.unwrap();
        wait_until(|| fast.count() == 1 && silent.count() == 1).await;

        // Still retained: "silent" never acknowledged
        assert_eq!(bus.stream_info("LOGS").unwrap().messages, 1);
    }

    #[tokio::test]
    async fn test_message_without_interest_is_not_retained() {
        let bus = test_bus(BusOptions::default()).await;
        bus.publish("log.events", b"nobody".to_vec()).await.unwrap();

        let info = bus.stream_info("LOGS").unwrap();
        assert_eq!(info.messages, 0);
        assert_eq!(info.last_sequence, 1);
    }

    #[tokio::test]
    async fn test_nak_triggers_redelivery() {
        let bus = test_bus(BusOptions::default()).await;
        let collector = Arc::new(Collector {
            received: Mutex::new(Vec::new()),
            nak_first: AtomicUsize::new(2),
            ack: true,
        });

        let _s = bus
            .subscribe("log.events", "hot", "hot", collector.clone())
            .await
            .unwrap();
        bus.publish("log.events", b"retry-me".to_vec()).await.unwrap();

        wait_until(|| collector.count() == 3).await;
        wait_until(|| bus.stream_info("LOGS").unwrap().messages == 0).await;
    }

    #[tokio::test]
    async fn test_unacked_message_redelivered_after_ack_wait() {
        let bus = test_bus(BusOptions {
            ack_wait: Duration::from_millis(100),
            ..BusOptions::default()
        })
        .await;

        struct AckOnSecond {
            deliveries: Mutex<Vec<u32>>,
        }

        #[async_trait]
        impl MessageHandler for AckOnSecond {
            async fn handle(&self, message: Message) {
                let count = message.delivery_count();
                self.deliveries.lock().unwrap().push(count);
                if count >= 2 {
                    message.ack();
                }
                // first delivery dropped without a decision
            }
        }

        let handler = Arc::new(AckOnSecond {
            deliveries: Mutex::new(Vec::new()),
        });
        let _s = bus
            .subscribe("log.events", "hot", "hot", handler.clone())
            .await
            .unwrap();
        bus.publish("log.events", b"slow".to_vec()).await.unwrap();

        wait_until(|| handler.deliveries.lock().unwrap().len() == 2).await;
        assert_eq!(*handler.deliveries.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_max_deliver_gives_up() {
        let bus = test_bus(BusOptions {
            max_deliver: 2,
            ..BusOptions::default()
        })
        .await;
        let collector = Arc::new(Collector {
            received: Mutex::new(Vec::new()),
            nak_first: AtomicUsize::new(usize::MAX),
            ack: true,
        });

        let _s = bus
            .subscribe("log.events", "hot", "hot", collector.clone())
            .await
            .unwrap();
        bus.publish("log.events", b"poison".to_vec()).await.unwrap();

        wait_until(|| bus.stream_info("LOGS").unwrap().messages == 0).await;
        assert_eq!(collector.count(), 2);
    }

    #[tokio::test]
    async fn test_durable_cursor_survives_resubscribe() {
        let bus = test_bus(BusOptions::default()).await;
        let first = Collector::acking();
        let sub = bus
            .subscribe("log.events", "hot", "hot", first.clone())
            .await
            .unwrap();
        bus.publish("log.events", b"a".to_vec()).await.unwrap();
        wait_until(|| first.count() == 1).await;
        sub.unsubscribe();

        // Published while no member is connected: retained for the durable
        bus.publish("log.events", b"b".to_vec()).await.unwrap();
        assert_eq!(bus.stream_info("LOGS").unwrap().messages, 1);

        let second = Collector::acking();
        let _sub = bus
            .subscribe("log.events", "hot", "hot", second.clone())
            .await
            .unwrap();
        wait_until(|| second.count() == 1).await;
        assert_eq!(second.received.lock().unwrap()[0], b"b".to_vec());
    }

    #[tokio::test]
    async fn test_durable_binding_mismatch_rejected() {
        let bus = test_bus(BusOptions::default()).await;
        let _s = bus
            .subscribe("log.events", "hot", "hot", Collector::acking())
            .await
            .unwrap();
        let err = bus
            .subscribe("log.events", "other", "hot", Collector::acking())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BusError::ConsumerMismatch { .. }));
    }

    #[tokio::test]
    async fn test_ephemeral_delivers_only_new_messages() {
        let bus = test_bus(BusOptions::default()).await;
        let _durable = bus
            .subscribe("log.events", "hot", "hot", Collector::acking())
            .await
            .unwrap();

        bus.publish("log.events", b"before".to_vec()).await.unwrap();
        let mut tail = bus.subscribe_ephemeral("log.events", 10).await.unwrap();
        bus.publish("log.events", b"after".to_vec()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), tail.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"after".to_vec());
    }

    #[tokio::test]
    async fn test_ephemeral_full_buffer_drops_newest() {
        let bus = test_bus(BusOptions::default()).await;
        let mut tail = bus.subscribe_ephemeral("log.events", 2).await.unwrap();

        for payload in [b"1", b"2", b"3"] {
            bus.publish("log.events", payload.to_vec()).await.unwrap();
        }

        assert_eq!(tail.take_dropped(), 1);
        assert_eq!(tail.recv().await.unwrap(), b"1".to_vec());
        assert_eq!(tail.recv().await.unwrap(), b"2".to_vec());
        bus.publish("log.events", b"4".to_vec()).await.unwrap();
        assert_eq!(tail.recv().await.unwrap(), b"4".to_vec());
        assert_eq!(tail.take_dropped(), 0);
    }

    #[tokio::test]
    async fn test_ephemeral_drop_unsubscribes() {
        let bus = test_bus(BusOptions::default()).await;
        let tail = bus.subscribe_ephemeral("log.events", 4).await.unwrap();
        assert_eq!(bus.ephemeral_count("LOGS"), 1);
        drop(tail);
        assert_eq!(bus.ephemeral_count("LOGS"), 0);
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_publish() {
        let bus = test_bus(BusOptions::default()).await;
        bus.close();
        assert!(matches!(
            bus.publish("log.events", vec![]).await,
            Err(BusError::Closed)
        ));
    }

    async fn file_journal(dir: &tempfile::TempDir) -> Arc<SqliteJournal> {
        let url = format!("sqlite:{}", dir.path().join("bus.db").display());
        Arc::new(SqliteJournal::connect(&url).await.unwrap())
    }

    #[tokio::test]
    async fn test_unacked_messages_replay_after_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let journal = file_journal(&dir).await;
            let bus = MemoryBus::open(BusOptions::default(), journal.clone())
                .await
                .unwrap();
            bus.ensure_stream(logs_stream()).await.unwrap();

            let archiver = Collector::acking();
            let hot = Collector::silent();
            let _a = bus
                .subscribe("log.events", "archiver", "archiver", archiver.clone())
                .await
                .unwrap();
            let _h = bus
                .subscribe("log.events", "hot", "hot", hot.clone())
                .await
                .unwrap();

            bus.publish("log.events", b"a".to_vec()).await.unwrap();
            bus.publish("log.events", b"b".to_vec()).await.unwrap();
            wait_until(|| archiver.count() == 2 && hot.count() == 2).await;

            bus.shutdown(Duration::from_secs(1)).await;
            journal.close().await;
        }

        let journal = file_journal(&dir).await;
        let bus = MemoryBus::open(BusOptions::default(), journal).await.unwrap();
        let info = bus.stream_info("LOGS").unwrap();
        assert_eq!(info.messages, 2);
        assert_eq!(info.last_sequence, 2);
        assert_eq!(info.consumers, vec!["archiver".to_string(), "hot".to_string()]);

        let archiver = Collector::acking();
        let hot = Collector::acking();
        let _a = bus
            .subscribe("log.events", "archiver", "archiver", archiver.clone())
            .await
            .unwrap();
        let _h = bus
            .subscribe("log.events", "hot", "hot", hot.clone())
            .await
            .unwrap();

        wait_until(|| hot.count() == 2).await;
        assert_eq!(
            *hot.received.lock().unwrap(),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        wait_until(|| bus.stream_info("LOGS").unwrap().messages == 0).await;
        // Already acknowledged before the restart
        assert_eq!(archiver.count(), 0);

        bus.publish("log.events", b"c".to_vec()).await.unwrap();
        assert_eq!(bus.stream_info("LOGS").unwrap().last_sequence, 3);
        wait_until(|| archiver.count() == 1 && hot.count() == 3).await;
    }

    #[tokio::test]
    async fn test_reopen_keeps_consumer_binding() {
        let dir = tempfile::tempdir().unwrap();
        {
            let bus = MemoryBus::open(BusOptions::default(), file_journal(&dir).await)
                .await
                .unwrap();
            bus.ensure_stream(logs_stream()).await.unwrap();
            let _s = bus
                .subscribe("log.events", "hot", "hot", Collector::acking())
                .await
                .unwrap();
            bus.shutdown(Duration::from_secs(1)).await;
        }

        let bus = MemoryBus::open(BusOptions::default(), file_journal(&dir).await)
            .await
            .unwrap();
        let err = bus
            .subscribe("log.events", "other", "hot", Collector::acking())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BusError::ConsumerMismatch { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_handlers() {
        struct Slow {
            started: AtomicBool,
            finished: AtomicBool,
        }

        #[async_trait]
        impl MessageHandler for Slow {
            async fn handle(&self, message: Message) {
                self.started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                message.ack();
                self.finished.store(true, Ordering::SeqCst);
            }
        }

        let bus = test_bus(BusOptions::default()).await;
        let handler = Arc::new(Slow {
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });
        let _s = bus
            .subscribe("log.events", "hot", "hot", handler.clone())
            .await
            .unwrap();
        bus.publish("log.events", b"slow".to_vec()).await.unwrap();
        wait_until(|| handler.started.load(Ordering::SeqCst)).await;

        bus.shutdown(Duration::from_secs(5)).await;
        assert!(handler.finished.load(Ordering::SeqCst));
        assert_eq!(bus.stream_info("LOGS").unwrap().messages, 0);
    }
}
