//! Live-tail fan-out
//!
//! Each client owns one ephemeral deliver-new subscription with a bounded
//! buffer. The pump forwards records to a `TailSink` and probes liveness
//! on a fixed interval. Whatever ends the session, the subscription is
//! dropped on return, which is the only teardown path.

use crate::bus::{BusError, EphemeralSubscription, EventBus};
use crate::model::LogRecord;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_TAIL_BUFFER: usize = 100;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error("failed to subscribe to logs: {0}")]
    Subscribe(#[from] BusError),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Outbound side of a tail client's transport
#[async_trait]
pub trait TailSink: Send {
    /// Send one record as a JSON text frame
    async fn send_record(&mut self, json: String) -> Result<(), TailError>;

    async fn send_ping(&mut self) -> Result<(), TailError>;
}

/// Inbound-activity flag shared between the transport reader and the pump
#[derive(Debug, Clone, Default)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the reader for every inbound frame (pong or otherwise)
    pub fn mark_inbound(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn take_inbound(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Why a tail session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailEnd {
    /// Cancellation fired (client gone, handler exit or server shutdown)
    Cancelled,
    /// No inbound frame since the previous probe
    LivenessFailed,
    /// Sending a record or ping failed
    SendFailed,
    /// The bus side of the subscription went away
    BusClosed,
}

#[derive(Debug, Clone)]
pub struct TailSettings {
    pub buffer: usize,
    pub ping_interval: Duration,
}

impl Default for TailSettings {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_TAIL_BUFFER,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

pub struct LiveTail {
    bus: Arc<dyn EventBus>,
    subject: String,
    settings: TailSettings,
}

impl LiveTail {
    pub fn new(bus: Arc<dyn EventBus>, subject: impl Into<String>, settings: TailSettings) -> Self {
        Self {
            bus,
            subject: subject.into(),
            settings,
        }
    }

    pub fn settings(&self) -> &TailSettings {
        &self.settings
    }

    /// Open a deliver-new subscription for one client
    pub async fn subscribe(&self) -> Result<EphemeralSubscription, TailError> {
        Ok(self
            .bus
            .subscribe_ephemeral(&self.subject, self.settings.buffer)
            .await?)
    }

    /// Forward records to `sink` until the session ends
    ///
    /// Consumes the subscription; it is released when this returns.
    pub async fn pump<S: TailSink>(
        &self,
        mut subscription: EphemeralSubscription,
        sink: &mut S,
        liveness: Liveness,
        cancel: CancellationToken,
    ) -> TailEnd {
        let period = self.settings.ping_interval;
        let mut probe = interval_at(Instant::now() + period, period);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probed_before = false;

        crate::metrics::tail_session_opened();
        info!(subject = %self.subject, "Tail session started");

        let end = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break TailEnd::Cancelled,

                _ = probe.tick() => {
                    if probed_before && !liveness.take_inbound() {
                        break TailEnd::LivenessFailed;
                    }
                    liveness.take_inbound();
                    probed_before = true;
                    if sink.send_ping().await.is_err() {
                        break TailEnd::SendFailed;
                    }
                }

                payload = subscription.recv() => {
                    crate::metrics::record_tail_drops(subscription.take_dropped());
                    let Some(payload) = payload else {
                        break TailEnd::BusClosed;
                    };
                    let json = match LogRecord::from_slice(&payload)
                        .and_then(|record| Ok(serde_json::to_string(&record)?))
                    {
                        Ok(json) => json,
                        Err(e) => {
                            debug!(error = %e, "Skipping undecodable tail record");
                            continue;
                        }
                    };
                    if sink.send_record(json).await.is_err() {
                        break TailEnd::SendFailed;
                    }
                }
            }
        };

        crate::metrics::record_tail_drops(subscription.take_dropped());
        drop(subscription);
        crate::metrics::tail_session_closed();
        info!(subject = %self.subject, reason = ?end, "Tail session ended");
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusOptions, MemoryBus, StreamConfig, LOG_STREAM, LOG_SUBJECT};

    #[derive(Default)]
    struct CollectingSink {
        records: Vec<LogRecord>,
        pings: usize,
        fail_sends: bool,
    }

    #[async_trait]
    impl TailSink for CollectingSink {
        async fn send_record(&mut self, json: String) -> Result<(), TailError> {
            if self.fail_sends {
                return Err(TailError::Transport("broken pipe".into()));
            }
            self.records.push(LogRecord::from_slice(json.as_bytes()).unwrap());
            Ok(())
        }

        async fn send_ping(&mut self) -> Result<(), TailError> {
            if self.fail_sends {
                return Err(TailError::Transport("broken pipe".into()));
            }
            self.pings += 1;
            Ok(())
        }
    }

    async fn setup(ping_interval: Duration) -> (Arc<MemoryBus>, LiveTail) {
        let bus = Arc::new(MemoryBus::new(BusOptions::default()));
        bus.ensure_stream(StreamConfig {
            name: LOG_STREAM.to_string(),
            subjects: vec![LOG_SUBJECT.to_string()],
        })
        .await
        .unwrap();
        let tail = LiveTail::new(
            bus.clone(),
            LOG_SUBJECT,
            TailSettings {
                buffer: 16,
                ping_interval,
            },
        );
        (bus, tail)
    }

    fn payload(message: &str) -> Vec<u8> {
        LogRecord::new("info", message).to_json_vec().unwrap()
    }

    #[tokio::test]
    async fn test_only_records_after_subscription_are_delivered() {
        let (bus, tail) = setup(Duration::from_secs(30)).await;

        bus.publish(LOG_SUBJECT, payload("before")).await.unwrap();
        let subscription = tail.subscribe().await.unwrap();
        bus.publish(LOG_SUBJECT, payload("after")).await.unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });

        let mut sink = CollectingSink::default();
        let end = tail
            .pump(subscription, &mut sink, Liveness::new(), cancel)
            .await;

        assert_eq!(end, TailEnd::Cancelled);
        let messages: Vec<_> = sink.records.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["after"]);
    }

    #[tokio::test]
    async fn test_teardown_unsubscribes() {
        let (bus, tail) = setup(Duration::from_secs(30)).await;
        let subscription = tail.subscribe().await.unwrap();
        assert_eq!(bus.ephemeral_count(LOG_STREAM), 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = CollectingSink::default();
        tail.pump(subscription, &mut sink, Liveness::new(), cancel)
            .await;

        assert_eq!(bus.ephemeral_count(LOG_STREAM), 0);
    }

    #[tokio::test]
    async fn test_silent_client_fails_liveness() {
        let (bus, tail) = setup(Duration::from_millis(20)).await;
        let subscription = tail.subscribe().await.unwrap();

        let mut sink = CollectingSink::default();
        let end = tail
            .pump(subscription, &mut sink, Liveness::new(), CancellationToken::new())
            .await;

        assert_eq!(end, TailEnd::LivenessFailed);
        assert_eq!(sink.pings, 1);
        assert_eq!(bus.ephemeral_count(LOG_STREAM), 0);
    }

    #[tokio::test]
    async fn test_responsive_client_stays_connected() {
        let (_bus, tail) = setup(Duration::from_millis(20)).await;
        let subscription = tail.subscribe().await.unwrap();

        let liveness = Liveness::new();
        let responder = liveness.clone();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                responder.mark_inbound();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopper.cancel();
        });

        let mut sink = CollectingSink::default();
        let end = tail.pump(subscription, &mut sink, liveness, cancel).await;

        assert_eq!(end, TailEnd::Cancelled);
        assert!(sink.pings >= 2);
    }

    #[tokio::test]
    async fn test_send_failure_ends_session() {
        let (bus, tail) = setup(Duration::from_secs(30)).await;
        let subscription = tail.subscribe().await.unwrap();
        bus.publish(LOG_SUBJECT, payload("x")).await.unwrap();

        let mut sink = CollectingSink {
            fail_sends: true,
            ..Default::default()
        };
        let end = tail
            .pump(subscription, &mut sink, Liveness::new(), CancellationToken::new())
            .await;

        assert_eq!(end, TailEnd::SendFailed);
        assert_eq!(bus.ephemeral_count(LOG_STREAM), 0);
    }
}
