//! In-memory transports for exercising the relay without Postgres or RabbitMQ.
//!
//! [`RecordingBus`] records every publish and can be told to fail, stall, or
//! close its channels. [`ScriptedSource`] delivers payloads pushed through its
//! handle and can simulate dropped connections.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use botberi_events::{DomainEventEnvelope, ParseError};
use tokio::sync::{mpsc, watch, Notify};

use crate::bus::{BusChannel, MessageBus, OutboundMessage};
use crate::error::{BusError, ConnectionError};
use crate::source::{NotificationSource, NotificationStream, SourceSignal};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Recording Bus
// =============================================================================

/// A message captured by [`RecordingBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: String,
}

impl PublishedMessage {
    /// Decode the body back into an envelope.
    pub fn envelope(&self) -> Result<DomainEventEnvelope, ParseError> {
        let text = std::str::from_utf8(&self.body)
            .map_err(|err| ParseError::Malformed(err.to_string()))?;
        DomainEventEnvelope::parse(text)
    }
}

#[derive(Clone)]
pub struct RecordingBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    published: Mutex<Vec<PublishedMessage>>,
    declarations: Mutex<Vec<String>>,
    channels: Mutex<Vec<Arc<RecordingChannel>>>,
    publish_attempts: AtomicUsize,
    failing_publishes: AtomicU32,
    failing_opens: AtomicU32,
    publish_delay: Mutex<Duration>,
    gate: watch::Sender<bool>,
    closed: AtomicBool,
    published_notify: Notify,
}

impl Default for RecordingBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBus {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner: Arc::new(BusInner {
                published: Mutex::new(Vec::new()),
                declarations: Mutex::new(Vec::new()),
                channels: Mutex::new(Vec::new()),
                publish_attempts: AtomicUsize::new(0),
                failing_publishes: AtomicU32::new(0),
                failing_opens: AtomicU32::new(0),
                publish_delay: Mutex::new(Duration::ZERO),
                gate,
                closed: AtomicBool::new(false),
                published_notify: Notify::new(),
            }),
        }
    }

    /// Fail the next `count` publish calls with a transport error.
    pub fn fail_publishes(&self, count: u32) {
        self.inner.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` channel opens with a transport error.
    pub fn fail_channel_opens(&self, count: u32) {
        self.inner.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Delay every publish by `delay` before recording it.
    pub fn set_publish_delay(&self, delay: Duration) {
        *lock(&self.inner.publish_delay) = delay;
    }

    /// Make publishes wait until [`RecordingBus::resume_publishes`] is called.
    pub fn pause_publishes(&self) {
        self.inner.gate.send_replace(false);
    }

    pub fn resume_publishes(&self) {
        self.inner.gate.send_replace(true);
    }

    /// Mark every open channel closed, as if the broker dropped them.
    pub fn close_open_channels(&self) {
        for channel in lock(&self.inner.channels).iter() {
            channel.open.store(false, Ordering::SeqCst);
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.inner.published).clone()
    }

    pub fn publish_attempts(&self) -> usize {
        self.inner.publish_attempts.load(Ordering::SeqCst)
    }

    /// Exchange names in declaration order.
    pub fn exchange_declarations(&self) -> Vec<String> {
        lock(&self.inner.declarations).clone()
    }

    pub fn channels_opened(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    pub fn open_channel_count(&self) -> usize {
        lock(&self.inner.channels)
            .iter()
            .filter(|channel| channel.is_open())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` messages were published or `timeout` passes,
    /// then return everything published so far.
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> Vec<PublishedMessage> {
        let wait = async {
            loop {
                let notified = self.inner.published_notify.notified();
                if lock(&self.inner.published).len() >= count {
                    return;
                }
                notified.await;
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        self.published()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn open_channel(&self) -> Result<Arc<dyn BusChannel>, BusError> {
        if Self::take_failure(&self.inner.failing_opens) {
            return Err(BusError::transport("injected channel open failure"));
        }
        self.inner.closed.store(false, Ordering::SeqCst);

        let channel = Arc::new(RecordingChannel {
            bus: Arc::clone(&self.inner),
            open: AtomicBool::new(true),
        });
        lock(&self.inner.channels).push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close(&self) -> Result<(), BusError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.close_open_channels();
        Ok(())
    }
}

struct RecordingChannel {
    bus: Arc<BusInner>,
    open: AtomicBool,
}

#[async_trait]
impl BusChannel for RecordingChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.bus.closed.load(Ordering::SeqCst)
    }

    async fn declare_topic_exchange(&self, name: &str) -> Result<(), BusError> {
        lock(&self.bus.declarations).push(name.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), BusError> {
        self.bus.publish_attempts.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.bus.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let delay = *lock(&self.bus.publish_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !self.is_open() {
            return Err(BusError::ChannelClosed);
        }
        if RecordingBus::take_failure(&self.bus.failing_publishes) {
            return Err(BusError::transport("injected publish failure"));
        }

        lock(&self.bus.published).push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: message.body.clone(),
            content_type: message.content_type.to_string(),
        });
        self.bus.published_notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Scripted Source
// =============================================================================

enum Scripted {
    Notify(String),
    Lose,
    Fail(String),
}

/// A [`NotificationSource`] fed from the test through its own methods.
#[derive(Clone)]
pub struct ScriptedSource {
    inner: Arc<SourceInner>,
}

struct SourceInner {
    tx: mpsc::UnboundedSender<Scripted>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Scripted>>>,
    failing_subscribes: AtomicU32,
    subscribed_channel: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSource {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SourceInner {
                tx,
                rx: Mutex::new(Some(rx)),
                failing_subscribes: AtomicU32::new(0),
                subscribed_channel: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Deliver a raw payload.
    pub fn notify(&self, payload: impl Into<String>) {
        let _ = self.inner.tx.send(Scripted::Notify(payload.into()));
    }

    /// Simulate a connection that dropped and came straight back.
    pub fn drop_connection(&self) {
        let _ = self.inner.tx.send(Scripted::Lose);
    }

    /// Make the next receive fail, as if the connection dropped and could not
    /// be re-established. The receive after that reports the reconnect.
    pub fn fail_next_receive(&self, reason: impl Into<String>) {
        let _ = self.inner.tx.send(Scripted::Fail(reason.into()));
    }

    /// Fail the next `count` subscribe calls.
    pub fn fail_subscribes(&self, count: u32) {
        self.inner.failing_subscribes.store(count, Ordering::SeqCst);
    }

    pub fn subscribed_channel(&self) -> Option<String> {
        lock(&self.inner.subscribed_channel).clone()
    }

    /// Whether the subscription has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSource for ScriptedSource {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn NotificationStream>, ConnectionError> {
        if RecordingBus::take_failure(&self.inner.failing_subscribes) {
            return Err(ConnectionError::source_error("injected subscribe failure"));
        }
        let rx = lock(&self.inner.rx)
            .take()
            .ok_or_else(|| ConnectionError::source_error("scripted source already subscribed"))?;

        *lock(&self.inner.subscribed_channel) = Some(channel.to_string());
        self.inner.closed.store(false, Ordering::SeqCst);

        Ok(Box::new(ScriptedStream {
            rx: Some(rx),
            source: Arc::clone(&self.inner),
            reconnect_pending: false,
        }))
    }
}

struct ScriptedStream {
    rx: Option<mpsc::UnboundedReceiver<Scripted>>,
    source: Arc<SourceInner>,
    reconnect_pending: bool,
}

#[async_trait]
impl NotificationStream for ScriptedStream {
    async fn next_signal(&mut self) -> Result<SourceSignal, ConnectionError> {
        if self.reconnect_pending {
            self.reconnect_pending = false;
            return Ok(SourceSignal::Reconnected);
        }
        let Some(rx) = self.rx.as_mut() else {
            return Err(ConnectionError::source_error("scripted stream closed"));
        };
        match rx.recv().await {
            Some(Scripted::Notify(payload)) => Ok(SourceSignal::Notification(payload)),
            Some(Scripted::Lose) => Ok(SourceSignal::Reconnected),
            Some(Scripted::Fail(reason)) => {
                self.reconnect_pending = true;
                Err(ConnectionError::source_error(reason))
            }
            None => Err(ConnectionError::source_error("scripted source dropped")),
        }
    }

    async fn close(mut self: Box<Self>) -> Result<(), ConnectionError> {
        // Hand the receiver back so the source can be subscribed again.
        if let Some(rx) = self.rx.take() {
            *lock(&self.source.rx) = Some(rx);
        }
        self.source.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
