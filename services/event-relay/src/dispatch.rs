//! Bounded, routing-key-sharded publish workers.
//!
//! Each routing key hashes to one shard. A shard is a bounded queue drained by
//! a single worker, so envelopes with the same routing key are published in the
//! order they were received while different keys proceed in parallel. The
//! listener only enqueues; it never waits on a publish.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use botberi_events::DomainEventEnvelope;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::publisher::Publisher;

/// Sizing for the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Number of shards, one worker each.
    pub workers: usize,

    /// Queue bound per shard.
    pub queue_capacity: usize,

    /// How long the listener may wait on a full shard before dropping.
    pub enqueue_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            enqueue_timeout: Duration::from_secs(1),
        }
    }
}

/// Sending side, held by the listener.
pub struct Dispatcher {
    shards: Vec<mpsc::Sender<DomainEventEnvelope>>,
    enqueue_timeout: Duration,
}

/// Receiving side: the spawned publish workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

/// Spawn `config.workers` publish workers sharing `publisher`.
pub fn spawn_workers(publisher: Arc<Publisher>, config: &DispatchConfig) -> (Dispatcher, WorkerPool) {
    let workers = config.workers.max(1);
    let capacity = config.queue_capacity.max(1);

    let mut shards = Vec::with_capacity(workers);
    let mut handles = Vec::with_capacity(workers);

    for index in 0..workers {
        let (tx, rx) = mpsc::channel(capacity);
        shards.push(tx);
        handles.push(tokio::spawn(run_worker(index, rx, Arc::clone(&publisher))));
    }

    info!(workers, queue_capacity = capacity, "Started publish workers");

    (
        Dispatcher {
            shards,
            enqueue_timeout: config.enqueue_timeout,
        },
        WorkerPool { handles },
    )
}

async fn run_worker(
    index: usize,
    mut rx: mpsc::Receiver<DomainEventEnvelope>,
    publisher: Arc<Publisher>,
) {
    debug!(worker = index, "Publish worker started");

    while let Some(envelope) = rx.recv().await {
        if let Err(err) = publisher.publish(&envelope).await {
            error!(
                worker = index,
                routing_key = envelope.routing_key(),
                table = envelope.table(),
                op = envelope.raw_op().unwrap_or_default(),
                error = %err,
                "Dropping event after failed publish"
            );
        }
    }

    debug!(worker = index, "Publish worker stopped");
}

impl Dispatcher {
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard a routing key maps to. Stable for the life of the process.
    pub fn shard_for(&self, routing_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        routing_key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Queue an envelope on its shard.
    ///
    /// Waits at most the enqueue timeout when the shard is full, then gives up
    /// with [`DispatchError::QueueFull`].
    pub async fn dispatch(&self, envelope: DomainEventEnvelope) -> Result<(), DispatchError> {
        let shard = self.shard_for(envelope.routing_key());
        let sender = &self.shards[shard];

        match sender.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(DispatchError::Closed),
            Err(TrySendError::Full(envelope)) => {
                let routing_key = envelope.routing_key().to_string();
                debug!(shard, routing_key = %routing_key, "Publish queue full, waiting");

                match tokio::time::timeout(self.enqueue_timeout, sender.send(envelope)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(DispatchError::Closed),
                    Err(_) => Err(DispatchError::QueueFull { shard, routing_key }),
                }
            }
        }
    }
}

impl WorkerPool {
    /// Wait for the workers to drain their queues, aborting whatever is still
    /// running after `timeout`. The matching [`Dispatcher`] must be dropped
    /// first or the workers never see the end of their queues.
    pub async fn shutdown(mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;

        for handle in self.handles.iter_mut() {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                break;
            }
        }

        let abandoned = self
            .handles
            .iter()
            .filter(|handle| !handle.is_finished())
            .inspect(|handle| handle.abort())
            .count();

        if abandoned > 0 {
            warn!(abandoned, "Publish workers did not drain in time, aborted");
        } else {
            debug!("Publish workers drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use botberi_events::Operation;
    use serde_json::{json, Map};

    use super::*;
    use crate::retry::RetryPolicy;
    use crate::state::ConnectionMonitor;
    use crate::stats::RelayStats;
    use crate::testing::RecordingBus;

    fn envelope(routing_key: &str, seq: u64) -> DomainEventEnvelope {
        let mut data = Map::new();
        data.insert("seq".to_string(), json!(seq));
        DomainEventEnvelope::new(routing_key, "instances", Operation::Update, data).unwrap()
    }

    fn publisher(bus: &RecordingBus) -> Arc<Publisher> {
        let monitor = ConnectionMonitor::new("message_bus");
        Arc::new(Publisher::new(
            Arc::new(bus.clone()),
            "events.topic",
            RetryPolicy::default(),
            monitor.reporter(),
            Arc::new(RelayStats::new()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_routing_key_is_published_in_order() {
        let bus = RecordingBus::new();
        bus.set_publish_delay(Duration::from_millis(20));
        let config = DispatchConfig {
            workers: 4,
            ..Default::default()
        };
        let (dispatcher, pool) = spawn_workers(publisher(&bus), &config);

        let keys = ["instance.updated", "agent.updated", "knowledge_base_entry.updated"];
        for seq in 0..20 {
            for key in keys {
                dispatcher.dispatch(envelope(key, seq)).await.unwrap();
            }
        }

        let published = bus.wait_for_published(60, Duration::from_secs(30)).await;
        assert_eq!(published.len(), 60);

        let mut by_key: HashMap<String, Vec<u64>> = HashMap::new();
        for message in &published {
            let envelope = message.envelope().unwrap();
            let seq = envelope.data()["seq"].as_u64().unwrap();
            by_key.entry(message.routing_key.clone()).or_default().push(seq);
        }
        for key in keys {
            assert_eq!(by_key[key], (0..20).collect::<Vec<_>>(), "order for {key}");
        }

        drop(dispatcher);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shard_assignment_is_stable() {
        let bus = RecordingBus::new();
        let (dispatcher, pool) = spawn_workers(publisher(&bus), &DispatchConfig::default());

        let shard = dispatcher.shard_for("instance.created");
        for _ in 0..10 {
            assert_eq!(dispatcher.shard_for("instance.created"), shard);
        }
        assert!(shard < dispatcher.shard_count());

        drop(dispatcher);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_after_enqueue_timeout() {
        let bus = RecordingBus::new();
        bus.pause_publishes();
        let config = DispatchConfig {
            workers: 1,
            queue_capacity: 1,
            enqueue_timeout: Duration::from_millis(100),
        };
        let (dispatcher, pool) = spawn_workers(publisher(&bus), &config);

        // First envelope is taken by the worker and stalls in publish.
        dispatcher.dispatch(envelope("instance.updated", 0)).await.unwrap();
        while bus.publish_attempts() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // Second fills the queue; third has nowhere to go.
        dispatcher.dispatch(envelope("instance.updated", 1)).await.unwrap();
        let err = dispatcher
            .dispatch(envelope("instance.updated", 2))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull { shard: 0, .. }));

        bus.resume_publishes();
        let published = bus.wait_for_published(2, Duration::from_secs(5)).await;
        assert_eq!(published.len(), 2);

        drop(dispatcher);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_stalled_workers() {
        let bus = RecordingBus::new();
        bus.pause_publishes();
        let (dispatcher, pool) = spawn_workers(publisher(&bus), &DispatchConfig::default());

        dispatcher.dispatch(envelope("agent.created", 0)).await.unwrap();
        while bus.publish_attempts() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        drop(dispatcher);

        let start = Instant::now();
        pool.shutdown(Duration::from_millis(200)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(bus.published().is_empty());
    }
}
