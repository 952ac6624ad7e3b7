use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use mirrex_model::{BucketId, FileId};

use crate::error::Result;
use crate::replication::events::{EventPublisher, ReplicationEvent};

/// Lightweight in-process event bus that fans replication events out to
/// observers inside the process. External transports (WebSocket broadcast,
/// dashboards) subscribe here; lagging subscribers lose events rather than
/// applying backpressure to the core.
pub struct InProcEventBus {
    sender: broadcast::Sender<ReplicationEvent>,
    channel_capacity: usize,
}

impl fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("channel_capacity", &self.channel_capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            channel_capacity: capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for InProcEventBus {
    async fn publish(&self, event: ReplicationEvent) -> Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Stream trait so generic consumers can subscribe without depending on the
/// concrete bus type.
pub trait EventStream {
    fn subscribe_events(&self) -> broadcast::Receiver<ReplicationEvent>;
}

impl EventStream for InProcEventBus {
    fn subscribe_events(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.subscribe()
    }
}

type ProgressKey = (BucketId, FileId);

/// Publisher decorator that coalesces the per-file progress stream.
///
/// Non-progress events pass straight through. Progress events are stashed
/// per file and flushed on a fixed cadence; the terminal progress report
/// (bytes == size) bypasses the stash so completion is never delayed.
pub struct ProgressBatcher {
    inner: Arc<dyn EventPublisher>,
    pending: Arc<Mutex<HashMap<ProgressKey, ReplicationEvent>>>,
    cancel: CancellationToken,
}

impl fmt::Debug for ProgressBatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressBatcher")
            .field("pending", &self.pending.lock().len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ProgressBatcher {
    pub fn new(inner: Arc<dyn EventPublisher>, flush_interval: Duration) -> Self {
        let pending: Arc<Mutex<HashMap<ProgressKey, ReplicationEvent>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let flush_pending = Arc::clone(&pending);
        let flush_inner = Arc::clone(&inner);
        let flush_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = flush_cancel.cancelled() => break,
                    _ = tokio::time::sleep(flush_interval) => {}
                }
                let batch: Vec<ReplicationEvent> = {
                    let mut guard = flush_pending.lock();
                    guard.drain().map(|(_, event)| event).collect()
                };
                for event in batch {
                    let _ = flush_inner.publish(event).await;
                }
            }
        });

        Self {
            inner,
            pending,
            cancel,
        }
    }
}

impl Drop for ProgressBatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl EventPublisher for ProgressBatcher {
    async fn publish(&self, event: ReplicationEvent) -> Result<()> {
        if let ReplicationEvent::CopyProgress {
            bucket_id,
            file_id,
            bytes_copied,
            file_size,
            ..
        } = &event
        {
            if bytes_copied < file_size {
                self.pending
                    .lock()
                    .insert((*bucket_id, *file_id), event);
                return Ok(());
            }
            // Terminal progress: drop anything stashed and send straight away.
            self.pending.lock().remove(&(*bucket_id, *file_id));
        }
        self.inner.publish(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrex_model::FileStatus;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn bus_fans_out_to_subscribers() {
        let bus = InProcEventBus::new(8);
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        bus.publish(ReplicationEvent::status_change(
            BucketId(1),
            FileId(2),
            FileStatus::Completed,
            "/srv/a.txt",
        ))
        .await
        .unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(
                event,
                ReplicationEvent::StatusChange {
                    status: FileStatus::Completed,
                    ..
                }
            ));
        }
    }

    #[tokio::test]
    async fn batcher_coalesces_intermediate_progress() {
        let bus = Arc::new(InProcEventBus::new(16));
        let mut rx = bus.subscribe();
        let batcher =
            ProgressBatcher::new(bus.clone(), Duration::from_millis(20));

        for bytes in [10u64, 20, 30] {
            batcher
                .publish(ReplicationEvent::copy_progress(
                    BucketId(1),
                    FileId(5),
                    bytes,
                    100,
                ))
                .await
                .unwrap();
        }

        // Only the most recent stashed report survives the flush.
        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ReplicationEvent::CopyProgress { bytes_copied, .. } => {
                assert_eq!(bytes_copied, 30)
            }
            other => panic!("unexpected event: {other:?}"),
        }

        sleep(Duration::from_millis(40)).await;
        assert!(rx.try_recv().is_err(), "no duplicate flushes expected");
    }

    #[tokio::test]
    async fn terminal_progress_bypasses_batching() {
        let bus = Arc::new(InProcEventBus::new(16));
        let mut rx = bus.subscribe();
        let batcher = ProgressBatcher::new(bus.clone(), Duration::from_secs(3600));

        batcher
            .publish(ReplicationEvent::copy_progress(
                BucketId(1),
                FileId(5),
                40,
                100,
            ))
            .await
            .unwrap();
        batcher
            .publish(ReplicationEvent::copy_progress(
                BucketId(1),
                FileId(5),
                100,
                100,
            ))
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ReplicationEvent::CopyProgress {
                bytes_copied,
                percent,
                ..
            } => {
                assert_eq!(bytes_copied, 100);
                assert_eq!(percent, 100.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
