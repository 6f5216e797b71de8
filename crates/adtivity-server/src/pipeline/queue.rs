use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use adtivity_core::config::PipelineConfig;
use adtivity_core::error::PipelineError;
use adtivity_core::event::{Batch, Event, IngestionId, ValidatedEvent};
use adtivity_core::metric::TimeRange;
use adtivity_core::store::AnalyticsStore;

use super::aggregator::{MetricsAggregator, RebuildReport};
use super::writer::{with_backoff, EventWriter};

enum Control {
    Flush(oneshot::Sender<()>),
    Rebuild(TimeRange, oneshot::Sender<Result<RebuildReport, PipelineError>>),
    Close(oneshot::Sender<()>),
}

/// One tenant's slice of the ingestion queue.
///
/// Producers allocate ingestion ids and send under `next_id`, so channel
/// order is id order. `pending` counts events admitted but not yet written
/// and aggregated; it never exceeds the configured capacity.
struct Lane {
    tenant_id: String,
    next_id: Mutex<IngestionId>,
    pending: AtomicUsize,
    events: mpsc::Sender<Event>,
    control: mpsc::UnboundedSender<Control>,
}

impl Lane {
    /// Admit all of `events` or none of them.
    fn admit(
        &self,
        events: Vec<ValidatedEvent>,
        received_at: DateTime<Utc>,
        capacity: usize,
        retry_after_secs: u64,
    ) -> Result<Vec<IngestionId>, PipelineError> {
        let mut next_id = self
            .next_id
            .lock()
            .map_err(|_| PipelineError::StoreUnavailable("ingestion lane poisoned".to_string()))?;

        let n = events.len();
        if self.events.is_closed() || self.pending.load(Ordering::Acquire) + n > capacity {
            return Err(PipelineError::Backpressure { retry_after_secs });
        }
        self.pending.fetch_add(n, Ordering::AcqRel);

        let mut ids = Vec::with_capacity(n);
        for (sent, validated) in events.into_iter().enumerate() {
            let id = *next_id;
            // Cannot fill up: channel occupancy is bounded by `pending`.
            if self
                .events
                .try_send(validated.into_event(id, received_at))
                .is_err()
            {
                self.pending.fetch_sub(n - sent, Ordering::AcqRel);
                return Err(PipelineError::StoreUnavailable(
                    "ingestion lane closed".to_string(),
                ));
            }
            *next_id += 1;
            ids.push(id);
        }
        Ok(ids)
    }
}

/// Drains one lane: batches by size or age, writes, aggregates.
struct LaneWorker {
    lane: Arc<Lane>,
    events: mpsc::Receiver<Event>,
    control: mpsc::UnboundedReceiver<Control>,
    writer: Arc<EventWriter>,
    aggregator: Arc<MetricsAggregator>,
    flush_max: usize,
    flush_interval: Duration,
    buffer: Vec<Event>,
    deadline: Option<Instant>,
}

impl LaneWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                control = self.control.recv() => match control {
                    Some(Control::Flush(done)) => {
                        self.drain_and_flush().await;
                        let _ = done.send(());
                    }
                    Some(Control::Rebuild(range, reply)) => {
                        self.drain_and_flush().await;
                        let report = self.aggregator.rebuild(&self.lane.tenant_id, &range).await;
                        let _ = reply.send(report);
                    }
                    Some(Control::Close(done)) => {
                        self.events.close();
                        self.drain_and_flush().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.drain_and_flush().await;
                        break;
                    }
                },
                event = self.events.recv() => match event {
                    Some(event) => {
                        if self.buffer.is_empty() {
                            self.deadline = Some(Instant::now() + self.flush_interval);
                        }
                        self.buffer.push(event);
                        if self.buffer.len() >= self.flush_max {
                            self.flush().await;
                        }
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },
                _ = sleep_until(self.deadline.unwrap_or_else(Instant::now)), if self.deadline.is_some() => {
                    self.flush().await;
                }
            }
        }
        debug!(tenant_id = %self.lane.tenant_id, "ingestion lane stopped");
    }

    async fn drain_and_flush(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.buffer.push(event);
        }
        self.flush().await;
    }

    /// Runs to completion once started; it is never raced against anything.
    async fn flush(&mut self) {
        self.deadline = None;
        while !self.buffer.is_empty() {
            let take = self.buffer.len().min(self.flush_max);
            let batch = Batch::new(
                self.lane.tenant_id.clone(),
                self.buffer.drain(..take).collect(),
            );
            let written = self.writer.write(&batch).await;
            self.aggregator.apply(&batch.tenant_id, &written).await;
            self.lane.pending.fetch_sub(batch.len(), Ordering::AcqRel);
        }
    }
}

/// A tenant's lane, filled in once its id high-water mark is known.
type LaneSlot = Arc<OnceCell<Arc<Lane>>>;

/// Per-tenant bounded ingestion queue with one writer task per tenant.
pub(crate) struct IngestionQueue {
    lanes: RwLock<HashMap<String, LaneSlot>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    store: Arc<dyn AnalyticsStore>,
    writer: Arc<EventWriter>,
    aggregator: Arc<MetricsAggregator>,
    config: Arc<PipelineConfig>,
}

impl IngestionQueue {
    pub(crate) fn new(
        store: Arc<dyn AnalyticsStore>,
        writer: Arc<EventWriter>,
        aggregator: Arc<MetricsAggregator>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            lanes: RwLock::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            store,
            writer,
            aggregator,
            config,
        }
    }

    fn backpressure(&self) -> PipelineError {
        PipelineError::Backpressure {
            retry_after_secs: self.config.retry_after_secs(),
        }
    }

    /// The tenant's lane, created on first use. A new lane resumes ids after
    /// the highest one already stored for the tenant.
    ///
    /// The map lock only covers slot creation; the store lookup runs inside
    /// the tenant's own slot so other tenants keep flowing.
    async fn lane(&self, tenant_id: &str) -> Result<Arc<Lane>, PipelineError> {
        let slot = self.slot(tenant_id).await;
        let lane = slot.get_or_try_init(|| self.open_lane(tenant_id)).await?;
        Ok(Arc::clone(lane))
    }

    async fn slot(&self, tenant_id: &str) -> LaneSlot {
        if let Some(slot) = self.lanes.read().await.get(tenant_id) {
            return Arc::clone(slot);
        }
        let mut lanes = self.lanes.write().await;
        Arc::clone(lanes.entry(tenant_id.to_string()).or_default())
    }

    /// Lanes that finished opening.
    async fn open_lanes(&self) -> Vec<Arc<Lane>> {
        self.lanes
            .read()
            .await
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    async fn open_lane(&self, tenant_id: &str) -> Result<Arc<Lane>, PipelineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.backpressure());
        }

        let high_water = with_backoff(&self.config, "max_ingestion_id", |_| {
            self.store.max_ingestion_id(tenant_id)
        })
        .await?;
        let next_id = high_water.unwrap_or(0) + 1;

        let (events_tx, events_rx) = mpsc::channel(self.config.queue_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let lane = Arc::new(Lane {
            tenant_id: tenant_id.to_string(),
            next_id: Mutex::new(next_id),
            pending: AtomicUsize::new(0),
            events: events_tx,
            control: control_tx,
        });
        let worker = LaneWorker {
            lane: Arc::clone(&lane),
            events: events_rx,
            control: control_rx,
            writer: Arc::clone(&self.writer),
            aggregator: Arc::clone(&self.aggregator),
            flush_max: self.config.flush_max_events,
            flush_interval: self.config.flush_interval(),
            buffer: Vec::with_capacity(self.config.flush_max_events),
            deadline: None,
        };
        let handle = tokio::spawn(worker.run());
        if let Ok(mut workers) = self.workers.lock() {
            workers.push(handle);
        }
        info!(tenant_id, next_ingestion_id = next_id, "ingestion lane opened");
        Ok(lane)
    }

    pub(crate) async fn enqueue(
        &self,
        tenant_id: &str,
        events: Vec<ValidatedEvent>,
        received_at: DateTime<Utc>,
    ) -> Result<Vec<IngestionId>, PipelineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.backpressure());
        }
        let lane = self.lane(tenant_id).await?;
        lane.admit(
            events,
            received_at,
            self.config.queue_capacity,
            self.config.retry_after_secs(),
        )
    }

    /// Events admitted for the tenant and not yet fully processed.
    pub(crate) async fn pending(&self, tenant_id: &str) -> usize {
        self.lanes
            .read()
            .await
            .get(tenant_id)
            .and_then(|slot| slot.get())
            .map_or(0, |lane| lane.pending.load(Ordering::Acquire))
    }

    /// Events admitted across every tenant and not yet fully processed.
    pub(crate) async fn pending_total(&self) -> usize {
        self.open_lanes()
            .await
            .iter()
            .map(|lane| lane.pending.load(Ordering::Acquire))
            .sum()
    }

    /// Wait until everything admitted for the tenant so far is written and
    /// aggregated (or reported failed).
    pub(crate) async fn flush(&self, tenant_id: &str) {
        let lane = self
            .lanes
            .read()
            .await
            .get(tenant_id)
            .and_then(|slot| slot.get().cloned());
        if let Some(lane) = lane {
            let (done_tx, done_rx) = oneshot::channel();
            if lane.control.send(Control::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    pub(crate) async fn flush_all(&self) {
        for lane in self.open_lanes().await {
            let (done_tx, done_rx) = oneshot::channel();
            if lane.control.send(Control::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    /// Run a rebuild on the tenant's writer task so it cannot interleave
    /// with that tenant's writes.
    pub(crate) async fn rebuild(
        &self,
        tenant_id: &str,
        range: TimeRange,
    ) -> Result<RebuildReport, PipelineError> {
        let lane = self.lane(tenant_id).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let stopped = || PipelineError::StoreUnavailable("ingestion lane stopped".to_string());
        lane.control
            .send(Control::Rebuild(range, reply_tx))
            .map_err(|_| stopped())?;
        reply_rx.await.map_err(|_| stopped())?
    }

    /// Refuse new events, drain every lane and wait for the writer tasks.
    pub(crate) async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let slots: Vec<LaneSlot> = self.lanes.read().await.values().cloned().collect();
        for slot in slots {
            // Waits out a lane that is still opening; an empty slot stays
            // empty because `open_lane` now refuses.
            let Ok(lane) = slot
                .get_or_try_init(|| async { Err::<Arc<Lane>, ()>(()) })
                .await
            else {
                continue;
            };
            let (done_tx, done_rx) = oneshot::channel();
            if lane.control.send(Control::Close(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("ingestion queue drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adtivity_core::event::EventFamily;
    use serde_json::Map;

    fn validated() -> ValidatedEvent {
        ValidatedEvent {
            tenant_id: "t1".to_string(),
            family: EventFamily::Web2,
            event_type: "page_view".to_string(),
            event_name: "page_view".to_string(),
            occurred_at: Utc::now(),
            user_id: None,
            anonymous_id: None,
            session_id: None,
            chain_id: None,
            tx_hash: None,
            wallet_address: None,
            contract_address: None,
            properties: Map::new(),
        }
    }

    fn lane(capacity: usize) -> (Lane, mpsc::Receiver<Event>) {
        let (events, rx) = mpsc::channel(capacity);
        let (control, _) = mpsc::unbounded_channel();
        let lane = Lane {
            tenant_id: "t1".to_string(),
            next_id: Mutex::new(41),
            pending: AtomicUsize::new(0),
            events,
            control,
        };
        (lane, rx)
    }

    #[test]
    fn admit_assigns_consecutive_ids_in_send_order() {
        let (lane, mut rx) = lane(4);
        let ids = lane
            .admit(vec![validated(), validated()], Utc::now(), 4, 1)
            .unwrap_or_default();
        assert_eq!(ids, vec![41, 42]);
        assert_eq!(rx.try_recv().map(|e| e.ingestion_id).ok(), Some(41));
        assert_eq!(rx.try_recv().map(|e| e.ingestion_id).ok(), Some(42));
    }

    #[test]
    fn admit_is_all_or_nothing_at_capacity() {
        let (lane, _rx) = lane(3);
        assert!(lane.admit(vec![validated(), validated()], Utc::now(), 3, 1).is_ok());
        let err = lane.admit(vec![validated(), validated()], Utc::now(), 3, 7);
        assert!(matches!(
            err,
            Err(PipelineError::Backpressure { retry_after_secs: 7 })
        ));
        assert_eq!(lane.pending.load(Ordering::Acquire), 2);
        // No id was burned by the refused batch.
        let ids = lane.admit(vec![validated()], Utc::now(), 3, 1).unwrap_or_default();
        assert_eq!(ids, vec![43]);
    }
}
