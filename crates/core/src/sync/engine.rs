//! Sync engine: drains the mutation queue against the remote API.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::errors::Result;

use super::broadcaster::{StatusBroadcaster, Subscription};
use super::config::SyncConfig;
use super::connectivity::{CallbackId, ConnectivityMonitor};
use super::entity_cache::EntityCache;
use super::queue::MutationQueue;
use super::queue_model::{
    CachedEntity, DeliveryError, EngineState, OperationKind, OperationStatus, QueuedOperation,
    SyncNotice, SyncPhase, SyncStatusEvent, SyncTrigger,
};
use super::remote::{Outcome, RemoteApi, ServerEntity};

/// Summary of one drain cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub trigger: SyncTrigger,
    pub attempted: usize,
    pub succeeded: usize,
    pub conflicts: usize,
    pub retryable_failures: usize,
    pub permanent_failures: usize,
    pub storage_errors: usize,
    /// Connectivity dropped mid-cycle; remaining entries were not started.
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl CycleReport {
    fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            attempted: 0,
            succeeded: 0,
            conflicts: 0,
            retryable_failures: 0,
            permanent_failures: 0,
            storage_errors: 0,
            cancelled: false,
            duration_ms: 0,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.retryable_failures > 0 || self.permanent_failures > 0 || self.storage_errors > 0
    }

    fn merge(&mut self, lane: &LaneReport) {
        self.attempted += lane.attempted;
        self.succeeded += lane.succeeded;
        self.conflicts += lane.conflicts;
        self.retryable_failures += lane.retryable_failures;
        self.permanent_failures += lane.permanent_failures;
        self.storage_errors += lane.storage_errors;
        self.cancelled |= lane.cancelled;
    }
}

/// Result of a drain request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(CycleReport),
    /// Another cycle was already running; this request was a no-op.
    Coalesced,
    /// Not started because the device is offline.
    Offline,
}

type EntityKey = (String, String);

fn entity_key(op: &QueuedOperation) -> EntityKey {
    (op.entity_type.clone(), op.entity_local_id.clone())
}

/// Queued operations of one entity, in queue order.
struct Lane {
    entity: EntityKey,
    ops: Vec<QueuedOperation>,
}

#[derive(Default)]
struct LaneReport {
    attempted: usize,
    succeeded: usize,
    conflicts: usize,
    retryable_failures: usize,
    permanent_failures: usize,
    storage_errors: usize,
    cancelled: bool,
    /// The entity must not be retried again in this cycle.
    blocked: bool,
}

enum Applied {
    Succeeded,
    Conflict,
    Retryable,
    Permanent,
}

struct Progress {
    completed: usize,
    total: usize,
}

fn group_into_lanes(batch: Vec<QueuedOperation>, excluded: &HashSet<EntityKey>) -> Vec<Lane> {
    let mut lanes: Vec<Lane> = Vec::new();
    for op in batch {
        let key = entity_key(&op);
        if excluded.contains(&key) {
            continue;
        }
        match lanes.iter_mut().find(|lane| lane.entity == key) {
            Some(lane) => lane.ops.push(op),
            None => lanes.push(Lane {
                entity: key,
                ops: vec![op],
            }),
        }
    }
    lanes
}

/// Coordinates delivery of queued mutations.
///
/// One instance per process, shared through `Arc`. At most one drain cycle
/// runs at a time; entries of one entity are delivered strictly in order
/// while distinct entities proceed with bounded concurrency.
pub struct SyncEngine {
    queue: Arc<MutationQueue>,
    cache: EntityCache,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<ConnectivityMonitor>,
    broadcaster: Arc<StatusBroadcaster>,
    config: SyncConfig,
    cycle_mutex: AsyncMutex<()>,
    state: Mutex<EngineState>,
    cycle_starts: AtomicU64,
    wake: Notify,
    pending_trigger: Mutex<Option<SyncTrigger>>,
    background_task: AsyncMutex<Option<JoinHandle<()>>>,
    reconnect_callback: Mutex<Option<CallbackId>>,
}

impl SyncEngine {
    /// Build the engine and register it for reconnect notifications.
    pub fn new(
        queue: Arc<MutationQueue>,
        cache: EntityCache,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<ConnectivityMonitor>,
        broadcaster: Arc<StatusBroadcaster>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            queue,
            cache,
            remote,
            connectivity: Arc::clone(&connectivity),
            broadcaster,
            config,
            cycle_mutex: AsyncMutex::new(()),
            state: Mutex::new(EngineState::Idle),
            cycle_starts: AtomicU64::new(0),
            wake: Notify::new(),
            pending_trigger: Mutex::new(None),
            background_task: AsyncMutex::new(None),
            reconnect_callback: Mutex::new(None),
        });

        let weak = Arc::downgrade(&engine);
        let callback_id = connectivity.on_transition(move |online| {
            if !online {
                return;
            }
            if let Some(engine) = weak.upgrade() {
                engine.request_sync_with(SyncTrigger::Reconnect);
            }
        });
        if let Ok(mut slot) = engine.reconnect_callback.lock() {
            *slot = Some(callback_id);
        }
        engine
    }

    pub fn queue(&self) -> Arc<MutationQueue> {
        Arc::clone(&self.queue)
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state.lock().map(|s| *s).unwrap_or(EngineState::Idle)
    }

    fn set_state(&self, state: EngineState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    /// Number of drain cycles actually started.
    pub fn cycle_starts(&self) -> u64 {
        self.cycle_starts.load(Ordering::SeqCst)
    }

    /// Undelivered entry count for the pending badge.
    pub async fn count(&self) -> usize {
        self.queue.count().await
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatusEvent) + Send + Sync + 'static,
    {
        self.broadcaster.subscribe(callback)
    }

    pub fn subscribe_notices<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncNotice) + Send + Sync + 'static,
    {
        self.broadcaster.subscribe_notices(callback)
    }

    /// Run a drain cycle now and wait for it.
    pub async fn force_sync_now(&self) -> Result<DrainOutcome> {
        self.run_cycle(SyncTrigger::Manual).await
    }

    /// Ask the background loop to drain soon without waiting.
    pub fn request_sync(&self) {
        self.request_sync_with(SyncTrigger::Manual);
    }

    fn request_sync_with(&self, trigger: SyncTrigger) {
        if let Ok(mut slot) = self.pending_trigger.lock() {
            *slot = Some(trigger);
        }
        self.wake.notify_one();
    }

    fn take_trigger(&self) -> SyncTrigger {
        self.pending_trigger
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .unwrap_or(SyncTrigger::Manual)
    }

    /// Run one drain cycle unless one is already running or the device is
    /// offline.
    pub async fn run_cycle(&self, trigger: SyncTrigger) -> Result<DrainOutcome> {
        if !self.connectivity.is_online() {
            debug!("[SyncEngine] Skipping {:?} cycle while offline", trigger);
            return Ok(DrainOutcome::Offline);
        }
        let Ok(_cycle_guard) = self.cycle_mutex.try_lock() else {
            debug!("[SyncEngine] {:?} trigger coalesced into running cycle", trigger);
            return Ok(DrainOutcome::Coalesced);
        };

        self.cycle_starts.fetch_add(1, Ordering::SeqCst);
        self.set_state(EngineState::Draining);
        let started_at = Instant::now();

        let result = self.drain(trigger).await;

        // Entries left backing off by earlier cycles keep the engine in
        // backoff even when this cycle had nothing due.
        let next_state = match &result {
            Ok(report) if !report.cancelled => match self.queue.next_retry_at().await {
                Some(until) => EngineState::BackingOff { until },
                None => EngineState::Idle,
            },
            _ => EngineState::Idle,
        };
        self.set_state(next_state);

        let mut report = result?;
        report.duration_ms = started_at.elapsed().as_millis() as u64;
        info!(
            "[SyncEngine] Cycle {:?} done attempted={} ok={} conflicts={} retryable={} permanent={} storage_errors={} cancelled={} duration_ms={}",
            report.trigger,
            report.attempted,
            report.succeeded,
            report.conflicts,
            report.retryable_failures,
            report.permanent_failures,
            report.storage_errors,
            report.cancelled,
            report.duration_ms
        );
        Ok(DrainOutcome::Completed(report))
    }

    async fn drain(&self, trigger: SyncTrigger) -> Result<CycleReport> {
        // No delivery runs outside a cycle, so anything still in flight here
        // was interrupted by a failed store write.
        self.queue.recover_in_flight().await?;

        let mut report = CycleReport::new(trigger);
        let mut failed_entities: HashSet<EntityKey> = HashSet::new();
        let progress = Mutex::new(Progress {
            completed: 0,
            total: self.queue.count().await,
        });
        self.publish_progress(&progress, false);

        loop {
            if !self.connectivity.is_online() {
                report.cancelled = true;
                break;
            }
            let batch = self.queue.peek_next_batch(self.config.batch_size).await;
            let lanes = group_into_lanes(batch, &failed_entities);
            if lanes.is_empty() {
                break;
            }
            debug!("[SyncEngine] Delivering {} entity lanes", lanes.len());

            let progress_ref = &progress;
            let lane_reports: Vec<(EntityKey, LaneReport)> = stream::iter(lanes)
                .map(|lane| async move {
                    let entity = lane.entity.clone();
                    let lane_report = self.deliver_lane(lane, progress_ref).await;
                    (entity, lane_report)
                })
                .buffer_unordered(self.config.max_concurrency.max(1))
                .collect()
                .await;

            for (entity, lane_report) in &lane_reports {
                report.merge(lane_report);
                if lane_report.blocked {
                    failed_entities.insert(entity.clone());
                }
            }
            if report.cancelled {
                break;
            }
        }

        let backing_off = self.queue.next_retry_at().await.is_some();
        let phase = if report.has_failures() || report.cancelled || backing_off {
            SyncPhase::Error
        } else {
            SyncPhase::Complete
        };
        if let Ok(p) = progress.lock() {
            self.broadcaster
                .publish(SyncStatusEvent::finished(phase, p.completed, p.total));
        }
        Ok(report)
    }

    fn publish_progress(&self, progress: &Mutex<Progress>, step: bool) {
        let Ok(mut p) = progress.lock() else {
            return;
        };
        if step {
            p.completed += 1;
            p.total = p.total.max(p.completed);
        }
        // Published under the lock so concurrent lanes emit increasing counts.
        self.broadcaster
            .publish(SyncStatusEvent::syncing(p.completed, p.total));
    }

    async fn deliver_lane(&self, lane: Lane, progress: &Mutex<Progress>) -> LaneReport {
        let mut report = LaneReport::default();

        for op in lane.ops {
            if !self.connectivity.is_online() {
                report.cancelled = true;
                break;
            }

            let op = match self.queue.mark_in_flight(&op.id).await {
                Ok(op) => op,
                Err(err) => {
                    warn!("[SyncEngine] Could not start {}: {}", op.id, err);
                    report.storage_errors += 1;
                    report.blocked = true;
                    break;
                }
            };
            report.attempted += 1;

            let outcome = self.send_with_timeout(&op).await;
            let applied = self.apply_outcome(&op, outcome).await;
            self.publish_progress(progress, true);

            match applied {
                Ok(Applied::Succeeded) => report.succeeded += 1,
                Ok(Applied::Conflict) => report.conflicts += 1,
                Ok(Applied::Permanent) => report.permanent_failures += 1,
                Ok(Applied::Retryable) => {
                    report.retryable_failures += 1;
                    report.blocked = true;
                    break;
                }
                Err(err) => {
                    warn!("[SyncEngine] Could not record outcome for {}: {}", op.id, err);
                    report.storage_errors += 1;
                    report.blocked = true;
                    break;
                }
            }
        }
        report
    }

    async fn send_with_timeout(&self, op: &QueuedOperation) -> Outcome {
        match tokio::time::timeout(self.config.request_timeout, self.remote.send(op)).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::RetryableFailure(format!(
                "request timed out after {} ms",
                self.config.request_timeout.as_millis()
            )),
        }
    }

    async fn apply_outcome(&self, op: &QueuedOperation, outcome: Outcome) -> Result<Applied> {
        match outcome {
            Outcome::Success(server) => {
                self.apply_success_to_cache(op, &server).await?;
                let remote_id = server.remote_id.or_else(|| op.entity_remote_id.clone());
                self.queue.mark_succeeded(&op.id, remote_id).await?;
                debug!(
                    "[SyncEngine] Delivered {} {:?} {}/{}",
                    op.id, op.kind, op.entity_type, op.entity_local_id
                );
                Ok(Applied::Succeeded)
            }
            Outcome::Conflict(server) => {
                self.cache
                    .apply_server_entity(&op.entity_type, &op.entity_local_id, &server)
                    .await?;
                self.queue
                    .mark_conflicted(&op.id, server.remote_id.clone())
                    .await?;
                self.broadcaster.publish_notice(SyncNotice::Conflict {
                    operation_id: op.id.clone(),
                    entity_type: op.entity_type.clone(),
                    entity_local_id: op.entity_local_id.clone(),
                });
                Ok(Applied::Conflict)
            }
            Outcome::RetryableFailure(reason) => {
                self.record_failure(op, DeliveryError::RetryableNetwork(reason), true)
                    .await
            }
            Outcome::PermanentFailure(reason) => {
                self.record_failure(op, DeliveryError::PermanentRequest(reason), false)
                    .await
            }
        }
    }

    async fn record_failure(
        &self,
        op: &QueuedOperation,
        error: DeliveryError,
        retryable: bool,
    ) -> Result<Applied> {
        let reason = error.message().to_string();
        let updated = self.queue.mark_failed(&op.id, error, retryable).await?;
        if updated.status == OperationStatus::FailedRetryable {
            warn!(
                "[SyncEngine] Retryable failure for {} (attempt {}): {}",
                op.id, updated.attempt_count, reason
            );
            return Ok(Applied::Retryable);
        }

        warn!(
            "[SyncEngine] Permanent failure for {} {}/{}: {}",
            op.id, op.entity_type, op.entity_local_id, reason
        );
        self.broadcaster.publish_notice(SyncNotice::PermanentFailure {
            operation_id: op.id.clone(),
            entity_type: op.entity_type.clone(),
            entity_local_id: op.entity_local_id.clone(),
            reason,
        });
        Ok(Applied::Permanent)
    }

    async fn apply_success_to_cache(
        &self,
        op: &QueuedOperation,
        server: &ServerEntity,
    ) -> Result<Option<CachedEntity>> {
        if op.kind == OperationKind::Delete {
            self.cache
                .remove(&op.entity_type, &op.entity_local_id)
                .await?;
            return Ok(None);
        }
        let record = self
            .cache
            .apply_server_entity(&op.entity_type, &op.entity_local_id, server)
            .await?;
        Ok(Some(record))
    }

    fn next_delay(&self) -> Duration {
        let jitter_bound = self.config.interval_jitter.as_millis() as u64;
        let jitter_ms = if jitter_bound > 0 {
            rand::thread_rng().gen_range(0..=jitter_bound)
        } else {
            0
        };
        let periodic = self.config.periodic_interval + Duration::from_millis(jitter_ms);

        match self.state() {
            EngineState::BackingOff { until } => {
                let wait = (until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                wait.min(periodic)
            }
            _ => periodic,
        }
    }

    /// Spawn the background loop if it is not already running.
    ///
    /// The loop drains on startup, on reconnect, on `request_sync`, when a
    /// backoff deadline passes and on the periodic timer.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.background_task.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
            guard.take();
        }

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut trigger = SyncTrigger::Startup;
            loop {
                if engine.connectivity.is_online() && engine.queue.count().await > 0 {
                    if let Err(err) = engine.run_cycle(trigger).await {
                        warn!("[SyncEngine] Background cycle failed: {}", err);
                    }
                }

                let delay = engine.next_delay();
                tokio::select! {
                    _ = engine.wake.notified() => {
                        trigger = engine.take_trigger();
                    }
                    _ = tokio::time::sleep(delay) => {
                        trigger = SyncTrigger::Periodic;
                    }
                }
            }
        });
        *guard = Some(handle);
        info!("[SyncEngine] Background loop started");
    }

    /// Stop the background loop. A delivery in progress is abandoned at its
    /// next suspension point; its entry stays in flight and is recovered as
    /// retryable by the next cycle or on reopen.
    pub async fn stop(&self) {
        let mut guard = self.background_task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
            info!("[SyncEngine] Background loop stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        let guard = self.background_task.lock().await;
        guard.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.reconnect_callback.lock() {
            if let Some(id) = slot.take() {
                self.connectivity.remove_callback(id);
            }
        }
    }
}
