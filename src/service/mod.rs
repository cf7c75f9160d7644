use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RollupConfig;
use crate::exec::{write_rollup_batch, RollupExecutionContext};
use crate::health::HealthMetrics;
use crate::rollup::{RollupWriteContext, SlotKey};
use crate::schedule::ScheduleContext;
use crate::writer::RollupWriter;

/// Produces the computed rollups for one slot key.
///
/// The aggregation math lives behind this seam; the service only consumes
/// the resulting write contexts.
pub trait RollupSource: Send + Sync {
    fn rollups_for(
        &self,
        key: SlotKey,
    ) -> impl Future<Output = anyhow::Result<Vec<RollupWriteContext>>> + Send;
}

/// Drives the rollup pipeline: a periodic loop advances the schedule
/// clock, promotes eligible slots, and dispatches each scheduled key into
/// a slot execution that writes batches through a bounded worker pool.
///
/// All collaborators are injected; nothing here is a global.
pub struct RollupService<S, W> {
    cfg: RollupConfig,
    schedule: Arc<ScheduleContext>,
    source: Arc<S>,
    writer: Arc<W>,
    health: Arc<HealthMetrics>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl<S, W> RollupService<S, W>
where
    S: RollupSource + Send + Sync + 'static,
    W: RollupWriter + Send + Sync + 'static,
{
    pub fn new(
        cfg: RollupConfig,
        schedule: Arc<ScheduleContext>,
        source: Arc<S>,
        writer: Arc<W>,
        health: Arc<HealthMetrics>,
    ) -> RollupService<S, W> {
        let workers = Arc::new(Semaphore::new(cfg.workers));
        RollupService {
            cfg,
            schedule,
            source,
            writer,
            health,
            workers,
            cancel: CancellationToken::new(),
        }
    }

    /// The schedule context, for the ingestion path.
    pub fn schedule(&self) -> &Arc<ScheduleContext> {
        &self.schedule
    }

    /// Starts the background scheduler loop.
    pub fn start(&self) {
        let cfg = self.cfg.clone();
        let schedule = Arc::clone(&self.schedule);
        let source = Arc::clone(&self.source);
        let writer = Arc::clone(&self.writer);
        let health = Arc::clone(&self.health);
        let workers = Arc::clone(&self.workers);
        let cancel = self.cancel.clone();

        info!(
            poll_interval = ?cfg.poll_interval,
            lag_window = ?cfg.lag_window,
            max_age = ?cfg.max_age,
            shards = schedule.managed_shards().len(),
            "rollup service started",
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cfg.poll_interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("rollup service stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        Self::tick(&cfg, &schedule, &source, &writer, &health, &workers);
                    }
                }
            }
        });
    }

    /// Signals the scheduler loop to stop. In-flight slot executions run
    /// to completion so no counter is left dangling.
    pub async fn stop(&self) {
        self.cancel.cancel();
    }

    fn tick(
        cfg: &RollupConfig,
        schedule: &Arc<ScheduleContext>,
        source: &Arc<S>,
        writer: &Arc<W>,
        health: &Arc<HealthMetrics>,
        workers: &Arc<Semaphore>,
    ) {
        schedule.set_current_time(unix_millis());

        let pass = schedule.schedule_eligible_slots(
            cfg.lag_window.as_millis() as u64,
            cfg.max_age.as_millis() as u64,
        );
        if pass.dropped > 0 {
            health.slots_dropped.inc_by(pass.dropped as f64);
        }
        health
            .scheduled_slots
            .set(schedule.get_scheduled_count() as f64);
        health.running_slots.set(schedule.get_running_count() as f64);

        while let Some(key) = schedule.get_next_scheduled() {
            let schedule = Arc::clone(schedule);
            let source = Arc::clone(source);
            let writer = Arc::clone(writer);
            let health = Arc::clone(health);
            let workers = Arc::clone(workers);
            let batch_size = cfg.batch_size;

            tokio::spawn(async move {
                Self::execute_slot(
                    key, batch_size, schedule, source, writer, health, workers,
                )
                .await;
            });
        }
    }

    /// Runs one scheduled slot key end to end: compute rollups, fan out
    /// batch writes under one execution context, then retire or requeue.
    pub async fn execute_slot(
        key: SlotKey,
        batch_size: usize,
        schedule: Arc<ScheduleContext>,
        source: Arc<S>,
        writer: Arc<W>,
        health: Arc<HealthMetrics>,
        workers: Arc<Semaphore>,
    ) {
        let contexts = match source.rollups_for(key).await {
            Ok(contexts) => contexts,
            Err(e) => {
                warn!(key = %key, error = %e, "computing rollups failed, requeueing");
                health.rollup_failures.inc();
                Self::requeue(&schedule, key);
                return;
            }
        };

        if contexts.is_empty() {
            debug!(key = %key, "no rollups for slot, retiring");
            if let Err(e) = schedule.clear_from_running(key) {
                error!(key = %key, error = %e, "clearing empty slot");
            }
            return;
        }

        let exec = Arc::new(RollupExecutionContext::new(contexts.len() as u32));
        let mut tasks = JoinSet::new();

        for chunk in contexts.chunks(batch_size) {
            let batch = chunk.to_vec();
            let writer = Arc::clone(&writer);
            let exec = Arc::clone(&exec);
            let health = Arc::clone(&health);
            let permit = Arc::clone(&workers)
                .acquire_owned()
                .await
                .expect("worker semaphore never closes");

            tasks.spawn(async move {
                let _permit = permit;
                write_rollup_batch(writer.as_ref(), &batch, &exec, &health).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                // A panicked task never decremented its batch, so the
                // counter stays non-zero and the slot goes down the
                // requeue path below.
                error!(key = %key, error = %e, "batch write task aborted");
                exec.mark_unsuccessful(&e);
            }
        }

        if exec.is_done() && exec.was_successful() {
            match schedule.clear_from_running(key) {
                Ok(()) => {
                    health.slots_rolled.inc();
                    debug!(key = %key, rollups = contexts.len(), "slot rolled up");
                }
                Err(e) => error!(key = %key, error = %e, "clearing completed slot"),
            }
        } else {
            warn!(
                key = %key,
                cause = exec.failure_cause().as_deref().unwrap_or("incomplete"),
                "slot execution unsuccessful, requeueing",
            );
            health.rollup_failures.inc();
            Self::requeue(&schedule, key);
        }
    }

    fn requeue(schedule: &ScheduleContext, key: SlotKey) {
        if let Err(e) = schedule.clear_from_running(key) {
            error!(key = %key, error = %e, "clearing failed slot");
        }
        if let Err(e) = schedule.push_back_to_scheduled(key, false) {
            error!(key = %key, error = %e, "requeueing failed slot");
        }
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
