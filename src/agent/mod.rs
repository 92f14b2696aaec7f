use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{self, Batch};
use crate::config::Config;
use crate::delivery::{Delivery, Deliverer, InfluxWriter, PointWriter, RetryPolicy};
use crate::export::HealthMetrics;
use crate::sensor::Sampler;
use crate::spool::Spool;
use crate::stabilize::{Compensator, Stabilizer};

/// What one cycle ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every metric was missing; nothing was written or spooled.
    Empty,
    /// The fresh batch was written; `replayed` spooled batches followed it.
    Delivered { attempts: u32, replayed: usize },
    /// The fresh batch went to the spool.
    Spooled { evicted: usize },
}

impl CycleOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Delivered { .. } => "delivered",
            Self::Spooled { .. } => "spooled",
        }
    }
}

/// Fixed-interval sample, stabilize, batch, deliver loop.
///
/// Cycles never overlap. Each cycle is scheduled from the previous cycle's
/// start, so time spent sampling and delivering does not accumulate as
/// drift.
pub struct Scheduler<W> {
    interval: Duration,
    send_margin: Duration,
    host_tag: String,
    sampler: Sampler,
    stabilizer: Stabilizer,
    deliverer: Deliverer<W>,
    spool: Arc<Spool>,
    health: Arc<HealthMetrics>,
}

impl<W: PointWriter> Scheduler<W> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        interval: Duration,
        send_margin: Duration,
        host_tag: String,
        sampler: Sampler,
        stabilizer: Stabilizer,
        deliverer: Deliverer<W>,
        spool: Arc<Spool>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            interval,
            send_margin,
            host_tag,
            sampler,
            stabilizer,
            deliverer,
            spool,
            health,
        }
    }

    pub fn stabilizer(&self) -> &Stabilizer {
        &self.stabilizer
    }

    /// Time available for writes after `cycle_start`. Intervals too short
    /// to keep a margin use the whole interval.
    fn send_deadline(&self, cycle_start: Instant) -> Instant {
        let budget = self
            .interval
            .checked_sub(self.send_margin)
            .filter(|b| !b.is_zero())
            .unwrap_or(self.interval);
        cycle_start + budget
    }

    /// Run cycles until `cancel` fires. Cancellation is checked between
    /// cycles and between write attempts.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval = ?self.interval,
            metrics = self.sampler.metrics().len(),
            spooled = self.spool.len(),
            "scheduler started",
        );

        if self.sampler.is_empty() {
            warn!("no sensors configured, every cycle will be empty");
        }

        if !self.spool.is_empty() {
            let deadline = self.send_deadline(Instant::now());
            self.replay_spool(deadline).await;
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let cycle_start = Instant::now();

            let result = AssertUnwindSafe(self.run_cycle(cycle_start, &cancel))
                .catch_unwind()
                .await;

            match result {
                Ok(outcome) => {
                    debug!(outcome = ?outcome, "cycle finished");
                    self.health.cycles.with_label_values(&[outcome.as_str()]).inc();
                }
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(error = %msg, "cycle failed, continuing at next tick");
                    self.health.cycles.with_label_values(&["error"]).inc();
                }
            }

            let elapsed = cycle_start.elapsed();
            self.health.cycle_duration.observe(elapsed.as_secs_f64());

            if elapsed > self.interval {
                warn!(
                    elapsed = ?elapsed,
                    interval = ?self.interval,
                    overrun = ?(elapsed - self.interval),
                    "cycle overran the interval",
                );
                self.health.cycle_overruns.inc();
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(cycle_start + self.interval) => {}
            }
        }

        info!(spooled = self.spool.len(), "scheduler stopped");
    }

    /// One sample, stabilize, batch, deliver pass.
    pub async fn run_cycle(
        &mut self,
        cycle_start: Instant,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        let cycle_time = Utc::now();
        let samples = self.sampler.sample().await;

        let mut readings = BTreeMap::new();
        for metric in self.sampler.metrics() {
            let reading = self.stabilizer.stabilize(metric, &samples, cycle_time);
            self.health.observe_reading(metric, reading);
            readings.insert(metric, reading);
        }

        let Some(batch) = batch::assemble(cycle_time, &self.host_tag, &readings) else {
            return CycleOutcome::Empty;
        };

        let deadline = self.send_deadline(cycle_start);
        let outcome = match self.deliverer.deliver(&batch, Some(deadline), cancel).await {
            Delivery::Delivered { attempts } => {
                self.health.deliveries.with_label_values(&["success"]).inc();
                self.health.delivery_attempts.observe(f64::from(attempts));

                let replayed = if self.spool.is_empty() || cancel.is_cancelled() {
                    0
                } else {
                    self.replay_spool(deadline).await
                };

                CycleOutcome::Delivered { attempts, replayed }
            }
            Delivery::Failed { attempts, error } => {
                self.health.deliveries.with_label_values(&["failure"]).inc();
                self.health
                    .delivery_errors
                    .with_label_values(&[error.kind()])
                    .inc();
                if attempts > 0 {
                    self.health.delivery_attempts.observe(f64::from(attempts));
                }

                warn!(
                    attempts,
                    error = %error,
                    fields = batch.len(),
                    "delivery failed, spooling batch",
                );

                let evicted = self.spool_batch(batch);
                CycleOutcome::Spooled { evicted }
            }
        };

        self.update_spool_metrics();
        outcome
    }

    fn spool_batch(&self, batch: Batch) -> usize {
        let evicted = self.spool.enqueue(batch);
        if evicted > 0 {
            self.health.spool_evictions.inc_by(evicted as f64);
        }
        self.update_spool_metrics();
        evicted
    }

    async fn replay_spool(&self, deadline: Instant) -> usize {
        let deliverer = &self.deliverer;
        let report = self
            .spool
            .flush(|b| async move { deliverer.attempt_once(&b, Some(deadline)).await })
            .await;

        if report.delivered > 0 {
            self.health.spool_replayed.inc_by(report.delivered as f64);
        }
        if let Some(e) = &report.stopped_by {
            debug!(error = %e, remaining = report.remaining, "spool replay paused");
        }

        self.update_spool_metrics();
        report.delivered
    }

    fn update_spool_metrics(&self) {
        self.health.spool_entries.set(self.spool.len() as f64);
        self.health
            .spool_durable
            .set(if self.spool.is_durable() { 1.0 } else { 0.0 });
    }
}

/// Owns the logger's components for the process lifetime.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    spool: Option<Arc<Spool>>,
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            spool: None,
            task: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Open the spool, build the pipeline and start the cycle loop. A spool
    /// that cannot be opened falls back to memory rather than failing.
    pub async fn start(&mut self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let spool = Arc::new(Spool::open_or_memory(&self.cfg.spool));
        self.health.spool_capacity.set(spool.capacity() as f64);
        self.health.spool_entries.set(spool.len() as f64);
        self.health
            .spool_durable
            .set(if spool.is_durable() { 1.0 } else { 0.0 });

        let writer = InfluxWriter::new(&self.cfg.database).context("creating database writer")?;
        info!(
            url = writer.url(),
            api = ?self.cfg.database.api,
            target = %self.cfg.database.database_or_bucket,
            "database writer configured",
        );

        let deliverer = Deliverer::new(
            writer,
            RetryPolicy::from_config(&self.cfg.delivery),
            self.cfg.database.timeout,
        );

        let sampler = Sampler::from_config(&self.cfg.sensors, &self.cfg.sampling);

        let mut stabilizer = Stabilizer::new(&self.cfg.stabilizer);
        if let Some(compensator) = Compensator::from_config(&self.cfg.compensation) {
            info!(
                source = %self.cfg.compensation.source.display(),
                factor = self.cfg.compensation.factor,
                "temperature compensation enabled",
            );
            stabilizer = stabilizer.with_compensator(compensator);
        }

        let scheduler = Scheduler::new(
            self.cfg.interval,
            self.cfg.delivery.send_margin,
            self.cfg.host_tag.clone(),
            sampler,
            stabilizer,
            deliverer,
            Arc::clone(&spool),
            Arc::clone(&self.health),
        );

        self.task = Some(tokio::spawn(scheduler.run(self.cancel.child_token())));
        self.spool = Some(spool);

        info!("agent fully started");

        Ok(())
    }

    /// Stop the loop and wait for the current cycle to wind down.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "scheduler task failed");
            }
        }

        if let Some(spool) = &self.spool {
            if !spool.is_empty() {
                info!(entries = spool.len(), "batches remain spooled for next start");
            }
        }

        self.health.stop();

        Ok(())
    }
}
