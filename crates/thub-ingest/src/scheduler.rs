//! Per-source ingestion cycles on cron schedules.
//!
//! Every cycle runs in its own task so a panicking source is reported as a
//! failed cycle and the next tick of any job still fires. A source never
//! overlaps with itself: a tick that finds the previous cycle still running
//! is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use thub_core::Channel;
use thub_sources::Source;
use thub_storage::{BatchSink, DayProbe};
use tokio::task::JoinError;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::config::SourceSchedule;
use crate::gate::{FetchGate, GateReason, TradingSessionGate};
use crate::normalize::Normalizer;

pub struct SourceJob {
    pub source: Arc<dyn Source>,
    /// Six-field cron expression, UTC.
    pub schedule: String,
    pub gate: Option<Arc<dyn FetchGate>>,
}

impl SourceJob {
    pub fn new(source: Arc<dyn Source>, schedule: impl Into<String>) -> Self {
        Self {
            source,
            schedule: schedule.into(),
            gate: None,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn FetchGate>) -> Self {
        self.gate = Some(gate);
        self
    }
}

/// Pairs sources with their schedules. Sources without a schedule entry or
/// with a disabled one are left out; the A-share source is gated on trading
/// sessions, backfilling through `probe` when given.
pub fn assemble_jobs(
    sources: Vec<Arc<dyn Source>>,
    schedules: &[SourceSchedule],
    probe: Option<Arc<dyn DayProbe>>,
) -> Vec<SourceJob> {
    let mut jobs = Vec::with_capacity(sources.len());
    for source in sources {
        let Some(entry) = schedules.iter().find(|s| s.name == source.name()) else {
            warn!(source = source.name(), "no schedule configured; source not scheduled");
            continue;
        };
        if !entry.enabled {
            info!(source = source.name(), "source disabled");
            continue;
        }
        let mut job = SourceJob::new(Arc::clone(&source), entry.schedule.clone());
        if source.channel() == Channel::Ashare {
            let mut gate = TradingSessionGate::new(Channel::Ashare);
            if let Some(probe) = &probe {
                gate = gate.with_probe(Arc::clone(probe));
            }
            job = job.with_gate(Arc::new(gate));
        }
        jobs.push(job);
    }
    jobs
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    Skipped {
        reason: GateReason,
    },
    AlreadyRunning,
    Empty,
    Saved {
        fetched: usize,
        normalized: usize,
        duplicates: usize,
        written: usize,
        skipped_unrouted: usize,
    },
    FetchFailed {
        error: String,
    },
    PersistFailed {
        error: String,
    },
    Panicked {
        message: String,
    },
}

impl CycleOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::FetchFailed { .. } | Self::PersistFailed { .. } | Self::Panicked { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub source: String,
    pub outcome: CycleOutcome,
    pub elapsed_ms: u64,
}

struct JobSlot {
    job: SourceJob,
    running: AtomicBool,
}

/// Clears the running flag however the cycle ends. Owned by the cycle task,
/// so a caller that stops waiting leaves the flag set until the work is done.
struct RunningGuard(Arc<JobSlot>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

pub struct IngestScheduler {
    slots: Vec<Arc<JobSlot>>,
    sink: Arc<dyn BatchSink>,
    normalizer: Normalizer,
}

impl IngestScheduler {
    pub fn new(jobs: Vec<SourceJob>, sink: Arc<dyn BatchSink>, normalizer: Normalizer) -> Self {
        let slots = jobs
            .into_iter()
            .map(|job| {
                Arc::new(JobSlot {
                    job,
                    running: AtomicBool::new(false),
                })
            })
            .collect();
        Self {
            slots,
            sink,
            normalizer,
        }
    }

    pub fn source_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|s| s.job.source.name().to_string())
            .collect()
    }

    /// Whether the named source has a cycle in flight, or `None` when it is
    /// not scheduled.
    pub fn is_running(&self, name: &str) -> Option<bool> {
        self.slots
            .iter()
            .find(|s| s.job.source.name() == name)
            .map(|s| s.running.load(Ordering::Acquire))
    }

    /// One cycle of every source, concurrently.
    pub async fn run_all_once(&self) -> Vec<CycleReport> {
        join_all(self.slots.iter().map(|slot| self.run_slot(slot))).await
    }

    /// One cycle of the named source, or `None` when it is not scheduled.
    pub async fn run_source(&self, name: &str) -> Option<CycleReport> {
        let slot = self.slots.iter().find(|s| s.job.source.name() == name)?;
        Some(self.run_slot(slot).await)
    }

    /// Registers one cron job per source, starts the scheduler and kicks
    /// off a full run after `startup_delay`.
    pub async fn start(self: Arc<Self>, startup_delay: Duration) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for slot in &self.slots {
            let name = slot.job.source.name().to_string();
            let schedule = slot.job.schedule.clone();
            let this = Arc::clone(&self);
            let slot = Arc::clone(slot);
            let job = Job::new_async(schedule.as_str(), move |_uuid, _l| {
                let this = Arc::clone(&this);
                let slot = Arc::clone(&slot);
                Box::pin(async move {
                    this.run_slot(&slot).await;
                })
            })
            .with_context(|| format!("creating job for {name} with cron {schedule}"))?;
            sched
                .add(job)
                .await
                .with_context(|| format!("adding job for {name}"))?;
            info!(source = %name, cron = %schedule, "source scheduled");
        }
        sched.start().await.context("starting scheduler")?;

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            tokio::time::sleep(startup_delay).await;
            let reports = this.run_all_once().await;
            let failed = reports.iter().filter(|r| r.outcome.is_failure()).count();
            info!(sources = reports.len(), failed, "startup ingestion finished");
        });
        Ok(sched)
    }

    async fn run_slot(&self, slot: &Arc<JobSlot>) -> CycleReport {
        let name = slot.job.source.name().to_string();
        let started = Instant::now();

        if slot.running.swap(true, Ordering::AcqRel) {
            debug!(source = %name, "previous cycle still running; tick dropped");
            return CycleReport {
                source: name,
                outcome: CycleOutcome::AlreadyRunning,
                elapsed_ms: 0,
            };
        }
        let guard = RunningGuard(Arc::clone(slot));

        let source = Arc::clone(&slot.job.source);
        let gate = slot.job.gate.clone();
        let sink = Arc::clone(&self.sink);
        let normalizer = self.normalizer;
        let cycle = tokio::spawn(async move {
            let _guard = guard;
            run_cycle(source, gate, sink, normalizer).await
        });
        let outcome = match cycle.await {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = panic_message(err);
                error!(source = %name, panic = %message, "ingestion cycle panicked");
                CycleOutcome::Panicked { message }
            }
        };

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &outcome {
            CycleOutcome::Saved { written, .. } => {
                info!(source = %name, written, elapsed_ms, "ingestion cycle saved")
            }
            other => debug!(source = %name, outcome = ?other, elapsed_ms, "ingestion cycle finished"),
        }
        CycleReport {
            source: name,
            outcome,
            elapsed_ms,
        }
    }
}

async fn run_cycle(
    source: Arc<dyn Source>,
    gate: Option<Arc<dyn FetchGate>>,
    sink: Arc<dyn BatchSink>,
    normalizer: Normalizer,
) -> CycleOutcome {
    let name = source.name().to_string();

    if let Some(gate) = gate {
        let decision = gate.decide(Utc::now()).await;
        if !decision.admit {
            debug!(source = %name, reason = ?decision.reason, "fetch not admitted");
            return CycleOutcome::Skipped {
                reason: decision.reason,
            };
        }
    }

    let items = match source.fetch().await {
        Ok(items) => items,
        Err(err) => {
            warn!(source = %name, error = %err, "fetch failed");
            return CycleOutcome::FetchFailed {
                error: err.to_string(),
            };
        }
    };
    if items.is_empty() {
        info!(source = %name, "source returned no items");
        return CycleOutcome::Empty;
    }

    let fetched = items.len();
    let normalized = normalizer.normalize(items);
    if normalized.records.is_empty() {
        info!(source = %name, fetched, dropped = normalized.dropped, "nothing left after normalizing");
        return CycleOutcome::Empty;
    }

    match sink.save_batch(&normalized.records).await {
        Ok(summary) => {
            if !summary.channels.is_empty() {
                if let Some(handle) = sink.refresh_views(&summary.channels) {
                    watch_refresh(name.clone(), handle);
                }
            }
            CycleOutcome::Saved {
                fetched,
                normalized: normalized.records.len(),
                duplicates: normalized.duplicates,
                written: summary.written,
                skipped_unrouted: summary.skipped_unrouted,
            }
        }
        Err(err) => {
            error!(source = %name, error = %err, "persisting batch failed");
            CycleOutcome::PersistFailed {
                error: err.to_string(),
            }
        }
    }
}

fn watch_refresh(source: String, handle: tokio::task::JoinHandle<thub_storage::CacheRefreshOutcome>) {
    tokio::spawn(async move {
        match handle.await {
            Ok(outcome) if outcome.timed_out => {
                warn!(%source, refreshed = outcome.refreshed, "cache refresh timed out")
            }
            Ok(outcome) => debug!(
                %source,
                refreshed = outcome.refreshed,
                failed = outcome.failed,
                "cache refreshed"
            ),
            Err(err) => warn!(%source, error = %err, "cache refresh task failed"),
        }
    });
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "cycle task cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
