use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::auth::Principal;
use crate::engine::{now_ms, Engine, EngineError, RoomStore, ScheduleFilter};
use crate::model::*;

const DAY_MS: Ms = 24 * 3_600_000;

/// When a duty runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Every(Duration),
    /// Once a day at a local wall-clock time.
    DailyAt { cutoff: NaiveTime, offset: FixedOffset },
}

/// Outcome of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub examined: usize,
    pub transitioned: usize,
    pub failed: Vec<(Ulid, EngineError)>,
}

/// A periodic, idempotent state transition over the store. A failure on one
/// record is recorded in the report and never stops the sweep; an `Err` from
/// `run` means the store could not be read at all.
#[async_trait]
pub trait SweepDuty: Send + Sync {
    fn name(&self) -> &'static str;
    fn cadence(&self) -> Cadence;
    async fn run(&self, engine: &Engine, now: Ms) -> Result<SweepReport, EngineError>;
}

/// Cancels `booked` schedules whose start is more than `grace` in the past.
pub struct AutoCancelLate {
    pub grace: Duration,
    pub every: Duration,
}

#[async_trait]
impl SweepDuty for AutoCancelLate {
    fn name(&self) -> &'static str {
        "auto_cancel_late"
    }

    fn cadence(&self) -> Cadence {
        Cadence::Every(self.every)
    }

    async fn run(&self, engine: &Engine, now: Ms) -> Result<SweepReport, EngineError> {
        let deadline = now - self.grace.as_millis() as Ms;
        let booked = engine
            .list_schedules(&ScheduleFilter {
                status: Some(ScheduleStatus::Booked),
                ..Default::default()
            })
            .await?;

        let mut report = SweepReport::default();
        for s in booked.iter().filter(|s| s.window.start < deadline) {
            report.examined += 1;
            match engine.auto_cancel_no_show(s.id, now).await {
                Ok(true) => {
                    info!("schedule {} on room {} cancelled as no-show", s.id, s.room_id);
                    report.transitioned += 1;
                }
                Ok(false) => debug!("schedule {} moved on before the sweep reached it", s.id),
                Err(e) => report.failed.push((s.id, e)),
            }
        }
        Ok(report)
    }
}

/// At the day cutoff, finishes schedules still in use and cancels ones never
/// started, for everything that began before the cutoff.
pub struct AutoFinishDay {
    pub cutoff: NaiveTime,
    pub offset: FixedOffset,
}

#[async_trait]
impl SweepDuty for AutoFinishDay {
    fn name(&self) -> &'static str {
        "auto_finish_day"
    }

    fn cadence(&self) -> Cadence {
        Cadence::DailyAt {
            cutoff: self.cutoff,
            offset: self.offset,
        }
    }

    async fn run(&self, engine: &Engine, now: Ms) -> Result<SweepReport, EngineError> {
        let cutoff = last_cutoff(now, self.cutoff, self.offset);
        let mut report = SweepReport::default();
        for status in [ScheduleStatus::InUse, ScheduleStatus::Booked] {
            let schedules = engine
                .list_schedules(&ScheduleFilter {
                    status: Some(status),
                    ..Default::default()
                })
                .await?;
            for s in schedules.iter().filter(|s| s.window.start < cutoff) {
                report.examined += 1;
                match engine.auto_close_day(s, cutoff, now).await {
                    Ok(true) => report.transitioned += 1,
                    Ok(false) => debug!("schedule {} moved on before the sweep reached it", s.id),
                    Err(e) => report.failed.push((s.id, e)),
                }
            }
        }
        Ok(report)
    }
}

/// Retries conversion of every pending booking whose window has not passed,
/// and cancels the ones whose window ended while still pending.
pub struct ConvertPending {
    pub every: Duration,
}

#[async_trait]
impl SweepDuty for ConvertPending {
    fn name(&self) -> &'static str {
        "convert_pending"
    }

    fn cadence(&self) -> Cadence {
        Cadence::Every(self.every)
    }

    async fn run(&self, engine: &Engine, now: Ms) -> Result<SweepReport, EngineError> {
        let pending = engine.list_bookings(Some(BookingStatus::Pending)).await?;
        let by = Principal::sweeper();
        let mut report = SweepReport::default();
        for b in pending {
            report.examined += 1;
            if b.window.end.unwrap_or(b.window.start) <= now {
                match engine.expire_pending(b.id, now).await {
                    Ok(true) => report.transitioned += 1,
                    Ok(false) => debug!("booking {} moved on before the sweep reached it", b.id),
                    Err(e) => report.failed.push((b.id, e)),
                }
                continue;
            }
            match engine.convert_booking(b.id, &by).await {
                Ok(_) => report.transitioned += 1,
                Err(e) => report.failed.push((b.id, e)),
            }
        }
        Ok(report)
    }
}

/// Most recent instant at or before `now` when the local clock read `cutoff`.
pub fn last_cutoff(now: Ms, cutoff: NaiveTime, offset: FixedOffset) -> Ms {
    let Some(utc) = DateTime::from_timestamp_millis(now) else {
        return now;
    };
    let local = utc.with_timezone(&offset);
    let candidate = local.date_naive().and_time(cutoff);
    let at = match offset.from_local_datetime(&candidate).single() {
        Some(dt) => dt.timestamp_millis(),
        None => return now,
    };
    if at > now { at - DAY_MS } else { at }
}

fn until_next_run(cadence: Cadence, now: Ms) -> Duration {
    match cadence {
        Cadence::Every(every) => every,
        Cadence::DailyAt { cutoff, offset } => {
            let next = last_cutoff(now, cutoff, offset) + DAY_MS;
            Duration::from_millis((next - now).max(0) as u64)
        }
    }
}

/// Drive one duty forever. Runs once at startup so work missed while the
/// process was down is caught up, then on the duty's cadence.
pub async fn run_duty(engine: Arc<Engine>, duty: Arc<dyn SweepDuty>) {
    let name = duty.name();
    let mut store_down = false;
    loop {
        let now = now_ms();
        match duty.run(&engine, now).await {
            Ok(report) => {
                if store_down {
                    info!("{name}: store reachable again");
                    store_down = false;
                }
                if report.transitioned > 0 {
                    metrics::counter!(crate::observability::SWEEP_TRANSITIONS_TOTAL, "duty" => name)
                        .increment(report.transitioned as u64);
                    info!("{name}: {} of {} record(s) transitioned", report.transitioned, report.examined);
                }
                for (id, e) in &report.failed {
                    metrics::counter!(crate::observability::SWEEP_ERRORS_TOTAL, "duty" => name).increment(1);
                    warn!("{name}: {id}: {e}");
                }
            }
            Err(e) => {
                if !store_down {
                    error!("{name}: sweep skipped: {e}");
                    store_down = true;
                }
            }
        }
        tokio::time::sleep(until_next_run(duty.cadence(), now_ms())).await;
    }
}

/// Background task that compacts the WAL when appends exceed the threshold.
pub async fn run_compactor(store: Arc<RoomStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends >= threshold {
            match store.compact().await {
                Ok(()) => info!("compacted WAL ({appends} appends since last compaction)"),
                Err(e) => error!("WAL compaction failed: {e}"),
            }
        }
    }
}
