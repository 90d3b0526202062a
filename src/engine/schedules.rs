use tracing::{debug, info};
use ulid::Ulid;

use crate::auth::Principal;
use crate::limits::MAX_NOTE_LEN;
use crate::model::*;
use crate::notify::{DomainEvent, DomainEventKind};

use super::conflict::{now_ms, validate_window};
use super::store::{ScheduleChange, ScheduleUpdate};
use super::{Engine, EngineError};

pub const NO_SHOW_REASON: &str = "no-show";
pub const DAY_CLOSED_REASON: &str = "day closed";

/// A staff reservation straight onto a physical room, without a booking.
#[derive(Debug, Clone)]
pub struct WalkInRequest {
    pub room_id: RoomId,
    pub window: Window,
    pub note: Option<String>,
}

impl Engine {
    pub async fn reserve_walk_in(&self, request: WalkInRequest, by: &Principal) -> Result<RoomSchedule, EngineError> {
        by.ensure_staff("reserve walk-ins")?;
        validate_window(&request.window)?;
        if request.note.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("note too long"));
        }
        let now = now_ms();
        let schedule = RoomSchedule {
            id: Ulid::new(),
            room_id: request.room_id,
            booking_id: None,
            window: request.window,
            status: ScheduleStatus::Booked,
            virtual_room: None,
            admin_notes: AdminNotes {
                virtual_size_to_use: None,
                text: request.note,
            },
            cancel_reason: None,
            created_by: by.id.clone(),
            updated_by: by.id.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_walk_in(schedule.clone()).await?;
        info!("walk-in {} on room {} by {by}", schedule.id, schedule.room_id);
        Ok(schedule)
    }

    pub async fn start_schedule(&self, id: Ulid, by: &Principal) -> Result<RoomSchedule, EngineError> {
        by.ensure_staff("start schedules")?;
        let s = self
            .transition(id, Some(ScheduleStatus::Booked), ScheduleChange::Start, by)
            .await?;
        self.emit(DomainEvent::schedule(DomainEventKind::ScheduleStarted, &s, s.updated_at));
        Ok(s)
    }

    /// Close an in-use schedule now. An open end becomes `max(now, start)`.
    pub async fn finish_schedule(&self, id: Ulid, by: &Principal) -> Result<RoomSchedule, EngineError> {
        by.ensure_staff("finish schedules")?;
        let s = self
            .transition(id, Some(ScheduleStatus::InUse), ScheduleChange::Finish { at: now_ms() }, by)
            .await?;
        self.emit(DomainEvent::schedule(DomainEventKind::ScheduleFinished, &s, s.updated_at));
        Ok(s)
    }

    pub async fn cancel_schedule(&self, id: Ulid, reason: Option<String>, by: &Principal) -> Result<RoomSchedule, EngineError> {
        by.ensure_staff("cancel schedules")?;
        if reason.as_ref().is_some_and(|r| r.len() > MAX_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let reason = reason.unwrap_or_else(|| format!("cancelled by {}", by.id));
        let s = self.transition(id, None, ScheduleChange::Cancel { reason }, by).await?;
        self.emit(DomainEvent::schedule(DomainEventKind::ScheduleCancelled, &s, s.updated_at));
        self.settle(&s, by).await?;
        Ok(s)
    }

    /// Extend, shorten, open or close a live schedule's end.
    pub async fn set_schedule_end(&self, id: Ulid, end: Option<Ms>, by: &Principal) -> Result<RoomSchedule, EngineError> {
        by.ensure_staff("change schedule ends")?;
        let current = self.store.get_schedule(id).await?;
        validate_window(&Window {
            start: current.window.start,
            end,
        })?;
        self.transition(id, None, ScheduleChange::SetEnd { end }, by).await
    }

    /// Sweeper: cancel a schedule still `booked` past its grace period.
    /// Returns `false` when someone else already moved it.
    pub async fn auto_cancel_no_show(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let by = Principal::sweeper();
        let change = ScheduleChange::Cancel {
            reason: NO_SHOW_REASON.into(),
        };
        let s = match self.transition_at(id, Some(ScheduleStatus::Booked), change, &by, now).await {
            Ok(s) => s,
            Err(EngineError::InvalidTransition { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.emit(DomainEvent::schedule(DomainEventKind::ScheduleAutoCancelled, &s, now));
        self.settle(&s, &by).await?;
        Ok(true)
    }

    /// Sweeper: close out a schedule that started before the day cutoff.
    /// In-use schedules finish at the cutoff; booked ones are cancelled.
    pub async fn auto_close_day(&self, schedule: &RoomSchedule, cutoff: Ms, now: Ms) -> Result<bool, EngineError> {
        let by = Principal::sweeper();
        let (expected, change, kind) = match schedule.status {
            ScheduleStatus::InUse => (
                ScheduleStatus::InUse,
                ScheduleChange::Finish { at: cutoff },
                DomainEventKind::ScheduleAutoFinished,
            ),
            ScheduleStatus::Booked => (
                ScheduleStatus::Booked,
                ScheduleChange::Cancel {
                    reason: DAY_CLOSED_REASON.into(),
                },
                DomainEventKind::ScheduleAutoCancelled,
            ),
            _ => return Ok(false),
        };
        let s = match self.transition_at(schedule.id, Some(expected), change, &by, now).await {
            Ok(s) => s,
            Err(EngineError::InvalidTransition { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.emit(DomainEvent::schedule(kind, &s, now));
        if s.status == ScheduleStatus::Cancelled {
            self.settle(&s, &by).await?;
        }
        Ok(true)
    }

    async fn transition(
        &self,
        id: Ulid,
        expected: Option<ScheduleStatus>,
        change: ScheduleChange,
        by: &Principal,
    ) -> Result<RoomSchedule, EngineError> {
        self.transition_at(id, expected, change, by, now_ms()).await
    }

    async fn transition_at(
        &self,
        id: Ulid,
        expected: Option<ScheduleStatus>,
        change: ScheduleChange,
        by: &Principal,
        at: Ms,
    ) -> Result<RoomSchedule, EngineError> {
        let s = self
            .store
            .update_schedule(ScheduleUpdate {
                id,
                expected,
                change,
                by: by.id.clone(),
                at,
            })
            .await?;
        debug!("schedule {id} on room {} is now {} ({by})", s.room_id, s.status);
        Ok(s)
    }

    /// A confirmed booking whose last live schedule was cancelled is cancelled too.
    async fn settle(&self, schedule: &RoomSchedule, by: &Principal) -> Result<(), EngineError> {
        let Some(booking_id) = schedule.booking_id else {
            return Ok(());
        };
        if let Some(booking) = self.store.settle_booking(booking_id, by.id.clone(), schedule.updated_at).await? {
            info!("booking {booking_id} cancelled: no live schedules left");
            self.emit(DomainEvent::booking(DomainEventKind::BookingCancelled, booking_id, booking.updated_at));
        }
        Ok(())
    }
}
