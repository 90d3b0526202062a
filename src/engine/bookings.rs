use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::auth::Principal;
use crate::limits::*;
use crate::model::*;
use crate::notify::{DomainEvent, DomainEventKind};

use super::allocator::{allocate_many, Allocation};
use super::conflict::{now_ms, validate_window};
use super::store::ConversionCommit;
use super::{Engine, EngineError};

pub const EXPIRED_REASON: &str = "expired";

/// What a customer or staff member asks for.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub size: RoomSize,
    pub window: Window,
    pub rooms: u32,
    pub contact: Contact,
    pub note: Option<String>,
    /// Try to convert right away instead of waiting for the sweeper.
    pub convert_now: bool,
}

impl BookingRequest {
    fn validate(&self) -> Result<(), EngineError> {
        validate_window(&self.window)?;
        if self.rooms == 0 {
            return Err(EngineError::Validation("a booking needs at least one room".into()));
        }
        if self.rooms > MAX_ROOMS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many rooms in one booking"));
        }
        if self.contact.name.trim().is_empty() {
            return Err(EngineError::Validation("contact name must not be empty".into()));
        }
        if self.contact.name.len() > MAX_CONTACT_LEN
            || self.contact.phone.as_ref().is_some_and(|p| p.len() > MAX_CONTACT_LEN)
        {
            return Err(EngineError::LimitExceeded("contact too long"));
        }
        if self.note.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("note too long"));
        }
        Ok(())
    }
}

fn schedule_for(booking: &Booking, allocation: &Allocation, window: Window, by: &str, at: Ms) -> RoomSchedule {
    let mut admin_notes = allocation.admin_notes();
    admin_notes.text = booking.note.clone();
    RoomSchedule {
        id: Ulid::new(),
        room_id: allocation.physical_room,
        booking_id: Some(booking.id),
        window,
        status: ScheduleStatus::Booked,
        virtual_room: Some(allocation.virtual_room_info()),
        admin_notes,
        cancel_reason: None,
        created_by: by.to_string(),
        updated_by: by.to_string(),
        created_at: at,
        updated_at: at,
    }
}

impl Engine {
    pub async fn create_booking(&self, request: BookingRequest, by: &Principal) -> Result<Booking, EngineError> {
        request.validate()?;
        let now = now_ms();
        let booking = Booking {
            id: Ulid::new(),
            size: request.size,
            window: request.window,
            rooms: request.rooms,
            contact: request.contact,
            source: by.source(),
            note: request.note,
            status: BookingStatus::Pending,
            schedule_ids: Vec::new(),
            last_failure: None,
            cancel_reason: None,
            created_by: by.id.clone(),
            updated_by: by.id.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_booking(booking.clone()).await?;
        info!("booking {} created by {by}: {} x{}", booking.id, booking.size, booking.rooms);
        self.emit(DomainEvent::booking(DomainEventKind::BookingCreated, booking.id, now));

        if !request.convert_now {
            return Ok(booking);
        }
        match self.convert_booking(booking.id, by).await {
            Ok(confirmed) => Ok(confirmed),
            // The booking exists and stays pending; the sweeper retries.
            Err(e) if e.is_retryable() => self.store.get_booking(booking.id).await,
            Err(e) => Err(e),
        }
    }

    /// Allocate every room the booking needs and commit all schedules in one
    /// step. On failure nothing is committed and the reason is recorded on
    /// the still-pending booking.
    pub async fn convert_booking(&self, id: Ulid, by: &Principal) -> Result<Booking, EngineError> {
        let booking = self.store.get_booking(id).await?;
        match booking.status {
            BookingStatus::Pending => {}
            BookingStatus::Cancelled => return Err(EngineError::BookingCancelled(id)),
            BookingStatus::Confirmed => {
                return Err(EngineError::InvalidBookingState {
                    id,
                    status: booking.status,
                    action: "convert",
                });
            }
        }

        match self
            .commit_allocation(&booking, booking.window, BookingStatus::Pending, &[], by)
            .await
        {
            Ok(confirmed) => {
                info!("booking {id} confirmed on {} room(s)", confirmed.rooms);
                self.emit(DomainEvent::booking(DomainEventKind::BookingConfirmed, id, confirmed.updated_at));
                Ok(confirmed)
            }
            Err(e) => {
                self.record_failure(id, &e, by).await;
                Err(e)
            }
        }
    }

    pub async fn cancel_booking(&self, id: Ulid, reason: Option<String>, by: &Principal) -> Result<Booking, EngineError> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let now = now_ms();
        let reason = reason.unwrap_or_else(|| format!("cancelled by {}", by.id));
        let (booking, cascade) = self.store.cancel_booking(id, reason, by.id.clone(), now).await?;
        info!("booking {id} cancelled by {by}, {} schedule(s) released", cascade.len());
        for s in &cascade {
            self.emit(DomainEvent::schedule(DomainEventKind::ScheduleCancelled, s, now));
        }
        self.emit(DomainEvent::booking(DomainEventKind::BookingCancelled, id, now));
        Ok(booking)
    }

    /// Sweeper: cancel a booking that is still pending once its window is
    /// over. `false` if it was converted or cancelled in the meantime.
    pub async fn expire_pending(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let by = Principal::sweeper();
        match self.store.expire_booking(id, EXPIRED_REASON.into(), by.id.clone(), now).await? {
            Some(_) => {
                info!("pending booking {id} expired unconverted");
                self.emit(DomainEvent::booking(DomainEventKind::BookingCancelled, id, now));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Move a booking to a new window. Pending bookings only change their
    /// window. Confirmed bookings are re-allocated, reusing their own rooms
    /// where possible, and keep their old schedules unless the whole new
    /// allocation commits.
    pub async fn modify_booking(&self, id: Ulid, window: Window, by: &Principal) -> Result<Booking, EngineError> {
        validate_window(&window)?;
        let booking = self.store.get_booking(id).await?;
        match booking.status {
            BookingStatus::Cancelled => Err(EngineError::BookingCancelled(id)),
            BookingStatus::Pending => {
                let updated = self.store.set_pending_window(id, window, by.id.clone(), now_ms()).await?;
                info!("pending booking {id} moved by {by}");
                Ok(updated)
            }
            BookingStatus::Confirmed => {
                let mut live = Vec::new();
                for sid in &booking.schedule_ids {
                    let s = self.store.get_schedule(*sid).await?;
                    if s.status == ScheduleStatus::Cancelled {
                        continue;
                    }
                    if s.status != ScheduleStatus::Booked {
                        return Err(EngineError::InvalidBookingState {
                            id,
                            status: booking.status,
                            action: "modify once a room is in use",
                        });
                    }
                    live.push(s.id);
                }

                let updated = self
                    .commit_allocation(&booking, window, BookingStatus::Confirmed, &live, by)
                    .await?;
                info!("booking {id} moved by {by}, {} schedule(s) replaced", live.len());
                for sid in &live {
                    if let Ok(s) = self.store.get_schedule(*sid).await {
                        self.emit(DomainEvent::schedule(DomainEventKind::ScheduleCancelled, &s, updated.updated_at));
                    }
                }
                self.emit(DomainEvent::booking(DomainEventKind::BookingConfirmed, id, updated.updated_at));
                Ok(updated)
            }
        }
    }

    /// Allocate and commit, retrying with the raced room excluded whenever a
    /// concurrent writer took it between decision and commit.
    async fn commit_allocation(
        &self,
        booking: &Booking,
        window: Window,
        expected: BookingStatus,
        replaces: &[Ulid],
        by: &Principal,
    ) -> Result<Booking, EngineError> {
        let mut excluded: Vec<RoomId> = Vec::new();
        for attempt in 0..=self.commit_retries {
            let allocations =
                allocate_many(self.store(), booking.size, window, booking.rooms, replaces, &excluded).await?;
            let now = now_ms();
            let schedules = allocations
                .iter()
                .map(|a| schedule_for(booking, a, window, &by.id, now))
                .collect();
            let commit = ConversionCommit {
                booking_id: booking.id,
                expected,
                schedules,
                replaces: replaces.to_vec(),
                window,
                by: by.id.clone(),
                at: now,
            };
            match self.store.commit_conversion(commit).await {
                Err(EngineError::ConflictRace(room)) => {
                    metrics::counter!(crate::observability::COMMIT_RACES_TOTAL).increment(1);
                    warn!(
                        "booking {}: lost room {room} to a concurrent commit (attempt {})",
                        booking.id,
                        attempt + 1
                    );
                    excluded.push(room);
                }
                other => return other,
            }
        }
        Err(EngineError::NoRoomAvailable { size: booking.size })
    }

    async fn record_failure(&self, id: Ulid, error: &EngineError, by: &Principal) {
        if matches!(
            error,
            EngineError::BookingCancelled(_) | EngineError::InvalidBookingState { .. } | EngineError::StoreUnavailable(_)
        ) {
            return;
        }
        warn!("booking {id} not converted: {error}");
        if let Err(e) = self
            .store
            .record_conversion_failure(id, error.to_string(), by.id.clone(), now_ms())
            .await
        {
            debug!("could not record conversion failure on {id}: {e}");
        }
    }
}
