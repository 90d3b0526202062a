mod admin;
mod allocator;
mod bookings;
mod conflict;
mod directory;
mod error;
mod queries;
mod schedules;
mod store;

pub use allocator::{allocate, allocate_many, Allocation};
pub use bookings::BookingRequest;
pub use conflict::validate_window;
pub use directory::{validate_bands, Directory};
pub use error::EngineError;
pub use schedules::WalkInRequest;
pub use store::{
    ConversionCommit, RoomStore, ScheduleChange, ScheduleFilter, ScheduleStore, ScheduleUpdate, SharedBooking,
    SharedRoomState,
};

pub(crate) use conflict::now_ms;

use std::sync::Arc;

use crate::notify::{DomainEvent, NotifyHub};

pub const DEFAULT_COMMIT_RETRIES: u32 = 3;

/// Booking lifecycle manager. Owns the booking state machine, turns
/// accepted bookings into schedules, and mediates every staff or sweeper
/// transition. All state lives in the store; the engine itself is cheap to
/// share behind an `Arc`.
pub struct Engine {
    store: Arc<dyn ScheduleStore>,
    pub notify: Arc<NotifyHub>,
    /// How many times a commit that lost a room race is re-allocated.
    commit_retries: u32,
}

impl Engine {
    pub fn new(store: Arc<dyn ScheduleStore>, notify: Arc<NotifyHub>) -> Self {
        Self {
            store,
            notify,
            commit_retries: DEFAULT_COMMIT_RETRIES,
        }
    }

    pub fn with_commit_retries(mut self, retries: u32) -> Self {
        self.commit_retries = retries;
        self
    }

    pub fn store(&self) -> &dyn ScheduleStore {
        self.store.as_ref()
    }

    fn emit(&self, event: DomainEvent) {
        self.notify.send(event);
    }
}
