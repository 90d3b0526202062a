use ulid::Ulid;

use crate::model::*;

use super::allocator::{allocate, Allocation};
use super::conflict::validate_window;
use super::store::ScheduleFilter;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store.get_booking(id).await
    }

    pub async fn list_bookings(&self, status: Option<BookingStatus>) -> Result<Vec<Booking>, EngineError> {
        self.store.list_bookings(status).await
    }

    pub async fn get_schedule(&self, id: Ulid) -> Result<RoomSchedule, EngineError> {
        self.store.get_schedule(id).await
    }

    pub async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<RoomSchedule>, EngineError> {
        self.store.list_schedules(filter).await
    }

    /// Every schedule a booking produced, including replaced and cancelled ones.
    pub async fn booking_schedules(&self, id: Ulid) -> Result<Vec<RoomSchedule>, EngineError> {
        self.list_schedules(&ScheduleFilter {
            booking_id: Some(id),
            ..Default::default()
        })
        .await
    }

    /// Virtual rooms in allocation order. With a size, only the active rooms
    /// the allocator would walk for it.
    pub async fn list_virtual_rooms(&self, size: Option<RoomSize>) -> Result<Vec<VirtualRoom>, EngineError> {
        let directory = self.store.directory().await?;
        let mut rooms: Vec<VirtualRoom> = match size {
            Some(size) => directory.list_by_size(size).into_iter().cloned().collect(),
            None => directory.virtual_rooms().cloned().collect(),
        };
        rooms.sort_by_key(|vr| (vr.priority, vr.id));
        Ok(rooms)
    }

    pub async fn list_physical_rooms(&self) -> Result<Vec<PhysicalRoom>, EngineError> {
        Ok(self.store.directory().await?.physical_rooms().cloned().collect())
    }

    /// What `convert` would pick right now. Reserves nothing.
    pub async fn preview_allocation(&self, size: RoomSize, window: Window) -> Result<Allocation, EngineError> {
        validate_window(&window)?;
        allocate(self.store(), size, window, &[], &[]).await
    }
}
