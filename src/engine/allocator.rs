use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::store::ScheduleStore;
use super::EngineError;

/// Outcome of one allocation. A pure decision: nothing is reserved until the
/// caller commits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub physical_room: RoomId,
    pub virtual_room: VirtualRoomId,
    pub requested_size: RoomSize,
    pub used_size: RoomSize,
    pub upgraded: bool,
}

impl Allocation {
    pub fn virtual_room_info(&self) -> VirtualRoomInfo {
        VirtualRoomInfo {
            virtual_room_id: self.virtual_room,
            requested_size: self.requested_size,
            used_size: self.used_size,
            upgraded: self.upgraded,
        }
    }

    pub fn admin_notes(&self) -> AdminNotes {
        AdminNotes {
            virtual_size_to_use: Some(self.used_size),
            text: None,
        }
    }
}

/// Walk the priority list for `size`, then each larger size, and return the
/// first virtual room whose physical room is free for `window`.
///
/// Physical rooms in `exclude` are skipped; schedules in `ignore` do not
/// count as conflicts.
pub async fn allocate(
    store: &dyn ScheduleStore,
    size: RoomSize,
    window: Window,
    ignore: &[Ulid],
    exclude: &[RoomId],
) -> Result<Allocation, EngineError> {
    let directory = store.directory().await?;
    for used_size in size.escalation() {
        for vr in directory.list_by_size(used_size) {
            if exclude.contains(&vr.physical_room) {
                continue;
            }
            if store.has_conflict(vr.physical_room, window, ignore).await? {
                continue;
            }
            let allocation = Allocation {
                physical_room: vr.physical_room,
                virtual_room: vr.id,
                requested_size: size,
                used_size,
                upgraded: used_size != size,
            };
            metrics::counter!(
                crate::observability::ALLOCATIONS_TOTAL,
                "outcome" => if allocation.upgraded { "upgraded" } else { "exact" }
            )
            .increment(1);
            return Ok(allocation);
        }
    }
    metrics::counter!(crate::observability::ALLOCATIONS_TOTAL, "outcome" => "exhausted").increment(1);
    Err(EngineError::NoRoomAvailable { size })
}

/// Allocate `count` distinct physical rooms for the same window.
pub async fn allocate_many(
    store: &dyn ScheduleStore,
    size: RoomSize,
    window: Window,
    count: u32,
    ignore: &[Ulid],
    exclude: &[RoomId],
) -> Result<Vec<Allocation>, EngineError> {
    let mut taken: Vec<RoomId> = exclude.to_vec();
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let allocation = allocate(store, size, window, ignore, &taken).await?;
        taken.push(allocation.physical_room);
        out.push(allocation);
    }
    Ok(out)
}
