use std::collections::BTreeMap;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Snapshot of the physical rooms and the virtual rooms mapped onto them.
///
/// Read-mostly. Every write goes through [`Directory::put_virtual_rooms`],
/// which re-checks the priority-band rule over the whole candidate set
/// before anything is replaced.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    physical: BTreeMap<RoomId, PhysicalRoom>,
    virtual_rooms: BTreeMap<VirtualRoomId, VirtualRoom>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn physical_room(&self, id: RoomId) -> Option<&PhysicalRoom> {
        self.physical.get(&id)
    }

    pub fn physical_rooms(&self) -> impl Iterator<Item = &PhysicalRoom> {
        self.physical.values()
    }

    pub fn virtual_rooms(&self) -> impl Iterator<Item = &VirtualRoom> {
        self.virtual_rooms.values()
    }

    pub fn resolve(&self, id: VirtualRoomId) -> Result<&VirtualRoom, EngineError> {
        self.virtual_rooms
            .get(&id)
            .ok_or(EngineError::VirtualRoomNotFound(id))
    }

    /// Active virtual rooms of one size, lowest rank first, ties by lowest id.
    pub fn list_by_size(&self, size: RoomSize) -> Vec<&VirtualRoom> {
        let mut rooms: Vec<&VirtualRoom> = self
            .virtual_rooms
            .values()
            .filter(|vr| vr.active && vr.size == size && self.physical.contains_key(&vr.physical_room))
            .collect();
        rooms.sort_by_key(|vr| (vr.priority, vr.id));
        rooms
    }

    pub fn put_physical_room(&mut self, room: PhysicalRoom) -> Result<(), EngineError> {
        validate_name(&room.name)?;
        self.physical.insert(room.id, room);
        Ok(())
    }

    /// Create, update or recreate several virtual rooms as one change.
    /// Nothing is applied unless the resulting directory passes validation.
    pub fn put_virtual_rooms(&mut self, rooms: Vec<VirtualRoom>) -> Result<(), EngineError> {
        let mut candidate = self.virtual_rooms.clone();
        for vr in rooms {
            validate_name(&vr.name)?;
            if !self.physical.contains_key(&vr.physical_room) {
                return Err(EngineError::RoomNotFound(vr.physical_room));
            }
            candidate.insert(vr.id, vr);
        }
        if candidate.len() > MAX_VIRTUAL_ROOMS {
            return Err(EngineError::LimitExceeded("too many virtual rooms"));
        }
        validate_bands(candidate.values())?;
        self.virtual_rooms = candidate;
        Ok(())
    }

    /// Replay path: records were validated when first written.
    pub(super) fn restore_physical_room(&mut self, room: PhysicalRoom) {
        self.physical.insert(room.id, room);
    }

    pub(super) fn restore_virtual_room(&mut self, vr: VirtualRoom) {
        self.virtual_rooms.insert(vr.id, vr);
    }
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("room name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    Ok(())
}

/// Priority ranks must be unique, form one consecutive run, and never step
/// down a size class when walked in rank order. Inactive rooms keep their
/// rank, so deactivating a room never opens a gap.
pub fn validate_bands<'a>(rooms: impl IntoIterator<Item = &'a VirtualRoom>) -> Result<(), EngineError> {
    let mut ranked: Vec<&VirtualRoom> = rooms.into_iter().collect();
    ranked.sort_by_key(|vr| vr.priority);

    for pair in ranked.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if a.priority == b.priority {
            return Err(EngineError::Config(format!(
                "virtual rooms {} and {} share priority rank {}",
                a.id, b.id, a.priority
            )));
        }
        if b.priority != a.priority + 1 {
            return Err(EngineError::Config(format!(
                "gap in priority ranks between {} and {}",
                a.priority, b.priority
            )));
        }
        if b.size < a.size {
            return Err(EngineError::Config(format!(
                "rank {} ({}) follows rank {} ({}): size bands overlap",
                b.priority, b.size, a.priority, a.size
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vr(id: VirtualRoomId, size: RoomSize, physical_room: RoomId, priority: u32) -> VirtualRoom {
        VirtualRoom {
            id,
            name: format!("V{id}"),
            size,
            physical_room,
            priority,
            active: true,
        }
    }

    fn with_rooms(n: RoomId) -> Directory {
        let mut dir = Directory::new();
        for id in 1..=n {
            dir.put_physical_room(PhysicalRoom { id, name: format!("P{id}") }).unwrap();
        }
        dir
    }

    #[test]
    fn list_by_size_is_priority_ordered_and_active_only() {
        let mut dir = with_rooms(4);
        dir.put_virtual_rooms(vec![
            vr(1, RoomSize::Small, 1, 1),
            vr(2, RoomSize::Small, 2, 2),
            vr(3, RoomSize::Small, 3, 3),
            vr(4, RoomSize::Medium, 4, 4),
        ])
        .unwrap();
        let mut off = vr(2, RoomSize::Small, 2, 2);
        off.active = false;
        dir.put_virtual_rooms(vec![off]).unwrap();

        let small: Vec<_> = dir.list_by_size(RoomSize::Small).iter().map(|v| v.id).collect();
        assert_eq!(small, vec![1, 3]);
        assert_eq!(dir.list_by_size(RoomSize::Large).len(), 0);
    }

    #[test]
    fn resolve_unknown_is_not_found() {
        let dir = with_rooms(1);
        assert_eq!(dir.resolve(9), Err(EngineError::VirtualRoomNotFound(9)));
    }

    #[test]
    fn duplicate_rank_rejected() {
        let mut dir = with_rooms(2);
        let result = dir.put_virtual_rooms(vec![vr(1, RoomSize::Small, 1, 1), vr(2, RoomSize::Small, 2, 1)]);
        assert!(matches!(result, Err(EngineError::Config(_))));
        assert_eq!(dir.virtual_rooms().count(), 0);
    }

    #[test]
    fn gap_rejected() {
        let mut dir = with_rooms(2);
        let result = dir.put_virtual_rooms(vec![vr(1, RoomSize::Small, 1, 1), vr(2, RoomSize::Medium, 2, 3)]);
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn overlapping_bands_rejected() {
        let mut dir = with_rooms(3);
        let result = dir.put_virtual_rooms(vec![
            vr(1, RoomSize::Small, 1, 1),
            vr(2, RoomSize::Medium, 2, 2),
            vr(3, RoomSize::Small, 3, 3),
        ]);
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn failed_update_leaves_directory_untouched() {
        let mut dir = with_rooms(2);
        dir.put_virtual_rooms(vec![vr(1, RoomSize::Small, 1, 1), vr(2, RoomSize::Medium, 2, 2)])
            .unwrap();
        // Moving the medium room into rank 1 collides with the small one.
        let result = dir.put_virtual_rooms(vec![vr(2, RoomSize::Medium, 2, 1)]);
        assert!(result.is_err());
        assert_eq!(dir.resolve(2).unwrap().priority, 2);
    }

    #[test]
    fn virtual_room_needs_physical_room() {
        let mut dir = with_rooms(1);
        let result = dir.put_virtual_rooms(vec![vr(1, RoomSize::Small, 5, 1)]);
        assert_eq!(result, Err(EngineError::RoomNotFound(5)));
    }

    #[test]
    fn two_virtual_rooms_may_share_a_physical_room() {
        let mut dir = with_rooms(1);
        dir.put_virtual_rooms(vec![vr(1, RoomSize::Medium, 1, 1), vr(2, RoomSize::Large, 1, 2)])
            .unwrap();
        assert_eq!(dir.list_by_size(RoomSize::Large)[0].physical_room, 1);
    }
}
