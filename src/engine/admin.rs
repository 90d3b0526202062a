use tracing::info;

use crate::auth::Principal;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn put_physical_room(&self, room: PhysicalRoom, by: &Principal) -> Result<(), EngineError> {
        by.ensure_staff("manage rooms")?;
        let id = room.id;
        self.store.put_physical_room(room).await?;
        info!("physical room {id} saved by {by}");
        Ok(())
    }

    /// Create, update or recreate one virtual room.
    pub async fn put_virtual_room(&self, room: VirtualRoom, by: &Principal) -> Result<(), EngineError> {
        self.put_virtual_rooms(vec![room], by).await
    }

    /// Apply several virtual-room changes as one directory update, so a rank
    /// reshuffle never has to pass through an invalid intermediate layout.
    pub async fn put_virtual_rooms(&self, rooms: Vec<VirtualRoom>, by: &Principal) -> Result<(), EngineError> {
        by.ensure_staff("manage rooms")?;
        let count = rooms.len();
        self.store.put_virtual_rooms(rooms).await?;
        info!("{count} virtual room(s) saved by {by}");
        Ok(())
    }

    /// Virtual rooms are never deleted. Existing schedules keep their info.
    pub async fn deactivate_virtual_room(&self, id: VirtualRoomId, by: &Principal) -> Result<VirtualRoom, EngineError> {
        by.ensure_staff("manage rooms")?;
        let mut room = self.store.directory().await?.resolve(id)?.clone();
        room.active = false;
        self.store.put_virtual_rooms(vec![room.clone()]).await?;
        info!("virtual room {id} deactivated by {by}");
        Ok(room)
    }
}
