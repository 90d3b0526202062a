use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Ms, RoomId};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainEventKind {
    BookingCreated,
    BookingConfirmed,
    BookingCancelled,
    ScheduleStarted,
    ScheduleFinished,
    ScheduleCancelled,
    ScheduleAutoCancelled,
    ScheduleAutoFinished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainEvent {
    pub kind: DomainEventKind,
    pub booking_id: Option<Ulid>,
    pub schedule_id: Option<Ulid>,
    pub room_id: Option<RoomId>,
    pub at: Ms,
}

impl DomainEvent {
    pub fn booking(kind: DomainEventKind, booking_id: Ulid, at: Ms) -> Self {
        Self {
            kind,
            booking_id: Some(booking_id),
            schedule_id: None,
            room_id: None,
            at,
        }
    }

    pub fn schedule(kind: DomainEventKind, schedule: &crate::model::RoomSchedule, at: Ms) -> Self {
        Self {
            kind,
            booking_id: schedule.booking_id,
            schedule_id: Some(schedule.id),
            room_id: Some(schedule.room_id),
            at,
        }
    }
}

/// Broadcast hub for domain events: one firehose plus a channel per physical
/// room. Sending never fails the transition that produced the event.
pub struct NotifyHub {
    all: broadcast::Sender<DomainEvent>,
    rooms: DashMap<RoomId, broadcast::Sender<DomainEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            rooms: DashMap::new(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<DomainEvent> {
        self.all.subscribe()
    }

    /// Subscribe to schedule events on one room. Creates the channel if needed.
    pub fn subscribe_room(&self, room_id: RoomId) -> broadcast::Receiver<DomainEvent> {
        let sender = self
            .rooms
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, event: DomainEvent) {
        if let Some(room_id) = event.room_id
            && let Some(sender) = self.rooms.get(&room_id)
        {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(room_id: RoomId) -> DomainEvent {
        DomainEvent {
            kind: DomainEventKind::ScheduleStarted,
            booking_id: None,
            schedule_id: Some(Ulid::new()),
            room_id: Some(room_id),
            at: 0,
        }
    }

    #[tokio::test]
    async fn room_subscribers_only_see_their_room() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe_room(1);
        let mut all = hub.subscribe_all();

        hub.send(started(2));
        let mine = started(1);
        hub.send(mine.clone());

        assert_eq!(rx.recv().await.unwrap(), mine);
        assert_eq!(all.recv().await.unwrap().room_id, Some(2));
        assert_eq!(all.recv().await.unwrap(), mine);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(DomainEvent::booking(DomainEventKind::BookingCreated, Ulid::new(), 0));
    }

    #[test]
    fn event_kinds_serialize_snake_case() {
        let json = serde_json::to_string(&DomainEventKind::ScheduleAutoCancelled).unwrap();
        assert_eq!(json, "\"schedule_auto_cancelled\"");
    }
}
