use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type inside the engine.
pub type Ms = i64;

/// Physical room number as assigned by the venue.
pub type RoomId = u32;

pub type VirtualRoomId = u32;

/// Half-open interval `[start, end)`. `end = None` means open-ended: the
/// window extends to infinity until something closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Ms,
    pub end: Option<Ms>,
}

impl Window {
    pub fn new(start: Ms, end: Option<Ms>) -> Self {
        debug_assert!(end.is_none_or(|e| e >= start), "Window end must not precede start");
        Self { start, end }
    }

    pub fn closed(start: Ms, end: Ms) -> Self {
        Self::new(start, Some(end))
    }

    pub fn open(start: Ms) -> Self {
        Self::new(start, None)
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Zero-length windows occupy nothing.
    pub fn is_empty(&self) -> bool {
        self.end == Some(self.start)
    }

    pub fn end_or_max(&self) -> Ms {
        self.end.unwrap_or(Ms::MAX)
    }

    pub fn duration_ms(&self) -> Option<Ms> {
        self.end.map(|e| e - self.start)
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.start < other.end_or_max() && other.start < self.end_or_max()
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end_or_max()
    }
}

/// Customer-facing size class. Ordered: upgrades only ever move up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomSize {
    Small,
    Medium,
    Large,
}

impl RoomSize {
    pub const ALL: [RoomSize; 3] = [RoomSize::Small, RoomSize::Medium, RoomSize::Large];

    pub fn next_larger(self) -> Option<RoomSize> {
        match self {
            RoomSize::Small => Some(RoomSize::Medium),
            RoomSize::Medium => Some(RoomSize::Large),
            RoomSize::Large => None,
        }
    }

    /// This size followed by every larger one, in escalation order.
    pub fn escalation(self) -> impl Iterator<Item = RoomSize> {
        std::iter::successors(Some(self), |s| s.next_larger())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoomSize::Small => "small",
            RoomSize::Medium => "medium",
            RoomSize::Large => "large",
        }
    }
}

impl fmt::Display for RoomSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "small" | "s" => Ok(RoomSize::Small),
            "medium" | "m" => Ok(RoomSize::Medium),
            "large" | "l" => Ok(RoomSize::Large),
            other => Err(format!("unknown room size: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalRoom {
    pub id: RoomId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualRoom {
    pub id: VirtualRoomId,
    pub name: String,
    pub size: RoomSize,
    pub physical_room: RoomId,
    /// Lower ranks are tried first.
    pub priority: u32,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingSource {
    Staff,
    Customer,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub phone: Option<String>,
}

/// An abstract customer intent. Converted into one or more `RoomSchedule`s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub size: RoomSize,
    pub window: Window,
    /// Number of distinct physical rooms required for the window.
    pub rooms: u32,
    pub contact: Contact,
    pub source: BookingSource,
    pub note: Option<String>,
    pub status: BookingStatus,
    /// Every schedule this booking ever produced, oldest first.
    pub schedule_ids: Vec<Ulid>,
    pub last_failure: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleStatus {
    Booked,
    InUse,
    Finished,
    Cancelled,
}

impl ScheduleStatus {
    /// Legal edges: booked → in-use → finished, and cancelled from booked or in-use.
    pub fn can_become(self, next: ScheduleStatus) -> bool {
        use ScheduleStatus::*;
        matches!(
            (self, next),
            (Booked, InUse) | (InUse, Finished) | (Booked, Cancelled) | (InUse, Cancelled)
        )
    }

    /// Whether the schedule still occupies its room for conflict purposes.
    pub fn occupies_room(self) -> bool {
        !matches!(self, ScheduleStatus::Cancelled)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScheduleStatus::Finished | ScheduleStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleStatus::Booked => "booked",
            ScheduleStatus::InUse => "in-use",
            ScheduleStatus::Finished => "finished",
            ScheduleStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which virtual room was used to reach the physical room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualRoomInfo {
    pub virtual_room_id: VirtualRoomId,
    pub requested_size: RoomSize,
    pub used_size: RoomSize,
    pub upgraded: bool,
}

/// Staff-facing notes. `virtual_size_to_use` always equals the size class of
/// the chosen virtual room, upgrade or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminNotes {
    pub virtual_size_to_use: Option<RoomSize>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSchedule {
    pub id: Ulid,
    pub room_id: RoomId,
    /// `None` for walk-ins.
    pub booking_id: Option<Ulid>,
    pub window: Window,
    pub status: ScheduleStatus,
    pub virtual_room: Option<VirtualRoomInfo>,
    pub admin_notes: AdminNotes,
    pub cancel_reason: Option<String>,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// All schedules of one physical room. The unit of write serialization.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: PhysicalRoom,
    /// Sorted by `window.start`. Never shrinks: cancelled and finished
    /// schedules stay for audit.
    pub schedules: Vec<RoomSchedule>,
}

impl RoomState {
    pub fn new(room: PhysicalRoom) -> Self {
        Self {
            room,
            schedules: Vec::new(),
        }
    }

    /// Insert or replace a schedule, keeping sort order by start.
    pub fn put_schedule(&mut self, schedule: RoomSchedule) {
        if let Some(pos) = self.schedules.iter().position(|s| s.id == schedule.id) {
            if self.schedules[pos].window.start == schedule.window.start {
                self.schedules[pos] = schedule;
                return;
            }
            self.schedules.remove(pos);
        }
        let pos = self
            .schedules
            .partition_point(|s| s.window.start <= schedule.window.start);
        self.schedules.insert(pos, schedule);
    }

    pub fn schedule(&self, id: &Ulid) -> Option<&RoomSchedule> {
        self.schedules.iter().find(|s| s.id == *id)
    }

    /// Live (non-cancelled) schedules whose window overlaps `query`.
    /// Uses binary search to skip schedules starting at or after `query`'s end.
    pub fn overlapping<'a>(&'a self, query: &'a Window) -> impl Iterator<Item = &'a RoomSchedule> {
        let right_bound = self
            .schedules
            .partition_point(|s| s.window.start < query.end_or_max());
        self.schedules[..right_bound]
            .iter()
            .filter(move |s| s.status.occupies_room() && s.window.overlaps(query))
    }

    /// First live schedule overlapping `query`, skipping ids in `ignore`.
    pub fn find_conflict(&self, query: &Window, ignore: &[Ulid]) -> Option<Ulid> {
        self.overlapping(query)
            .find(|s| !ignore.contains(&s.id))
            .map(|s| s.id)
    }
}

/// WAL record format. Every record carries the full post-image of what it
/// touches; replay is upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PhysicalRoomPut(PhysicalRoom),
    /// Virtual rooms written together so a replayed directory never sees a
    /// half-applied band change.
    VirtualRoomsPut(Vec<VirtualRoom>),
    BookingPut(Booking),
    SchedulePut(RoomSchedule),
    /// A booking's schedules committed in one step, with the schedules they replace.
    Converted {
        booking: Booking,
        schedules: Vec<RoomSchedule>,
        replaced: Vec<RoomSchedule>,
    },
    /// A booking cancellation and its cascade.
    BookingCancelled {
        booking: Booking,
        schedules: Vec<RoomSchedule>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(start: Ms, end: Option<Ms>, status: ScheduleStatus) -> RoomSchedule {
        RoomSchedule {
            id: Ulid::new(),
            room_id: 1,
            booking_id: None,
            window: Window::new(start, end),
            status,
            virtual_room: None,
            admin_notes: AdminNotes::default(),
            cancel_reason: None,
            created_by: "test".into(),
            updated_by: "test".into(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn room() -> RoomState {
        RoomState::new(PhysicalRoom { id: 1, name: "P1".into() })
    }

    #[test]
    fn window_basics() {
        let w = Window::closed(100, 200);
        assert_eq!(w.duration_ms(), Some(100));
        assert!(w.contains_instant(100));
        assert!(w.contains_instant(199));
        assert!(!w.contains_instant(200)); // half-open
        assert!(Window::open(100).contains_instant(i64::MAX - 1));
    }

    #[test]
    fn window_overlap() {
        let a = Window::closed(100, 200);
        let b = Window::closed(150, 250);
        let c = Window::closed(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn open_window_blocks_everything_after_start() {
        let open = Window::open(1000);
        assert!(open.overlaps(&Window::closed(5000, 6000)));
        assert!(open.overlaps(&Window::closed(500, 1001)));
        assert!(!open.overlaps(&Window::closed(500, 1000)));
    }

    #[test]
    fn empty_window_overlaps_nothing() {
        let empty = Window::closed(150, 150);
        assert!(!empty.overlaps(&Window::closed(100, 200)));
        assert!(!Window::closed(100, 200).overlaps(&empty));
    }

    #[test]
    fn size_escalation_only_goes_up() {
        let from_small: Vec<_> = RoomSize::Small.escalation().collect();
        assert_eq!(from_small, RoomSize::ALL.to_vec());
        let from_large: Vec<_> = RoomSize::Large.escalation().collect();
        assert_eq!(from_large, vec![RoomSize::Large]);
    }

    #[test]
    fn size_parse() {
        assert_eq!("Medium".parse::<RoomSize>(), Ok(RoomSize::Medium));
        assert_eq!("l".parse::<RoomSize>(), Ok(RoomSize::Large));
        assert!("huge".parse::<RoomSize>().is_err());
    }

    #[test]
    fn schedule_transitions() {
        use ScheduleStatus::*;
        assert!(Booked.can_become(InUse));
        assert!(Booked.can_become(Cancelled));
        assert!(InUse.can_become(Finished));
        assert!(InUse.can_become(Cancelled));
        assert!(!Booked.can_become(Finished));
        assert!(!Finished.can_become(Cancelled));
        assert!(!Cancelled.can_become(Booked));
        assert!(!InUse.can_become(Booked));
    }

    #[test]
    fn schedules_stay_sorted() {
        let mut rs = room();
        rs.put_schedule(schedule(300, Some(400), ScheduleStatus::Booked));
        rs.put_schedule(schedule(100, Some(200), ScheduleStatus::Booked));
        rs.put_schedule(schedule(200, Some(300), ScheduleStatus::Booked));
        let starts: Vec<_> = rs.schedules.iter().map(|s| s.window.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn put_schedule_replaces_in_place() {
        let mut rs = room();
        let mut s = schedule(100, Some(200), ScheduleStatus::Booked);
        rs.put_schedule(s.clone());
        s.status = ScheduleStatus::InUse;
        rs.put_schedule(s.clone());
        assert_eq!(rs.schedules.len(), 1);
        assert_eq!(rs.schedule(&s.id).map(|s| s.status), Some(ScheduleStatus::InUse));
    }

    #[test]
    fn overlapping_skips_cancelled_and_past() {
        let mut rs = room();
        rs.put_schedule(schedule(100, Some(200), ScheduleStatus::Finished));
        rs.put_schedule(schedule(450, Some(600), ScheduleStatus::Cancelled));
        let live = schedule(500, Some(700), ScheduleStatus::Booked);
        rs.put_schedule(live.clone());
        rs.put_schedule(schedule(1000, Some(1100), ScheduleStatus::Booked));

        let query = Window::closed(500, 800);
        let hits: Vec<_> = rs.overlapping(&query).map(|s| s.id).collect();
        assert_eq!(hits, vec![live.id]);
    }

    #[test]
    fn open_schedule_conflicts_with_later_query() {
        let mut rs = room();
        let open = schedule(100, None, ScheduleStatus::InUse);
        rs.put_schedule(open.clone());
        assert_eq!(rs.find_conflict(&Window::closed(10_000, 20_000), &[]), Some(open.id));
        assert_eq!(rs.find_conflict(&Window::closed(0, 100), &[]), None);
    }

    #[test]
    fn find_conflict_honours_ignore_list() {
        let mut rs = room();
        let own = schedule(100, Some(200), ScheduleStatus::Booked);
        rs.put_schedule(own.clone());
        assert_eq!(rs.find_conflict(&Window::closed(150, 250), &[own.id]), None);
        assert_eq!(rs.find_conflict(&Window::closed(150, 250), &[]), Some(own.id));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SchedulePut(schedule(100, None, ScheduleStatus::Booked));
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
