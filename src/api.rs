//! JSON request and response shapes for the line protocol.
//!
//! Every request is one JSON object per line, tagged by `op`. Times cross
//! this boundary as RFC 3339 strings and are carried as Unix milliseconds
//! everywhere else.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::auth::Principal;
use crate::engine::EngineError;
use crate::model::*;
use crate::notify::DomainEvent;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Authenticate {
        password: String,
        principal: Principal,
    },
    CreateBooking {
        size: RoomSize,
        start: DateTime<FixedOffset>,
        #[serde(default)]
        end: Option<DateTime<FixedOffset>>,
        #[serde(default = "one_room")]
        rooms: u32,
        contact: Contact,
        #[serde(default)]
        note: Option<String>,
        #[serde(default)]
        convert_now: bool,
    },
    ConvertBooking {
        id: Ulid,
    },
    CancelBooking {
        id: Ulid,
        #[serde(default)]
        reason: Option<String>,
    },
    ModifyBooking {
        id: Ulid,
        start: DateTime<FixedOffset>,
        #[serde(default)]
        end: Option<DateTime<FixedOffset>>,
    },
    ReserveWalkIn {
        room_id: RoomId,
        start: DateTime<FixedOffset>,
        #[serde(default)]
        end: Option<DateTime<FixedOffset>>,
        #[serde(default)]
        note: Option<String>,
    },
    StartSchedule {
        id: Ulid,
    },
    FinishSchedule {
        id: Ulid,
    },
    CancelSchedule {
        id: Ulid,
        #[serde(default)]
        reason: Option<String>,
    },
    /// `end: null` reopens the schedule.
    SetScheduleEnd {
        id: Ulid,
        #[serde(default)]
        end: Option<DateTime<FixedOffset>>,
    },
    PutPhysicalRoom {
        id: RoomId,
        name: String,
    },
    PutVirtualRoom {
        room: VirtualRoom,
    },
    PutVirtualRooms {
        rooms: Vec<VirtualRoom>,
    },
    DeactivateVirtualRoom {
        id: VirtualRoomId,
    },
    GetBooking {
        id: Ulid,
    },
    ListBookings {
        #[serde(default)]
        status: Option<BookingStatus>,
    },
    GetSchedule {
        id: Ulid,
    },
    ListSchedules {
        #[serde(default)]
        room_id: Option<RoomId>,
        #[serde(default)]
        status: Option<ScheduleStatus>,
        #[serde(default)]
        booking_id: Option<Ulid>,
        #[serde(default)]
        start: Option<DateTime<FixedOffset>>,
        #[serde(default)]
        end: Option<DateTime<FixedOffset>>,
    },
    ListVirtualRooms {
        #[serde(default)]
        size: Option<RoomSize>,
    },
    ListPhysicalRooms,
    /// Preview what conversion would pick, without reserving.
    Allocate {
        size: RoomSize,
        start: DateTime<FixedOffset>,
        #[serde(default)]
        end: Option<DateTime<FixedOffset>>,
    },
    /// Stream domain events on this connection: one room, or all of them.
    Listen {
        #[serde(default)]
        room_id: Option<RoomId>,
    },
    Unlisten,
}

fn one_room() -> u32 {
    1
}

pub fn to_ms(t: &DateTime<FixedOffset>) -> Ms {
    t.timestamp_millis()
}

/// Build a window from API times. The end must not precede the start.
pub fn window(start: &DateTime<FixedOffset>, end: Option<&DateTime<FixedOffset>>) -> Result<Window, EngineError> {
    let start = to_ms(start);
    let end = end.map(to_ms);
    if end.is_some_and(|e| e <= start) {
        return Err(EngineError::Validation("window end must be after its start".into()));
    }
    Ok(Window::new(start, end))
}

pub fn to_utc(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowView {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl From<Window> for WindowView {
    fn from(w: Window) -> Self {
        Self {
            start: to_utc(w.start),
            end: w.end.map(to_utc),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingView {
    pub id: Ulid,
    pub size: RoomSize,
    #[serde(flatten)]
    pub window: WindowView,
    pub rooms: u32,
    pub contact: Contact,
    pub source: BookingSource,
    pub note: Option<String>,
    pub status: BookingStatus,
    pub schedule_ids: Vec<Ulid>,
    pub last_failure: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Booking> for BookingView {
    fn from(b: Booking) -> Self {
        Self {
            id: b.id,
            size: b.size,
            window: b.window.into(),
            rooms: b.rooms,
            contact: b.contact,
            source: b.source,
            note: b.note,
            status: b.status,
            schedule_ids: b.schedule_ids,
            last_failure: b.last_failure,
            cancel_reason: b.cancel_reason,
            created_by: b.created_by,
            updated_by: b.updated_by,
            created_at: to_utc(b.created_at),
            updated_at: to_utc(b.updated_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleView {
    pub id: Ulid,
    pub room_id: RoomId,
    pub booking_id: Option<Ulid>,
    #[serde(flatten)]
    pub window: WindowView,
    pub status: ScheduleStatus,
    pub virtual_room: Option<VirtualRoomInfo>,
    pub admin_notes: AdminNotes,
    pub cancel_reason: Option<String>,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<RoomSchedule> for ScheduleView {
    fn from(s: RoomSchedule) -> Self {
        Self {
            id: s.id,
            room_id: s.room_id,
            booking_id: s.booking_id,
            window: s.window.into(),
            status: s.status,
            virtual_room: s.virtual_room,
            admin_notes: s.admin_notes,
            cancel_reason: s.cancel_reason,
            created_by: s.created_by,
            updated_by: s.updated_by,
            created_at: to_utc(s.created_at),
            updated_at: to_utc(s.updated_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&EngineError> for ErrorBody {
    fn from(e: &EngineError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

impl ErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// One response line: `{"ok": ...}`, `{"error": {...}}`, or a pushed `{"event": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok(serde_json::Value),
    Error(ErrorBody),
    Event(DomainEvent),
}

impl Response {
    pub fn ok(value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Response::Ok(v),
            Err(e) => Response::Error(ErrorBody::new("internal", e.to_string())),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":{{"code":"internal","message":"{e}","retryable":false}}}}"#))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_booking_with_defaults() {
        let line = r#"{"op":"create_booking","size":"small","start":"2026-03-01T18:00:00+09:00","end":"2026-03-01T20:00:00+09:00","contact":{"name":"Kim","phone":null}}"#;
        let req: Request = serde_json::from_str(line).unwrap();
        match req {
            Request::CreateBooking {
                size,
                start,
                end,
                rooms,
                convert_now,
                ..
            } => {
                assert_eq!(size, RoomSize::Small);
                assert_eq!(rooms, 1);
                assert!(!convert_now);
                let w = window(&start, end.as_ref()).unwrap();
                assert_eq!(w.duration_ms(), Some(2 * 3_600_000));
                assert_eq!(to_utc(w.start).to_rfc3339(), "2026-03-01T09:00:00+00:00");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn window_rejects_inverted_times() {
        let start = DateTime::parse_from_rfc3339("2026-03-01T20:00:00Z").unwrap();
        let end = DateTime::parse_from_rfc3339("2026-03-01T18:00:00Z").unwrap();
        assert!(matches!(window(&start, Some(&end)), Err(EngineError::Validation(_))));
    }

    #[test]
    fn unit_ops_parse() {
        let req: Request = serde_json::from_str(r#"{"op":"list_physical_rooms"}"#).unwrap();
        assert!(matches!(req, Request::ListPhysicalRooms));
    }

    #[test]
    fn error_envelope_shape() {
        let line = Response::Error(ErrorBody::from(&EngineError::Busy("room 1".into()))).to_line();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["error"]["code"], "busy");
        assert_eq!(v["error"]["retryable"], true);
    }

    #[test]
    fn schedule_view_uses_rfc3339() {
        let s = RoomSchedule {
            id: Ulid::new(),
            room_id: 3,
            booking_id: None,
            window: Window::open(1_767_225_600_000),
            status: ScheduleStatus::InUse,
            virtual_room: None,
            admin_notes: AdminNotes::default(),
            cancel_reason: None,
            created_by: "staff".into(),
            updated_by: "staff".into(),
            created_at: 1_767_225_600_000,
            updated_at: 1_767_225_600_000,
        };
        let v = serde_json::to_value(ScheduleView::from(s)).unwrap();
        assert_eq!(v["start"], "2026-01-01T00:00:00Z");
        assert!(v["end"].is_null());
        assert_eq!(v["status"], "in-use");
    }
}
