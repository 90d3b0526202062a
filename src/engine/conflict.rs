use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Reject windows no booking or walk-in may ask for.
pub fn validate_window(window: &Window) -> Result<(), EngineError> {
    use crate::limits::*;
    if let Some(end) = window.end
        && end <= window.start
    {
        return Err(EngineError::Validation("window end must be after its start".into()));
    }
    if window.start < MIN_VALID_TIMESTAMP_MS
        || window.start > MAX_VALID_TIMESTAMP_MS
        || window.end.is_some_and(|e| e > MAX_VALID_TIMESTAMP_MS)
    {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if window.duration_ms().is_some_and(|d| d > MAX_WINDOW_DURATION_MS) {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(())
}

/// Conflict detection on one physical room. The caller holds the room lock
/// when the answer is used for a commit.
pub(crate) fn has_conflict(rs: &RoomState, window: &Window, ignore: &[Ulid]) -> bool {
    rs.find_conflict(window, ignore).is_some()
}

pub(crate) fn check_no_conflict(rs: &RoomState, window: &Window, ignore: &[Ulid]) -> Result<(), EngineError> {
    match rs.find_conflict(window, ignore) {
        Some(id) => Err(EngineError::Conflict(id)),
        None => Ok(()),
    }
}

/// Pairwise overlap check among schedules being committed together on the
/// same room.
pub(crate) fn check_batch_disjoint(batch: &[&RoomSchedule]) -> Result<(), EngineError> {
    for i in 0..batch.len() {
        for j in (i + 1)..batch.len() {
            if batch[i].room_id == batch[j].room_id && batch[i].window.overlaps(&batch[j].window) {
                return Err(EngineError::ConflictRace(batch[i].room_id));
            }
        }
    }
    Ok(())
}
