use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::conflict::{check_batch_disjoint, check_no_conflict, has_conflict};
use super::directory::Directory;
use super::EngineError;

pub type SharedRoomState = Arc<RwLock<RoomState>>;
pub type SharedBooking = Arc<Mutex<Booking>>;

/// Everything needed to turn a booking's allocation into schedules in one step.
#[derive(Debug, Clone)]
pub struct ConversionCommit {
    pub booking_id: Ulid,
    /// Status the booking must still have when the commit lands.
    pub expected: BookingStatus,
    pub schedules: Vec<RoomSchedule>,
    /// Existing schedules cancelled by this commit (booking modification).
    pub replaces: Vec<Ulid>,
    /// Booking window after the commit.
    pub window: Window,
    pub by: String,
    pub at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleChange {
    Start,
    /// Close the schedule. An open or later end is pulled in to `at`, never before start.
    Finish { at: Ms },
    Cancel { reason: String },
    SetEnd { end: Option<Ms> },
}

impl ScheduleChange {
    fn target(&self, current: ScheduleStatus) -> ScheduleStatus {
        match self {
            ScheduleChange::Start => ScheduleStatus::InUse,
            ScheduleChange::Finish { .. } => ScheduleStatus::Finished,
            ScheduleChange::Cancel { .. } => ScheduleStatus::Cancelled,
            ScheduleChange::SetEnd { .. } => current,
        }
    }
}

/// A conditional schedule mutation. `expected`, when set, must match the
/// record's status at commit time or the update is rejected.
#[derive(Debug, Clone)]
pub struct ScheduleUpdate {
    pub id: Ulid,
    pub expected: Option<ScheduleStatus>,
    pub change: ScheduleChange,
    pub by: String,
    pub at: Ms,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleFilter {
    pub room_id: Option<RoomId>,
    pub status: Option<ScheduleStatus>,
    pub window: Option<Window>,
    pub booking_id: Option<Ulid>,
}

impl ScheduleFilter {
    fn matches(&self, s: &RoomSchedule) -> bool {
        self.status.is_none_or(|st| s.status == st)
            && self.booking_id.is_none_or(|b| s.booking_id == Some(b))
            && self.window.is_none_or(|w| s.window.overlaps(&w))
    }
}

/// Persistence for bookings, schedules and the room directory.
///
/// Only conditional read-modify-write operations are exposed: every write
/// re-validates the record's current state under its lock before committing.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn directory(&self) -> Result<Directory, EngineError>;
    async fn put_physical_room(&self, room: PhysicalRoom) -> Result<(), EngineError>;
    async fn put_virtual_rooms(&self, rooms: Vec<VirtualRoom>) -> Result<(), EngineError>;

    async fn has_conflict(&self, room_id: RoomId, window: Window, ignore: &[Ulid]) -> Result<bool, EngineError>;

    async fn insert_booking(&self, booking: Booking) -> Result<(), EngineError>;
    async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError>;
    async fn list_bookings(&self, status: Option<BookingStatus>) -> Result<Vec<Booking>, EngineError>;
    /// Record why a pending booking could not be converted. Pending only.
    async fn record_conversion_failure(&self, id: Ulid, reason: String, by: String, at: Ms) -> Result<Booking, EngineError>;
    /// Move a pending booking's window. Pending only.
    async fn set_pending_window(&self, id: Ulid, window: Window, by: String, at: Ms) -> Result<Booking, EngineError>;
    async fn commit_conversion(&self, commit: ConversionCommit) -> Result<Booking, EngineError>;
    /// Cancel a booking and every schedule of it that is not finished.
    async fn cancel_booking(&self, id: Ulid, reason: String, by: String, at: Ms) -> Result<(Booking, Vec<RoomSchedule>), EngineError>;
    /// Cancel a confirmed booking whose schedules have all been cancelled.
    async fn settle_booking(&self, id: Ulid, by: String, at: Ms) -> Result<Option<Booking>, EngineError>;
    /// Cancel a booking that is still pending. `None` if it has moved on.
    async fn expire_booking(&self, id: Ulid, reason: String, by: String, at: Ms) -> Result<Option<Booking>, EngineError>;

    async fn insert_walk_in(&self, schedule: RoomSchedule) -> Result<(), EngineError>;
    async fn update_schedule(&self, update: ScheduleUpdate) -> Result<RoomSchedule, EngineError>;
    async fn get_schedule(&self, id: Ulid) -> Result<RoomSchedule, EngineError>;
    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<RoomSchedule>, EngineError>;
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL and batches appends for group commit: block for the first
/// append, drain whatever else is queued, then one fsync for the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so buffered bytes never leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let batch = vec![(event, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
    }
}

/// Plain maps rebuilt from the log before anything is shared.
#[derive(Default)]
struct ReplayState {
    directory: Directory,
    rooms: BTreeMap<RoomId, RoomState>,
    bookings: HashMap<Ulid, Booking>,
}

impl ReplayState {
    fn put_schedule(&mut self, schedule: RoomSchedule) {
        match self.rooms.get_mut(&schedule.room_id) {
            Some(rs) => rs.put_schedule(schedule),
            None => warn!("replay: schedule {} references unknown room {}", schedule.id, schedule.room_id),
        }
    }

    fn apply(&mut self, event: Event) {
        match event {
            Event::PhysicalRoomPut(room) => {
                self.rooms
                    .entry(room.id)
                    .and_modify(|rs| rs.room = room.clone())
                    .or_insert_with(|| RoomState::new(room.clone()));
                self.directory.restore_physical_room(room);
            }
            Event::VirtualRoomsPut(rooms) => {
                for vr in rooms {
                    self.directory.restore_virtual_room(vr);
                }
            }
            Event::BookingPut(booking) => {
                self.bookings.insert(booking.id, booking);
            }
            Event::SchedulePut(schedule) => self.put_schedule(schedule),
            Event::Converted {
                booking,
                schedules,
                replaced,
            } => {
                for s in schedules.into_iter().chain(replaced) {
                    self.put_schedule(s);
                }
                self.bookings.insert(booking.id, booking);
            }
            Event::BookingCancelled { booking, schedules } => {
                for s in schedules {
                    self.put_schedule(s);
                }
                self.bookings.insert(booking.id, booking);
            }
        }
    }
}

/// The production store: sharded in-memory state, one `RwLock` per physical
/// room and one `Mutex` per booking, made durable by an optional WAL.
///
/// Lock order is always compaction gate → booking → rooms in ascending id.
pub struct RoomStore {
    directory: RwLock<Directory>,
    rooms: DashMap<RoomId, SharedRoomState>,
    /// Reverse lookup: schedule id → physical room id.
    schedule_index: DashMap<Ulid, RoomId>,
    bookings: DashMap<Ulid, SharedBooking>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Held shared by every mutation, exclusively by compaction.
    gate: RwLock<()>,
    lock_timeout: Duration,
    /// Bound on one WAL round trip, send through fsync acknowledgement.
    commit_timeout: Duration,
}

impl RoomStore {
    /// Store without durability, for tests and tooling.
    pub fn in_memory(lock_timeout: Duration) -> Self {
        Self::from_replay(ReplayState::default(), None, lock_timeout)
    }

    /// Replay the log at `wal_path` and start its group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: &Path, lock_timeout: Duration) -> io::Result<Self> {
        let replay = Wal::replay(wal_path)?;
        if replay.discarded_tail {
            warn!("discarded torn tail of {}", wal_path.display());
        }
        let count = replay.events.len();
        let mut state = ReplayState::default();
        for event in replay.events {
            state.apply(event);
        }
        info!(
            "replayed {count} records from {}: {} rooms, {} bookings",
            wal_path.display(),
            state.rooms.len(),
            state.bookings.len()
        );

        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));
        Ok(Self::from_replay(state, Some(wal_tx), lock_timeout))
    }

    fn from_replay(state: ReplayState, wal_tx: Option<mpsc::Sender<WalCommand>>, lock_timeout: Duration) -> Self {
        let rooms = DashMap::new();
        let schedule_index = DashMap::new();
        for (id, rs) in state.rooms {
            for s in &rs.schedules {
                schedule_index.insert(s.id, id);
            }
            rooms.insert(id, Arc::new(RwLock::new(rs)));
        }
        let bookings = DashMap::new();
        for (id, b) in state.bookings {
            bookings.insert(id, Arc::new(Mutex::new(b)));
        }
        Self {
            directory: RwLock::new(state.directory),
            rooms,
            schedule_index,
            bookings,
            wal_tx,
            gate: RwLock::new(()),
            lock_timeout,
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
        }
    }

    pub fn with_commit_timeout(mut self, commit_timeout: Duration) -> Self {
        self.commit_timeout = commit_timeout;
        self
    }

    /// Attach a WAL writer that never answers. The receiver must be kept alive.
    #[cfg(test)]
    pub(super) fn with_stalled_wal(mut self) -> (Self, mpsc::Receiver<WalCommand>) {
        let (wal_tx, wal_rx) = mpsc::channel(16);
        self.wal_tx = Some(wal_tx);
        (self, wal_rx)
    }

    /// Write one record through the group-commit writer. No-op without a WAL.
    ///
    /// A round trip past `commit_timeout` is `StoreUnavailable`, not `Busy`:
    /// the record may still reach the log.
    async fn persist(&self, event: Event) -> Result<(), EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let round_trip = async {
            let (tx, rx) = oneshot::channel();
            wal_tx
                .send(WalCommand::Append { event, response: tx })
                .await
                .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
            rx.await
                .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
                .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
        };
        match tokio::time::timeout(self.commit_timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!(crate::observability::COMMIT_TIMEOUTS_TOTAL).increment(1);
                warn!("WAL commit not acknowledged within {:?}", self.commit_timeout);
                Err(EngineError::StoreUnavailable(format!(
                    "commit not acknowledged within {:?}",
                    self.commit_timeout
                )))
            }
        }
    }

    async fn bounded<F: Future>(&self, what: impl FnOnce() -> String, fut: F) -> Result<F::Output, EngineError> {
        tokio::time::timeout(self.lock_timeout, fut).await.map_err(|_| {
            metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
            EngineError::Busy(what())
        })
    }

    async fn enter(&self) -> Result<tokio::sync::RwLockReadGuard<'_, ()>, EngineError> {
        self.bounded(|| "compaction".into(), self.gate.read()).await
    }

    fn room(&self, id: RoomId) -> Result<SharedRoomState, EngineError> {
        self.rooms
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::RoomNotFound(id))
    }

    pub(super) async fn lock_room(&self, id: RoomId) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self.room(id)?;
        self.bounded(|| format!("room {id}"), rs.write_owned()).await
    }

    /// Write-lock several rooms in ascending id order.
    async fn lock_rooms(
        &self,
        ids: impl IntoIterator<Item = RoomId>,
    ) -> Result<BTreeMap<RoomId, OwnedRwLockWriteGuard<RoomState>>, EngineError> {
        let mut ids: Vec<RoomId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        let mut guards = BTreeMap::new();
        for id in ids {
            guards.insert(id, self.lock_room(id).await?);
        }
        Ok(guards)
    }

    pub(super) async fn lock_booking(&self, id: Ulid) -> Result<OwnedMutexGuard<Booking>, EngineError> {
        let booking = self
            .bookings
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        self.bounded(|| format!("booking {id}"), booking.lock_owned()).await
    }

    fn room_of(&self, schedule_id: &Ulid) -> Result<RoomId, EngineError> {
        self.schedule_index
            .get(schedule_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*schedule_id))
    }

    /// Rewrite the log with one record per live entity.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let _exclusive = self.gate.write().await;

        let directory = self.directory.read().await.clone();
        let mut events: Vec<Event> = directory.physical_rooms().cloned().map(Event::PhysicalRoomPut).collect();
        events.push(Event::VirtualRoomsPut(directory.virtual_rooms().cloned().collect()));

        let rooms: Vec<SharedRoomState> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in rooms {
            let guard = rs.read().await;
            events.extend(guard.schedules.iter().cloned().map(Event::SchedulePut));
        }
        let bookings: Vec<SharedBooking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        for b in bookings {
            events.push(Event::BookingPut(b.lock().await.clone()));
        }

        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx.send(WalCommand::AppendsSinceCompact { response: tx }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn update_pending(
        &self,
        id: Ulid,
        action: &'static str,
        by: String,
        at: Ms,
        f: impl FnOnce(&mut Booking),
    ) -> Result<Booking, EngineError> {
        let _gate = self.enter().await?;
        let mut guard = self.lock_booking(id).await?;
        if guard.status != BookingStatus::Pending {
            return Err(EngineError::InvalidBookingState {
                id,
                status: guard.status,
                action,
            });
        }
        let mut next = guard.clone();
        f(&mut next);
        next.updated_by = by;
        next.updated_at = at;
        self.persist(Event::BookingPut(next.clone())).await?;
        *guard = next.clone();
        Ok(next)
    }
}

fn cancelled(mut s: RoomSchedule, reason: &str, by: &str, at: Ms) -> RoomSchedule {
    s.status = ScheduleStatus::Cancelled;
    s.cancel_reason = Some(reason.to_string());
    s.updated_by = by.to_string();
    s.updated_at = at;
    s
}

#[async_trait]
impl ScheduleStore for RoomStore {
    async fn directory(&self) -> Result<Directory, EngineError> {
        Ok(self.bounded(|| "directory".into(), self.directory.read()).await?.clone())
    }

    async fn put_physical_room(&self, room: PhysicalRoom) -> Result<(), EngineError> {
        let _gate = self.enter().await?;
        let mut dir = self.bounded(|| "directory".into(), self.directory.write()).await?;
        let mut candidate = dir.clone();
        candidate.put_physical_room(room.clone())?;

        let existing = self.rooms.get(&room.id).map(|e| e.value().clone());
        let room_guard = match &existing {
            Some(rs) => Some(self.bounded(|| format!("room {}", room.id), rs.clone().write_owned()).await?),
            None => None,
        };

        self.persist(Event::PhysicalRoomPut(room.clone())).await?;
        *dir = candidate;
        match room_guard {
            Some(mut guard) => guard.room = room,
            None => {
                self.rooms.insert(room.id, Arc::new(RwLock::new(RoomState::new(room))));
            }
        }
        Ok(())
    }

    async fn put_virtual_rooms(&self, rooms: Vec<VirtualRoom>) -> Result<(), EngineError> {
        let _gate = self.enter().await?;
        let mut dir = self.bounded(|| "directory".into(), self.directory.write()).await?;
        let mut candidate = dir.clone();
        candidate.put_virtual_rooms(rooms.clone())?;
        self.persist(Event::VirtualRoomsPut(rooms)).await?;
        *dir = candidate;
        Ok(())
    }

    async fn has_conflict(&self, room_id: RoomId, window: Window, ignore: &[Ulid]) -> Result<bool, EngineError> {
        let rs = self.room(room_id)?;
        let guard = self.bounded(|| format!("room {room_id}"), rs.read()).await?;
        Ok(has_conflict(&guard, &window, ignore))
    }

    async fn insert_booking(&self, booking: Booking) -> Result<(), EngineError> {
        let _gate = self.enter().await?;
        if self.bookings.contains_key(&booking.id) {
            return Err(EngineError::AlreadyExists(booking.id));
        }
        self.persist(Event::BookingPut(booking.clone())).await?;
        self.bookings.insert(booking.id, Arc::new(Mutex::new(booking)));
        Ok(())
    }

    async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        Ok(self.lock_booking(id).await?.clone())
    }

    async fn list_bookings(&self, status: Option<BookingStatus>) -> Result<Vec<Booking>, EngineError> {
        let all: Vec<SharedBooking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for b in all {
            let guard = self.bounded(|| "booking".into(), b.lock()).await?;
            if status.is_none_or(|s| guard.status == s) {
                out.push(guard.clone());
            }
        }
        out.sort_by_key(|b| (b.window.start, b.id));
        Ok(out)
    }

    async fn record_conversion_failure(&self, id: Ulid, reason: String, by: String, at: Ms) -> Result<Booking, EngineError> {
        self.update_pending(id, "record a conversion failure", by, at, |b| b.last_failure = Some(reason))
            .await
    }

    async fn set_pending_window(&self, id: Ulid, window: Window, by: String, at: Ms) -> Result<Booking, EngineError> {
        self.update_pending(id, "move its window", by, at, |b| b.window = window).await
    }

    async fn commit_conversion(&self, commit: ConversionCommit) -> Result<Booking, EngineError> {
        let _gate = self.enter().await?;
        // The booking stays locked until the commit lands, so a concurrent
        // cancellation either happened before this check or waits for us.
        let mut booking = self.lock_booking(commit.booking_id).await?;
        if booking.status != commit.expected {
            if booking.status == BookingStatus::Cancelled {
                return Err(EngineError::BookingCancelled(commit.booking_id));
            }
            return Err(EngineError::InvalidBookingState {
                id: commit.booking_id,
                status: booking.status,
                action: "commit schedules",
            });
        }

        let replaced_rooms = commit
            .replaces
            .iter()
            .map(|id| self.room_of(id).map(|rid| (*id, rid)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut guards = self
            .lock_rooms(
                commit
                    .schedules
                    .iter()
                    .map(|s| s.room_id)
                    .chain(replaced_rooms.iter().map(|(_, rid)| *rid)),
            )
            .await?;

        let batch: Vec<&RoomSchedule> = commit.schedules.iter().collect();
        check_batch_disjoint(&batch)?;
        for s in &commit.schedules {
            let guard = &guards[&s.room_id];
            if guard.schedules.len() >= MAX_SCHEDULES_PER_ROOM {
                return Err(EngineError::LimitExceeded("too many schedules on room"));
            }
            if has_conflict(guard, &s.window, &commit.replaces) {
                return Err(EngineError::ConflictRace(s.room_id));
            }
        }

        let mut replaced = Vec::with_capacity(replaced_rooms.len());
        for (sid, rid) in &replaced_rooms {
            let current = guards[rid].schedule(sid).cloned().ok_or(EngineError::NotFound(*sid))?;
            if current.status != ScheduleStatus::Booked {
                return Err(EngineError::InvalidTransition {
                    id: *sid,
                    from: current.status,
                    to: ScheduleStatus::Cancelled,
                });
            }
            replaced.push(cancelled(current, "replaced by booking change", &commit.by, commit.at));
        }

        let mut next = booking.clone();
        next.status = BookingStatus::Confirmed;
        next.window = commit.window;
        next.schedule_ids.extend(commit.schedules.iter().map(|s| s.id));
        next.last_failure = None;
        next.updated_by = commit.by.clone();
        next.updated_at = commit.at;

        self.persist(Event::Converted {
            booking: next.clone(),
            schedules: commit.schedules.clone(),
            replaced: replaced.clone(),
        })
        .await?;

        for s in commit.schedules.into_iter().chain(replaced) {
            self.schedule_index.insert(s.id, s.room_id);
            if let Some(guard) = guards.get_mut(&s.room_id) {
                guard.put_schedule(s);
            }
        }
        *booking = next.clone();
        Ok(next)
    }

    async fn cancel_booking(&self, id: Ulid, reason: String, by: String, at: Ms) -> Result<(Booking, Vec<RoomSchedule>), EngineError> {
        let _gate = self.enter().await?;
        let mut booking = self.lock_booking(id).await?;
        if booking.status.is_terminal() {
            return Err(EngineError::InvalidBookingState {
                id,
                status: booking.status,
                action: "cancel",
            });
        }

        let owned = booking
            .schedule_ids
            .iter()
            .map(|sid| self.room_of(sid).map(|rid| (*sid, rid)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut guards = self.lock_rooms(owned.iter().map(|(_, rid)| *rid)).await?;

        let mut cascade = Vec::new();
        for (sid, rid) in &owned {
            let current = guards[rid].schedule(sid).cloned().ok_or(EngineError::NotFound(*sid))?;
            if current.status.can_become(ScheduleStatus::Cancelled) {
                cascade.push(cancelled(current, &reason, &by, at));
            }
        }

        let mut next = booking.clone();
        next.status = BookingStatus::Cancelled;
        next.cancel_reason = Some(reason);
        next.updated_by = by;
        next.updated_at = at;

        self.persist(Event::BookingCancelled {
            booking: next.clone(),
            schedules: cascade.clone(),
        })
        .await?;

        for s in &cascade {
            if let Some(guard) = guards.get_mut(&s.room_id) {
                guard.put_schedule(s.clone());
            }
        }
        *booking = next.clone();
        Ok((next, cascade))
    }

    async fn settle_booking(&self, id: Ulid, by: String, at: Ms) -> Result<Option<Booking>, EngineError> {
        let _gate = self.enter().await?;
        let mut booking = self.lock_booking(id).await?;
        if booking.status != BookingStatus::Confirmed {
            return Ok(None);
        }
        for sid in &booking.schedule_ids {
            let rs = self.room(self.room_of(sid)?)?;
            let guard = self.bounded(|| format!("room of {sid}"), rs.read()).await?;
            if guard.schedule(sid).is_some_and(|s| s.status.occupies_room()) {
                return Ok(None);
            }
        }

        let mut next = booking.clone();
        next.status = BookingStatus::Cancelled;
        next.cancel_reason = Some("all schedules cancelled".into());
        next.updated_by = by;
        next.updated_at = at;
        self.persist(Event::BookingPut(next.clone())).await?;
        *booking = next.clone();
        Ok(Some(next))
    }

    async fn expire_booking(&self, id: Ulid, reason: String, by: String, at: Ms) -> Result<Option<Booking>, EngineError> {
        let _gate = self.enter().await?;
        let mut booking = self.lock_booking(id).await?;
        if booking.status != BookingStatus::Pending {
            return Ok(None);
        }

        let mut next = booking.clone();
        next.status = BookingStatus::Cancelled;
        next.cancel_reason = Some(reason);
        next.updated_by = by;
        next.updated_at = at;
        self.persist(Event::BookingPut(next.clone())).await?;
        *booking = next.clone();
        Ok(Some(next))
    }

    async fn insert_walk_in(&self, schedule: RoomSchedule) -> Result<(), EngineError> {
        let _gate = self.enter().await?;
        let mut guard = self.lock_room(schedule.room_id).await?;
        if guard.schedules.len() >= MAX_SCHEDULES_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many schedules on room"));
        }
        check_no_conflict(&guard, &schedule.window, &[])?;
        self.persist(Event::SchedulePut(schedule.clone())).await?;
        self.schedule_index.insert(schedule.id, schedule.room_id);
        guard.put_schedule(schedule);
        Ok(())
    }

    async fn update_schedule(&self, update: ScheduleUpdate) -> Result<RoomSchedule, EngineError> {
        let _gate = self.enter().await?;
        let room_id = self.room_of(&update.id)?;
        let mut guard = self.lock_room(room_id).await?;
        let current = guard
            .schedule(&update.id)
            .cloned()
            .ok_or(EngineError::NotFound(update.id))?;
        let target = update.change.target(current.status);

        let expected_ok = update.expected.is_none_or(|e| e == current.status);
        let edge_ok = match update.change {
            ScheduleChange::SetEnd { .. } => !current.status.is_terminal(),
            _ => current.status.can_become(target),
        };
        if !expected_ok || !edge_ok {
            return Err(EngineError::InvalidTransition {
                id: update.id,
                from: current.status,
                to: target,
            });
        }

        let mut next = current.clone();
        next.status = target;
        next.updated_by = update.by;
        next.updated_at = update.at;
        match update.change {
            ScheduleChange::Start => {}
            ScheduleChange::Finish { at } => {
                let close = at.max(current.window.start);
                if current.window.end.is_none_or(|end| close < end) {
                    next.window.end = Some(close);
                }
            }
            ScheduleChange::Cancel { reason } => next.cancel_reason = Some(reason),
            ScheduleChange::SetEnd { end } => {
                if end.is_some_and(|e| e <= current.window.start) {
                    return Err(EngineError::Validation("schedule end must be after its start".into()));
                }
                next.window.end = end;
                check_no_conflict(&guard, &next.window, &[update.id])?;
            }
        }

        self.persist(Event::SchedulePut(next.clone())).await?;
        guard.put_schedule(next.clone());
        Ok(next)
    }

    async fn get_schedule(&self, id: Ulid) -> Result<RoomSchedule, EngineError> {
        let rs = self.room(self.room_of(&id)?)?;
        let guard = self.bounded(|| format!("room of {id}"), rs.read()).await?;
        guard.schedule(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<RoomSchedule>, EngineError> {
        let rooms: Vec<SharedRoomState> = match filter.room_id {
            Some(id) => vec![self.room(id)?],
            None => self.rooms.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for rs in rooms {
            let guard = self.bounded(|| "room".into(), rs.read()).await?;
            out.extend(guard.schedules.iter().filter(|s| filter.matches(s)).cloned());
        }
        out.sort_by_key(|s| (s.window.start, s.room_id, s.id));
        Ok(out)
    }
}
