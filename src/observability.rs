use std::net::SocketAddr;

use crate::api::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total API requests. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "roomkeeper_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "roomkeeper_request_duration_seconds";

// ── Allocation ──────────────────────────────────────────────────

/// Counter: allocation decisions. Labels: outcome (exact, upgraded, exhausted).
pub const ALLOCATIONS_TOTAL: &str = "roomkeeper_allocations_total";

/// Counter: commits that lost a room to a concurrent writer.
pub const COMMIT_RACES_TOTAL: &str = "roomkeeper_commit_races_total";

/// Counter: lock acquisitions that hit the configured timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "roomkeeper_lock_timeouts_total";

/// Counter: WAL commits not acknowledged within the commit timeout.
pub const COMMIT_TIMEOUTS_TOTAL: &str = "roomkeeper_commit_timeouts_total";

// ── Sweeper ─────────────────────────────────────────────────────

/// Counter: records moved by a sweep. Labels: duty.
pub const SWEEP_TRANSITIONS_TOTAL: &str = "roomkeeper_sweep_transitions_total";

/// Counter: per-record sweep failures. Labels: duty.
pub const SWEEP_ERRORS_TOTAL: &str = "roomkeeper_sweep_errors_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomkeeper_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomkeeper_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomkeeper_connections_rejected_total";

/// Counter: failed `authenticate` requests.
pub const AUTH_FAILURES_TOTAL: &str = "roomkeeper_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomkeeper_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a request to a short label for metrics.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::Authenticate { .. } => "authenticate",
        Request::CreateBooking { .. } => "create_booking",
        Request::ConvertBooking { .. } => "convert_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::ModifyBooking { .. } => "modify_booking",
        Request::ReserveWalkIn { .. } => "reserve_walk_in",
        Request::StartSchedule { .. } => "start_schedule",
        Request::FinishSchedule { .. } => "finish_schedule",
        Request::CancelSchedule { .. } => "cancel_schedule",
        Request::SetScheduleEnd { .. } => "set_schedule_end",
        Request::PutPhysicalRoom { .. } => "put_physical_room",
        Request::PutVirtualRoom { .. } => "put_virtual_room",
        Request::PutVirtualRooms { .. } => "put_virtual_rooms",
        Request::DeactivateVirtualRoom { .. } => "deactivate_virtual_room",
        Request::GetBooking { .. } => "get_booking",
        Request::ListBookings { .. } => "list_bookings",
        Request::GetSchedule { .. } => "get_schedule",
        Request::ListSchedules { .. } => "list_schedules",
        Request::ListVirtualRooms { .. } => "list_virtual_rooms",
        Request::ListPhysicalRooms => "list_physical_rooms",
        Request::Allocate { .. } => "allocate",
        Request::Listen { .. } => "listen",
        Request::Unlisten => "unlisten",
    }
}
