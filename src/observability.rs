use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roombook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roombook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roombook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roombook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roombook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roombook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roombook_wal_flush_batch_size";

/// Counter: expired KV entries removed by the sweeper.
pub const KV_PURGED_TOTAL: &str = "roombook_kv_purged_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: guard rejections of a missing or bad token. Labels: reason.
pub const AUTH_FAILURES_TOTAL: &str = "roombook_auth_failures_total";

/// Counter: booking requests or reschedules refused for overlap.
pub const BOOKING_CONFLICTS_TOTAL: &str = "roombook_booking_conflicts_total";

/// Counter: actions suppressed by the notification throttle.
pub const THROTTLE_SUPPRESSED_TOTAL: &str = "roombook_throttle_suppressed_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SetAccessToken { .. } => "set_access_token",
        Command::ResetAccessToken => "reset_access_token",
        Command::Login { .. } => "login",
        Command::Refresh { .. } => "refresh",
        Command::Register { .. } => "register",
        Command::Me => "me",
        Command::ListAccounts { .. } => "list_accounts",
        Command::FreezeAccount { .. } => "freeze_account",
        Command::GrantRole { .. } => "grant_role",
        Command::CreateRoom { .. } => "create_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::GetRoom { .. } => "get_room",
        Command::ListRooms { .. } => "list_rooms",
        Command::Availability { .. } => "availability",
        Command::RequestBooking { .. } => "request_booking",
        Command::Reschedule { .. } => "reschedule_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::ListBookings { .. } => "list_bookings",
        Command::Urge { .. } => "urge",
    }
}
