use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "courtbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "courtbook_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: reservation mutations that committed. Labels: op.
pub const RESERVATIONS_COMMITTED_TOTAL: &str = "courtbook_reservations_committed_total";

/// Counter: bookings refused because the slot is closed, blacked out or full. Labels: reason.
pub const RESERVATION_REJECTIONS_TOTAL: &str = "courtbook_reservation_rejections_total";

/// Counter: commits that lost a race with a config or blackout change. Labels: op.
pub const COMMIT_CONFLICTS_TOTAL: &str = "courtbook_commit_conflicts_total";

/// Counter: pending holds cancelled by the reaper.
pub const HOLDS_EXPIRED_TOTAL: &str = "courtbook_holds_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "courtbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "courtbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courtbook_connections_rejected_total";

/// Gauge: number of bookable resources.
pub const RESOURCES_ACTIVE: &str = "courtbook_resources_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server runs without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::SelectResources => "select_resources",
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertReservation { expires_at: Some(_), .. } => "hold_reservation",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::RescheduleReservation { .. } => "reschedule_reservation",
        Command::ConfirmReservation { .. } => "confirm_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectReservation { .. } => "select_reservation",
        Command::InsertBlackout { .. } => "insert_blackout",
        Command::DeleteBlackout { .. } => "delete_blackout",
        Command::SelectBlackouts { .. } => "select_blackouts",
    }
}
