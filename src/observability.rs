use std::net::SocketAddr;

use crate::engine::EngineError;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "spacebook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "spacebook_query_duration_seconds";

// ── Reservation outcomes ────────────────────────────────────────

/// Counter: reservations accepted (pending).
pub const RESERVATIONS_CREATED_TOTAL: &str = "spacebook_reservations_created_total";

/// Counter: reservation requests refused. Labels: reason.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "spacebook_reservations_rejected_total";

/// Counter: reservations canceled.
pub const RESERVATIONS_CANCELED_TOTAL: &str = "spacebook_reservations_canceled_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "spacebook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "spacebook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "spacebook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "spacebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "spacebook_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "spacebook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
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
        Command::InsertUser(_) => "insert_user",
        Command::UpdateProfile { .. } => "update_profile",
        Command::UpdateRoles { .. } => "update_roles",
        Command::SelectProfile => "select_profile",
        Command::InsertSpace(_) => "insert_space",
        Command::UpdateSpace { .. } => "update_space",
        Command::DeleteSpace { .. } => "delete_space",
        Command::SelectSpaces { .. } => "select_spaces",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFreeSlots { .. } => "select_free_slots",
        Command::InsertReservation(_) => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectUpcoming => "select_upcoming",
        Command::SelectCalendar { .. } => "select_calendar",
    }
}

/// Short reason label for a refused reservation request.
pub fn rejection_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::Conflict(_) => "conflict",
        EngineError::CapacityExceeded { .. } => "capacity",
        EngineError::InvalidAttendees(_) => "attendees",
        EngineError::InvalidInterval => "interval",
        EngineError::StartNotInFuture => "past_start",
        EngineError::SpaceInactive(_) => "inactive_space",
        EngineError::Forbidden(_) => "forbidden",
        EngineError::LimitExceeded(_) | EngineError::InvalidInput(_) => "limits",
        _ => "other",
    }
}
