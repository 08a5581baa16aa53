use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: protocol requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "carebook_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "carebook_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome (`booked` or an error kind).
pub const BOOKINGS_TOTAL: &str = "carebook_bookings_total";

/// Counter: applied status transitions. Labels: from, to.
pub const TRANSITIONS_TOTAL: &str = "carebook_transitions_total";

/// Counter: notifier deliveries that failed and were dropped. Labels: notifier.
pub const NOTIFY_FAILURES_TOTAL: &str = "carebook_notify_failures_total";

/// Gauge: professionals currently loaded.
pub const PROFESSIONALS_ACTIVE: &str = "carebook_professionals_active";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "carebook_connections_active";
pub const CONNECTIONS_TOTAL: &str = "carebook_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "carebook_connections_rejected_total";
pub const AUTH_FAILURES_TOTAL: &str = "carebook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "carebook_wal_flush_duration_seconds";

/// Histogram: events per WAL group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "carebook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op when `port` is `None`.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a request.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Auth { .. } => "auth",
        Request::CreateProfessional { .. } => "create_professional",
        Request::SetProfessionalStatus { .. } => "set_professional_status",
        Request::DeleteProfessional { .. } => "delete_professional",
        Request::AddWindow { .. } => "add_window",
        Request::RemoveWindow { .. } => "remove_window",
        Request::AddException { .. } => "add_exception",
        Request::RemoveException { .. } => "remove_exception",
        Request::ResolveDay { .. } => "resolve_day",
        Request::Slots { .. } => "slots",
        Request::IsBookable { .. } => "is_bookable",
        Request::Book { .. } => "book",
        Request::AdminBook { .. } => "admin_book",
        Request::Confirm { .. } => "confirm",
        Request::Cancel { .. } => "cancel",
        Request::SetStatus { .. } => "set_status",
        Request::GetAppointment { .. } => "get_appointment",
        Request::ListAppointments { .. } => "list_appointments",
        Request::PatientAppointments { .. } => "patient_appointments",
        Request::GetProfessional { .. } => "get_professional",
        Request::ListProfessionals => "list_professionals",
        Request::ForgetPatient { .. } => "forget_patient",
        Request::Subscribe { .. } => "subscribe",
    }
}
