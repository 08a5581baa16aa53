use tracing::warn;
use ulid::Ulid;

use crate::model::AppointmentStatus;

use super::EngineError;

/// Outcome of checking a requested status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Already in the target status; succeed without writing or notifying.
    Unchanged,
    Apply {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
}

/// Statuses reachable in one step from `from`.
pub fn next_statuses(from: AppointmentStatus) -> &'static [AppointmentStatus] {
    use AppointmentStatus::*;
    match from {
        Pending => &[Confirmed, Cancelled],
        Confirmed => &[Cancelled],
        Cancelled => &[],
    }
}

/// Validate `from → to` for appointment `id`.
///
/// The same-status check runs first so a retried cancel of a cancelled
/// appointment succeeds instead of tripping the terminal-state rule.
pub fn plan(id: Ulid, from: AppointmentStatus, to: AppointmentStatus) -> Result<Step, EngineError> {
    if from == to {
        return Ok(Step::Unchanged);
    }
    if from == AppointmentStatus::Cancelled {
        warn!(appointment = %id, to = %to, "transition out of cancelled rejected");
        return Err(EngineError::TerminalStateViolation(id));
    }
    if !next_statuses(from).contains(&to) {
        warn!(appointment = %id, from = %from, to = %to, "invalid status transition");
        return Err(EngineError::InvalidStatus(format!(
            "cannot move appointment from {from} to {to}"
        )));
    }
    Ok(Step::Apply { from, to })
}
