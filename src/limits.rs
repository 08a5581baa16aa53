use crate::model::Minute;

pub const MAX_PROFESSIONALS: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_WINDOWS_PER_PROFESSIONAL: usize = 512;
pub const MAX_EXCEPTIONS_PER_PROFESSIONAL: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_PROFESSIONAL: usize = 1_000_000;

/// Longest bookable slot: one whole day.
pub const MAX_SLOT_MINUTES: Minute = 24 * 60;

/// Longest accepted request line on the wire, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 64;
