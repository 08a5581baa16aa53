use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Minutes since local midnight. The only time-of-day type.
pub type Minute = i32;

pub const MINUTES_PER_DAY: Minute = 1440;

/// Half-open interval `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span from stored bounds. Empty, inverted and out-of-day ranges yield `None`.
    pub fn checked(start: Minute, end: Minute) -> Option<Self> {
        (0 <= start && start < end && end <= MINUTES_PER_DAY).then_some(Self { start, end })
    }

    pub fn duration(&self) -> Minute {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_clock(self.start), format_clock(self.end))
    }
}

/// Day-of-week index used by availability windows: 0 = Monday … 6 = Sunday.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_monday() as u8
}

pub fn minute_of(t: NaiveTime) -> Minute {
    (t.hour() * 60 + t.minute()) as Minute
}

/// Parse `HH:MM` (or `HH:MM:SS`, seconds ignored). `24:00` denotes end of day.
pub fn parse_clock(s: &str) -> Option<Minute> {
    let s = s.trim();
    if s == "24:00" || s == "24:00:00" {
        return Some(MINUTES_PER_DAY);
    }
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
        .map(minute_of)
}

pub fn format_clock(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// The instant `minute` begins on `date`. `None` outside `[0, 1440)`.
pub fn instant(date: NaiveDate, minute: Minute) -> Option<NaiveDateTime> {
    if !(0..MINUTES_PER_DAY).contains(&minute) {
        return None;
    }
    NaiveTime::from_hms_opt((minute / 60) as u32, (minute % 60) as u32, 0).map(|t| date.and_time(t))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfessionalStatus {
    Pending,
    Valid,
    Rejected,
}

impl ProfessionalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfessionalStatus::Pending => "pending",
            ProfessionalStatus::Valid => "valid",
            ProfessionalStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ProfessionalStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(ProfessionalStatus::Pending),
            "valid" => Ok(ProfessionalStatus::Valid),
            "rejected" => Ok(ProfessionalStatus::Rejected),
            other => Err(EngineError::InvalidInput(format!(
                "unknown professional status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    /// Pending and confirmed appointments occupy their slot.
    pub fn is_active(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(AppointmentStatus::Pending),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            _ => Err(EngineError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Professional {
    pub id: Ulid,
    pub name: Option<String>,
    /// Minor currency units.
    pub consultation_fee: u64,
    pub status: ProfessionalStatus,
}

/// Recurring weekly rule. Bounds are kept as stored; see [`AvailabilityWindow::span`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub day_of_week: u8,
    pub start: Minute,
    pub end: Minute,
    pub is_available: bool,
}

impl AvailabilityWindow {
    pub fn span(&self) -> Option<Span> {
        Span::checked(self.start, self.end)
    }
}

/// Dated exception that removes time from the recurring windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailableSlot {
    pub id: Ulid,
    pub date: NaiveDate,
    pub start: Minute,
    pub end: Minute,
}

impl UnavailableSlot {
    pub fn span(&self) -> Option<Span> {
        Span::checked(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub professional_id: Ulid,
    /// `None` once the patient identity has been deleted.
    pub patient_id: Option<Ulid>,
    pub date: NaiveDate,
    pub span: Span,
    pub status: AppointmentStatus,
    pub created_at: DateTime<Utc>,
}

/// Everything stored for one professional. Guarded by one lock in the engine.
#[derive(Debug, Clone)]
pub struct ProfessionalState {
    pub professional: Professional,
    pub windows: Vec<AvailabilityWindow>,
    pub exceptions: Vec<UnavailableSlot>,
    /// Every appointment ever booked, sorted by `(date, span.start)`.
    pub appointments: Vec<Appointment>,
    /// `(date, start)` → appointment id, for pending and confirmed appointments only.
    active_starts: HashMap<(NaiveDate, Minute), Ulid>,
}

impl ProfessionalState {
    pub fn new(professional: Professional) -> Self {
        Self {
            professional,
            windows: Vec::new(),
            exceptions: Vec::new(),
            appointments: Vec::new(),
            active_starts: HashMap::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.professional.id
    }

    /// Insert window maintaining order by `(day_of_week, start)`.
    pub fn insert_window(&mut self, window: AvailabilityWindow) {
        let key = (window.day_of_week, window.start);
        let pos = self
            .windows
            .partition_point(|w| (w.day_of_week, w.start) <= key);
        self.windows.insert(pos, window);
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<AvailabilityWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    /// Insert exception maintaining order by `(date, start)`.
    pub fn insert_exception(&mut self, slot: UnavailableSlot) {
        let key = (slot.date, slot.start);
        let pos = self
            .exceptions
            .partition_point(|e| (e.date, e.start) <= key);
        self.exceptions.insert(pos, slot);
    }

    pub fn remove_exception(&mut self, id: Ulid) -> Option<UnavailableSlot> {
        let pos = self.exceptions.iter().position(|e| e.id == id)?;
        Some(self.exceptions.remove(pos))
    }

    /// Insert an appointment, enforcing at most one active appointment per `(date, start)`.
    /// On violation returns the id of the appointment already holding the start.
    pub fn insert_appointment(&mut self, appointment: Appointment) -> Result<(), Ulid> {
        let key = (appointment.date, appointment.span.start);
        if appointment.status.is_active() {
            if let Some(holder) = self.active_starts.get(&key) {
                return Err(*holder);
            }
            self.active_starts.insert(key, appointment.id);
        }
        let pos = self
            .appointments
            .partition_point(|a| (a.date, a.span.start) <= key);
        self.appointments.insert(pos, appointment);
        Ok(())
    }

    pub fn appointment(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    /// Set an appointment's status, keeping the uniqueness index in step.
    /// Returns the previous status, or `None` for an unknown id.
    pub fn set_status(&mut self, id: Ulid, status: AppointmentStatus) -> Option<AppointmentStatus> {
        let appointment = self.appointments.iter_mut().find(|a| a.id == id)?;
        let previous = appointment.status;
        let key = (appointment.date, appointment.span.start);
        if previous.is_active() && !status.is_active() {
            if self.active_starts.get(&key) == Some(&id) {
                self.active_starts.remove(&key);
            }
        } else if !previous.is_active() && status.is_active() {
            self.active_starts.entry(key).or_insert(id);
        }
        appointment.status = status;
        Some(previous)
    }

    /// Appointment currently holding `(date, start)`, if any.
    pub fn slot_holder(&self, date: NaiveDate, start: Minute) -> Option<Ulid> {
        self.active_starts.get(&(date, start)).copied()
    }

    /// All appointments on `date`, in start order.
    pub fn appointments_on(&self, date: NaiveDate) -> &[Appointment] {
        let lo = self.appointments.partition_point(|a| a.date < date);
        let hi = self.appointments.partition_point(|a| a.date <= date);
        &self.appointments[lo..hi]
    }

    pub fn active_spans_on(&self, date: NaiveDate) -> Vec<Span> {
        self.appointments_on(date)
            .iter()
            .filter(|a| a.status.is_active())
            .map(|a| a.span)
            .collect()
    }

    /// Null out `patient_id` on every appointment of `patient_id`.
    pub fn detach_patient(&mut self, patient_id: Ulid) -> usize {
        let mut detached = 0;
        for a in self
            .appointments
            .iter_mut()
            .filter(|a| a.patient_id == Some(patient_id))
        {
            a.patient_id = None;
            detached += 1;
        }
        detached
    }

    /// Ids of every window, exception and appointment owned by this professional.
    pub fn entity_ids(&self) -> Vec<Ulid> {
        self.windows
            .iter()
            .map(|w| w.id)
            .chain(self.exceptions.iter().map(|e| e.id))
            .chain(self.appointments.iter().map(|a| a.id))
            .collect()
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProfessionalCreated {
        id: Ulid,
        name: Option<String>,
        consultation_fee: u64,
        status: ProfessionalStatus,
    },
    ProfessionalStatusChanged {
        id: Ulid,
        status: ProfessionalStatus,
    },
    ProfessionalDeleted {
        id: Ulid,
    },
    WindowAdded {
        id: Ulid,
        professional_id: Ulid,
        day_of_week: u8,
        start: Minute,
        end: Minute,
        is_available: bool,
    },
    WindowRemoved {
        id: Ulid,
        professional_id: Ulid,
    },
    ExceptionAdded {
        id: Ulid,
        professional_id: Ulid,
        date: NaiveDate,
        start: Minute,
        end: Minute,
    },
    ExceptionRemoved {
        id: Ulid,
        professional_id: Ulid,
    },
    AppointmentBooked {
        id: Ulid,
        professional_id: Ulid,
        patient_id: Option<Ulid>,
        date: NaiveDate,
        span: Span,
        status: AppointmentStatus,
        created_at: DateTime<Utc>,
    },
    AppointmentStatusChanged {
        id: Ulid,
        professional_id: Ulid,
        status: AppointmentStatus,
    },
    PatientDetached {
        patient_id: Ulid,
    },
}

/// Notification-worthy fact about an appointment, emitted after commit.
/// `old_status` is `None` when the appointment was just created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub appointment_id: Ulid,
    pub professional_id: Ulid,
    pub patient_id: Option<Ulid>,
    pub old_status: Option<AppointmentStatus>,
    pub new_status: AppointmentStatus,
    pub date: NaiveDate,
    pub start: Minute,
    pub end: Minute,
}

impl LifecycleEvent {
    pub fn created(appointment: &Appointment) -> Self {
        Self::transitioned(appointment, None)
    }

    pub fn transitioned(appointment: &Appointment, old_status: Option<AppointmentStatus>) -> Self {
        Self {
            appointment_id: appointment.id,
            professional_id: appointment.professional_id,
            patient_id: appointment.patient_id,
            old_status,
            new_status: appointment.status,
            date: appointment.date,
            start: appointment.span.start,
            end: appointment.span.end,
        }
    }
}
