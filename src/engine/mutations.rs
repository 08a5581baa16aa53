use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::{debug, info};
use ulid::Ulid;

use crate::auth::{require_admin, require_manager, Actor};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_bookable, requested_span, validate_duration, validate_range};
use super::lifecycle::{plan, Step};
use super::{apply_to_professional, Engine, EngineError};

fn record_booking(result: &Result<Appointment, EngineError>) {
    let outcome = match result {
        Ok(_) => "booked",
        Err(e) => e.kind(),
    };
    metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
}

impl Engine {
    // ── Professionals ─────────────────────────────────────────────

    pub async fn create_professional(
        &self,
        id: Ulid,
        name: Option<String>,
        consultation_fee: u64,
        status: ProfessionalStatus,
    ) -> Result<Professional, EngineError> {
        if self.state.len() >= MAX_PROFESSIONALS {
            return Err(EngineError::LimitExceeded("too many professionals"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("professional name too long"));
        }
        let _gate = self.commit_gate.read().await;

        let professional = Professional {
            id,
            name,
            consultation_fee,
            status,
        };
        let event = Event::ProfessionalCreated {
            id,
            name: professional.name.clone(),
            consultation_fee,
            status,
        };

        // Claim the id before the WAL await. Anyone reaching the new state
        // blocks on this write lock until the create is durable.
        let shared = Arc::new(RwLock::new(ProfessionalState::new(professional.clone())));
        let guard = shared.clone().write_owned().await;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(shared.clone());
            }
        }
        if let Err(e) = self.wal_append(&event).await {
            self.state.remove_if(&id, |_, current| Arc::ptr_eq(current, &shared));
            return Err(e);
        }
        drop(guard);
        metrics::gauge!(observability::PROFESSIONALS_ACTIVE).set(self.state.len() as f64);
        info!(professional = %id, status = status.as_str(), "professional created");
        Ok(professional)
    }

    /// Status is owned by the onboarding workflow; only `valid` professionals
    /// accept bookings.
    pub async fn set_professional_status(
        &self,
        id: Ulid,
        status: ProfessionalStatus,
    ) -> Result<Professional, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.write_professional(id).await?;
        let event = Event::ProfessionalStatusChanged { id, status };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(professional = %id, status = status.as_str(), "professional status changed");
        Ok(guard.professional.clone())
    }

    /// Remove a professional with everything they own.
    pub async fn delete_professional(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let guard = self.write_professional(id).await?;
        self.wal_append(&Event::ProfessionalDeleted { id }).await?;
        for entity in guard.entity_ids() {
            self.entity_to_professional.remove(&entity);
        }
        self.state.remove(&id);
        drop(guard);
        self.notify.remove(&id);
        metrics::gauge!(observability::PROFESSIONALS_ACTIVE).set(self.state.len() as f64);
        info!(professional = %id, "professional deleted");
        Ok(())
    }

    // ── Availability data ─────────────────────────────────────────

    pub async fn add_window(
        &self,
        id: Ulid,
        professional_id: Ulid,
        day_of_week: u8,
        start: Minute,
        end: Minute,
        is_available: bool,
    ) -> Result<AvailabilityWindow, EngineError> {
        if day_of_week > 6 {
            return Err(EngineError::InvalidInput(format!(
                "day_of_week must be 0 (Monday) through 6 (Sunday), got {day_of_week}"
            )));
        }
        validate_range(start, end)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.write_professional(professional_id).await?;
        if guard.windows.len() >= MAX_WINDOWS_PER_PROFESSIONAL {
            return Err(EngineError::LimitExceeded("too many availability windows"));
        }
        self.reserve_entity(id, professional_id)?;

        let event = Event::WindowAdded {
            id,
            professional_id,
            day_of_week,
            start,
            end,
            is_available,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.release_entity(&id);
            return Err(e);
        }
        Ok(AvailabilityWindow {
            id,
            day_of_week,
            start,
            end,
            is_available,
        })
    }

    pub async fn remove_window(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (professional_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.windows.iter().any(|w| w.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::WindowRemoved { id, professional_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(professional_id)
    }

    pub async fn add_exception(
        &self,
        id: Ulid,
        professional_id: Ulid,
        date: NaiveDate,
        start: Minute,
        end: Minute,
    ) -> Result<UnavailableSlot, EngineError> {
        validate_range(start, end)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.write_professional(professional_id).await?;
        if guard.exceptions.len() >= MAX_EXCEPTIONS_PER_PROFESSIONAL {
            return Err(EngineError::LimitExceeded("too many unavailable slots"));
        }
        self.reserve_entity(id, professional_id)?;

        let event = Event::ExceptionAdded {
            id,
            professional_id,
            date,
            start,
            end,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.release_entity(&id);
            return Err(e);
        }
        Ok(UnavailableSlot { id, date, start, end })
    }

    pub async fn remove_exception(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (professional_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.exceptions.iter().any(|e| e.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ExceptionRemoved { id, professional_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(professional_id)
    }

    // ── Booking ───────────────────────────────────────────────────

    /// Book `[start, start + duration)` on `date` as a pending appointment.
    ///
    /// Check and insert run under the professional's write lock, so of any
    /// number of concurrent requests for one start exactly one succeeds and
    /// the rest get `SlotUnavailable`. The `created` event goes out after the
    /// WAL commit.
    pub async fn book(
        &self,
        professional_id: Ulid,
        patient_id: Option<Ulid>,
        date: NaiveDate,
        start: Minute,
        duration: Minute,
    ) -> Result<Appointment, EngineError> {
        let result = self
            .insert_appointment(professional_id, patient_id, date, start, duration, AppointmentStatus::Pending)
            .await;
        record_booking(&result);
        result
    }

    /// Administrator booking. With `confirmed` the appointment skips `pending`.
    #[allow(clippy::too_many_arguments)]
    pub async fn admin_book(
        &self,
        actor: &Actor,
        professional_id: Ulid,
        patient_id: Option<Ulid>,
        date: NaiveDate,
        start: Minute,
        duration: Minute,
        confirmed: bool,
    ) -> Result<Appointment, EngineError> {
        require_admin(actor)?;
        let status = if confirmed {
            AppointmentStatus::Confirmed
        } else {
            AppointmentStatus::Pending
        };
        let result = self
            .insert_appointment(professional_id, patient_id, date, start, duration, status)
            .await;
        record_booking(&result);
        result
    }

    async fn insert_appointment(
        &self,
        professional_id: Ulid,
        patient_id: Option<Ulid>,
        date: NaiveDate,
        start: Minute,
        duration: Minute,
        status: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        validate_duration(duration)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.write_professional(professional_id).await?;
        if guard.professional.status != ProfessionalStatus::Valid {
            return Err(EngineError::ProfessionalNotBookable(professional_id));
        }
        let span = requested_span(professional_id, date, start, duration)?;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_PROFESSIONAL {
            return Err(EngineError::LimitExceeded("too many appointments for professional"));
        }
        check_bookable(&guard, date, span, self.now())?;

        let appointment = Appointment {
            id: Ulid::new(),
            professional_id,
            patient_id,
            date,
            span,
            status,
            created_at: Utc::now(),
        };
        let event = Event::AppointmentBooked {
            id: appointment.id,
            professional_id,
            patient_id,
            date,
            span,
            status,
            created_at: appointment.created_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        info!(
            appointment = %appointment.id,
            professional = %professional_id,
            %date,
            slot = %span,
            status = status.as_str(),
            "appointment booked"
        );
        self.notify.send(LifecycleEvent::created(&appointment));
        Ok(appointment)
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Move an appointment to `target`. Requesting the current status is a
    /// successful no-op that writes and notifies nothing.
    pub async fn transition(
        &self,
        id: Ulid,
        target: AppointmentStatus,
        actor: &Actor,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (professional_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.appointment(&id).cloned().ok_or(EngineError::NotFound(id))?;
        require_manager(actor, professional_id)?;

        let from = match plan(id, current.status, target)? {
            Step::Unchanged => {
                debug!(appointment = %id, status = %target, "transition is a no-op");
                return Ok(current);
            }
            Step::Apply { from, .. } => from,
        };

        let event = Event::AppointmentStatusChanged {
            id,
            professional_id,
            status: target,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard.appointment(&id).cloned().ok_or(EngineError::NotFound(id))?;
        drop(guard);

        metrics::counter!(
            observability::TRANSITIONS_TOTAL,
            "from" => from.as_str(),
            "to" => target.as_str()
        )
        .increment(1);
        info!(appointment = %id, from = %from, to = %target, "appointment status changed");
        self.notify.send(LifecycleEvent::transitioned(&updated, Some(from)));
        Ok(updated)
    }

    pub async fn confirm(&self, id: Ulid, actor: &Actor) -> Result<Appointment, EngineError> {
        self.transition(id, AppointmentStatus::Confirmed, actor).await
    }

    pub async fn cancel(&self, id: Ulid, actor: &Actor) -> Result<Appointment, EngineError> {
        self.transition(id, AppointmentStatus::Cancelled, actor).await
    }

    /// [`Engine::transition`] with the target given as text.
    pub async fn set_status(&self, id: Ulid, status: &str, actor: &Actor) -> Result<Appointment, EngineError> {
        let target: AppointmentStatus = status.parse()?;
        self.transition(id, target, actor).await
    }

    // ── Patients ──────────────────────────────────────────────────

    /// Detach a deleted patient from all their appointments. The appointments
    /// stay; only `patient_id` is cleared. Returns how many were touched.
    pub async fn forget_patient(&self, patient_id: Ulid) -> Result<usize, EngineError> {
        // Replay applies the detach to every professional present at this point
        // of the log, so nothing else may commit until it is written.
        let _exclusive = self.commit_gate.write().await;

        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(shared) = self.get_shared(&id) {
                guards.push(shared.write_owned().await);
            }
        }

        let event = Event::PatientDetached { patient_id };
        self.wal_append(&event).await?;
        let mut detached = 0;
        for guard in guards.iter_mut() {
            let before = guard.appointments.iter().filter(|a| a.patient_id == Some(patient_id)).count();
            apply_to_professional(guard, &event, &self.entity_to_professional);
            detached += before;
        }
        info!(patient = %patient_id, detached, "patient detached from appointments");
        Ok(detached)
    }

    // ── WAL maintenance ───────────────────────────────────────────

    /// Rewrite the WAL as the minimal event set that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for ps in shared {
            let ps = ps.read().await;
            let pid = ps.id();
            events.push(Event::ProfessionalCreated {
                id: pid,
                name: ps.professional.name.clone(),
                consultation_fee: ps.professional.consultation_fee,
                status: ps.professional.status,
            });
            events.extend(ps.windows.iter().map(|w| Event::WindowAdded {
                id: w.id,
                professional_id: pid,
                day_of_week: w.day_of_week,
                start: w.start,
                end: w.end,
                is_available: w.is_available,
            }));
            events.extend(ps.exceptions.iter().map(|e| Event::ExceptionAdded {
                id: e.id,
                professional_id: pid,
                date: e.date,
                start: e.start,
                end: e.end,
            }));
            events.extend(ps.appointments.iter().map(|a| Event::AppointmentBooked {
                id: a.id,
                professional_id: pid,
                patient_id: a.patient_id,
                date: a.date,
                span: a.span,
                status: a.status,
                created_at: a.created_at,
            }));
        }

        let count = events.len();
        self.wal
            .rewrite(events)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}
