use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::resolve_day;
use super::conflict::validate_duration;
use super::slots::{generate_slots, is_slot_bookable};
use super::{Engine, EngineError, SharedProfessionalState};

impl Engine {
    fn shared_or_not_found(&self, id: Ulid) -> Result<SharedProfessionalState, EngineError> {
        self.get_shared(&id).ok_or(EngineError::NotFound(id))
    }

    /// Free intervals for `date`, from a read-locked snapshot.
    pub async fn resolve_day(&self, professional_id: Ulid, date: NaiveDate) -> Result<Vec<Span>, EngineError> {
        let shared = self.shared_or_not_found(professional_id)?;
        let ps = shared.read().await;
        Ok(resolve_day(&ps.windows, &ps.exceptions, date))
    }

    /// Bookable slot starts of `duration` minutes on `date`.
    pub async fn generate_slots(
        &self,
        professional_id: Ulid,
        date: NaiveDate,
        duration: Minute,
    ) -> Result<Vec<Minute>, EngineError> {
        validate_duration(duration)?;
        let shared = self.shared_or_not_found(professional_id)?;
        let ps = shared.read().await;
        let free = resolve_day(&ps.windows, &ps.exceptions, date);
        Ok(generate_slots(&free, date, duration, ps.appointments_on(date), self.now()))
    }

    /// Advisory form of the booking check; a later `book` may still lose the race.
    /// Only a `valid` professional has bookable slots.
    pub async fn is_slot_bookable(
        &self,
        professional_id: Ulid,
        date: NaiveDate,
        start: Minute,
        duration: Minute,
    ) -> Result<bool, EngineError> {
        validate_duration(duration)?;
        let shared = self.shared_or_not_found(professional_id)?;
        let Some(span) = Span::checked(start, start + duration) else {
            return Ok(false);
        };
        let ps = shared.read().await;
        if ps.professional.status != ProfessionalStatus::Valid {
            return Ok(false);
        }
        let free = resolve_day(&ps.windows, &ps.exceptions, date);
        Ok(is_slot_bookable(&free, ps.appointments_on(date), date, span, self.now()))
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let professional_id = self.professional_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let shared = self.shared_or_not_found(professional_id)?;
        let ps = shared.read().await;
        ps.appointment(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// A professional's appointments in `(date, start)` order, optionally for one date.
    pub async fn list_appointments(
        &self,
        professional_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Appointment>, EngineError> {
        let shared = self.shared_or_not_found(professional_id)?;
        let ps = shared.read().await;
        Ok(match date {
            Some(d) => ps.appointments_on(d).to_vec(),
            None => ps.appointments.clone(),
        })
    }

    /// Every appointment held by `patient_id`, ordered by date and start.
    pub async fn patient_appointments(&self, patient_id: Ulid) -> Vec<Appointment> {
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut found = Vec::new();
        for ps in shared {
            let ps = ps.read().await;
            found.extend(
                ps.appointments
                    .iter()
                    .filter(|a| a.patient_id == Some(patient_id))
                    .cloned(),
            );
        }
        found.sort_by_key(|a| (a.date, a.span.start));
        found
    }

    pub async fn get_professional(&self, id: Ulid) -> Result<Professional, EngineError> {
        let shared = self.shared_or_not_found(id)?;
        let ps = shared.read().await;
        Ok(ps.professional.clone())
    }

    pub async fn list_professionals(&self) -> Vec<Professional> {
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for ps in shared {
            out.push(ps.read().await.professional.clone());
        }
        out.sort_by_key(|p| p.id);
        out
    }

    pub async fn windows(&self, professional_id: Ulid) -> Result<Vec<AvailabilityWindow>, EngineError> {
        let shared = self.shared_or_not_found(professional_id)?;
        let ps = shared.read().await;
        Ok(ps.windows.clone())
    }

    pub async fn exceptions(&self, professional_id: Ulid) -> Result<Vec<UnavailableSlot>, EngineError> {
        let shared = self.shared_or_not_found(professional_id)?;
        let ps = shared.read().await;
        Ok(ps.exceptions.clone())
    }
}
