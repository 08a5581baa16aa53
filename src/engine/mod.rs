mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod slots;
#[cfg(test)]
mod tests;

pub use availability::{merge_overlapping, resolve_day, subtract_intervals};
pub use conflict::{fixed_clock, system_clock, Clock};
pub use error::EngineError;
pub use lifecycle::{next_statuses, plan, Step};
pub use slots::{generate_slots, is_past, is_slot_bookable, slot_starts};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::{Wal, WalWriter};

pub type SharedProfessionalState = Arc<RwLock<ProfessionalState>>;

/// In-memory scheduling state for every professional, made durable by the WAL.
///
/// Each professional is guarded by its own lock. Writes follow one order:
/// commit gate (shared), professional write lock, WAL fsync, in-memory apply,
/// unlock, notify.
pub struct Engine {
    pub state: DashMap<Ulid, SharedProfessionalState>,
    pub notify: Arc<NotifyHub>,
    wal: WalWriter,
    /// window / exception / appointment id → professional id
    entity_to_professional: DashMap<Ulid, Ulid>,
    /// Held shared by every mutation and exclusively by compaction.
    commit_gate: RwLock<()>,
    clock: Clock,
}

/// Apply a per-professional event. The caller holds the professional's lock.
fn apply_to_professional(ps: &mut ProfessionalState, event: &Event, entities: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ProfessionalStatusChanged { status, .. } => {
            ps.professional.status = *status;
        }
        Event::WindowAdded {
            id,
            professional_id,
            day_of_week,
            start,
            end,
            is_available,
        } => {
            ps.insert_window(AvailabilityWindow {
                id: *id,
                day_of_week: *day_of_week,
                start: *start,
                end: *end,
                is_available: *is_available,
            });
            entities.insert(*id, *professional_id);
        }
        Event::WindowRemoved { id, .. } => {
            ps.remove_window(*id);
            entities.remove(id);
        }
        Event::ExceptionAdded {
            id,
            professional_id,
            date,
            start,
            end,
        } => {
            ps.insert_exception(UnavailableSlot {
                id: *id,
                date: *date,
                start: *start,
                end: *end,
            });
            entities.insert(*id, *professional_id);
        }
        Event::ExceptionRemoved { id, .. } => {
            ps.remove_exception(*id);
            entities.remove(id);
        }
        Event::AppointmentBooked {
            id,
            professional_id,
            patient_id,
            date,
            span,
            status,
            created_at,
        } => {
            let appointment = Appointment {
                id: *id,
                professional_id: *professional_id,
                patient_id: *patient_id,
                date: *date,
                span: *span,
                status: *status,
                created_at: *created_at,
            };
            match ps.insert_appointment(appointment) {
                Ok(()) => {
                    entities.insert(*id, *professional_id);
                }
                Err(holder) => {
                    warn!(appointment = %id, holder = %holder, %date, start = span.start, "dropping booking for a start already held");
                }
            }
        }
        Event::AppointmentStatusChanged { id, status, .. } => {
            if ps.set_status(*id, *status).is_none() {
                warn!(appointment = %id, "status change for unknown appointment");
            }
        }
        Event::PatientDetached { patient_id } => {
            ps.detach_patient(*patient_id);
        }
        // Created/Deleted change the professional map itself.
        Event::ProfessionalCreated { .. } | Event::ProfessionalDeleted { .. } => {}
    }
}

/// The professional a per-professional event belongs to.
fn event_professional_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ProfessionalStatusChanged { id, .. } => Some(*id),
        Event::WindowAdded { professional_id, .. }
        | Event::WindowRemoved { professional_id, .. }
        | Event::ExceptionAdded { professional_id, .. }
        | Event::ExceptionRemoved { professional_id, .. }
        | Event::AppointmentBooked { professional_id, .. }
        | Event::AppointmentStatusChanged { professional_id, .. } => Some(*professional_id),
        Event::ProfessionalCreated { .. }
        | Event::ProfessionalDeleted { .. }
        | Event::PatientDetached { .. } => None,
    }
}

/// Fold a replayed event log into plain state.
fn rebuild(events: &[Event], entities: &DashMap<Ulid, Ulid>) -> HashMap<Ulid, ProfessionalState> {
    let mut professionals: HashMap<Ulid, ProfessionalState> = HashMap::new();
    for event in events {
        match event {
            Event::ProfessionalCreated {
                id,
                name,
                consultation_fee,
                status,
            } => {
                professionals.insert(
                    *id,
                    ProfessionalState::new(Professional {
                        id: *id,
                        name: name.clone(),
                        consultation_fee: *consultation_fee,
                        status: *status,
                    }),
                );
            }
            Event::ProfessionalDeleted { id } => {
                if let Some(ps) = professionals.remove(id) {
                    for entity in ps.entity_ids() {
                        entities.remove(&entity);
                    }
                }
            }
            Event::PatientDetached { .. } => {
                for ps in professionals.values_mut() {
                    apply_to_professional(ps, event, entities);
                }
            }
            other => {
                if let Some(ps) = event_professional_id(other).and_then(|pid| professionals.get_mut(&pid)) {
                    apply_to_professional(ps, other, entities);
                }
            }
        }
    }
    professionals
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_clock(wal_path, notify, system_clock())
    }

    /// Open the WAL at `wal_path`, replay it and start the writer task.
    /// `clock` supplies "now" for past-slot filtering.
    pub fn with_clock(wal_path: PathBuf, notify: Arc<NotifyHub>, clock: Clock) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = WalWriter::spawn(Wal::open(&wal_path)?);

        let entities = DashMap::new();
        let state: DashMap<Ulid, SharedProfessionalState> = rebuild(&events, &entities)
            .into_iter()
            .map(|(id, ps)| (id, Arc::new(RwLock::new(ps))))
            .collect();

        info!(
            path = %wal_path.display(),
            events = events.len(),
            professionals = state.len(),
            "engine state restored"
        );
        metrics::gauge!(observability::PROFESSIONALS_ACTIVE).set(state.len() as f64);

        Ok(Self {
            state,
            notify,
            wal,
            entity_to_professional: entities,
            commit_gate: RwLock::new(()),
            clock,
        })
    }

    pub(super) fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }

    pub fn get_shared(&self, id: &Ulid) -> Option<SharedProfessionalState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn professional_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_professional.get(entity_id).map(|e| *e.value())
    }

    /// Write lock on a professional. Fails with `NotFound` if the professional
    /// is unknown, or if the state we waited on is no longer the one mapped
    /// under `id` (deleted, or deleted and created again).
    pub(super) async fn write_professional(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProfessionalState>, EngineError> {
        let shared = self.get_shared(&id).ok_or(EngineError::NotFound(id))?;
        let guard = shared.clone().write_owned().await;
        let current = self
            .state
            .get(&id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &shared));
        if !current {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    /// Claim a window/exception id for `professional_id` before its event is
    /// committed. Undo with [`Engine::release_entity`] if the commit fails.
    pub(super) fn reserve_entity(&self, id: Ulid, professional_id: Ulid) -> Result<(), EngineError> {
        match self.entity_to_professional.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(professional_id);
                Ok(())
            }
        }
    }

    pub(super) fn release_entity(&self, id: &Ulid) {
        self.entity_to_professional.remove(id);
    }

    /// Entity → owning professional → write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ProfessionalState>), EngineError> {
        let professional_id = self
            .professional_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = self.write_professional(professional_id).await?;
        Ok((professional_id, guard))
    }

    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal
            .append(event.clone())
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Commit `event` to the WAL, then apply it to `ps`.
    /// On a WAL failure memory is left untouched.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut ProfessionalState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_professional(ps, event, &self.entity_to_professional);
        Ok(())
    }
}
