use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Pre-validated caller identity, supplied by the identity layer with every
/// privileged request. The engine never derives it on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Admin,
    Professional(Ulid),
    Patient(Ulid),
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin)
    }

    /// Administrators manage every appointment; professionals only their own.
    pub fn may_manage(&self, professional_id: Ulid) -> bool {
        match self {
            Actor::Admin => true,
            Actor::Professional(id) => *id == professional_id,
            Actor::Patient(_) => false,
        }
    }
}

pub fn require_admin(actor: &Actor) -> Result<(), EngineError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Unauthorized("administrator required"))
    }
}

pub fn require_manager(actor: &Actor, professional_id: Ulid) -> Result<(), EngineError> {
    if actor.may_manage(professional_id) {
        Ok(())
    } else {
        Err(EngineError::Unauthorized(
            "only an administrator or the owning professional may change this appointment",
        ))
    }
}
