//! Effect - A side effect the reconcile loop can perform
//!
//! Effects are plain data. Nothing happens until a [`crate::reconcile::Reconciler`]
//! applies one.

use crate::resource::{Resource, ResourceId, State};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Refresh observed state; no identifier means "not created yet"
    Read {
        id: ResourceId,
        identifier: Option<String>,
    },
    Create(Resource),
    Update {
        id: ResourceId,
        identifier: String,
        from: State,
        to: Resource,
    },
    /// Delete what `State` describes, honouring the timeouts recorded in it
    Delete(State),
}

impl Effect {
    pub fn resource_id(&self) -> &ResourceId {
        match self {
            Effect::Read { id, .. } => id,
            Effect::Create(resource) => &resource.id,
            Effect::Update { id, .. } => id,
            Effect::Delete(state) => &state.id,
        }
    }

    /// Whether applying this effect changes anything in the cloud
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Effect::Read { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Effect::Read { .. } => "read",
            Effect::Create(_) => "create",
            Effect::Update { .. } => "update",
            Effect::Delete(_) => "delete",
        }
    }
}
