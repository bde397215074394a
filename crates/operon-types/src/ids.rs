//! Newtype identifiers for the distinct id-spaces the engine tracks.
//!
//! Keeping these as newtypes (rather than passing `Uuid`/`String` around
//! directly) prevents a `CheckpointId` from being passed where an
//! `OperationId` is expected, a class of bug that is otherwise easy to
//! introduce once several id-shaped parameters line up in a function
//! signature.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies an [`Operation`](crate::operation::Operation) across its
/// lifetime. Client-supplied or assigned at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    /// Mint a new time-sortable id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for OperationId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Identifies a [`Checkpoint`](crate::checkpoint::Checkpoint) within a single
/// operation. Monotonically increasing per operation so that "restore the
/// latest checkpoint preceding id X" is a simple numeric comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub u64);

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Step ids are caller-assigned strings, stable across pause/resume and
/// checkpoint restore, unlike the engine-minted [`OperationId`].
pub type StepId = String;
