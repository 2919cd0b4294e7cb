use std::collections::BTreeMap;

use serde::Serialize;

use crate::change::{ChangeRecord, EntityType};

/// Sent to observers whenever the staging area changes. Each variant carries
/// the id of the change it concerns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StagingEvent {
    Added(String),
    /// A newer proposal for the same target took the place of an older one.
    Replaced {
        superseded: String,
        replacement: String,
    },
    Edited(String),
    Approved(String),
    Rejected(String),
    CommitFailed {
        id: String,
        message: String,
    },
    /// Settled changes were dropped from the live list.
    Cleared(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Appended,
    /// Took the place of a pending change for the same target, or of an
    /// earlier copy of itself.
    Replaced { superseded: String },
    /// A replay of a change that is already settled or being committed.
    Ignored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// The store write went through and the change is now approved.
    Committed,
    /// The change had already been approved or rejected; nothing was written.
    AlreadySettled(crate::change::ChangeStatus),
    /// Another approval of this change is still writing to the store.
    InFlight,
}

/// Everything the presentation layer needs to render the review panel.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StagingSnapshot {
    pub pending: Vec<ChangeRecord>,
    pub pending_count: usize,
    pub pending_breakdown: BTreeMap<EntityType, usize>,
}
