pub use engine::StagingEngine;
pub use events::{AddOutcome, ApprovalOutcome, StagingEvent, StagingSnapshot};

pub mod engine;
pub mod events;
