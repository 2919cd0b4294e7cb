pub mod change;
pub mod commit;
pub mod config;
pub mod error;
pub mod intake;
pub mod notifier;
pub mod staging;
pub mod store;

pub use change::{ChangeRecord, ChangeStatus, EntityType, Proposal, RawChange};
pub use commit::{CommitAdapter, VaultCommitter};
pub use config::EngineConfig;
pub use error::{CommitError, CommitFailure, ValidationError};
pub use intake::{AbortSignal, ProposalEvent, ProposalIntake};
pub use staging::StagingEngine;
pub use store::{EntityStore, MemoryStore, SqliteVault};
pub use rusqlite;
