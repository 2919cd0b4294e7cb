// Re-export all public items from the change modules
pub use diff::FieldDiff;
pub use raw::RawChange;
pub use types::*;

pub mod diff;
pub mod raw;
pub mod types;
