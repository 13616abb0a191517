mod error;
mod interventions;
mod merges;
mod outcomes;
mod progress;
mod rows;
mod store;
mod supervision;
mod tasks;
mod workers;

pub use error::{StoreError, StoreResult};
pub use merges::MergeResolution;
pub use store::SqliteStore;
pub use tasks::DecompositionStart;
