pub mod engine;
pub mod graph;
pub mod ids;
pub mod intent;
pub mod model;
pub mod subtask;
pub mod time;
pub mod types;

pub use engine::*;
pub use graph::*;
pub use ids::*;
pub use intent::*;
pub use model::*;
pub use subtask::*;
pub use time::*;
pub use types::*;
