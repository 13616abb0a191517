pub mod agent;
pub mod config;
pub mod import;
pub mod orchestrator;
pub mod registry;
pub mod skills;
pub mod worker;
pub mod workspace;

pub use agent::*;
pub use config::*;
pub use import::*;
pub use orchestrator::*;
pub use registry::*;
pub use skills::*;
pub use worker::*;
pub use workspace::*;
