//! Complexity scoring and task decomposition.
//!
//! A task is split when its estimated complexity crosses a threshold, or up front
//! when its text reads like a bulk operation. The split itself comes from an
//! external [`Reasoner`]; everything around it (scoring fallback, response
//! parsing, index validation, persistence) is deterministic.

mod bulk;
mod complexity;
mod decomposer;
mod error;
mod plan;
mod reasoner;

pub use bulk::{detect_bulk_operation, looks_like_bulk, BulkDetection};
pub use complexity::{
    complexity_prompt, estimate_complexity, heuristic_estimate, parse_estimate, turns_for_score, ComplexityBucket,
    ComplexityEstimate, Confidence, EstimateSource,
};
pub use decomposer::{DecomposeOutcome, DecomposeSettings, Decomposer, Trigger};
pub use error::DecomposeError;
pub use plan::{decomposition_prompt, parse_decomposition, validate_plan};
pub use reasoner::{AgentCliReasoner, Reasoner};
