use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("task {id}: cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("invalid dependency: {0}")]
    InvalidDependency(String),

    #[error("dependency cycle through {task} (via {via:?})")]
    CircularDependency { task: String, via: Vec<String> },

    #[error("invalid subtask plan: {0}")]
    InvalidPlan(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound { kind, id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
