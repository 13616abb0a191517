use hive_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecomposeError {
    #[error("reasoner failed: {0}")]
    Reasoner(String),

    #[error("unparseable decomposition response: {0}")]
    InvalidResponse(String),

    #[error("decomposition produced {0} subtasks, need at least 2")]
    TooFewSubtasks(usize),

    #[error("subtask {subtask} depends on {dependency}, which is not an earlier subtask")]
    ForwardDependency { subtask: usize, dependency: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}
