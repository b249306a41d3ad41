use crate::utils::IsTransient;

// ============================================================================
// Store Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Version conflict: expected {expected}, found {actual:?}")]
    Conflict { expected: i64, actual: Option<i64> },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    Duplicate { entity: &'static str, id: String },

    #[error("{entity} {id} is in state {actual}")]
    StateMismatch {
        entity: &'static str,
        id: String,
        actual: String,
    },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound { entity, id: id.to_string() }
    }
}

impl IsTransient for StoreError {
    /// Only backend failures are worth retrying. Conflicts and missing rows
    /// will look the same on the next attempt.
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}
