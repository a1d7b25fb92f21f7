//! Error types for shard store calls.

/// Errors returned by a shard's key-value store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or refused the connection.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered but rejected a single command.
    #[error("{op} rejected for key {key}")]
    Rejected {
        /// Command name, e.g. `"set"` or `"del"`.
        op: &'static str,
        /// Key the command addressed.
        key: String,
    },

    /// A scan cursor that this store never issued.
    #[error("invalid scan cursor: {0}")]
    InvalidCursor(String),
}
