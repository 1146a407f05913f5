use ulid::Ulid;

#[derive(Debug)]
pub enum StoreError {
    /// The transaction could not run to completion (lock wait timed out, writer
    /// shutting down mid-flight). Safe to retry from scratch.
    Aborted(&'static str),
    /// A staged row duplicates a unique key.
    UniqueViolation(&'static str),
    /// A staged confirmed booking overlaps a committed one.
    ExclusionViolation(Ulid),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Aborted(why) => write!(f, "transaction aborted: {why}"),
            StoreError::UniqueViolation(key) => write!(f, "unique constraint violated: {key}"),
            StoreError::ExclusionViolation(id) => {
                write!(f, "overlaps confirmed booking: {id}")
            }
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
