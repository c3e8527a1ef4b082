use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("transaction {txn_id} is not active")]
    TxNotActive { txn_id: u64 },

    #[error("transaction conflict: txn={txn_id}, read set changed before commit")]
    TxConflict { txn_id: u64 },

    #[error("lock timeout: txn={txn_id}, resource={resource_id:?}")]
    LockTimeout { txn_id: u64, resource_id: String },

    #[error("deadlock detected: txn={txn_id}, resource={resource_id:?}")]
    Deadlock { txn_id: u64, resource_id: String },

    #[error("database already open (directory is locked by another handle)")]
    DatabaseAlreadyOpen,

    #[error("database is closed")]
    DatabaseClosed,

    #[error("invalid engine options: {0}")]
    InvalidOptions(String),

    #[error("relation name cannot be empty")]
    RelationNameEmpty,

    #[error("relation name too long (max 64 characters)")]
    RelationNameTooLong,

    #[error("relation name must start with letter or underscore")]
    RelationNameInvalidStart,

    #[error("relation name contains invalid characters (use alphanumeric and underscore only)")]
    RelationNameInvalidChar,

    #[error("relation name is reserved")]
    RelationNameReserved,

    #[error("relation '{name}' already exists")]
    RelationAlreadyExists { name: String },

    #[error("relation '{name}' does not exist")]
    RelationNotFound { name: String },

    #[error("column '{column}' already exists in relation '{relation}'")]
    ColumnAlreadyExists { relation: String, column: String },

    #[error("column '{column}' does not exist in relation '{relation}'")]
    ColumnNotFound { relation: String, column: String },

    #[error("index '{name}' already exists")]
    IndexAlreadyExists { name: String },

    #[error("index '{name}' does not exist")]
    IndexNotFound { name: String },

    #[error("page {page_id} not found")]
    PageNotFound { page_id: u32 },

    #[error("write overruns page {page_id}: offset={offset}, len={len}, capacity={capacity}")]
    PageOverflow {
        page_id: u32,
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("record of {size} bytes cannot fit in a page (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("validation error: field={field:?}, value={value}, reason={reason:?}")]
    Validation {
        field: String,
        value: String,
        reason: String,
    },

    #[error("schema validation error: {0}")]
    SchemaValidation(String),

    #[error("checksum mismatch in {component} at position {position}")]
    ChecksumMismatch { component: String, position: u64 },

    #[error("data corruption in {component}: page={page_id}, {details}")]
    Corruption {
        component: String,
        page_id: u32,
        details: String,
    },

    #[error("data corruption: {details}")]
    DataCorruption { details: String },

    #[error("lock poisoned: {lock_name} (another thread panicked while holding this lock)")]
    LockPoisoned { lock_name: String },

    #[error("parse error at position {pos}: expected {expected}, found {found}")]
    Parse {
        expected: String,
        found: String,
        pos: usize,
    },

    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("cyclic migration dependency among: {}", migrations.join(", "))]
    CyclicDependency { migrations: Vec<String> },

    #[error("migration '{id}' not found")]
    MigrationNotFound { id: String },

    #[error("serialization error: {error} ({context})")]
    SerializationError { context: String, error: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Corruption is fatal to the read that hit it and is never retried.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::ChecksumMismatch { .. } | Error::Corruption { .. } | Error::DataCorruption { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::PageNotFound { .. }
                | Error::RelationNotFound { .. }
                | Error::ColumnNotFound { .. }
                | Error::IndexNotFound { .. }
                | Error::MigrationNotFound { .. }
        )
    }

    /// Lock timeouts and deadlocks; the caller is expected to abort.
    pub fn is_concurrency(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. } | Error::Deadlock { .. } | Error::TxConflict { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError {
            context: "json".to_string(),
            error: err.to_string(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::LockPoisoned {
            lock_name: "unknown".to_string(),
        }
    }
}

// Binary parsing of page and WAL headers
impl From<std::array::TryFromSliceError> for Error {
    fn from(_: std::array::TryFromSliceError) -> Self {
        Error::DataCorruption {
            details: "failed to parse binary data".to_string(),
        }
    }
}

pub trait PoisonedLockExt<'a, T> {
    fn recover_poison(self) -> T;
}

impl<'a, T> PoisonedLockExt<'a, std::sync::RwLockReadGuard<'a, T>> for std::sync::LockResult<std::sync::RwLockReadGuard<'a, T>> {
    fn recover_poison(self) -> std::sync::RwLockReadGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<'a, T> PoisonedLockExt<'a, std::sync::RwLockWriteGuard<'a, T>> for std::sync::LockResult<std::sync::RwLockWriteGuard<'a, T>> {
    fn recover_poison(self) -> std::sync::RwLockWriteGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<'a, T> PoisonedLockExt<'a, std::sync::MutexGuard<'a, T>> for std::sync::LockResult<std::sync::MutexGuard<'a, T>> {
    fn recover_poison(self) -> std::sync::MutexGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = Error::ChecksumMismatch { component: "wal".to_string(), position: 12 };
        assert!(err.is_corruption());
        assert!(!err.is_not_found());

        let err = Error::PageNotFound { page_id: 7 };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "page 7 not found");

        let err = Error::Deadlock { txn_id: 3, resource_id: "r1".to_string() };
        assert!(err.is_concurrency());
    }

    #[test]
    fn test_cyclic_dependency_message() {
        let err = Error::CyclicDependency {
            migrations: vec!["a".to_string(), "c".to_string()],
        };
        assert_eq!(err.to_string(), "cyclic migration dependency among: a, c");
    }
}
