use thiserror::Error;

/// Stable error classification exposed to clients alongside the SQLSTATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Semantic,
    Constraint,
    Deadlock,
    LockTimeout,
    DataType,
    Resource,
    Recovery,
    Internal,
}

/// Optional context attached to a user-visible error.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub statement: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub constraint: Option<String>,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL parsing error: {0}")]
    Parse(String),

    #[error("Semantic error: {0}")]
    Semantic(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Unique constraint violation: {0}")]
    UniqueViolation(String),

    #[error("NOT NULL constraint violation: {0}")]
    NotNullViolation(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Data type error: {0}")]
    DataType(String),

    #[error("Deadlock detected")]
    Deadlock,

    #[error("Lock timeout")]
    LockTimeout,

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Buffer pool error: {0}")]
    Buffer(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Recovery error: {0}")]
    Recovery(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{source}")]
    Contexted {
        source: Box<DbError>,
        context: ErrorContext,
    },
}

impl DbError {
    /// Wraps the error with statement/table/column context.
    pub fn with_context(self, context: ErrorContext) -> Self {
        DbError::Contexted {
            source: Box::new(self),
            context,
        }
    }

    /// The stable kind tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::Parse(_) => ErrorKind::Syntax,
            DbError::Semantic(_)
            | DbError::Catalog(_)
            | DbError::NotFound(_)
            | DbError::AlreadyExists(_)
            | DbError::Unsupported(_)
            | DbError::Execution(_) => ErrorKind::Semantic,
            DbError::UniqueViolation(_)
            | DbError::NotNullViolation(_)
            | DbError::Constraint(_) => ErrorKind::Constraint,
            DbError::DataType(_) | DbError::Serialization(_) => ErrorKind::DataType,
            DbError::Deadlock => ErrorKind::Deadlock,
            DbError::LockTimeout => ErrorKind::LockTimeout,
            DbError::Lock(_) | DbError::Transaction(_) => ErrorKind::Semantic,
            DbError::Io(_)
            | DbError::Storage(_)
            | DbError::Buffer(_)
            | DbError::ResourceExhausted(_)
            | DbError::Network(_) => ErrorKind::Resource,
            DbError::Wal(_) | DbError::Recovery(_) => ErrorKind::Recovery,
            DbError::Internal(_) => ErrorKind::Internal,
            DbError::Contexted { source, .. } => source.kind(),
        }
    }

    /// SQLSTATE-like five character code for the client protocol.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            DbError::Parse(_) => "42601",
            DbError::Semantic(_) | DbError::Execution(_) => "42000",
            DbError::Catalog(_) | DbError::NotFound(_) => "42P01",
            DbError::AlreadyExists(_) => "42P07",
            DbError::UniqueViolation(_) => "23505",
            DbError::NotNullViolation(_) => "23502",
            DbError::Constraint(_) => "23514",
            DbError::DataType(_) | DbError::Serialization(_) => "22000",
            DbError::Deadlock => "40P01",
            DbError::LockTimeout => "55P03",
            DbError::Lock(_) => "55000",
            DbError::Transaction(_) => "25000",
            DbError::Io(_) | DbError::Storage(_) | DbError::Buffer(_) => "58030",
            DbError::ResourceExhausted(_) => "53200",
            DbError::Wal(_) | DbError::Recovery(_) => "58P01",
            DbError::Unsupported(_) => "0A000",
            DbError::Network(_) => "08000",
            DbError::Internal(_) => "XX000",
            DbError::Contexted { source, .. } => source.sqlstate(),
        }
    }

    /// Whether the caller may safely retry the failed transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Deadlock | ErrorKind::LockTimeout)
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

// Error conversions for common error types

impl From<bincode::error::EncodeError> for DbError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for DbError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_mapping() {
        assert_eq!(DbError::Deadlock.sqlstate(), "40P01");
        assert_eq!(DbError::LockTimeout.sqlstate(), "55P03");
        assert_eq!(DbError::UniqueViolation("pk".into()).sqlstate(), "23505");
        assert_eq!(DbError::Parse("bad token".into()).sqlstate(), "42601");
    }

    #[test]
    fn test_kind_survives_context() {
        let err = DbError::Deadlock.with_context(ErrorContext {
            table: Some("accounts".into()),
            ..Default::default()
        });
        assert_eq!(err.kind(), ErrorKind::Deadlock);
        assert!(err.is_retryable());
    }
}
