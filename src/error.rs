use thiserror::Error;

use crate::bson::{BsonError, Document};
use crate::query::QueryError;
use crate::storage::StorageError;

/// Semantic error categories shared by every layer.
///
/// Callers branch on the kind, never on messages or concrete error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed wire bytes. Fatal to the connection only.
    ProtocolError,
    /// Well-formed request that failed; answered with an error document.
    CommandError,
    NamespaceNotFound,
    NamespaceAlreadyExists,
    /// Pool exhaustion or backend outage.
    BackendUnavailable,
    /// The backend cannot evaluate an operator; the caller falls back to
    /// in-process evaluation.
    UnsupportedOperator,
}

/// Numeric error codes sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InternalError,
    BadValue,
    HostUnreachable,
    FailedToParse,
    TypeMismatch,
    NamespaceNotFound,
    ConflictingUpdateOperators,
    CursorNotFound,
    NamespaceExists,
    CommandNotFound,
    ImmutableField,
    InvalidOptions,
    InvalidNamespace,
    QueryPlanKilled,
    NotImplemented,
    DuplicateKey,
    InterruptedAtShutdown,
    Interrupted,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::InternalError => 1,
            ErrorCode::BadValue => 2,
            ErrorCode::HostUnreachable => 6,
            ErrorCode::FailedToParse => 9,
            ErrorCode::TypeMismatch => 14,
            ErrorCode::NamespaceNotFound => 26,
            ErrorCode::ConflictingUpdateOperators => 40,
            ErrorCode::CursorNotFound => 43,
            ErrorCode::NamespaceExists => 48,
            ErrorCode::CommandNotFound => 59,
            ErrorCode::ImmutableField => 66,
            ErrorCode::InvalidOptions => 72,
            ErrorCode::InvalidNamespace => 73,
            ErrorCode::QueryPlanKilled => 175,
            ErrorCode::NotImplemented => 238,
            ErrorCode::DuplicateKey => 11000,
            ErrorCode::InterruptedAtShutdown => 11600,
            ErrorCode::Interrupted => 11601,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::InternalError => "InternalError",
            ErrorCode::BadValue => "BadValue",
            ErrorCode::HostUnreachable => "HostUnreachable",
            ErrorCode::FailedToParse => "FailedToParse",
            ErrorCode::TypeMismatch => "TypeMismatch",
            ErrorCode::NamespaceNotFound => "NamespaceNotFound",
            ErrorCode::ConflictingUpdateOperators => "ConflictingUpdateOperators",
            ErrorCode::CursorNotFound => "CursorNotFound",
            ErrorCode::NamespaceExists => "NamespaceExists",
            ErrorCode::CommandNotFound => "CommandNotFound",
            ErrorCode::ImmutableField => "ImmutableField",
            ErrorCode::InvalidOptions => "InvalidOptions",
            ErrorCode::InvalidNamespace => "InvalidNamespace",
            ErrorCode::QueryPlanKilled => "QueryPlanKilled",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::DuplicateKey => "DuplicateKey",
            ErrorCode::InterruptedAtShutdown => "InterruptedAtShutdown",
            ErrorCode::Interrupted => "Interrupted",
        }
    }

    fn kind(self) -> ErrorKind {
        match self {
            ErrorCode::NamespaceNotFound => ErrorKind::NamespaceNotFound,
            ErrorCode::NamespaceExists => ErrorKind::NamespaceAlreadyExists,
            ErrorCode::HostUnreachable => ErrorKind::BackendUnavailable,
            _ => ErrorKind::CommandError,
        }
    }
}

/// A failed command, reported to the client as an error reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
}

pub type CommandResult<T> = Result<T, CommandError>;

impl CommandError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadValue, message)
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TypeMismatch, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    /// The `{ok: 0, errmsg, code, codeName}` reply body.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::with_capacity(4);
        doc.insert("ok", 0.0);
        doc.insert("errmsg", self.message.as_str());
        doc.insert("code", self.code.code());
        doc.insert("codeName", self.code.name());
        doc
    }
}

impl From<QueryError> for CommandError {
    fn from(err: QueryError) -> Self {
        let code = match &err {
            QueryError::BadValue(_) => ErrorCode::BadValue,
            QueryError::TypeMismatch(_) => ErrorCode::TypeMismatch,
            QueryError::FailedToParse(_) => ErrorCode::FailedToParse,
            QueryError::ConflictingUpdateOperators(_) => ErrorCode::ConflictingUpdateOperators,
            QueryError::ImmutableField(_) => ErrorCode::ImmutableField,
            QueryError::NotImplemented(_) => ErrorCode::NotImplemented,
        };
        CommandError::new(code, err.to_string())
    }
}

impl From<BsonError> for CommandError {
    fn from(err: BsonError) -> Self {
        CommandError::new(ErrorCode::BadValue, err.to_string())
    }
}

impl From<StorageError> for CommandError {
    fn from(err: StorageError) -> Self {
        let code = match &err {
            StorageError::NamespaceNotFound(_) => ErrorCode::NamespaceNotFound,
            StorageError::NamespaceAlreadyExists(_) => ErrorCode::NamespaceExists,
            StorageError::InvalidNamespace(_) => ErrorCode::InvalidNamespace,
            StorageError::DuplicateKey(_) => ErrorCode::DuplicateKey,
            StorageError::BackendUnavailable(_) => ErrorCode::HostUnreachable,
            StorageError::Cancelled => ErrorCode::Interrupted,
            StorageError::Query(q) => return CommandError::from(q.clone()),
            StorageError::Corrupt(_) | StorageError::Backend(_) => ErrorCode::InternalError,
        };
        CommandError::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::Bson;

    #[test]
    fn test_error_document_shape() {
        let err = CommandError::new(ErrorCode::CommandNotFound, "no such command: 'nope'");
        let doc = err.to_document();
        assert_eq!(doc.get("ok"), Some(&Bson::Double(0.0)));
        assert_eq!(doc.get_str("errmsg"), Some("no such command: 'nope'"));
        assert_eq!(doc.get("code"), Some(&Bson::Int32(59)));
        assert_eq!(doc.get_str("codeName"), Some("CommandNotFound"));
    }

    #[test]
    fn test_error_messages() {
        let err = CommandError::bad_value("bad thing");
        assert_eq!(err.to_string(), "bad thing");

        let err: CommandError = QueryError::ImmutableField("x".into()).into();
        assert_eq!(err.code, ErrorCode::ImmutableField);
        assert_eq!(err.code.code(), 66);
    }

    #[test]
    fn test_storage_errors_map_to_kinds() {
        let err: CommandError = StorageError::NamespaceNotFound("test.values".into()).into();
        assert_eq!(err.kind(), ErrorKind::NamespaceNotFound);
        assert_eq!(err.code.code(), 26);

        let err: CommandError = StorageError::NamespaceAlreadyExists("test.values".into()).into();
        assert_eq!(err.kind(), ErrorKind::NamespaceAlreadyExists);

        let err: CommandError = StorageError::BackendUnavailable("down".into()).into();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(err.code.code(), 6);

        let err: CommandError = StorageError::DuplicateKey("dup".into()).into();
        assert_eq!(err.code.code(), 11000);
    }
}
