//! Error types for kvmodel operations.

use std::fmt;

use crate::commit::CommitReport;

/// The primary error type for all kvmodel operations.
#[derive(Debug)]
pub enum Error {
    /// Connector-level errors (connect, disconnect, closed store)
    Connection(ConnectionError),
    /// Query construction errors, raised before any backend contact
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction lifecycle misuse
    Transaction(TransactionError),
    /// Errors reported by the store for a single command or instance
    Backend(BackendError),
    /// Aggregated per-instance failures of one commit
    Commit(CommitError),
    /// Internal invariant violated; indicates a bug
    Consistency(ConsistencyError),
    /// Model declaration / registration errors
    Schema(SchemaError),
    /// Configuration errors
    Config(ConfigError),
    /// Validation errors
    Validation(ValidationError),
    /// The `Cx` was cancelled
    Cancelled,
    /// JSON encoding or decoding failed
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Could not reach the backend
    Connect,
    /// Backend went away mid-pipeline
    Disconnected,
    /// The store is unusable (e.g. poisoned lock)
    Unavailable,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Model the query was built for
    pub model: Option<String>,
    /// Field the criterion named, if any
    pub field: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Criterion names a field the model does not declare
    UnknownField,
    /// Criterion names a field without an index
    NotIndexed,
    /// Lookup suffix other than `in` / `eq`
    UnsupportedLookup,
    /// `sort_by` on a field that cannot be sorted
    Ordering,
    /// Tree shape cannot be lowered
    Malformed,
    /// Combining queries over different models
    ModelMismatch,
    /// `search()` without a search engine
    NoSearchEngine,
    /// Projection or `load_only` on an unknown field
    NoProjection,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub field: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// `commit()` already ran for this transaction
    AlreadyExecuted,
    /// `begin()` while a transaction is open
    NestedNotSupported,
    /// Instance is owned by another session
    ForeignSession,
    /// Operation requires an open transaction
    NotOpen,
}

#[derive(Debug, Clone)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    /// Key the failure relates to, if known
    pub key: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Operation against a key holding the wrong kind of value
    WrongType,
    /// A unique value is already owned by another id
    UniqueViolation,
    /// Stored version differs from the instance's version
    VersionConflict,
    /// Write without an id on a model that does not assign ids
    MissingId,
    /// Reply shape did not match the command
    Protocol,
    /// Server-side script failure
    Script,
}

/// All per-instance failures of one commit, raised after every
/// notification for the commit has fired.
#[derive(Debug)]
pub struct CommitError {
    pub report: Box<CommitReport>,
}

#[derive(Debug)]
pub struct ConsistencyError {
    pub message: String,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub model: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Model was never registered with the catalog
    NotRegistered,
    /// Invalid model declaration
    Invalid,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

/// Every failed rule of one instance.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Failed rules in check order; model-level ones use the field `_model`
    pub errors: Vec<FieldValidationError>,
}

/// One failed rule on one field.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// Record field name
    pub field: String,
    /// Which rule failed
    pub kind: ValidationErrorKind,
    /// Message shown to the caller
    pub message: String,
}

/// Rule kinds checked before an instance is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Text exceeds `max_length`
    MaxLength,
    /// Text does not match `pattern`
    Pattern,
    /// Required field is missing/null/blank
    Required,
    /// Custom validation failed
    Custom,
    /// `Model::validate` rejected the instance
    Model,
}

impl ValidationError {
    /// An empty collector.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// True when no rule failed.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Record a failed rule.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            kind,
            message: message.into(),
        });
    }

    pub fn add_max_length(&mut self, field: impl Into<String>, max: usize, actual: usize) {
        let field = field.into();
        let message = format!("'{field}' must be at most {max} characters (got {actual})");
        self.add(field, ValidationErrorKind::MaxLength, message);
    }

    pub fn add_pattern(&mut self, field: impl Into<String>, pattern: &str) {
        let field = field.into();
        let message = format!("'{field}' must match pattern {pattern}");
        self.add(field, ValidationErrorKind::Pattern, message);
    }

    pub fn add_required(&mut self, field: impl Into<String>) {
        let field = field.into();
        let message = format!("'{field}' is required");
        self.add(field, ValidationErrorKind::Required, message);
    }

    pub fn add_custom(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.add(field, ValidationErrorKind::Custom, message);
    }

    pub fn add_model_error(&mut self, message: impl Into<String>) {
        self.add("_model", ValidationErrorKind::Model, message);
    }

    /// Merge another set of errors into this one.
    pub fn extend(&mut self, other: ValidationError) {
        self.errors.extend(other.errors);
    }

    /// Convert to a `Result`, `Ok(())` when no errors were collected.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

impl Error {
    /// Usage errors are programming mistakes; retrying cannot help.
    pub fn is_usage(&self) -> bool {
        matches!(self, Error::Query(_) | Error::Transaction(_) | Error::Schema(_))
    }

    pub fn is_consistency(&self) -> bool {
        matches!(self, Error::Consistency(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// A backend error reporting a value already owned by another id.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Error::Backend(b) if b.is_unique_violation())
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Error::Backend(b) if b.is_version_conflict())
    }

    /// Shorthand for an internal invariant violation.
    pub fn consistency(message: impl Into<String>) -> Self {
        Error::Consistency(ConsistencyError {
            message: message.into(),
        })
    }

    /// Shorthand for a reply that does not match the command sent.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Backend(BackendError {
            kind: BackendErrorKind::Protocol,
            key: None,
            message: message.into(),
        })
    }

    pub fn query(
        kind: QueryErrorKind,
        model: &str,
        field: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::Query(QueryError {
            kind,
            model: Some(model.to_string()),
            field: field.map(str::to_string),
            message: message.into(),
        })
    }

    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    /// Kind of query error, if this is one.
    pub fn query_kind(&self) -> Option<QueryErrorKind> {
        match self {
            Error::Query(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Kind of backend error, if this is one.
    pub fn backend_kind(&self) -> Option<BackendErrorKind> {
        match self {
            Error::Backend(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Kind of transaction error, if this is one.
    pub fn transaction_kind(&self) -> Option<TransactionErrorKind> {
        match self {
            Error::Transaction(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl BackendError {
    pub fn is_unique_violation(&self) -> bool {
        self.kind == BackendErrorKind::UniqueViolation
    }

    pub fn is_version_conflict(&self) -> bool {
        self.kind == BackendErrorKind::VersionConflict
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => {
                if let Some(field) = &e.field {
                    write!(
                        f,
                        "Type error in field '{}': expected {}, found {}",
                        field, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Backend(e) => write!(f, "Backend error: {}", e),
            Error::Commit(e) => write!(f, "Commit error: {}", e),
            Error::Consistency(e) => write!(f, "Consistency error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.model, &self.field) {
            (Some(model), Some(field)) => write!(f, "{}.{}: {}", model, field, self.message),
            (Some(model), None) => write!(f, "{}: {}", model, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(field) = &self.field {
            write!(
                f,
                "expected {} for field '{}', found {}",
                self.expected, field, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{} (key {})", self.message, key),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} instance(s) failed to commit",
            self.report.failure_count(),
            self.report.outcomes.len()
        )
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.model, self.message)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "validation error on '{}': {}", err.field, err.message)
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        Error::Backend(err)
    }
}

impl From<CommitError> for Error {
    fn from(err: CommitError) -> Self {
        Error::Commit(err)
    }
}

impl From<ConsistencyError> for Error {
    fn from(err: ConsistencyError) -> Self {
        Error::Consistency(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_collects_and_displays() {
        let mut v = ValidationError::new();
        assert!(v.clone().into_result().is_ok());
        v.add_required("name");
        assert_eq!(v.to_string(), "validation error on 'name': 'name' is required");
        v.add_max_length("name", 3, 5);
        let err: Error = v.into();
        assert!(err.is_validation());
        assert!(err.to_string().contains("validation errors:"));
    }

    #[test]
    fn classification_helpers() {
        let q = Error::query(QueryErrorKind::NotIndexed, "user", Some("age"), "not indexed");
        assert!(q.is_usage());
        assert_eq!(q.query_kind(), Some(QueryErrorKind::NotIndexed));
        assert_eq!(q.to_string(), "Query error: user.age: not indexed");

        let c = Error::consistency("duplicate identity");
        assert!(c.is_consistency());
        assert!(!c.is_usage());

        let b = BackendError {
            kind: BackendErrorKind::UniqueViolation,
            key: Some("kvm.user:uni:email".into()),
            message: "value taken".into(),
        };
        assert!(b.is_unique_violation());
        let err = Error::from(b);
        assert_eq!(err.backend_kind(), Some(BackendErrorKind::UniqueViolation));
        assert!(err.is_unique_violation());
        assert!(!err.is_version_conflict());

        let stale = Error::Backend(BackendError {
            kind: BackendErrorKind::VersionConflict,
            key: Some("kvm.user:obj:7".into()),
            message: "expected version 2, found 3".into(),
        });
        assert!(stale.is_version_conflict());
        assert!(!stale.is_unique_violation());
        assert!(!c.is_unique_violation());
    }
}
