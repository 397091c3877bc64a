// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Repository Error Taxonomy
//!
//! Every failure that leaves the repository layer is a [`RepositoryError`]
//! tagged with one [`RepositoryErrorKind`]. Store-level failures
//! ([`StoreError`]) are normalized through [`RepositoryError::from_store`] /
//! [`RepositoryError::from_unknown`], which map the known constraint codes and
//! leave everything else as `Unknown`.
//!
//! | Kind | Raised by | Store code |
//! |------|-----------|------------|
//! | `NotFound` | `update`/`delete` preconditions | `PGRST116` |
//! | `Validation` | empty updates, bad pagination | - |
//! | `UniqueConstraint` | inserts/updates | `23505` |
//! | `ForeignKeyConstraint` | inserts/updates | `23503` |
//! | `Transaction` | sequential transaction steps | - |
//! | `BulkOperation` | bulk paths | - |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Store code for a unique-constraint violation.
pub const UNIQUE_VIOLATION_CODE: &str = "23505";

/// Store code for a foreign-key violation.
pub const FOREIGN_KEY_VIOLATION_CODE: &str = "23503";

/// Store code for "no row matched a single-row request".
pub const ROW_NOT_FOUND_CODE: &str = "PGRST116";

/// Underlying cause attached to a [`RepositoryError`].
pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Closed set of repository failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryErrorKind {
    NotFound,
    Validation,
    Connection,
    Permission,
    UniqueConstraint,
    ForeignKeyConstraint,
    Transaction,
    BulkOperation,
    Unknown,
}

impl RepositoryErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryErrorKind::NotFound => "not_found",
            RepositoryErrorKind::Validation => "validation",
            RepositoryErrorKind::Connection => "connection",
            RepositoryErrorKind::Permission => "permission",
            RepositoryErrorKind::UniqueConstraint => "unique_constraint",
            RepositoryErrorKind::ForeignKeyConstraint => "foreign_key_constraint",
            RepositoryErrorKind::Transaction => "transaction",
            RepositoryErrorKind::BulkOperation => "bulk_operation",
            RepositoryErrorKind::Unknown => "unknown",
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Only transport failures qualify; constraint and validation failures
    /// will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepositoryErrorKind::Connection)
    }
}

impl fmt::Display for RepositoryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Failure reported by a [`TabularStore`](crate::domain::repository::TabularStore)
/// implementation, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StoreError {
    pub code: Option<String>,
    pub message: String,
    pub status: Option<u16>,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn unique_violation(message: impl Into<String>) -> Self {
        Self::with_code(UNIQUE_VIOLATION_CODE, message).with_status(409)
    }

    pub fn foreign_key_violation(message: impl Into<String>) -> Self {
        Self::with_code(FOREIGN_KEY_VIOLATION_CODE, message).with_status(409)
    }

    pub fn row_not_found() -> Self {
        Self::with_code(ROW_NOT_FOUND_CODE, "The result contains 0 rows").with_status(406)
    }
}

/// Normalized repository failure.
///
/// Immutable once returned to a caller: fields are only readable through
/// accessors, and the `with_*` builders are used while the error is still
/// being assembled inside the repository layer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RepositoryError {
    kind: RepositoryErrorKind,
    message: String,
    code: Option<String>,
    status: Option<u16>,
    entity: Option<String>,
    operation: Option<String>,
    field_errors: Vec<FieldError>,
    failed_step: Option<usize>,
    queued_steps: Option<usize>,
    #[source]
    cause: Option<ErrorCause>,
}

impl RepositoryError {
    fn base(kind: RepositoryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            status: None,
            entity: None,
            operation: None,
            field_errors: Vec::new(),
            failed_step: None,
            queued_steps: None,
            cause: None,
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        let entity = entity.into();
        let mut err = Self::base(
            RepositoryErrorKind::NotFound,
            format!("{entity} with id {id} not found"),
        );
        err.code = Some(ROW_NOT_FOUND_CODE.to_string());
        err.status = Some(404);
        err.entity = Some(entity);
        err
    }

    pub fn validation(
        message: impl Into<String>,
        field_errors: Vec<FieldError>,
        entity: Option<&str>,
    ) -> Self {
        let mut err = Self::base(RepositoryErrorKind::Validation, message);
        err.status = Some(400);
        err.field_errors = field_errors;
        err.entity = entity.map(str::to_string);
        err
    }

    pub fn connection(message: impl Into<String>, cause: Option<anyhow::Error>) -> Self {
        let mut err = Self::base(RepositoryErrorKind::Connection, message);
        err.status = Some(503);
        err.cause = cause.map(into_cause);
        err
    }

    pub fn permission(message: impl Into<String>, entity: Option<&str>) -> Self {
        let mut err = Self::base(RepositoryErrorKind::Permission, message);
        err.status = Some(403);
        err.entity = entity.map(str::to_string);
        err
    }

    pub fn unique_constraint(
        field: impl fmt::Display,
        value: impl fmt::Display,
        entity: impl Into<String>,
    ) -> Self {
        let entity = entity.into();
        let mut err = Self::base(
            RepositoryErrorKind::UniqueConstraint,
            format!("{entity} with {field} '{value}' already exists"),
        );
        err.code = Some(UNIQUE_VIOLATION_CODE.to_string());
        err.status = Some(409);
        err.entity = Some(entity);
        err
    }

    pub fn foreign_key_constraint(message: impl Into<String>, entity: impl Into<String>) -> Self {
        let mut err = Self::base(RepositoryErrorKind::ForeignKeyConstraint, message);
        err.code = Some(FOREIGN_KEY_VIOLATION_CODE.to_string());
        err.status = Some(409);
        err.entity = Some(entity.into());
        err
    }

    pub fn transaction(
        message: impl Into<String>,
        cause: Option<anyhow::Error>,
        entity: impl Into<String>,
    ) -> Self {
        let mut err = Self::base(RepositoryErrorKind::Transaction, message);
        err.status = Some(500);
        err.entity = Some(entity.into());
        err.operation = Some("transaction".to_string());
        err.cause = cause.map(into_cause);
        err
    }

    /// Transaction failure at the 1-indexed `step` out of `total` queued steps.
    pub fn transaction_step_failed(
        step: usize,
        total: usize,
        cause: anyhow::Error,
        entity: impl Into<String>,
    ) -> Self {
        let mut err = Self::transaction(
            format!("Operation {step} of {total} in transaction failed: {cause}"),
            Some(cause),
            entity,
        );
        err.failed_step = Some(step);
        err.queued_steps = Some(total);
        err
    }

    pub fn bulk_operation(
        message: impl Into<String>,
        cause: Option<anyhow::Error>,
        entity: impl Into<String>,
    ) -> Self {
        let mut err = Self::base(RepositoryErrorKind::BulkOperation, message);
        err.status = Some(500);
        err.entity = Some(entity.into());
        err.operation = Some("bulkOperation".to_string());
        err.cause = cause.map(into_cause);
        err
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        let mut err = Self::base(RepositoryErrorKind::Unknown, message);
        err.status = Some(500);
        err
    }

    /// Normalize a store failure, mapping known constraint codes.
    pub fn from_store(err: StoreError, entity: &str, operation: &str) -> Self {
        let normalized = match err.code.as_deref() {
            Some(UNIQUE_VIOLATION_CODE) => {
                let mut e = Self::base(RepositoryErrorKind::UniqueConstraint, err.message.clone());
                e.status = Some(409);
                e
            }
            Some(FOREIGN_KEY_VIOLATION_CODE) => {
                let mut e =
                    Self::base(RepositoryErrorKind::ForeignKeyConstraint, err.message.clone());
                e.status = Some(409);
                e
            }
            Some(ROW_NOT_FOUND_CODE) => {
                let mut e = Self::base(RepositoryErrorKind::NotFound, err.message.clone());
                e.status = Some(404);
                e
            }
            _ => {
                let mut e = Self::base(RepositoryErrorKind::Unknown, err.message.clone());
                e.status = err.status;
                e
            }
        };

        Self {
            code: err.code.clone(),
            entity: Some(entity.to_string()),
            operation: Some(operation.to_string()),
            cause: Some(Arc::new(err)),
            ..normalized
        }
    }

    /// Normalize an arbitrary failure.
    ///
    /// Repository errors pass through (gaining entity/operation context when
    /// missing), store errors go through [`RepositoryError::from_store`], and
    /// anything else becomes `Unknown` with the original kept as the cause.
    pub fn from_unknown(err: anyhow::Error, entity: &str, operation: &str) -> Self {
        let err = match err.downcast::<RepositoryError>() {
            Ok(repository_error) => return repository_error.with_context(entity, operation),
            Err(err) => err,
        };
        let err = match err.downcast::<StoreError>() {
            Ok(store_error) => return Self::from_store(store_error, entity, operation),
            Err(err) => err,
        };

        let mut normalized = Self::unknown(err.to_string());
        normalized.entity = Some(entity.to_string());
        normalized.operation = Some(operation.to_string());
        normalized.cause = Some(into_cause(err));
        normalized
    }

    /// Fill in entity/operation when they are not already set.
    pub fn with_context(mut self, entity: &str, operation: &str) -> Self {
        if self.entity.is_none() {
            self.entity = Some(entity.to_string());
        }
        if self.operation.is_none() {
            self.operation = Some(operation.to_string());
        }
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn kind(&self) -> RepositoryErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn entity(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    pub fn field_errors(&self) -> &[FieldError] {
        &self.field_errors
    }

    /// 1-indexed transaction step that failed, for `Transaction` errors.
    pub fn failed_step(&self) -> Option<usize> {
        self.failed_step
    }

    /// Number of steps queued in the failed transaction.
    pub fn queued_steps(&self) -> Option<usize> {
        self.queued_steps
    }

    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

fn into_cause(err: anyhow::Error) -> ErrorCause {
    let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = err.into();
    Arc::from(boxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_named_constructors_report_matching_kind() {
        let cases = vec![
            (RepositoryError::not_found("Contract", "c-1"), RepositoryErrorKind::NotFound),
            (
                RepositoryError::validation("bad", vec![FieldError::new("title", "required")], None),
                RepositoryErrorKind::Validation,
            ),
            (RepositoryError::connection("offline", None), RepositoryErrorKind::Connection),
            (RepositoryError::permission("denied", Some("Contract")), RepositoryErrorKind::Permission),
            (
                RepositoryError::unique_constraint("email", "a@b.c", "User"),
                RepositoryErrorKind::UniqueConstraint,
            ),
            (
                RepositoryError::foreign_key_constraint("missing owner", "Document"),
                RepositoryErrorKind::ForeignKeyConstraint,
            ),
            (
                RepositoryError::transaction("boom", None, "Contract"),
                RepositoryErrorKind::Transaction,
            ),
            (
                RepositoryError::bulk_operation("boom", None, "Contract"),
                RepositoryErrorKind::BulkOperation,
            ),
            (RepositoryError::unknown("???"), RepositoryErrorKind::Unknown),
        ];

        for (err, kind) in cases {
            assert_eq!(err.kind(), kind, "{err}");
        }
    }

    #[test]
    fn test_not_found_carries_entity_context() {
        let err = RepositoryError::not_found("Vistoria", "v-42");
        assert_eq!(err.entity(), Some("Vistoria"));
        assert_eq!(err.status(), Some(404));
        assert!(err.message().contains("v-42"));
    }

    #[test]
    fn test_validation_keeps_every_field_error() {
        let err = RepositoryError::validation(
            "invalid contract",
            vec![
                FieldError::new("title", "required"),
                FieldError::new("value", "must be positive").with_code("min"),
            ],
            Some("Contract"),
        );
        assert_eq!(err.field_errors().len(), 2);
        assert_eq!(err.field_errors()[1].code.as_deref(), Some("min"));
    }

    #[test]
    fn test_from_store_maps_known_codes() {
        let unique = RepositoryError::from_store(
            StoreError::unique_violation("duplicate key"),
            "User",
            "create",
        );
        assert_eq!(unique.kind(), RepositoryErrorKind::UniqueConstraint);
        assert_eq!(unique.code(), Some(UNIQUE_VIOLATION_CODE));
        assert_eq!(unique.operation(), Some("create"));

        let fk = RepositoryError::from_store(
            StoreError::foreign_key_violation("owner missing"),
            "Document",
            "create",
        );
        assert_eq!(fk.kind(), RepositoryErrorKind::ForeignKeyConstraint);

        let missing = RepositoryError::from_store(StoreError::row_not_found(), "Document", "findById");
        assert_eq!(missing.kind(), RepositoryErrorKind::NotFound);

        let other = RepositoryError::from_store(
            StoreError::with_code("57014", "statement timeout").with_status(500),
            "Document",
            "findMany",
        );
        assert_eq!(other.kind(), RepositoryErrorKind::Unknown);
        assert_eq!(other.status(), Some(500));
        assert!(other.source().is_some());
    }

    #[test]
    fn test_from_unknown_passes_repository_errors_through() {
        let original = RepositoryError::permission("denied", None);
        let err = RepositoryError::from_unknown(original.into(), "Contract", "update");
        assert_eq!(err.kind(), RepositoryErrorKind::Permission);
        assert_eq!(err.entity(), Some("Contract"));
        assert_eq!(err.operation(), Some("update"));
    }

    #[test]
    fn test_from_unknown_downcasts_store_errors() {
        let err = RepositoryError::from_unknown(
            StoreError::unique_violation("dup").into(),
            "User",
            "create",
        );
        assert_eq!(err.kind(), RepositoryErrorKind::UniqueConstraint);
    }

    #[test]
    fn test_from_unknown_wraps_foreign_errors() {
        let err = RepositoryError::from_unknown(anyhow::anyhow!("socket closed"), "User", "count");
        assert_eq!(err.kind(), RepositoryErrorKind::Unknown);
        assert_eq!(err.message(), "socket closed");
        assert!(err.cause().is_some());
    }

    #[test]
    fn test_transaction_step_failure_reports_position() {
        let err = RepositoryError::transaction_step_failed(
            2,
            5,
            anyhow::anyhow!("insert failed"),
            "Contract",
        );
        assert_eq!(err.kind(), RepositoryErrorKind::Transaction);
        assert_eq!(err.failed_step(), Some(2));
        assert_eq!(err.queued_steps(), Some(5));
        assert!(err.message().contains("2 of 5"));
    }

    #[test]
    fn test_only_connection_errors_are_retryable() {
        assert!(RepositoryError::connection("down", None).is_retryable());
        assert!(!RepositoryError::unique_constraint("a", "b", "c").is_retryable());
    }
}
