//! Error types shared by every layer of the store.
//!
//! Each failure maps to a stable [`ErrorKind`] tag so FFI callers can branch
//! on it without parsing messages.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error tags surfaced in every [`AppResponse`](crate::app_response::AppResponse).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    NotFoundError,
    PersistenceError,
    InitializationError,
    MigrationError,
    SerializationError,
    BadRequest,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::NotFoundError => "NotFoundError",
            ErrorKind::PersistenceError => "PersistenceError",
            ErrorKind::InitializationError => "InitializationError",
            ErrorKind::MigrationError => "MigrationError",
            ErrorKind::SerializationError => "SerializationError",
            ErrorKind::BadRequest => "BadRequest",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        FieldViolation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// A record failed schema checks. Lists every offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("validation failed: {}", summarize(.violations))]
pub struct ValidationError {
    pub violations: Vec<FieldViolation>,
}

impl ValidationError {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError {
            violations: vec![FieldViolation::new(field, message)],
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.violations.iter().map(|v| v.field.as_str())
    }
}

fn summarize(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} ({})", v.field, v.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A single stored record could not be brought up to the current schema.
/// Recorded per item; never aborts a migration batch.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("record #{index} could not be migrated: {message}")]
pub struct MigrationError {
    /// Always [`ErrorKind::MigrationError`].
    pub kind: ErrorKind,
    pub index: usize,
    pub id: Option<String>,
    pub message: String,
}

/// Failures of the storage medium itself.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("LMDB error: {0}")]
    Lmdb(#[from] lmdb::Error),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors returned by [`SupplementStore`](crate::supplement_store::SupplementStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),
    #[error("Initialization error: {0}")]
    Initialization(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation(_) => ErrorKind::ValidationError,
            StoreError::NotFound(_) => ErrorKind::NotFoundError,
            StoreError::Persistence(_) => ErrorKind::PersistenceError,
            StoreError::Initialization(_) => ErrorKind::InitializationError,
        }
    }

    /// Offending fields for validation failures, empty otherwise.
    pub fn violations(&self) -> &[FieldViolation] {
        match self {
            StoreError::Validation(err) => &err.violations,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collaborator {
    Classifier,
    QualityAnalyzer,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collaborator::Classifier => f.write_str("category classifier"),
            Collaborator::QualityAnalyzer => f.write_str("quality analyzer"),
        }
    }
}

/// A collaborator (classifier, quality analyzer) failed. Never fails a write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{collaborator} failed: {message}")]
pub struct CollaboratorError {
    pub collaborator: Collaborator,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(collaborator: Collaborator, message: impl Into<String>) -> Self {
        CollaboratorError {
            collaborator,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    ClassifierFailed,
    QualityAnalyzerFailed,
    MergeAmbiguous,
    BarcodeConflict,
}

/// A degraded-but-successful write: the record was stored, something
/// optional about it was not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Warning {
            kind,
            message: message.into(),
        }
    }
}

impl From<CollaboratorError> for Warning {
    fn from(err: CollaboratorError) -> Self {
        let kind = match err.collaborator {
            Collaborator::Classifier => WarningKind::ClassifierFailed,
            Collaborator::QualityAnalyzer => WarningKind::QualityAnalyzerFailed,
        };
        Warning::new(kind, err.to_string())
    }
}
