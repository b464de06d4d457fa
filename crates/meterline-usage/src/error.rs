use chrono::{DateTime, Utc};
use meterline_common::time::{format_timestamp, TimestampError};
use thiserror::Error;

use crate::domain::types::EntityType;

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("Entity not found: {entity_id}")]
    EntityNotFound { entity_id: String },

    #[error("An active entity already exists for id {entity_id}")]
    EntityAlreadyExists { entity_id: String },

    #[error(
        "Event for {entity_id} at {} is earlier than the latest period boundary {}",
        format_timestamp(.event_time),
        format_timestamp(.period_start)
    )]
    OutOfOrderEvent {
        entity_id: String,
        event_time: DateTime<Utc>,
        period_start: DateTime<Utc>,
    },

    #[error("Concurrent modification of {entity_id}: {message}")]
    Conflict { entity_id: String, message: String },

    #[error("Unable to find volume_type id '{volume_type_id}'")]
    VolumeTypeNotFound { volume_type_id: String },

    #[error(
        "Invalid interval [{}, {}) for {entity_id}",
        format_timestamp(.start),
        format_timestamp(.end)
    )]
    InvalidInterval {
        entity_id: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("{0}")]
    DateFormat(#[from] TimestampError),

    #[error("Invalid attribute '{field}': {message}")]
    InvalidAttribute { field: String, message: String },

    #[error("Entity {entity_id} is a {actual}, expected a {expected}")]
    EntityTypeMismatch {
        entity_id: String,
        expected: EntityType,
        actual: EntityType,
    },

    #[error("Database error during {operation}: {source}")]
    DatabaseError {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, UsageError>;

impl UsageError {
    /// Missing mandatory payload field, phrased for the caller.
    pub fn missing_param(field: &str) -> Self {
        UsageError::InvalidAttribute {
            field: field.to_string(),
            message: format!(
                "The '{}' param is mandatory for the request you have made.",
                field
            ),
        }
    }

    pub fn database(operation: &str, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        UsageError::DatabaseError {
            operation: operation.to_string(),
            source: Box::new(source),
        }
    }

    /// Only a lost race is worth re-issuing after re-reading current state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UsageError::Conflict { .. })
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            UsageError::EntityNotFound { .. } => "METERLINE_ENTITY_NOT_FOUND",
            UsageError::EntityAlreadyExists { .. } => "METERLINE_ENTITY_ALREADY_EXISTS",
            UsageError::OutOfOrderEvent { .. } => "METERLINE_OUT_OF_ORDER_EVENT",
            UsageError::Conflict { .. } => "METERLINE_CONFLICT",
            UsageError::VolumeTypeNotFound { .. } => "METERLINE_VOLUME_TYPE_NOT_FOUND",
            UsageError::InvalidInterval { .. } => "METERLINE_INVALID_INTERVAL",
            UsageError::DateFormat(_) => "METERLINE_DATE_FORMAT",
            UsageError::InvalidAttribute { .. } => "METERLINE_INVALID_ATTRIBUTE",
            UsageError::EntityTypeMismatch { .. } => "METERLINE_ENTITY_TYPE_MISMATCH",
            UsageError::DatabaseError { .. } => "METERLINE_DATABASE_ERROR",
            UsageError::Serialization(_) => "METERLINE_SERIALIZATION_ERROR",
            UsageError::Configuration(_) => "METERLINE_CONFIG_ERROR",
        }
    }
}
