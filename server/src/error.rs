use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use std::{error::Error, fmt};
use utoipa::ToSchema;

use crate::message::MessageKind;

#[derive(Debug, ToSchema, Clone, PartialEq, Eq)]
pub enum ApiError {
    InternalServerError(String),
    UnprocessableEntity(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::UnprocessableEntity(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
        };

        let body = Json(json!({
            "reason": message,
            "code": 1
        }));

        (status, body).into_response()
    }
}

use sqlx::Error as SqlxError;

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub enum DatabaseError {
    UniqueConstraintViolation { column: String },

    ForeignKeyViolation { column: String },

    CheckConstraintViolation { constraint_name: String },

    InternalServerError { message: String },

    RowNotFound,
}

impl From<SqlxError> for DatabaseError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => DatabaseError::RowNotFound,

            SqlxError::Database(db_error) => {
                let error_code = db_error.code().unwrap_or_default();
                let message = db_error.message();

                match error_code.as_ref() {
                    "23505" => match db_error.constraint() {
                        Some(constraint) => DatabaseError::UniqueConstraintViolation {
                            column: constraint
                                .strip_prefix("unique_")
                                .or_else(|| constraint.strip_suffix("_key"))
                                .unwrap_or(constraint)
                                .to_string(),
                        },
                        None => DatabaseError::InternalServerError {
                            message: format!("Unique constraint violation: {}", message),
                        },
                    },

                    "23503" => match db_error.constraint() {
                        Some(constraint) => DatabaseError::ForeignKeyViolation {
                            column: constraint
                                .strip_prefix("fk_")
                                .or_else(|| constraint.strip_suffix("_fkey"))
                                .unwrap_or(constraint)
                                .to_string(),
                        },
                        None => DatabaseError::InternalServerError {
                            message: format!("Foreign key constraint violation: {}", message),
                        },
                    },

                    "23514" => DatabaseError::CheckConstraintViolation {
                        constraint_name: db_error
                            .constraint()
                            .unwrap_or("unknown_constraint")
                            .to_string(),
                    },

                    _ => DatabaseError::InternalServerError {
                        message: format!("Database error ({}): {}", error_code, message),
                    },
                }
            }

            _ => DatabaseError::InternalServerError {
                message: error.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(error: serde_json::Error) -> Self {
        DatabaseError::InternalServerError {
            message: format!("Payload encoding failed: {}", error),
        }
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseError::UniqueConstraintViolation { column } => {
                write!(
                    f,
                    "Unique constraint violation: duplicate value in column '{}'",
                    column
                )
            }
            DatabaseError::ForeignKeyViolation { column } => {
                write!(
                    f,
                    "Foreign key violation: invalid reference in column '{}'",
                    column
                )
            }
            DatabaseError::CheckConstraintViolation { constraint_name } => {
                write!(
                    f,
                    "Check constraint violation: constraint '{}' failed",
                    constraint_name
                )
            }
            DatabaseError::InternalServerError { message } => {
                write!(f, "Database error: {}", message)
            }
            DatabaseError::RowNotFound => {
                write!(f, "No matching row found")
            }
        }
    }
}

impl Error for DatabaseError {}

// ═══════════════════════════════════════════════════════════════════════════════
// DOMAIN
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("Refusing to store message without contents")]
    EmptyBody,

    #[error("Message length ({len} characters) too long (max: {max})")]
    BodyTooLong { len: usize, max: usize },

    #[error("Channel missing")]
    ChannelMissing,

    #[error("Unable to reply on this message (type = {0})")]
    NotRepliable(MessageKind),

    #[error("Reply chain exceeds {0} hops")]
    ReplyChainTooDeep(usize),

    #[error("Not an owner")]
    NotOwner,

    #[error("Message {0} still has replies")]
    ThreadNotEmpty(i64),

    #[error("Reaction '{0}' is not allowed")]
    ReactionNotAllowed(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid {0}")]
    Invalid(&'static str),

    #[error("Internal error: {0}")]
    InternalError(#[from] DatabaseError),

    #[error("{context}: {source}")]
    Context {
        context: &'static str,
        #[source]
        source: Box<DomainError>,
    },
}

impl DomainError {
    pub fn root(&self) -> &DomainError {
        match self {
            DomainError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self.root(), DomainError::InternalError(_))
    }
}

pub trait ResultExt<T> {
    fn context(self, context: &'static str) -> Result<T, DomainError>;
}

impl<T, E: Into<DomainError>> ResultExt<T> for Result<T, E> {
    fn context(self, context: &'static str) -> Result<T, DomainError> {
        self.map_err(|e| DomainError::Context {
            context,
            source: Box::new(e.into()),
        })
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        if err.is_persistence() {
            tracing::error!("Database error: {}", err);
            return ApiError::InternalServerError("Internal server error".to_string());
        }
        ApiError::UnprocessableEntity(err.to_string())
    }
}
