//! Error taxonomy shared by the store and the transaction processor.
//!
//! Mirrors the six abstract kinds from the error handling design: `Incorrect`,
//! `NotFound`, `Conflict`, `NotSupported`, `Busy`, `Fault`. `Conflict` and
//! `NotSupported` carry a cause so callers can pick between the two HTTP
//! statuses each kind maps to.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictCause {
    /// CAS version mismatch (`If-Match` precondition or resolved create CAS).
    PreconditionFailed,
    /// Referential integrity violation within a transaction.
    ReferentialIntegrity,
    /// A conditional create's `ifNoneExist` query matched more than one resource.
    MultipleMatches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotSupportedCause {
    /// A FHIR-defined method this server does not implement (e.g. `PATCH`).
    UnsupportedMethod,
    /// `POST Type/id` — not a legal interaction.
    MethodNotAllowed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{message}")]
    Incorrect {
        message: String,
        expression: Option<String>,
    },

    #[error("{message}")]
    NotFound { message: String },

    #[error("{message}")]
    Conflict {
        message: String,
        cause: ConflictCause,
    },

    #[error("{message}")]
    NotSupported {
        message: String,
        cause: NotSupportedCause,
    },

    #[error("{message}")]
    Busy { message: String },

    #[error("{message}")]
    Fault { message: String },
}

impl Error {
    pub fn incorrect(message: impl Into<String>) -> Self {
        Error::Incorrect {
            message: message.into(),
            expression: None,
        }
    }

    pub fn incorrect_at(message: impl Into<String>, expression: impl Into<String>) -> Self {
        Error::Incorrect {
            message: message.into(),
            expression: Some(expression.into()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound { message: message.into() }
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Error::Conflict {
            message: message.into(),
            cause: ConflictCause::PreconditionFailed,
        }
    }

    pub fn referential_integrity(message: impl Into<String>) -> Self {
        Error::Conflict {
            message: message.into(),
            cause: ConflictCause::ReferentialIntegrity,
        }
    }

    pub fn multiple_matches(message: impl Into<String>) -> Self {
        Error::Conflict {
            message: message.into(),
            cause: ConflictCause::MultipleMatches,
        }
    }

    pub fn unsupported_method(message: impl Into<String>) -> Self {
        Error::NotSupported {
            message: message.into(),
            cause: NotSupportedCause::UnsupportedMethod,
        }
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Error::NotSupported {
            message: message.into(),
            cause: NotSupportedCause::MethodNotAllowed,
        }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Error::Busy { message: message.into() }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Error::Fault { message: message.into() }
    }

    /// HTTP status this error surfaces as, per the error handling design.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Incorrect { .. } => 400,
            Error::NotFound { .. } => 404,
            Error::Conflict { cause, .. } => match cause {
                ConflictCause::ReferentialIntegrity => 409,
                ConflictCause::PreconditionFailed | ConflictCause::MultipleMatches => 412,
            },
            Error::NotSupported { cause, .. } => match cause {
                NotSupportedCause::UnsupportedMethod => 422,
                NotSupportedCause::MethodNotAllowed => 405,
            },
            Error::Busy { .. } => 503,
            Error::Fault { .. } => 500,
        }
    }

    /// FHIR issue code for the `OperationOutcome` this error projects to.
    pub fn issue_code(&self) -> &'static str {
        match self {
            Error::Incorrect { .. } => "invalid",
            Error::NotFound { .. } => "not-found",
            Error::Conflict { cause, .. } => match cause {
                ConflictCause::ReferentialIntegrity => "conflict",
                ConflictCause::PreconditionFailed => "conflict",
                ConflictCause::MultipleMatches => "conflict",
            },
            Error::NotSupported { .. } => "not-supported",
            Error::Busy { .. } => "processing",
            Error::Fault { .. } => "processing",
        }
    }

    pub fn expression(&self) -> Option<&str> {
        match self {
            Error::Incorrect { expression, .. } => expression.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
