//! Error types for the transaction lifecycle and their HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::pool::TransactionalPool;

/// Errors reported by the lifecycle stages and the [`Tx`](crate::Tx) extractor.
///
/// Every variant converts into a response. The response carries a [`ChainFailure`]
/// extension so an enclosing scope rolls back rather than committing an error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `begin` ran on a controller that has no pool attached.
    #[error("transaction pool is not initialized; attach a pool to the controller first")]
    UndefinedPool,

    /// `attach` was called twice on the same controller.
    #[error("a pool is already attached to this controller")]
    PoolAlreadyAttached,

    /// A commit stage or extractor ran with no pending scope in the request.
    #[error("no open transaction for this request; is the begin stage installed before it?")]
    OutOfBounds,

    /// `begin` ran while an earlier scope of the same request was still pending.
    #[error("a transaction is already open for this request")]
    NestedScope,

    /// `Tx` was extracted more than once at the same time.
    #[error("Tx extractor used multiple times in the same handler")]
    OverlappingExtractors,

    /// The scope was already finalized when a handler tried to use it.
    #[error("transaction already finalized")]
    ScopeClosed,

    /// The chain did not resolve the scope before the deadline.
    #[error("request chain did not finish within {0:?}")]
    DeadlineElapsed(Duration),

    /// Serialization conflicts persisted through every attempt.
    #[error("transaction failed after {attempts} attempt(s) due to serialization conflicts")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: DatabaseFailure,
    },

    /// COMMIT failed with an error that a fresh attempt would not resolve.
    #[error("commit failed: {0}")]
    CommitFailed(#[source] DatabaseFailure),

    /// The body could not be buffered for replay.
    #[error("request body exceeds the {0} byte replay limit")]
    BodyTooLarge(usize),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::DeadlineElapsed(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::RetryExhausted { .. } => StatusCode::CONFLICT,
            Error::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_failure(self) -> ChainFailure {
        match self {
            Error::Database(e) => ChainFailure::Database(DatabaseFailure::new(e)),
            Error::CommitFailed(failure) => ChainFailure::Database(failure),
            Error::DeadlineElapsed(d) => ChainFailure::DeadlineElapsed(d),
            other => ChainFailure::Handler(other.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "transaction chain error");
        } else {
            tracing::warn!(error = %self, "transaction chain error");
        }

        let message = self.to_string();
        let failure = self.into_failure();
        let mut response = (status, message).into_response();
        response.extensions_mut().insert(failure);
        response
    }
}

/// Why a scope rolled back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainFailure {
    #[error("handler responded with {0}")]
    Status(StatusCode),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("database error: {0}")]
    Database(DatabaseFailure),

    #[error("handler panicked")]
    Panicked,

    #[error("request chain did not finish within {0:?}")]
    DeadlineElapsed(Duration),

    #[error("scope dropped without a terminal signal")]
    Abandoned,
}

impl ChainFailure {
    /// Whether re-running the chain in a fresh transaction may succeed, as judged by `pool`
    pub fn is_retryable<P: TransactionalPool>(&self, pool: &P) -> bool {
        match self {
            ChainFailure::Database(failure) => pool.is_serialization_failure(failure.error()),
            _ => false,
        }
    }

    /// Read the failure off a response produced by a later stage.
    /// Responses with a 4xx or 5xx status count as failures even without an extension.
    pub fn from_response(response: &Response) -> Option<ChainFailure> {
        if let Some(failure) = response.extensions().get::<ChainFailure>() {
            return Some(failure.clone());
        }
        let status = response.status();
        (status.is_client_error() || status.is_server_error()).then_some(ChainFailure::Status(status))
    }
}

impl IntoResponse for ChainFailure {
    fn into_response(self) -> Response {
        let status = match &self {
            ChainFailure::Status(status) => *status,
            ChainFailure::DeadlineElapsed(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut response = (status, self.to_string()).into_response();
        response.extensions_mut().insert(self);
        response
    }
}

/// A database error raised inside the chain. Shared so the failure stays cloneable.
#[derive(Debug, Clone)]
pub struct DatabaseFailure(Arc<sqlx::Error>);

impl DatabaseFailure {
    pub fn new(error: sqlx::Error) -> Self {
        Self(Arc::new(error))
    }

    pub fn error(&self) -> &sqlx::Error {
        &self.0
    }
}

impl fmt::Display for DatabaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for DatabaseFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl PartialEq for DatabaseFailure {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.to_string() == other.0.to_string()
    }
}

impl Eq for DatabaseFailure {}
