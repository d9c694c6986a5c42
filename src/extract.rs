//! `Tx` extractor: handler access to the request's open transaction

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use sqlx::{PgConnection, PgPool};
use tokio::sync::OwnedMutexGuard;

use crate::error::{ChainFailure, Error};
use crate::pool::TransactionalPool;
use crate::scope::Scope;

/// Exclusive handle on the transaction opened by the enclosing `begin` stage.
///
/// The transaction stays locked for as long as the extractor is alive, so the controller
/// finalizes only after the handler lets go of it.
pub struct Tx<P: TransactionalPool> {
    scope: Scope<P>,
    guard: OwnedMutexGuard<Option<P::Transaction>>,
}

impl<S, P> FromRequestParts<S> for Tx<P>
where
    S: Send + Sync,
    P: TransactionalPool,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let scope = parts
            .extensions
            .get::<Scope<P>>()
            .filter(|scope| scope.is_pending())
            .cloned()
            .ok_or(Error::OutOfBounds)?;

        let guard = scope.try_lock().ok_or(Error::OverlappingExtractors)?;
        if guard.is_none() {
            return Err(Error::ScopeClosed);
        }

        Ok(Tx { scope, guard })
    }
}

impl<P: TransactionalPool> Tx<P> {
    pub fn scope(&self) -> &Scope<P> {
        &self.scope
    }

    /// The open transaction
    pub fn conn(&mut self) -> Result<&mut P::Transaction, Error> {
        self.guard.as_mut().ok_or(Error::ScopeClosed)
    }

    /// Resolve the scope as committed now. Returns `false` if it had already resolved.
    pub fn commit(self) -> bool {
        self.scope.signal_commit()
    }

    /// Resolve the scope as rolled back now. Returns `false` if it had already resolved.
    pub fn rollback(self, reason: impl Into<String>) -> bool {
        self.scope.signal_error(ChainFailure::Handler(reason.into()))
    }
}

impl Tx<PgPool> {
    /// The connection behind the transaction, usable as a sqlx executor
    pub fn executor(&mut self) -> Result<&mut PgConnection, Error> {
        Ok(&mut **self.conn()?)
    }
}
