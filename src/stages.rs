//! Explicit terminal stages: `commit`, `catch_error` and the paired `end`

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::error::{ChainFailure, Error};
use crate::pool::TransactionalPool;
use crate::scope::Scope;

fn live_scope<P: TransactionalPool>(req: &Request) -> Option<Scope<P>> {
    req.extensions()
        .get::<Scope<P>>()
        .filter(|scope| scope.is_pending())
        .cloned()
}

/// Signals commit after the stages it wraps respond successfully.
///
/// Without a pending scope the request is answered with [`Error::OutOfBounds`] and the
/// wrapped stages never run.
pub struct CommitLayer<P> {
    _pool: PhantomData<fn() -> P>,
}

impl<P> CommitLayer<P> {
    pub(crate) fn new() -> Self {
        Self { _pool: PhantomData }
    }
}

impl<P> Clone for CommitLayer<P> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<S, P> Layer<S> for CommitLayer<P> {
    type Service = CommitService<S, P>;

    fn layer(&self, inner: S) -> Self::Service {
        CommitService {
            inner,
            _pool: PhantomData,
        }
    }
}

pub struct CommitService<S, P> {
    inner: S,
    _pool: PhantomData<fn() -> P>,
}

impl<S: Clone, P> Clone for CommitService<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _pool: PhantomData,
        }
    }
}

impl<S, P> Service<Request> for CommitService<S, P>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    P: TransactionalPool,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let Some(scope) = live_scope::<P>(&req) else {
            return Box::pin(async { Ok::<_, Infallible>(Error::OutOfBounds.into_response()) });
        };

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let response = inner.call(req).await?;
            if ChainFailure::from_response(&response).is_none() && scope.signal_commit() {
                tracing::debug!(scope_id = scope.id(), "commit signalled");
            }
            Ok(response)
        })
    }
}

/// Signals rollback when the stages it wraps fail or panic.
///
/// The failing response is still returned, so it surfaces from the enclosing `begin`.
/// Without a pending scope responses pass through untouched and panics keep unwinding.
pub struct CatchErrorLayer<P> {
    _pool: PhantomData<fn() -> P>,
}

impl<P> CatchErrorLayer<P> {
    pub(crate) fn new() -> Self {
        Self { _pool: PhantomData }
    }
}

impl<P> Clone for CatchErrorLayer<P> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<S, P> Layer<S> for CatchErrorLayer<P> {
    type Service = CatchErrorService<S, P>;

    fn layer(&self, inner: S) -> Self::Service {
        CatchErrorService {
            inner,
            _pool: PhantomData,
        }
    }
}

pub struct CatchErrorService<S, P> {
    inner: S,
    _pool: PhantomData<fn() -> P>,
}

impl<S: Clone, P> Clone for CatchErrorService<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _pool: PhantomData,
        }
    }
}

impl<S, P> Service<Request> for CatchErrorService<S, P>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    P: TransactionalPool,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let scope = live_scope::<P>(&req);
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let response = match AssertUnwindSafe(inner.call(req)).catch_unwind().await {
                Ok(result) => result?,
                Err(panic) => match &scope {
                    Some(_) => ChainFailure::Panicked.into_response(),
                    None => std::panic::resume_unwind(panic),
                },
            };

            if let Some(scope) = scope
                && let Some(failure) = ChainFailure::from_response(&response)
                && scope.signal_error(failure)
            {
                tracing::debug!(scope_id = scope.id(), "rollback signalled");
            }
            Ok(response)
        })
    }
}

/// `commit` and `catch_error` as one layer, with the catch stage outermost
pub struct End<P> {
    pub commit: CommitLayer<P>,
    pub catch_error: CatchErrorLayer<P>,
}

impl<P> Clone for End<P> {
    fn clone(&self) -> Self {
        Self {
            commit: self.commit.clone(),
            catch_error: self.catch_error.clone(),
        }
    }
}

impl<S, P> Layer<S> for End<P> {
    type Service = CatchErrorService<CommitService<S, P>, P>;

    fn layer(&self, inner: S) -> Self::Service {
        self.catch_error.layer(self.commit.layer(inner))
    }
}
