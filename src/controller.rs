//! Lifecycle controller: binds a scope to the downstream handler chain
//!
//! `begin` opens a scope, publishes it in the request extensions and spawns the rest of
//! the chain as its own task. The controller then waits for whichever comes first:
//!
//! - an explicit signal from a `commit`/`catch_error` stage or the `Tx` extractor
//! - the chain's response (success commits, 4xx/5xx or a panic rolls back)
//! - the configured deadline (rolls back and aborts the chain)
//!
//! Once resolved it finalizes the transaction, then waits for the chain's response.
//! Serialization conflicts re-run the whole chain with a rebuilt request.

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tower::{Layer, Service, ServiceExt};
use tracing::Instrument;

use crate::config::TxConfig;
use crate::error::{ChainFailure, DatabaseFailure, Error};
use crate::isolation::IsolationLevel;
use crate::pool::TransactionalPool;
use crate::scope::{Scope, ScopeId, Terminal, TerminalSignal};
use crate::stages::{CatchErrorLayer, CommitLayer, End};

struct ControllerInner<P: TransactionalPool> {
    pool: OnceLock<P>,
    config: TxConfig,
    next_id: AtomicU64,
    active: Mutex<HashMap<ScopeId, IsolationLevel>>,
}

/// Owns the pool and hands out the lifecycle stages for route registration.
///
/// Cheap to clone; clones share bookkeeping.
pub struct Controller<P: TransactionalPool> {
    inner: Arc<ControllerInner<P>>,
}

impl<P: TransactionalPool> Clone for Controller<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: TransactionalPool> Controller<P> {
    pub fn new(pool: P, config: TxConfig) -> Self {
        let controller = Self::detached(config);
        let _ = controller.inner.pool.set(pool);
        controller
    }

    /// A controller without a pool. `begin` reports `UndefinedPool` until one is attached.
    pub fn detached(config: TxConfig) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                pool: OnceLock::new(),
                config,
                next_id: AtomicU64::new(0),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn attach(&self, pool: P) -> Result<(), Error> {
        self.inner
            .pool
            .set(pool)
            .map_err(|_| Error::PoolAlreadyAttached)
    }

    pub fn pool(&self) -> Option<&P> {
        self.inner.pool.get()
    }

    pub fn config(&self) -> &TxConfig {
        &self.inner.config
    }

    /// Number of scopes opened by this controller that have not been finalized yet
    pub fn active_scopes(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stage that opens a transaction for everything layered inside it
    pub fn begin(&self) -> BeginLayer<P> {
        BeginLayer {
            controller: self.clone(),
            isolation: self.inner.config.isolation,
            retry_limit: self.inner.config.retry_limit,
        }
    }

    /// Stage that commits once the stages inside it respond successfully
    pub fn commit(&self) -> CommitLayer<P> {
        CommitLayer::new()
    }

    /// Stage that rolls back when the stages inside it fail
    pub fn catch_error(&self) -> CatchErrorLayer<P> {
        CatchErrorLayer::new()
    }

    /// The commit and catch-error stages, paired
    pub fn end(&self) -> End<P> {
        End {
            commit: self.commit(),
            catch_error: self.catch_error(),
        }
    }

    fn track(&self, scope: &Scope<P>) -> ActiveGuard<'_, P> {
        self.inner.active.lock().insert(scope.id(), scope.isolation());
        ActiveGuard {
            controller: self,
            id: scope.id(),
        }
    }

    async fn run<S>(
        &self,
        mut inner: S,
        req: Request,
        isolation: IsolationLevel,
        retry_limit: u32,
    ) -> Result<Response, Error>
    where
        S: Service<Request, Response = Response, Error = Infallible> + Send + 'static,
        S::Future: Send + 'static,
    {
        let pool = self.pool().cloned().ok_or(Error::UndefinedPool)?;

        if req
            .extensions()
            .get::<Scope<P>>()
            .is_some_and(Scope::is_pending)
        {
            return Err(Error::NestedScope);
        }

        let retry_limit = retry_limit.max(1);
        let mut replay = Replay::new(req, retry_limit, self.inner.config.max_replay_bytes).await?;
        let mut attempt = 1;

        loop {
            let req = replay.next().ok_or(Error::OutOfBounds)?;
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let span = tracing::debug_span!("tx_scope", scope_id = id, %isolation, attempt);

            let outcome = async {
                let (scope, signal) =
                    Scope::create(&pool, id, isolation, retry_limit, attempt).await?;
                tracing::debug!("transaction opened");
                let _active = self.track(&scope);
                self.drive(&pool, &mut inner, req, scope, signal).await
            }
            .instrument(span)
            .await?;

            match outcome {
                Outcome::Done(response) => return Ok(response),
                Outcome::Retry { response, cause } if attempt >= retry_limit => {
                    tracing::warn!(scope_id = id, attempt, "retry budget exhausted");
                    return match cause {
                        RetryCause::Commit(source) => Err(Error::RetryExhausted {
                            attempts: attempt,
                            source,
                        }),
                        RetryCause::Chain(_) => Ok(response),
                    };
                }
                Outcome::Retry { cause, .. } => {
                    tracing::warn!(scope_id = id, attempt, cause = %cause, "serialization conflict, retrying");
                    attempt += 1;
                }
            }
        }
    }

    async fn drive<S>(
        &self,
        pool: &P,
        inner: &mut S,
        mut req: Request,
        scope: Scope<P>,
        mut signal: TerminalSignal,
    ) -> Result<Outcome, Error>
    where
        S: Service<Request, Response = Response, Error = Infallible> + Send + 'static,
        S::Future: Send + 'static,
    {
        let limit = self.inner.config.deadline;
        let deadline = Instant::now() + limit;

        req.extensions_mut().insert(scope.clone());
        let chain = match inner.ready().await {
            Ok(ready) => ready.call(req),
            Err(never) => match never {},
        };
        let mut downstream = ChainTask(tokio::spawn(chain.in_current_span()));
        let mut aborted = false;

        let wake = tokio::select! {
            terminal = signal.wait() => Wake::Signalled(terminal),
            joined = &mut downstream.0 => Wake::Finished(response_from_join(joined)),
            () = tokio::time::sleep_until(deadline) => Wake::Deadline,
        };

        let mut response = None;
        let terminal = match wake {
            Wake::Signalled(terminal) => terminal,
            Wake::Finished(res) => {
                // Response completion is the automatic trigger when no stage signalled.
                match ChainFailure::from_response(&res) {
                    Some(failure) => scope.signal_error(failure),
                    None => scope.signal_commit(),
                };
                response = Some(res);
                signal.wait().await
            }
            Wake::Deadline => {
                tracing::warn!(?limit, "request chain missed its deadline");
                scope.signal_error(ChainFailure::DeadlineElapsed(limit));
                downstream.0.abort();
                let _ = (&mut downstream.0).await;
                response = Some(Error::DeadlineElapsed(limit).into_response());
                signal.wait().await
            }
        };

        let tx = match tokio::time::timeout_at(deadline, scope.take_transaction()).await {
            Ok(tx) => tx,
            Err(_) => {
                tracing::warn!("handler still holds the transaction at the deadline, aborting it");
                downstream.0.abort();
                aborted = true;
                scope.take_transaction().await
            }
        };
        let committed = self.finalize(pool, tx, &terminal).await;

        let response = match response {
            Some(response) => response,
            None if aborted => Error::DeadlineElapsed(limit).into_response(),
            None => match tokio::time::timeout_at(deadline, &mut downstream.0).await {
                Ok(joined) => response_from_join(joined),
                Err(_) => {
                    downstream.0.abort();
                    Error::DeadlineElapsed(limit).into_response()
                }
            },
        };

        match (terminal, committed) {
            (Terminal::Commit, Ok(())) => Ok(Outcome::Done(response)),
            (Terminal::Commit, Err(e)) => {
                let retryable = pool.is_serialization_failure(&e);
                let failure = DatabaseFailure::new(e);
                scope.mark_commit_failed(ChainFailure::Database(failure.clone()));
                if retryable {
                    Ok(Outcome::Retry {
                        response,
                        cause: RetryCause::Commit(failure),
                    })
                } else {
                    Err(Error::CommitFailed(failure))
                }
            }
            (Terminal::Rollback(failure), _) if failure.is_retryable(pool) => Ok(Outcome::Retry {
                response,
                cause: RetryCause::Chain(failure),
            }),
            (Terminal::Rollback(_), _) => Ok(Outcome::Done(response)),
        }
    }

    async fn finalize(
        &self,
        pool: &P,
        tx: Option<P::Transaction>,
        terminal: &Terminal,
    ) -> Result<(), sqlx::Error> {
        let Some(tx) = tx else {
            tracing::warn!("transaction was already detached before finalization");
            return Ok(());
        };

        match terminal {
            Terminal::Commit => match pool.commit(tx).await {
                Ok(()) => {
                    tracing::debug!("transaction committed");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(error = %e, "commit failed");
                    Err(e)
                }
            },
            Terminal::Rollback(failure) => {
                if let Err(e) = pool.rollback(tx).await {
                    tracing::warn!(error = %e, "rollback failed");
                }
                tracing::debug!(%failure, "transaction rolled back");
                Ok(())
            }
        }
    }
}

struct ActiveGuard<'a, P: TransactionalPool> {
    controller: &'a Controller<P>,
    id: ScopeId,
}

impl<P: TransactionalPool> Drop for ActiveGuard<'_, P> {
    fn drop(&mut self) {
        self.controller.inner.active.lock().remove(&self.id);
    }
}

enum Wake {
    Signalled(Terminal),
    Finished(Response),
    Deadline,
}

enum Outcome {
    Done(Response),
    Retry { response: Response, cause: RetryCause },
}

enum RetryCause {
    Commit(DatabaseFailure),
    Chain(ChainFailure),
}

impl std::fmt::Display for RetryCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryCause::Commit(e) => write!(f, "commit: {}", e),
            RetryCause::Chain(failure) => write!(f, "chain: {}", failure),
        }
    }
}

/// The spawned downstream chain. Dropping it cancels the chain, so a dropped `begin`
/// future cannot leave a handler running against a pending scope.
struct ChainTask(JoinHandle<Result<Response, Infallible>>);

impl Drop for ChainTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn response_from_join(joined: Result<Result<Response, Infallible>, JoinError>) -> Response {
    match joined {
        Ok(Ok(response)) => response,
        Ok(Err(never)) => match never {},
        Err(e) if e.is_panic() => {
            tracing::error!("handler chain panicked");
            ChainFailure::Panicked.into_response()
        }
        Err(_) => ChainFailure::Abandoned.into_response(),
    }
}

/// Source of requests for each attempt. With a single attempt the body streams through;
/// otherwise it is buffered once and every attempt gets a rebuilt copy.
enum Replay {
    Once(Option<Request>),
    Buffered { parts: Parts, body: Bytes },
}

impl Replay {
    async fn new(req: Request, retry_limit: u32, max_bytes: usize) -> Result<Self, Error> {
        if retry_limit <= 1 {
            return Ok(Replay::Once(Some(req)));
        }
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, max_bytes)
            .await
            .map_err(|_| Error::BodyTooLarge(max_bytes))?;
        Ok(Replay::Buffered { parts, body })
    }

    fn next(&mut self) -> Option<Request> {
        match self {
            Replay::Once(req) => req.take(),
            Replay::Buffered { parts, body } => {
                let mut req = Request::new(Body::from(body.clone()));
                *req.method_mut() = parts.method.clone();
                *req.uri_mut() = parts.uri.clone();
                *req.version_mut() = parts.version;
                *req.headers_mut() = parts.headers.clone();
                *req.extensions_mut() = parts.extensions.clone();
                Some(req)
            }
        }
    }
}

/// Layer produced by [`Controller::begin`]
pub struct BeginLayer<P: TransactionalPool> {
    controller: Controller<P>,
    isolation: IsolationLevel,
    retry_limit: u32,
}

impl<P: TransactionalPool> Clone for BeginLayer<P> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            isolation: self.isolation,
            retry_limit: self.retry_limit,
        }
    }
}

impl<P: TransactionalPool> BeginLayer<P> {
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Total attempts, including the first. Values below 1 are treated as 1.
    pub fn retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit.max(1);
        self
    }
}

impl<S, P: TransactionalPool> Layer<S> for BeginLayer<P> {
    type Service = BeginService<S, P>;

    fn layer(&self, inner: S) -> Self::Service {
        BeginService {
            inner,
            stage: self.clone(),
        }
    }
}

pub struct BeginService<S, P: TransactionalPool> {
    inner: S,
    stage: BeginLayer<P>,
}

impl<S: Clone, P: TransactionalPool> Clone for BeginService<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            stage: self.stage.clone(),
        }
    }
}

impl<S, P> Service<Request> for BeginService<S, P>
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
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let stage = self.stage.clone();

        Box::pin(async move {
            let response = stage
                .controller
                .run(inner, req, stage.isolation, stage.retry_limit)
                .await
                .unwrap_or_else(IntoResponse::into_response);
            Ok(response)
        })
    }
}
