//! One attempt at an open transaction bound to a request
//!
//! A scope resolves exactly once. The first of `signal_commit` / `signal_error` wins the
//! compare-and-swap on the terminal state and is delivered to the controller through a
//! one-shot channel; every later signal is a no-op.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{OwnedMutexGuard, oneshot};

use crate::error::{ChainFailure, Error};
use crate::isolation::IsolationLevel;
use crate::pool::TransactionalPool;

pub type ScopeId = u64;

const PENDING: u8 = 0;
const RESOLVING: u8 = 1;
const COMMITTED: u8 = 2;
const ROLLED_BACK: u8 = 3;

/// Observable terminal state of a scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalState {
    Pending,
    Committed,
    RolledBack(ChainFailure),
}

/// What the controller should do with the transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Terminal {
    Commit,
    Rollback(ChainFailure),
}

pub(crate) type TxSlot<T> = Arc<tokio::sync::Mutex<Option<T>>>;

struct ScopeInner<P: TransactionalPool> {
    id: ScopeId,
    isolation: IsolationLevel,
    retry_limit: u32,
    attempt: u32,
    state: AtomicU8,
    failure: OnceLock<ChainFailure>,
    notify: Mutex<Option<oneshot::Sender<Terminal>>>,
    slot: TxSlot<P::Transaction>,
}

/// A live transaction scope. Clones share the same state.
pub struct Scope<P: TransactionalPool> {
    inner: Arc<ScopeInner<P>>,
}

/// Receiving half of a scope's terminal channel, held by the controller
pub(crate) struct TerminalSignal(oneshot::Receiver<Terminal>);

impl TerminalSignal {
    /// Suspend until the scope resolves
    pub(crate) async fn wait(&mut self) -> Terminal {
        (&mut self.0)
            .await
            .unwrap_or(Terminal::Rollback(ChainFailure::Abandoned))
    }
}

impl<P: TransactionalPool> Scope<P> {
    /// Open a transaction through the pool and wrap it in a pending scope
    pub(crate) async fn create(
        pool: &P,
        id: ScopeId,
        isolation: IsolationLevel,
        retry_limit: u32,
        attempt: u32,
    ) -> Result<(Self, TerminalSignal), Error> {
        let tx = pool.begin(isolation).await?;
        Ok(Self::from_transaction(tx, id, isolation, retry_limit, attempt))
    }

    pub(crate) fn from_transaction(
        tx: P::Transaction,
        id: ScopeId,
        isolation: IsolationLevel,
        retry_limit: u32,
        attempt: u32,
    ) -> (Self, TerminalSignal) {
        let (sender, receiver) = oneshot::channel();
        let scope = Self {
            inner: Arc::new(ScopeInner {
                id,
                isolation,
                retry_limit,
                attempt,
                state: AtomicU8::new(PENDING),
                failure: OnceLock::new(),
                notify: Mutex::new(Some(sender)),
                slot: Arc::new(tokio::sync::Mutex::new(Some(tx))),
            }),
        };
        (scope, TerminalSignal(receiver))
    }

    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.inner.isolation
    }

    pub fn retry_limit(&self) -> u32 {
        self.inner.retry_limit
    }

    /// 1-based attempt number within the retry budget
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    pub fn state(&self) -> TerminalState {
        match self.inner.state.load(Ordering::Acquire) {
            COMMITTED => TerminalState::Committed,
            ROLLED_BACK => TerminalState::RolledBack(
                self.inner
                    .failure
                    .get()
                    .cloned()
                    .unwrap_or(ChainFailure::Abandoned),
            ),
            _ => TerminalState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == PENDING
    }

    /// Request a commit. Returns `false` if the scope already resolved.
    pub fn signal_commit(&self) -> bool {
        self.resolve(Terminal::Commit)
    }

    /// Request a rollback. Returns `false` if the scope already resolved.
    pub fn signal_error(&self, failure: ChainFailure) -> bool {
        self.resolve(Terminal::Rollback(failure))
    }

    fn resolve(&self, terminal: Terminal) -> bool {
        if self
            .inner
            .state
            .compare_exchange(PENDING, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!(scope_id = self.id(), "ignoring signal on resolved scope");
            return false;
        }

        let settled = match &terminal {
            Terminal::Commit => COMMITTED,
            Terminal::Rollback(failure) => {
                let _ = self.inner.failure.set(failure.clone());
                ROLLED_BACK
            }
        };
        self.inner.state.store(settled, Ordering::Release);

        if let Some(sender) = self.inner.notify.lock().take() {
            let _ = sender.send(terminal);
        }
        true
    }

    /// A commit that was signalled but rejected by the database leaves the scope rolled back
    pub(crate) fn mark_commit_failed(&self, failure: ChainFailure) {
        let _ = self.inner.failure.set(failure);
        self.inner.state.store(ROLLED_BACK, Ordering::Release);
    }

    /// Detach the transaction for finalization. Waits for any handler holding it.
    pub(crate) async fn take_transaction(&self) -> Option<P::Transaction> {
        self.inner.slot.lock().await.take()
    }

    /// Exclusive access for a handler without waiting
    pub(crate) fn try_lock(&self) -> Option<OwnedMutexGuard<Option<P::Transaction>>> {
        self.inner.slot.clone().try_lock_owned().ok()
    }
}

impl<P: TransactionalPool> Clone for Scope<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: TransactionalPool> fmt::Debug for Scope<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id())
            .field("isolation", &self.isolation())
            .field("attempt", &self.attempt())
            .field("state", &self.state())
            .finish()
    }
}
