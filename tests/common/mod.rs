#![allow(dead_code)]

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use txchain::{IsolationLevel, TransactionalPool};

pub type MemTx = txchain::Tx<MemoryPool>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Begin(IsolationLevel),
    Commit,
    CommitConflict,
    CommitRejected,
    Rollback,
}

#[derive(Default)]
struct Shared {
    rows: Mutex<BTreeMap<String, i64>>,
    events: Mutex<Vec<Event>>,
    conflicts: AtomicU32,
    rejections: AtomicU32,
}

/// In-memory pool: writes are buffered per transaction and only become visible on commit
#[derive(Clone, Default)]
pub struct MemoryPool {
    shared: Arc<Shared>,
}

pub struct MemoryTx {
    writes: BTreeMap<String, i64>,
    shared: Arc<Shared>,
}

impl MemoryTx {
    pub fn get(&self, key: &str) -> Option<i64> {
        self.writes
            .get(key)
            .copied()
            .or_else(|| self.shared.rows.lock().get(key).copied())
    }

    pub fn set(&mut self, key: &str, value: i64) {
        self.writes.insert(key.to_string(), value);
    }
}

impl MemoryPool {
    pub fn with_row(self, key: &str, value: i64) -> Self {
        self.shared.rows.lock().insert(key.to_string(), value);
        self
    }

    /// Make the next `n` commits fail with a serialization conflict
    pub fn fail_next_commits(&self, n: u32) {
        self.shared.conflicts.store(n, Ordering::SeqCst);
    }

    /// Make the next commit fail with an error that is not a serialization conflict
    pub fn reject_next_commit(&self) {
        self.shared.rejections.store(1, Ordering::SeqCst);
    }

    pub fn row(&self, key: &str) -> Option<i64> {
        self.shared.rows.lock().get(key).copied()
    }

    pub fn events(&self) -> Vec<Event> {
        self.shared.events.lock().clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.shared.events.lock().iter().filter(|e| *e == event).count()
    }
}

impl TransactionalPool for MemoryPool {
    type Transaction = MemoryTx;

    async fn begin(&self, isolation: IsolationLevel) -> Result<MemoryTx, sqlx::Error> {
        self.shared.events.lock().push(Event::Begin(isolation));
        Ok(MemoryTx {
            writes: BTreeMap::new(),
            shared: Arc::clone(&self.shared),
        })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), sqlx::Error> {
        let conflicted = self
            .shared
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let rejected = self
            .shared
            .rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            self.shared.events.lock().push(Event::CommitRejected);
            return Err(sqlx::Error::Protocol(
                "08006: connection failure during commit".to_string(),
            ));
        }

        if conflicted {
            self.shared.events.lock().push(Event::CommitConflict);
            return Err(sqlx::Error::Protocol(
                "40001: could not serialize access due to concurrent update".to_string(),
            ));
        }

        self.shared.rows.lock().extend(tx.writes);
        self.shared.events.lock().push(Event::Commit);
        Ok(())
    }

    async fn rollback(&self, _tx: MemoryTx) -> Result<(), sqlx::Error> {
        self.shared.events.lock().push(Event::Rollback);
        Ok(())
    }

    fn is_serialization_failure(&self, err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Protocol(msg) if msg.starts_with("40001"))
    }
}

pub fn post(uri: &str, body: &str) -> Request {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
