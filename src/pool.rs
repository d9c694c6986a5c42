//! Database pool seam
//!
//! The lifecycle controller only needs four things from a pool: open a transaction at a
//! given isolation level, commit it, roll it back, and tell a serialization conflict apart
//! from other failures. `sqlx::PgPool` provides all of them.
//!
//! Handlers run their queries against the open transaction through the
//! [`Tx`](crate::Tx) extractor. Domain functions keep using sqlx's generic Executor
//! pattern so they accept both `&PgPool` and `&mut PgConnection`:
//!
//! ```ignore
//! use sqlx::{Executor, Postgres};
//!
//! pub async fn my_query<'e, E>(executor: E, id: i64) -> Result<MyType, sqlx::Error>
//! where
//!     E: Executor<'e, Database = Postgres>,
//! {
//!     sqlx::query_as("SELECT * FROM my_table WHERE id = $1")
//!         .bind(id)
//!         .fetch_one(executor)
//!         .await
//! }
//! ```

use sqlx::{PgPool, Postgres};
use std::future::Future;

use crate::isolation::IsolationLevel;

/// SQLSTATE `serialization_failure`
pub const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE `deadlock_detected`
pub const DEADLOCK_DETECTED: &str = "40P01";

/// A pool able to run the begin/commit/rollback protocol for a request scope.
pub trait TransactionalPool: Clone + Send + Sync + 'static {
    /// An open transaction holding one connection.
    type Transaction: Send + 'static;

    /// Open a transaction and issue the isolation-level statement before anything else.
    fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Result<Self::Transaction, sqlx::Error>> + Send;

    fn commit(
        &self,
        tx: Self::Transaction,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn rollback(
        &self,
        tx: Self::Transaction,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Whether the error is a conflict that a fresh attempt may resolve
    fn is_serialization_failure(&self, err: &sqlx::Error) -> bool {
        is_serialization_failure(err)
    }
}

impl TransactionalPool for PgPool {
    type Transaction = sqlx::Transaction<'static, Postgres>;

    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Transaction, sqlx::Error> {
        let mut tx = sqlx::Pool::begin(self).await?;
        sqlx::query(isolation.statement())
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), sqlx::Error> {
        tx.commit().await
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), sqlx::Error> {
        tx.rollback().await
    }
}

/// Postgres reports serialization conflicts and deadlocks with SQLSTATE 40001 and 40P01
pub fn is_serialization_failure(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .is_some_and(|code| code == SERIALIZATION_FAILURE || code == DEADLOCK_DETECTED)
}
