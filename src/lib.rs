//! Request-bound Postgres transactions shared across an axum handler chain.
//!
//! A [`Controller`] hands out tower layers that share one transaction between every
//! stage of a request:
//!
//! - [`Controller::begin`] opens the transaction (isolation level and retry budget are
//!   configurable) and runs the rest of the chain while it stays open.
//! - [`Controller::commit`], [`Controller::catch_error`] and [`Controller::end`] resolve it
//!   explicitly. Without them the response decides: success commits, 4xx/5xx rolls back.
//! - Handlers use the transaction through the [`Tx`] extractor.
//!
//! Serialization conflicts re-run the chain in a fresh transaction, up to the retry limit.
//!
//! ```ignore
//! type Tx = txchain::Tx<sqlx::PgPool>;
//!
//! let controller = Controller::new(pool, TxConfig::from_env());
//!
//! let app = Router::new()
//!     .route("/foo/{id}", put(update_foo).layer(controller.end()))
//!     .layer(controller.begin().isolation(IsolationLevel::Serializable));
//!
//! async fn update_foo(mut tx: Tx, Path(id): Path<i64>) -> Result<StatusCode, txchain::Error> {
//!     sqlx::query("UPDATE foo SET value = value + 1 WHERE id = $1")
//!         .bind(id)
//!         .execute(tx.executor()?)
//!         .await?;
//!     Ok(StatusCode::NO_CONTENT)
//! }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod extract;
pub mod isolation;
pub mod pool;
pub mod registry;
pub mod scope;
pub mod stages;

pub use config::TxConfig;
pub use controller::{BeginLayer, BeginService, Controller};
pub use error::{ChainFailure, DatabaseFailure, Error};
pub use extract::Tx;
pub use isolation::IsolationLevel;
pub use pool::TransactionalPool;
pub use registry::Registry;
pub use scope::{Scope, ScopeId, TerminalState};
pub use stages::{CatchErrorLayer, CatchErrorService, CommitLayer, CommitService, End};
