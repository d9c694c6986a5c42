//! Scenarios against a real Postgres. Skipped unless DATABASE_URL is set.

mod common;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower::ServiceExt;

use common::body_text;
use txchain::{ChainFailure, Controller, Error, TxConfig};

type Tx = txchain::Tx<PgPool>;

async fn connect(table: &str) -> Option<PgPool> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("Failed to connect to database");

    sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(&format!(
        "CREATE TABLE {} (id BIGINT PRIMARY KEY, foo BIGINT NOT NULL)",
        table
    ))
    .execute(&pool)
    .await
    .unwrap();

    Some(pool)
}

async fn foo_of(pool: &PgPool, table: &str, id: i64) -> Option<i64> {
    sqlx::query_as::<_, (i64,)>(&format!("SELECT foo FROM {} WHERE id = $1", table))
        .bind(id)
        .fetch_optional(pool)
        .await
        .unwrap()
        .map(|row| row.0)
}

#[tokio::test]
async fn test_committed_update_is_visible_to_later_request() {
    const TABLE: &str = "txchain_visible";
    let Some(pool) = connect(TABLE).await else {
        return;
    };
    sqlx::query(&format!("INSERT INTO {} VALUES (1, 1)", TABLE))
        .execute(&pool)
        .await
        .unwrap();

    let controller = Controller::new(pool.clone(), TxConfig::default());
    let app = Router::new()
        .route(
            "/update",
            post(|mut tx: Tx| async move {
                sqlx::query(&format!("UPDATE {} SET foo = 2 WHERE id = 1", TABLE))
                    .execute(tx.executor()?)
                    .await?;
                Ok::<_, Error>(StatusCode::NO_CONTENT)
            })
            .layer(controller.end()),
        )
        .route(
            "/read",
            get(|mut tx: Tx| async move {
                let row: (i64,) =
                    sqlx::query_as(&format!("SELECT foo FROM {} WHERE id = 1", TABLE))
                        .fetch_one(tx.executor()?)
                        .await?;
                Ok::<_, Error>(row.0.to_string())
            }),
        )
        .layer(controller.begin());

    let response = app.clone().oneshot(common::post("/update", "")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.oneshot(common::get("/read")).await.unwrap();
    assert_eq!(body_text(response).await, "2");
}

#[tokio::test]
async fn test_failed_chain_leaves_no_row() {
    const TABLE: &str = "txchain_rollback";
    let Some(pool) = connect(TABLE).await else {
        return;
    };

    let controller = Controller::new(pool.clone(), TxConfig::default());
    let app = Router::new()
        .route(
            "/",
            post(|mut tx: Tx| async move {
                let conn = tx.executor().map_err(IntoResponse::into_response)?;
                sqlx::query(&format!("INSERT INTO {} VALUES (1, 999)", TABLE))
                    .execute(conn)
                    .await
                    .map_err(|e| Error::from(e).into_response())?;
                Err::<StatusCode, Response>(
                    ChainFailure::Handler("thrown before end".into()).into_response(),
                )
            })
            .layer(controller.end()),
        )
        .layer(controller.begin());

    let response = app.oneshot(common::post("/", "")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let found: Option<(i64,)> =
        sqlx::query_as(&format!("SELECT id FROM {} WHERE foo = 999", TABLE))
            .fetch_optional(&pool)
            .await
            .unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn test_response_completion_commits() {
    const TABLE: &str = "txchain_autocommit";
    let Some(pool) = connect(TABLE).await else {
        return;
    };

    let controller = Controller::new(pool.clone(), TxConfig::default());
    let app = Router::new()
        .route(
            "/",
            post(|mut tx: Tx| async move {
                sqlx::query(&format!("INSERT INTO {} VALUES (1, 42)", TABLE))
                    .execute(tx.executor()?)
                    .await?;
                Ok::<_, Error>(StatusCode::CREATED)
            }),
        )
        .layer(controller.begin());

    let response = app.oneshot(common::post("/", "")).await.unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(foo_of(&pool, TABLE, 1).await, Some(42));
}

#[tokio::test]
async fn test_no_dirty_read_under_read_committed() {
    const TABLE: &str = "txchain_dirty";
    let Some(pool) = connect(TABLE).await else {
        return;
    };
    sqlx::query(&format!("INSERT INTO {} VALUES (1, 101)", TABLE))
        .execute(&pool)
        .await
        .unwrap();

    let controller = Controller::new(pool.clone(), TxConfig::default());
    let written = Arc::new(tokio::sync::Notify::new());
    let release = Arc::new(tokio::sync::Notify::new());

    let writer = {
        let written = written.clone();
        let release = release.clone();
        move |mut tx: Tx| {
            let written = written.clone();
            let release = release.clone();
            async move {
                sqlx::query(&format!("UPDATE {} SET foo = 102 WHERE id = 1", TABLE))
                    .execute(tx.executor()?)
                    .await?;
                written.notify_one();
                release.notified().await;
                Ok::<_, Error>(StatusCode::NO_CONTENT)
            }
        }
    };

    let app = Router::new()
        .route("/write", post(writer).layer(controller.end()))
        .route(
            "/read",
            get(|mut tx: Tx| async move {
                let row: (i64,) =
                    sqlx::query_as(&format!("SELECT foo FROM {} WHERE id = 1", TABLE))
                        .fetch_one(tx.executor()?)
                        .await?;
                Ok::<_, Error>(row.0.to_string())
            }),
        )
        .layer(controller.begin());

    let pending_write = tokio::spawn(app.clone().oneshot(common::post("/write", "")));
    written.notified().await;

    let read = app.clone().oneshot(common::get("/read")).await.unwrap();
    assert_eq!(body_text(read).await, "101");

    release.notify_one();
    let write = pending_write.await.unwrap().unwrap();
    assert_eq!(write.status(), StatusCode::NO_CONTENT);
    assert_eq!(foo_of(&pool, TABLE, 1).await, Some(102));
}
