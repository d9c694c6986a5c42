//! Demo domain - DB queries for the `foo_items` table
//!
//! All functions use the generic Executor pattern, allowing them to work with
//! both `&PgPool` (for standalone queries) and `&mut PgConnection` (for transactions).

use serde::Serialize;
use sqlx::{Executor, Postgres};

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct FooItem {
    pub id: i64,
    pub foo: i64,
}

pub async fn create_table<'e, E>(executor: E) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    executor
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS foo_items (
                id BIGSERIAL PRIMARY KEY,
                foo BIGINT NOT NULL
            )
            "#,
        )
        .await?;
    Ok(())
}

pub async fn get<'e, E>(executor: E, id: i64) -> Result<Option<FooItem>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as("SELECT id, foo FROM foo_items WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub async fn insert<'e, E>(executor: E, foo: i64) -> Result<FooItem, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as("INSERT INTO foo_items (foo) VALUES ($1) RETURNING id, foo")
        .bind(foo)
        .fetch_one(executor)
        .await
}

/// Returns the number of rows updated
pub async fn update<'e, E>(executor: E, id: i64, foo: i64) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query("UPDATE foo_items SET foo = $1 WHERE id = $2")
        .bind(foo)
        .bind(id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

pub async fn exists_with_foo<'e, E>(executor: E, foo: i64) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM foo_items WHERE foo = $1)")
        .bind(foo)
        .fetch_one(executor)
        .await?;
    Ok(row.0)
}
