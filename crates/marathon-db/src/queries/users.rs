//! Database query functions for the `users` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::UserRow;

/// Insert a new user. Fails with a unique-violation if `username` is taken;
/// callers are expected to map that into a user-facing "already exists"
/// error.
pub async fn insert_user(
    pool: &PgPool,
    username: &str,
    password_hash: &str,
    api_key_hash: &str,
) -> Result<UserRow> {
    let row = sqlx::query_as::<_, UserRow>(
        "INSERT INTO users (id, username, password_hash, api_key_hash, created_at) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(username)
    .bind(password_hash)
    .bind(api_key_hash)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert user")?;
    Ok(row)
}

/// Fetch a user by username, used at login.
pub async fn get_by_username(pool: &PgPool, username: &str) -> Result<Option<UserRow>> {
    let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE username = $1")
        .bind(username)
        .fetch_optional(pool)
        .await
        .context("failed to fetch user by username")?;
    Ok(row)
}

/// Fetch a user by ID.
pub async fn get_by_id(pool: &PgPool, id: Uuid) -> Result<Option<UserRow>> {
    let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch user by id")?;
    Ok(row)
}

/// Fetch a user by API key hash, used to authenticate node/worker-facing
/// requests that carry a long-lived key instead of a session token.
pub async fn get_by_api_key_hash(pool: &PgPool, api_key_hash: &str) -> Result<Option<UserRow>> {
    let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE api_key_hash = $1")
        .bind(api_key_hash)
        .fetch_optional(pool)
        .await
        .context("failed to fetch user by api key hash")?;
    Ok(row)
}
