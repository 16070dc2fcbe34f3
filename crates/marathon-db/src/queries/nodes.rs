//! Database query functions for the `nodes` table.
//!
//! This table is an audit log, not the registry's backing store: the
//! in-memory node registry owns the authoritative view of which nodes are
//! currently registered, and is rebuilt empty on every orchestrator restart.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;

use crate::models::{NodeRow, NodeStatus};

/// Upsert a node row on registration or heartbeat. `id` is the primary key,
/// so a re-registration after a restart simply refreshes the existing row.
pub async fn upsert_node(pool: &PgPool, node: &NodeRow) -> Result<NodeRow> {
    let row = sqlx::query_as::<_, NodeRow>(
        "INSERT INTO nodes (
            id, address, capabilities, capacity, in_flight, status,
            last_heartbeat_at, registered_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (id) DO UPDATE SET
            address = EXCLUDED.address,
            capabilities = EXCLUDED.capabilities,
            capacity = EXCLUDED.capacity,
            in_flight = EXCLUDED.in_flight,
            status = EXCLUDED.status,
            last_heartbeat_at = EXCLUDED.last_heartbeat_at
         RETURNING *",
    )
    .bind(&node.id)
    .bind(&node.address)
    .bind(&node.capabilities)
    .bind(node.capacity)
    .bind(node.in_flight)
    .bind(node.status)
    .bind(node.last_heartbeat_at)
    .bind(node.registered_at)
    .fetch_one(pool)
    .await
    .context("failed to upsert node")?;
    Ok(row)
}

/// Record a heartbeat's in-flight count and status without touching the
/// other columns.
pub async fn record_heartbeat(
    pool: &PgPool,
    id: &str,
    in_flight: i32,
    status: NodeStatus,
) -> Result<()> {
    sqlx::query(
        "UPDATE nodes SET in_flight = $1, status = $2, last_heartbeat_at = $3 WHERE id = $4",
    )
    .bind(in_flight)
    .bind(status)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record node heartbeat")?;
    Ok(())
}

/// Mark a node dead in the audit log once the registry's liveness sweeper
/// has evicted it.
pub async fn mark_dead(pool: &PgPool, id: &str) -> Result<()> {
    sqlx::query("UPDATE nodes SET status = 'dead' WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark node dead")?;
    Ok(())
}

/// Fetch a single node row by ID.
pub async fn get_node(pool: &PgPool, id: &str) -> Result<Option<NodeRow>> {
    let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch node")?;
    Ok(row)
}

/// List all node rows, most recently registered first.
pub async fn list_nodes(pool: &PgPool) -> Result<Vec<NodeRow>> {
    let rows = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes ORDER BY registered_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list nodes")?;
    Ok(rows)
}
