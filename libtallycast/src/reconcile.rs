//! Post reconciliation
//!
//! Posts are keyed by (source, network-internal id). Reconciling an item
//! that already exists keeps its row, id, content and original created-at
//! and only refreshes `last_synced_at`. Reaction snapshots are append-only.

use uuid::Uuid;

use crate::db::Database;
use crate::error::{DbError, Result};
use crate::types::{IngestedItem, Metrics, Network};

/// Find or create the post for `item`, returning its internal id
///
/// A single upsert keyed on (source_id, network_internal_id), so two
/// sources never collide and re-running never duplicates.
pub async fn create_or_update_post(
    db: &Database,
    source_id: &str,
    network: Network,
    item: &IngestedItem,
) -> Result<String> {
    let now = chrono::Utc::now().timestamp();

    let id: String = sqlx::query_scalar(
        r#"
        INSERT INTO posts (id, source_id, network_internal_id, network, author, post_type, content, created_at, last_synced_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source_id, network_internal_id)
        DO UPDATE SET last_synced_at = excluded.last_synced_at
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(source_id)
    .bind(&item.network_internal_id)
    .bind(network.as_str())
    .bind(&item.author)
    .bind(item.post_type.as_str())
    .bind(&item.content)
    .bind(item.posted_at)
    .bind(now)
    .fetch_one(db.pool())
    .await
    .map_err(DbError::SqlxError)?;

    Ok(id)
}

/// Append a reaction snapshot; `None` metrics are stored as NULL
pub async fn sync_reactions(db: &Database, post_id: &str, metrics: Metrics) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO reactions (post_id, likes, reposts, views, synced_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(post_id)
    .bind(metrics.likes)
    .bind(metrics.reposts)
    .bind(metrics.views)
    .bind(chrono::Utc::now().timestamp())
    .execute(db.pool())
    .await
    .map_err(DbError::SqlxError)?;

    Ok(result.last_insert_rowid())
}

/// Reconcile an item and attach a snapshot of its metrics
pub async fn ingest(
    db: &Database,
    source_id: &str,
    network: Network,
    item: &IngestedItem,
) -> Result<String> {
    let post_id = create_or_update_post(db, source_id, network, item).await?;
    sync_reactions(db, &post_id, item.metrics).await?;
    Ok(post_id)
}
