//! Per-source aggregate stats
//!
//! Averages are taken over the latest snapshot of every post the source has
//! ever ingested (an all-time window). NULL metrics are ignored, so a metric
//! the network never reports averages to NULL rather than zero.

use crate::db::Database;
use crate::error::{DbError, Result};
use crate::types::StatsSummary;

/// Average likes/reposts/views over each post's most recent snapshot
///
/// Followers and following are left empty for the caller to fill in.
pub async fn calculate_average_stats(db: &Database, source_id: &str) -> Result<StatsSummary> {
    let (avg_likes, avg_reposts, avg_views) =
        sqlx::query_as::<_, (Option<f64>, Option<f64>, Option<f64>)>(
            r#"
            SELECT AVG(r.likes), AVG(r.reposts), AVG(r.views)
            FROM reactions r
            JOIN posts p ON p.id = r.post_id
            WHERE p.source_id = ?
              AND r.id = (
                  SELECT r2.id FROM reactions r2
                  WHERE r2.post_id = r.post_id
                  ORDER BY r2.synced_at DESC, r2.id DESC
                  LIMIT 1
              )
            "#,
        )
        .bind(source_id)
        .fetch_one(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

    Ok(StatsSummary {
        avg_likes,
        avg_reposts,
        avg_views,
        followers: None,
        following: None,
    })
}

/// Overwrite the stats row for a source, storing NULL for every `None`
pub async fn save_or_update_source_stats(
    db: &Database,
    source_id: &str,
    summary: &StatsSummary,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO source_stats (source_id, avg_likes, avg_reposts, avg_views, followers, following, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source_id) DO UPDATE SET
            avg_likes = excluded.avg_likes,
            avg_reposts = excluded.avg_reposts,
            avg_views = excluded.avg_views,
            followers = excluded.followers,
            following = excluded.following,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(source_id)
    .bind(summary.avg_likes)
    .bind(summary.avg_reposts)
    .bind(summary.avg_views)
    .bind(summary.followers)
    .bind(summary.following)
    .bind(chrono::Utc::now().timestamp())
    .execute(db.pool())
    .await
    .map_err(DbError::SqlxError)?;

    Ok(())
}

/// Recompute averages and store them with the given profile counters
pub async fn refresh_source_stats(
    db: &Database,
    source_id: &str,
    followers: Option<i64>,
    following: Option<i64>,
) -> Result<StatsSummary> {
    let summary = calculate_average_stats(db, source_id)
        .await?
        .with_followers(followers, following);
    save_or_update_source_stats(db, source_id, &summary).await?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{create_or_update_post, sync_reactions};
    use crate::types::{IngestedItem, Metrics, Network, PostType, Source};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Database, Source) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        let source = Source::new(Network::Weasyl, "artist");
        db.create_source(&source).await.unwrap();
        (temp_dir, db, source)
    }

    async fn post(db: &Database, source: &Source, id: &str) -> String {
        let item = IngestedItem {
            network_internal_id: id.to_string(),
            post_type: PostType::Image,
            author: source.username.clone(),
            content: String::new(),
            posted_at: 0,
            metrics: Metrics::default(),
        };
        create_or_update_post(db, &source.id, source.network, &item)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_source_averages_are_null() {
        let (_temp, db, source) = setup().await;
        let summary = calculate_average_stats(&db, &source.id).await.unwrap();
        assert_eq!(summary, StatsSummary::default());
    }

    #[tokio::test]
    async fn test_average_uses_latest_snapshot_per_post() {
        let (_temp, db, source) = setup().await;
        let a = post(&db, &source, "a").await;
        let b = post(&db, &source, "b").await;

        sync_reactions(&db, &a, Metrics::new(Some(100), None, Some(1000))).await.unwrap();
        sync_reactions(&db, &a, Metrics::new(Some(10), None, Some(50))).await.unwrap();
        sync_reactions(&db, &b, Metrics::new(Some(20), None, Some(150))).await.unwrap();

        let summary = calculate_average_stats(&db, &source.id).await.unwrap();
        assert_eq!(summary.avg_likes, Some(15.0));
        assert_eq!(summary.avg_views, Some(100.0));
        assert_eq!(summary.avg_reposts, None);
    }

    #[tokio::test]
    async fn test_save_overwrites_with_nulls() {
        let (_temp, db, source) = setup().await;

        let full = StatsSummary {
            avg_likes: Some(1.0),
            avg_reposts: Some(2.0),
            avg_views: Some(3.0),
            followers: Some(4),
            following: Some(5),
        };
        save_or_update_source_stats(&db, &source.id, &full).await.unwrap();

        let partial = StatsSummary {
            avg_likes: Some(9.0),
            ..StatsSummary::default()
        };
        save_or_update_source_stats(&db, &source.id, &partial).await.unwrap();

        let stored = db.get_source_stats(&source.id).await.unwrap().unwrap();
        assert_eq!(stored.summary, partial, "stale values must not survive");
    }

    #[tokio::test]
    async fn test_refresh_source_stats() {
        let (_temp, db, source) = setup().await;
        let a = post(&db, &source, "a").await;
        sync_reactions(&db, &a, Metrics::new(Some(3), Some(1), Some(9))).await.unwrap();

        let summary = refresh_source_stats(&db, &source.id, Some(250), Some(12))
            .await
            .unwrap();
        assert_eq!(summary.avg_likes, Some(3.0));
        assert_eq!(summary.followers, Some(250));

        let stored = db.get_source_stats(&source.id).await.unwrap().unwrap();
        assert_eq!(stored.summary, summary);
    }
}
