//! Database operations for Tallycast

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::{DbError, Result, TallyError};
use crate::types::{
    Network, Post, PostType, ReactionSnapshot, Source, SourceStats, StatsSummary, SyncStatus,
};

/// Raw, still-encrypted credential slots for one source
pub type TokenRow = [Option<String>; 4];

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // mode=rwc creates the file if it doesn't exist
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------

    pub async fn create_source(&self, source: &Source) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, network, username, active, sync_status, status_reason, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source.id)
        .bind(source.network.as_str())
        .bind(&source.username)
        .bind(source.active)
        .bind(source.sync_status.as_str())
        .bind(&source.status_reason)
        .bind(source.created_at)
        .bind(source.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_source(&self, source_id: &str) -> Result<Option<Source>> {
        let row = sqlx::query(
            r#"
            SELECT id, network, username, active, sync_status, status_reason, created_at, updated_at
            FROM sources WHERE id = ?
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| source_from_row(&r)).transpose()
    }

    pub async fn find_source(&self, network: Network, username: &str) -> Result<Option<Source>> {
        let row = sqlx::query(
            r#"
            SELECT id, network, username, active, sync_status, status_reason, created_at, updated_at
            FROM sources WHERE network = ? AND username = ?
            "#,
        )
        .bind(network.as_str())
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| source_from_row(&r)).transpose()
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query(
            r#"
            SELECT id, network, username, active, sync_status, status_reason, created_at, updated_at
            FROM sources ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(source_from_row).collect()
    }

    pub async fn list_active_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query(
            r#"
            SELECT id, network, username, active, sync_status, status_reason, created_at, updated_at
            FROM sources WHERE active = 1 ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(source_from_row).collect()
    }

    /// Delete a source and everything hanging off it
    pub async fn delete_source(&self, source_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Toggle whether the scheduler picks up a source
    pub async fn set_source_active(&self, source_id: &str, active: bool) -> Result<bool> {
        let status = if active {
            SyncStatus::Initialized
        } else {
            SyncStatus::Deactivated
        };

        let result = sqlx::query(
            r#"
            UPDATE sources SET active = ?, sync_status = ?, status_reason = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(active)
        .bind(status.as_str())
        .bind(chrono::Utc::now().timestamp())
        .bind(source_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_sync_status(
        &self,
        source_id: &str,
        status: SyncStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sources SET sync_status = ?, status_reason = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(chrono::Utc::now().timestamp())
        .bind(source_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Exclusions
    // ------------------------------------------------------------------

    /// Identifiers that must never be ingested for a source
    pub async fn load_exclusion_set(&self, source_id: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT network_internal_id FROM exclusions WHERE source_id = ?")
            .bind(source_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(|r| r.get("network_internal_id")).collect())
    }

    pub async fn add_exclusion(&self, source_id: &str, network_internal_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO exclusions (source_id, network_internal_id, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(source_id, network_internal_id) DO NOTHING
            "#,
        )
        .bind(source_id)
        .bind(network_internal_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn remove_exclusion(&self, source_id: &str, network_internal_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM exclusions WHERE source_id = ? AND network_internal_id = ?")
                .bind(source_id)
                .bind(network_internal_id)
                .execute(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Posts and reactions
    // ------------------------------------------------------------------

    pub async fn get_post_by_network_id(
        &self,
        source_id: &str,
        network_internal_id: &str,
    ) -> Result<Option<Post>> {
        let row = sqlx::query(
            r#"
            SELECT id, source_id, network_internal_id, network, author, post_type, content, created_at, last_synced_at
            FROM posts WHERE source_id = ? AND network_internal_id = ?
            "#,
        )
        .bind(source_id)
        .bind(network_internal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| post_from_row(&r)).transpose()
    }

    pub async fn list_posts(&self, source_id: &str) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, network_internal_id, network, author, post_type, content, created_at, last_synced_at
            FROM posts WHERE source_id = ?
            ORDER BY created_at DESC, id
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(post_from_row).collect()
    }

    pub async fn count_posts(&self, source_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(count)
    }

    /// Remove posts whose content starts with `prefix`
    pub async fn delete_posts_with_content_prefix(&self, source_id: &str, prefix: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM posts
            WHERE source_id = ? AND substr(content, 1, length(?)) = ?
            "#,
        )
        .bind(source_id)
        .bind(prefix)
        .bind(prefix)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    pub async fn list_reactions(&self, post_id: &str) -> Result<Vec<ReactionSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, likes, reposts, views, synced_at
            FROM reactions WHERE post_id = ?
            ORDER BY synced_at, id
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| ReactionSnapshot {
                id: r.get("id"),
                post_id: r.get("post_id"),
                likes: r.get("likes"),
                reposts: r.get("reposts"),
                views: r.get("views"),
                synced_at: r.get("synced_at"),
            })
            .collect())
    }

    pub async fn count_reactions_for_source(&self, source_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM reactions r
            JOIN posts p ON p.id = r.post_id
            WHERE p.source_id = ?
            "#,
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(count)
    }

    pub async fn get_source_stats(&self, source_id: &str) -> Result<Option<SourceStats>> {
        let row = sqlx::query(
            r#"
            SELECT source_id, avg_likes, avg_reposts, avg_views, followers, following, updated_at
            FROM source_stats WHERE source_id = ?
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| SourceStats {
            source_id: r.get("source_id"),
            summary: StatsSummary {
                avg_likes: r.get("avg_likes"),
                avg_reposts: r.get("avg_reposts"),
                avg_views: r.get("avg_views"),
                followers: r.get("followers"),
                following: r.get("following"),
            },
            updated_at: r.get("updated_at"),
        }))
    }

    // ------------------------------------------------------------------
    // Credential slots
    // ------------------------------------------------------------------

    pub async fn get_token_row(&self, source_id: &str) -> Result<Option<TokenRow>> {
        let row = sqlx::query(
            "SELECT secret1, secret2, secret3, secret4 FROM source_tokens WHERE source_id = ?",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| {
            [
                r.get("secret1"),
                r.get("secret2"),
                r.get("secret3"),
                r.get("secret4"),
            ]
        }))
    }

    pub async fn put_token_row(&self, source_id: &str, slots: &TokenRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_tokens (source_id, secret1, secret2, secret3, secret4, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                secret1 = excluded.secret1,
                secret2 = excluded.secret2,
                secret3 = excluded.secret3,
                secret4 = excluded.secret4,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source_id)
        .bind(&slots[0])
        .bind(&slots[1])
        .bind(&slots[2])
        .bind(&slots[3])
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Site analytics
    // ------------------------------------------------------------------

    pub async fn count_site_stats(&self, source_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM analytics_site_stats WHERE source_id = ?")
                .bind(source_id)
                .fetch_one(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        Ok(count)
    }

    pub async fn upsert_site_stat(
        &self,
        source_id: &str,
        date: &str,
        clicks: i64,
        impressions: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analytics_site_stats (source_id, date, clicks, impressions)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source_id, date) DO UPDATE SET
                clicks = excluded.clicks,
                impressions = excluded.impressions
            "#,
        )
        .bind(source_id)
        .bind(date)
        .bind(clicks)
        .bind(impressions)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn upsert_page_stat(
        &self,
        source_id: &str,
        date: &str,
        page_path: &str,
        clicks: i64,
        impressions: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analytics_page_stats (source_id, date, page_path, clicks, impressions)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source_id, date, page_path) DO UPDATE SET
                clicks = excluded.clicks,
                impressions = excluded.impressions
            "#,
        )
        .bind(source_id)
        .bind(date)
        .bind(page_path)
        .bind(clicks)
        .bind(impressions)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Page stats as (date, page_path, clicks, impressions)
    pub async fn list_page_stats(&self, source_id: &str) -> Result<Vec<(String, String, i64, i64)>> {
        let rows = sqlx::query_as::<_, (String, String, i64, i64)>(
            r#"
            SELECT date, page_path, clicks, impressions FROM analytics_page_stats
            WHERE source_id = ? ORDER BY date, page_path
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows)
    }

    pub async fn add_redirect(&self, source_id: &str, from_path: &str, to_path: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO redirects (source_id, from_path, to_path)
            VALUES (?, ?, ?)
            ON CONFLICT(source_id, from_path) DO UPDATE SET to_path = excluded.to_path
            "#,
        )
        .bind(source_id)
        .bind(from_path)
        .bind(to_path)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_redirects(&self, source_id: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT from_path, to_path FROM redirects WHERE source_id = ?",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().collect())
    }
}

fn source_from_row(r: &SqliteRow) -> Result<Source> {
    let network: String = r.get("network");
    let status: String = r.get("sync_status");

    Ok(Source {
        id: r.get("id"),
        network: network.parse()?,
        username: r.get("username"),
        active: r.get("active"),
        sync_status: SyncStatus::parse(&status).ok_or_else(|| {
            TallyError::InvalidInput(format!("Unknown sync status in database: {}", status))
        })?,
        status_reason: r.get("status_reason"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn post_from_row(r: &SqliteRow) -> Result<Post> {
    let network: String = r.get("network");
    let post_type: String = r.get("post_type");

    Ok(Post {
        id: r.get("id"),
        source_id: r.get("source_id"),
        network_internal_id: r.get("network_internal_id"),
        network: network.parse()?,
        author: r.get("author"),
        post_type: PostType::parse(&post_type).ok_or_else(|| {
            TallyError::InvalidInput(format!("Unknown post type in database: {}", post_type))
        })?,
        content: r.get("content"),
        created_at: r.get("created_at"),
        last_synced_at: r.get("last_synced_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, db)
    }

    async fn insert_post(db: &Database, source_id: &str, network_id: &str, content: &str) {
        sqlx::query(
            r#"
            INSERT INTO posts (id, source_id, network_internal_id, network, author, post_type, content, created_at, last_synced_at)
            VALUES (?, ?, ?, 'reddit', 'someone', 'post', ?, 0, 0)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(source_id)
        .bind(network_id)
        .bind(content)
        .execute(db.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_database_initialization_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("dir").join("tally.db");
        let db = Database::new(&db_path.to_string_lossy()).await;
        assert!(db.is_ok());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_create_and_get_source() {
        let (_temp, db) = setup_test_db().await;
        let source = Source::new(Network::Weasyl, "artist");
        db.create_source(&source).await.unwrap();

        let loaded = db.get_source(&source.id).await.unwrap().unwrap();
        assert_eq!(loaded.network, Network::Weasyl);
        assert_eq!(loaded.username, "artist");
        assert!(loaded.active);
        assert_eq!(loaded.sync_status, SyncStatus::Initialized);

        let found = db.find_source(Network::Weasyl, "artist").await.unwrap();
        assert_eq!(found.map(|s| s.id), Some(source.id));
    }

    #[tokio::test]
    async fn test_duplicate_source_rejected() {
        let (_temp, db) = setup_test_db().await;
        db.create_source(&Source::new(Network::E621, "dup")).await.unwrap();
        let result = db.create_source(&Source::new(Network::E621, "dup")).await;
        assert!(result.is_err(), "(network, username) must be unique");
    }

    #[tokio::test]
    async fn test_get_nonexistent_source_returns_none() {
        let (_temp, db) = setup_test_db().await;
        assert!(db.get_source("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deactivated_sources_are_not_listed_as_active() {
        let (_temp, db) = setup_test_db().await;
        let a = Source::new(Network::Reddit, "a");
        let b = Source::new(Network::Reddit, "b");
        db.create_source(&a).await.unwrap();
        db.create_source(&b).await.unwrap();

        assert!(db.set_source_active(&b.id, false).await.unwrap());

        let active = db.list_active_sources().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        let b = db.get_source(&b.id).await.unwrap().unwrap();
        assert_eq!(b.sync_status, SyncStatus::Deactivated);
        assert_eq!(db.list_sources().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_sync_status_records_reason() {
        let (_temp, db) = setup_test_db().await;
        let source = Source::new(Network::Twitch, "streamer");
        db.create_source(&source).await.unwrap();

        db.update_sync_status(&source.id, SyncStatus::Failed, Some("no content found"))
            .await
            .unwrap();

        let loaded = db.get_source(&source.id).await.unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::Failed);
        assert_eq!(loaded.status_reason.as_deref(), Some("no content found"));
    }

    #[tokio::test]
    async fn test_exclusion_set() {
        let (_temp, db) = setup_test_db().await;
        let source = Source::new(Network::E621, "artist");
        db.create_source(&source).await.unwrap();

        assert!(db.load_exclusion_set(&source.id).await.unwrap().is_empty());

        db.add_exclusion(&source.id, "123").await.unwrap();
        db.add_exclusion(&source.id, "123").await.unwrap();
        db.add_exclusion(&source.id, "456").await.unwrap();

        let set = db.load_exclusion_set(&source.id).await.unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("123"));

        assert!(db.remove_exclusion(&source.id, "123").await.unwrap());
        assert!(!db.remove_exclusion(&source.id, "123").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_source_cascades() {
        let (_temp, db) = setup_test_db().await;
        let source = Source::new(Network::Reddit, "cascade");
        db.create_source(&source).await.unwrap();
        insert_post(&db, &source.id, "p1", "r/rust: hello").await;
        db.add_exclusion(&source.id, "p2").await.unwrap();

        assert!(db.delete_source(&source.id).await.unwrap());
        assert_eq!(db.count_posts(&source.id).await.unwrap(), 0);
        assert!(db.load_exclusion_set(&source.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_posts_with_content_prefix() {
        let (_temp, db) = setup_test_db().await;
        let source = Source::new(Network::Reddit, "pruner");
        db.create_source(&source).await.unwrap();
        insert_post(&db, &source.id, "p1", "r/rust: keep me").await;
        insert_post(&db, &source.id, "p2", "r/old: drop me").await;
        insert_post(&db, &source.id, "p3", "r/oldies: keep me too").await;

        let removed = db
            .delete_posts_with_content_prefix(&source.id, "r/old:")
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.count_posts(&source.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_token_row_upsert() {
        let (_temp, db) = setup_test_db().await;
        let source = Source::new(Network::Twitch, "tokens");
        db.create_source(&source).await.unwrap();

        assert!(db.get_token_row(&source.id).await.unwrap().is_none());

        db.put_token_row(&source.id, &[Some("a".into()), None, None, None])
            .await
            .unwrap();
        db.put_token_row(&source.id, &[Some("b".into()), Some("c".into()), None, None])
            .await
            .unwrap();

        let row = db.get_token_row(&source.id).await.unwrap().unwrap();
        assert_eq!(row[0].as_deref(), Some("b"));
        assert_eq!(row[1].as_deref(), Some("c"));
        assert!(row[2].is_none());
    }

    #[tokio::test]
    async fn test_site_stats_upsert_is_idempotent() {
        let (_temp, db) = setup_test_db().await;
        let source = Source::new(Network::SearchConsole, "example.com");
        db.create_source(&source).await.unwrap();

        db.upsert_site_stat(&source.id, "2024-01-01", 3, 40).await.unwrap();
        db.upsert_site_stat(&source.id, "2024-01-01", 5, 50).await.unwrap();
        assert_eq!(db.count_site_stats(&source.id).await.unwrap(), 1);

        db.upsert_page_stat(&source.id, "2024-01-01", "/a", 1, 2).await.unwrap();
        db.upsert_page_stat(&source.id, "2024-01-01", "/a", 4, 8).await.unwrap();
        let pages = db.list_page_stats(&source.id).await.unwrap();
        assert_eq!(pages, vec![("2024-01-01".to_string(), "/a".to_string(), 4, 8)]);
    }

    #[tokio::test]
    async fn test_redirects() {
        let (_temp, db) = setup_test_db().await;
        let source = Source::new(Network::SearchConsole, "example.org");
        db.create_source(&source).await.unwrap();

        db.add_redirect(&source.id, "/old", "/new").await.unwrap();
        let map = db.get_redirects(&source.id).await.unwrap();
        assert_eq!(map.get("/old").map(String::as_str), Some("/new"));
    }
}
