//! Relational page/image store on embedded SQLite.
//!
//! The pool is capped at one connection so concurrent workers serialize
//! their writes instead of fighting over the writer lock.

use std::time::Duration;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::{ArchiveError, Result};
use crate::models::PageData;
use crate::urls;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const UPSERT_TIMEOUT: Duration = Duration::from_secs(120);
const UPSERT_TIMEOUT_MANY_IMAGES: Duration = Duration::from_secs(180);

/// SQLite-backed store for page and image records.
#[derive(Clone)]
pub struct PageStore {
    pool: SqlitePool,
}

impl PageStore {
    /// Opens (creating if needed) the database at `path` and ensures the
    /// schema exists. Pass `:memory:` for an ephemeral store.
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open page store at {path}"))?;

        let store = Self { pool };
        store
            .create_schema()
            .await
            .context("failed to create page store schema")?;
        info!(path, "page store ready");
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                qdrant_id TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL UNIQUE,
                title TEXT,
                status_code INTEGER,
                crawl_date DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                page_id INTEGER NOT NULL,
                image_url TEXT NOT NULL,
                image_path TEXT NOT NULL,
                alt_text TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (page_id) REFERENCES pages(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_pages_url ON pages(url)",
            "CREATE INDEX IF NOT EXISTS idx_pages_qdrant_id ON pages(qdrant_id)",
            "CREATE INDEX IF NOT EXISTS idx_images_page_id ON images(page_id)",
            "CREATE INDEX IF NOT EXISTS idx_images_url ON images(image_url)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Upserts the page row by unique URL and replaces its image set in
    /// one transaction. Returns the page row ID.
    pub async fn upsert_page(&self, page: &PageData) -> Result<i64> {
        let grace = if page.images.len() > 100 {
            UPSERT_TIMEOUT_MANY_IMAGES
        } else {
            UPSERT_TIMEOUT
        };
        tokio::time::timeout(grace, self.upsert_page_inner(page))
            .await
            .map_err(|_| ArchiveError::StoreUnavailable("page upsert timed out".to_string()))?
    }

    async fn upsert_page_inner(&self, page: &PageData) -> Result<i64> {
        let qdrant_id = urls::deterministic_id(&page.url);
        let mut tx = self.pool.begin().await?;

        let page_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO pages (qdrant_id, url, title, status_code, crawl_date, updated_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                status_code = excluded.status_code,
                crawl_date = excluded.crawl_date,
                updated_at = CURRENT_TIMESTAMP
            RETURNING id
            "#,
        )
        .bind(&qdrant_id)
        .bind(&page.url)
        .bind(&page.title)
        .bind(page.status_code as i64)
        .bind(page.crawl_date)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM images WHERE page_id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await?;

        for image in &page.images {
            sqlx::query(
                "INSERT INTO images (page_id, image_url, image_path, alt_text) VALUES (?, ?, ?, ?)",
            )
            .bind(page_id)
            .bind(&image.url)
            .bind(&image.local_path)
            .bind(&image.alt)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(page_id)
    }

    /// Ping plus `SELECT 1`, bounded to a few seconds.
    pub async fn health_check(&self) -> Result<()> {
        let probe = sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&self.pool);
        match tokio::time::timeout(HEALTH_TIMEOUT, probe).await {
            Ok(Ok(1)) => Ok(()),
            Ok(Ok(other)) => Err(ArchiveError::StoreUnavailable(format!(
                "health probe returned {other}"
            ))),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ArchiveError::StoreUnavailable(
                "health probe timed out".to_string(),
            )),
        }
    }

    /// Number of archived pages.
    pub async fn page_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Number of stored image records.
    pub async fn image_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM images")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Image rows stored for a page URL, in insertion order.
    pub async fn images_for_page(&self, url: &str) -> Result<Vec<(String, String, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT i.image_url, i.image_path, COALESCE(i.alt_text, '') AS alt_text
            FROM images i JOIN pages p ON p.id = i.page_id
            WHERE p.url = ? ORDER BY i.id
            "#,
        )
        .bind(url)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("image_url"),
                    row.get::<String, _>("image_path"),
                    row.get::<String, _>("alt_text"),
                )
            })
            .collect())
    }

    /// Closes the pool, reporting a timeout when the grace period elapses.
    pub async fn close(&self, grace: Duration) -> Result<()> {
        tokio::time::timeout(grace, self.pool.close())
            .await
            .map_err(|_| ArchiveError::ShutdownTimeout(grace))?;
        info!("page store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ImageData;

    async fn memory_store() -> PageStore {
        PageStore::open(":memory:").await.expect("in-memory store")
    }

    fn sample_page(url: &str) -> PageData {
        let mut page = PageData::new(url);
        page.title = "Sample".to_string();
        page.status_code = 200;
        page.main_content = "body".to_string();
        page.refresh_word_count();
        page
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates_in_place() {
        let store = memory_store().await;
        let mut page = sample_page("https://a.test/page");
        let first_id = store.upsert_page(&page).await.unwrap();

        page.title = "Renamed".to_string();
        let second_id = store.upsert_page(&page).await.unwrap();
        assert_eq!(first_id, second_id);
        assert_eq!(store.page_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reupsert_replaces_image_set() {
        let store = memory_store().await;
        let mut page = sample_page("https://a.test/page");
        page.images.push(ImageData {
            url: "https://a.test/one.png".to_string(),
            alt: "one".to_string(),
            local_path: "images/one.png".to_string(),
        });
        page.images.push(ImageData {
            url: "https://a.test/two.png".to_string(),
            alt: "two".to_string(),
            local_path: "images/two.png".to_string(),
        });
        store.upsert_page(&page).await.unwrap();
        assert_eq!(store.image_count().await.unwrap(), 2);

        page.images.truncate(1);
        store.upsert_page(&page).await.unwrap();
        assert_eq!(store.image_count().await.unwrap(), 1);

        let images = store.images_for_page("https://a.test/page").await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].0, "https://a.test/one.png");
    }

    #[tokio::test]
    async fn qdrant_id_matches_deterministic_id() {
        let store = memory_store().await;
        let page = sample_page("https://a.test/page");
        store.upsert_page(&page).await.unwrap();
        let stored: String =
            sqlx::query_scalar("SELECT qdrant_id FROM pages WHERE url = ?")
                .bind(&page.url)
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(stored, urls::deterministic_id(&page.url));
    }

    #[tokio::test]
    async fn health_check_passes_on_open_store() {
        let store = memory_store().await;
        store.health_check().await.unwrap();
    }
}
