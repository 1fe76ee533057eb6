//! Per-(stream, bucket) pagination progress.
//!
//! `advance` clamps to the larger of the stored and requested page, so a restarted or racing
//! writer can never move a watermark backwards.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use bidfill_core::Watermark;
use chrono::{NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::debug;

use crate::StoreError;

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, stream: &str, bucket: NaiveDate) -> Result<Option<Watermark>, StoreError>;

    /// Create the row with `last_page = 0`; re-establishing keeps any progress already recorded.
    /// `page_size` is the page size `total_pages` was computed with.
    async fn establish(
        &self,
        stream: &str,
        bucket: NaiveDate,
        total_pages: u32,
        total_count: u64,
        page_size: u32,
    ) -> Result<(), StoreError>;

    /// Raise `last_page` to `max(stored, last_page)` and return the stored value.
    async fn advance(&self, stream: &str, bucket: NaiveDate, last_page: u32) -> Result<u32, StoreError>;

    /// Shrink `total_pages` after an early stop; never below the stored `last_page`.
    async fn truncate_total_pages(
        &self,
        stream: &str,
        bucket: NaiveDate,
        total_pages: u32,
    ) -> Result<(), StoreError>;

    /// Overwrite `last_page`, `total_pages` and `page_size` after a page size change.
    /// The only write that may lower `last_page`.
    async fn rebase(&self, watermark: &Watermark) -> Result<(), StoreError>;

    async fn list(&self, stream: Option<&str>) -> Result<Vec<Watermark>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgWatermarkStore {
    pool: PgPool,
}

impl PgWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_db_int(value: u32, what: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::OutOfRange(format!("{what}={value}")))
}

fn from_db_int(value: i32, what: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::OutOfRange(format!("{what}={value}")))
}

fn watermark_from_row(row: &PgRow) -> Result<Watermark, StoreError> {
    let total_pages: Option<i32> = row.try_get("total_pages")?;
    let total_count: Option<i64> = row.try_get("total_count")?;
    let page_size: Option<i32> = row.try_get("page_size")?;
    Ok(Watermark {
        stream: row.try_get("stream")?,
        bucket: row.try_get("bucket")?,
        last_page: from_db_int(row.try_get("last_page")?, "last_page")?,
        total_pages: total_pages
            .map(|v| from_db_int(v, "total_pages"))
            .transpose()?,
        total_count: total_count
            .map(|v| u64::try_from(v).map_err(|_| StoreError::OutOfRange(format!("total_count={v}"))))
            .transpose()?,
        page_size: page_size.map(|v| from_db_int(v, "page_size")).transpose()?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore {
    async fn get(&self, stream: &str, bucket: NaiveDate) -> Result<Option<Watermark>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT stream, bucket, last_page, total_pages, total_count, page_size, updated_at
            FROM t_etl_watermark
            WHERE stream = $1 AND bucket = $2
            "#,
        )
        .bind(stream)
        .bind(bucket)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(watermark_from_row).transpose()
    }

    async fn establish(
        &self,
        stream: &str,
        bucket: NaiveDate,
        total_pages: u32,
        total_count: u64,
        page_size: u32,
    ) -> Result<(), StoreError> {
        let total_count = i64::try_from(total_count)
            .map_err(|_| StoreError::OutOfRange(format!("total_count={total_count}")))?;
        sqlx::query(
            r#"
            INSERT INTO t_etl_watermark
              (stream, bucket, last_page, total_pages, total_count, page_size, updated_at)
            VALUES ($1, $2, 0, $3, $4, $5, now())
            ON CONFLICT (stream, bucket) DO UPDATE SET
              total_pages = EXCLUDED.total_pages,
              total_count = EXCLUDED.total_count,
              page_size   = EXCLUDED.page_size,
              updated_at  = now()
            "#,
        )
        .bind(stream)
        .bind(bucket)
        .bind(to_db_int(total_pages, "total_pages")?)
        .bind(total_count)
        .bind(to_db_int(page_size, "page_size")?)
        .execute(&self.pool)
        .await?;
        debug!(stream, %bucket, total_pages, total_count, page_size, "watermark established");
        Ok(())
    }

    async fn advance(&self, stream: &str, bucket: NaiveDate, last_page: u32) -> Result<u32, StoreError> {
        let stored: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO t_etl_watermark (stream, bucket, last_page, total_pages, total_count, updated_at)
            VALUES ($1, $2, $3, NULL, NULL, now())
            ON CONFLICT (stream, bucket) DO UPDATE SET
              last_page  = GREATEST(t_etl_watermark.last_page, EXCLUDED.last_page),
              updated_at = now()
            RETURNING last_page
            "#,
        )
        .bind(stream)
        .bind(bucket)
        .bind(to_db_int(last_page, "last_page")?)
        .fetch_one(&self.pool)
        .await?;
        from_db_int(stored, "last_page")
    }

    async fn truncate_total_pages(
        &self,
        stream: &str,
        bucket: NaiveDate,
        total_pages: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE t_etl_watermark
            SET total_pages = GREATEST($3, last_page),
                updated_at  = now()
            WHERE stream = $1 AND bucket = $2
            "#,
        )
        .bind(stream)
        .bind(bucket)
        .bind(to_db_int(total_pages, "total_pages")?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rebase(&self, watermark: &Watermark) -> Result<(), StoreError> {
        let page_size = watermark.page_size.map(|v| to_db_int(v, "page_size")).transpose()?;
        let total_pages = watermark
            .total_pages
            .map(|v| to_db_int(v, "total_pages"))
            .transpose()?;
        sqlx::query(
            r#"
            UPDATE t_etl_watermark
            SET last_page   = $3,
                total_pages = $4,
                page_size   = $5,
                updated_at  = now()
            WHERE stream = $1 AND bucket = $2
            "#,
        )
        .bind(&watermark.stream)
        .bind(watermark.bucket)
        .bind(to_db_int(watermark.last_page, "last_page")?)
        .bind(total_pages)
        .bind(page_size)
        .execute(&self.pool)
        .await?;
        debug!(
            stream = %watermark.stream,
            bucket = %watermark.bucket,
            last_page = watermark.last_page,
            page_size = ?watermark.page_size,
            "watermark rebased"
        );
        Ok(())
    }

    async fn list(&self, stream: Option<&str>) -> Result<Vec<Watermark>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT stream, bucket, last_page, total_pages, total_count, page_size, updated_at
            FROM t_etl_watermark
            WHERE ($1::text IS NULL OR stream = $1)
            ORDER BY stream, bucket
            "#,
        )
        .bind(stream)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(watermark_from_row).collect()
    }
}

/// Map-backed store for tests and dry runs. Writes can be made to fail on demand.
#[derive(Debug, Default)]
pub struct InMemoryWatermarkStore {
    rows: RwLock<BTreeMap<(String, NaiveDate), Watermark>>,
    offline: AtomicBool,
    failing_writes: AtomicU32,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toggle_offline(&self) {
        self.offline.fetch_xor(true, Ordering::SeqCst);
    }

    /// The next `count` writes fail with `StoreError::Unavailable`.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("watermark store offline".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        self.check_read()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Unavailable("injected watermark write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn get(&self, stream: &str, bucket: NaiveDate) -> Result<Option<Watermark>, StoreError> {
        self.check_read()?;
        let guard = self.rows.read().await;
        Ok(guard.get(&(stream.to_string(), bucket)).cloned())
    }

    async fn establish(
        &self,
        stream: &str,
        bucket: NaiveDate,
        total_pages: u32,
        total_count: u64,
        page_size: u32,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        let mut guard = self.rows.write().await;
        let entry = guard
            .entry((stream.to_string(), bucket))
            .or_insert_with(|| Watermark {
                stream: stream.to_string(),
                bucket,
                last_page: 0,
                total_pages: None,
                total_count: None,
                page_size: None,
                updated_at: Utc::now(),
            });
        entry.total_pages = Some(total_pages);
        entry.total_count = Some(total_count);
        entry.page_size = Some(page_size);
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn advance(&self, stream: &str, bucket: NaiveDate, last_page: u32) -> Result<u32, StoreError> {
        self.check_write()?;
        let mut guard = self.rows.write().await;
        let entry = guard
            .entry((stream.to_string(), bucket))
            .or_insert_with(|| Watermark {
                stream: stream.to_string(),
                bucket,
                last_page: 0,
                total_pages: None,
                total_count: None,
                page_size: None,
                updated_at: Utc::now(),
            });
        entry.last_page = entry.last_page.max(last_page);
        entry.updated_at = Utc::now();
        Ok(entry.last_page)
    }

    async fn truncate_total_pages(
        &self,
        stream: &str,
        bucket: NaiveDate,
        total_pages: u32,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        let mut guard = self.rows.write().await;
        if let Some(entry) = guard.get_mut(&(stream.to_string(), bucket)) {
            entry.total_pages = Some(total_pages.max(entry.last_page));
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn rebase(&self, watermark: &Watermark) -> Result<(), StoreError> {
        self.check_write()?;
        let mut guard = self.rows.write().await;
        if let Some(entry) = guard.get_mut(&(watermark.stream.clone(), watermark.bucket)) {
            entry.last_page = watermark.last_page;
            entry.total_pages = watermark.total_pages;
            entry.page_size = watermark.page_size;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list(&self, stream: Option<&str>) -> Result<Vec<Watermark>, StoreError> {
        self.check_read()?;
        let guard = self.rows.read().await;
        Ok(guard
            .values()
            .filter(|wm| stream.map_or(true, |s| wm.stream == s))
            .cloned()
            .collect())
    }
}
