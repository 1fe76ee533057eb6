//! Idempotent record sinks. Every batch is written in one transaction and keyed by the
//! record's natural key, so re-delivering a page never duplicates rows.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use bidfill_core::{NoticeRow, OpeningResultRow, PrepPriceRow};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::debug;

use crate::StoreError;

#[async_trait]
pub trait NoticeSink: Send + Sync {
    async fn upsert_notices(&self, rows: &[NoticeRow]) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait PrepPriceSink: Send + Sync {
    async fn upsert_prep_prices(&self, rows: &[PrepPriceRow]) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait OpeningResultSink: Send + Sync {
    /// NULL incoming columns keep the stored value.
    async fn upsert_results(&self, rows: &[OpeningResultRow]) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NoticeSink for PgSink {
    async fn upsert_notices(&self, rows: &[NoticeRow]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO t_notice (bid_no, ord, base_amount, range_low, range_high, lower_rate,
                                      owner_id, work_type, announced_at, vat_included)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (bid_no, ord) DO UPDATE SET
                  base_amount  = EXCLUDED.base_amount,
                  range_low    = EXCLUDED.range_low,
                  range_high   = EXCLUDED.range_high,
                  lower_rate   = EXCLUDED.lower_rate,
                  owner_id     = EXCLUDED.owner_id,
                  work_type    = EXCLUDED.work_type,
                  announced_at = EXCLUDED.announced_at,
                  vat_included = EXCLUDED.vat_included
                "#,
            )
            .bind(&row.bid_no)
            .bind(&row.ord)
            .bind(row.base_amount)
            .bind(row.range_low)
            .bind(row.range_high)
            .bind(row.lower_rate)
            .bind(&row.owner_id)
            .bind(&row.work_type)
            .bind(row.announced_at)
            .bind(row.vat_included)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(rows = rows.len(), "notices upserted");
        Ok(rows.len())
    }
}

#[async_trait]
impl PrepPriceSink for PgSink {
    async fn upsert_prep_prices(&self, rows: &[PrepPriceRow]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO t_prep15 (bid_no, ord, comp_sno, bsis_plnprc, drawn_flag, draw_seq, final_plnprc)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (bid_no, ord, comp_sno) DO UPDATE SET
                  bsis_plnprc  = EXCLUDED.bsis_plnprc,
                  drawn_flag   = EXCLUDED.drawn_flag,
                  draw_seq     = EXCLUDED.draw_seq,
                  final_plnprc = EXCLUDED.final_plnprc
                "#,
            )
            .bind(&row.bid_no)
            .bind(&row.ord)
            .bind(row.comp_sno)
            .bind(row.bsis_plnprc)
            .bind(row.drawn_flag)
            .bind(row.draw_seq)
            .bind(row.final_plnprc)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(rows = rows.len(), "prep prices upserted");
        Ok(rows.len())
    }
}

#[async_trait]
impl OpeningResultSink for PgSink {
    async fn upsert_results(&self, rows: &[OpeningResultRow]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO t_result (bid_no, ord, est_price, presmpt_price, bidders_cnt,
                                      rebid_flag, rl_openg_dt, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, now())
                ON CONFLICT (bid_no, ord) DO UPDATE SET
                  est_price     = COALESCE(EXCLUDED.est_price,     t_result.est_price),
                  presmpt_price = COALESCE(EXCLUDED.presmpt_price, t_result.presmpt_price),
                  bidders_cnt   = COALESCE(EXCLUDED.bidders_cnt,   t_result.bidders_cnt),
                  rebid_flag    = EXCLUDED.rebid_flag,
                  rl_openg_dt   = COALESCE(EXCLUDED.rl_openg_dt,   t_result.rl_openg_dt),
                  updated_at    = now()
                "#,
            )
            .bind(&row.bid_no)
            .bind(&row.ord)
            .bind(row.est_price)
            .bind(row.presmpt_price)
            .bind(row.bidders_cnt)
            .bind(row.rebid_flag)
            .bind(row.rl_openg_dt)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(rows = rows.len(), "opening results upserted");
        Ok(rows.len())
    }
}

type BidKey = (String, String);

#[derive(Debug, Default)]
struct SinkTables {
    notices: BTreeMap<BidKey, NoticeRow>,
    prep_prices: BTreeMap<(String, String, i32), PrepPriceRow>,
    results: BTreeMap<BidKey, OpeningResultRow>,
}

/// Map-backed sink implementing all three record traits.
#[derive(Debug, Default)]
pub struct InMemorySink {
    tables: RwLock<SinkTables>,
    offline: AtomicBool,
    failing_writes: AtomicU32,
    batches: AtomicUsize,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toggle_offline(&self) {
        self.offline.fetch_xor(true, Ordering::SeqCst);
    }

    /// The next `count` non-empty batches fail with `StoreError::Unavailable`.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Committed non-empty batches across all tables.
    pub fn batches_written(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub async fn notice_count(&self) -> usize {
        self.tables.read().await.notices.len()
    }

    pub async fn prep_price_count(&self) -> usize {
        self.tables.read().await.prep_prices.len()
    }

    pub async fn result_count(&self) -> usize {
        self.tables.read().await.results.len()
    }

    pub async fn notice(&self, bid_no: &str, ord: &str) -> Option<NoticeRow> {
        let guard = self.tables.read().await;
        guard.notices.get(&(bid_no.to_string(), ord.to_string())).cloned()
    }

    pub async fn result(&self, bid_no: &str, ord: &str) -> Option<OpeningResultRow> {
        let guard = self.tables.read().await;
        guard.results.get(&(bid_no.to_string(), ord.to_string())).cloned()
    }

    pub async fn notices(&self) -> Vec<NoticeRow> {
        self.tables.read().await.notices.values().cloned().collect()
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("sink offline".into()));
        }
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Unavailable("injected sink write failure".into()));
        }
        Ok(())
    }
}

fn coalesce<T: Clone>(incoming: &Option<T>, stored: &Option<T>) -> Option<T> {
    incoming.clone().or_else(|| stored.clone())
}

#[async_trait]
impl NoticeSink for InMemorySink {
    async fn upsert_notices(&self, rows: &[NoticeRow]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.check_write()?;
        let mut guard = self.tables.write().await;
        for row in rows {
            guard
                .notices
                .insert((row.bid_no.clone(), row.ord.clone()), row.clone());
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(rows.len())
    }
}

#[async_trait]
impl PrepPriceSink for InMemorySink {
    async fn upsert_prep_prices(&self, rows: &[PrepPriceRow]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.check_write()?;
        let mut guard = self.tables.write().await;
        for row in rows {
            guard.prep_prices.insert(
                (row.bid_no.clone(), row.ord.clone(), row.comp_sno),
                row.clone(),
            );
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(rows.len())
    }
}

#[async_trait]
impl OpeningResultSink for InMemorySink {
    async fn upsert_results(&self, rows: &[OpeningResultRow]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.check_write()?;
        let mut guard = self.tables.write().await;
        for row in rows {
            let key = (row.bid_no.clone(), row.ord.clone());
            let merged = match guard.results.get(&key) {
                Some(stored) => OpeningResultRow {
                    bid_no: row.bid_no.clone(),
                    ord: row.ord.clone(),
                    est_price: coalesce(&row.est_price, &stored.est_price),
                    presmpt_price: coalesce(&row.presmpt_price, &stored.presmpt_price),
                    bidders_cnt: coalesce(&row.bidders_cnt, &stored.bidders_cnt),
                    rebid_flag: row.rebid_flag,
                    rl_openg_dt: coalesce(&row.rl_openg_dt, &stored.rl_openg_dt),
                },
                None => row.clone(),
            };
            guard.results.insert(key, merged);
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(bid_no: &str, base_amount: i64) -> NoticeRow {
        NoticeRow {
            bid_no: bid_no.into(),
            ord: "001".into(),
            base_amount,
            range_low: Some(-0.02),
            range_high: Some(0.02),
            lower_rate: Some(0.87745),
            owner_id: "B552695".into(),
            work_type: "Cnstwk".into(),
            announced_at: None,
            vat_included: true,
        }
    }

    fn result(est_price: Option<i64>, bidders_cnt: Option<i32>) -> OpeningResultRow {
        OpeningResultRow {
            bid_no: "R25BK0001".into(),
            ord: "001".into(),
            est_price,
            presmpt_price: None,
            bidders_cnt,
            rebid_flag: false,
            rl_openg_dt: None,
        }
    }

    #[tokio::test]
    async fn redelivered_batches_do_not_duplicate_rows() {
        let sink = InMemorySink::new();
        let batch = vec![notice("A", 100), notice("B", 200)];
        assert_eq!(sink.upsert_notices(&batch).await.unwrap(), 2);
        assert_eq!(sink.upsert_notices(&batch).await.unwrap(), 2);
        assert_eq!(sink.notice_count().await, 2);

        sink.upsert_notices(&[notice("A", 150)]).await.unwrap();
        assert_eq!(sink.notice("A", "001").await.unwrap().base_amount, 150);
        assert_eq!(sink.batches_written(), 3);
    }

    #[tokio::test]
    async fn prep_prices_are_keyed_by_component() {
        let sink = InMemorySink::new();
        let rows: Vec<_> = (1..=15)
            .map(|comp_sno| PrepPriceRow {
                bid_no: "A".into(),
                ord: "001".into(),
                comp_sno,
                bsis_plnprc: 1_000 + i64::from(comp_sno),
                drawn_flag: comp_sno <= 4,
                draw_seq: None,
                final_plnprc: None,
            })
            .collect();
        sink.upsert_prep_prices(&rows).await.unwrap();
        sink.upsert_prep_prices(&rows[..3]).await.unwrap();
        assert_eq!(sink.prep_price_count().await, 15);
    }

    #[tokio::test]
    async fn null_result_fields_keep_stored_values() {
        let sink = InMemorySink::new();
        sink.upsert_results(&[result(Some(9_000), Some(12))]).await.unwrap();
        sink.upsert_results(&[result(None, Some(14))]).await.unwrap();

        let stored = sink.result("R25BK0001", "001").await.unwrap();
        assert_eq!(stored.est_price, Some(9_000));
        assert_eq!(stored.bidders_cnt, Some(14));
    }

    #[tokio::test]
    async fn empty_batches_are_a_no_op_even_when_offline() {
        let sink = InMemorySink::new();
        sink.toggle_offline();
        assert_eq!(sink.upsert_notices(&[]).await.unwrap(), 0);
        assert!(sink.upsert_notices(&[notice("A", 1)]).await.is_err());
        assert_eq!(sink.batches_written(), 0);
    }

    #[tokio::test]
    async fn injected_failures_leave_tables_untouched() {
        let sink = InMemorySink::new();
        sink.fail_next_writes(1);
        assert!(sink.upsert_notices(&[notice("A", 1)]).await.is_err());
        assert_eq!(sink.notice_count().await, 0);
        assert!(sink.upsert_notices(&[notice("A", 1)]).await.is_ok());
        assert_eq!(sink.notice_count().await, 1);
    }
}
