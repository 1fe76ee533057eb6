//! Resumable bucketed backfill: walks day buckets oldest first and pages every enabled stream,
//! persisting each page before its watermark advances.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bidfill_adapters::PageSource;
use bidfill_core::plan::{plan, plan_dates, plan_range, today_in};
use bidfill_core::{total_pages_for, Bucket, StreamId};
use bidfill_storage::{
    connect_pool, run_migrations, BackoffPolicy, OpenApiClient, PgSink, PgWatermarkStore,
    WatermarkStore,
};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod pipeline;
pub mod progress;
pub mod retry;

pub use config::BackfillConfig;
pub use pipeline::{
    pipelines_for, BucketPrep, NoticePipeline, OpeningResultPipeline, PageReport, PipelineError,
    PrepPricePipeline, StreamPipeline,
};
pub use progress::{ProgressEvent, ProgressReporter, RecordingReporter, TracingReporter};
pub use retry::{retry_with_backoff, AttemptOutcome, Retried};

use retry::pause;

pub const CRATE_NAME: &str = "bidfill-sync";

/// Which days a run visits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketSelection {
    /// The N completed days before today.
    LastDays(u32),
    Range { from: NaiveDate, to: NaiveDate },
    Dates(Vec<NaiveDate>),
}

impl BucketSelection {
    pub fn buckets(&self, offset: FixedOffset, now: DateTime<Utc>) -> Vec<Bucket> {
        match self {
            Self::LastDays(days) => plan(today_in(offset, now), *days),
            Self::Range { from, to } => plan_range(*from, *to),
            Self::Dates(dates) => plan_dates(dates.iter().copied()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub page_size: u32,
    pub page_pause: Duration,
    pub retry: BackoffPolicy,
    pub tz_offset: FixedOffset,
    pub empty_page_stop_after: u32,
}

impl From<&BackfillConfig> for DriverSettings {
    fn from(config: &BackfillConfig) -> Self {
        Self {
            page_size: config.page_size.max(1),
            page_pause: config.page_pause,
            retry: config.retry,
            tz_offset: config.tz_offset,
            empty_page_stop_after: config.empty_page_stop_after,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedPage {
    pub stream: String,
    pub bucket: NaiveDate,
    pub page: u32,
    pub attempts: u32,
    pub fatal: bool,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub buckets: usize,
    pub pages_completed: usize,
    pub pages_failed: usize,
    pub rows_fetched: usize,
    pub rows_persisted: usize,
    pub rows_dropped: usize,
    pub empty_buckets: usize,
    pub probe_failures: usize,
    pub early_stops: usize,
    pub failed_pages: Vec<FailedPage>,
    pub cancelled: bool,
}

impl BackfillSummary {
    fn start(buckets: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            buckets,
            pages_completed: 0,
            pages_failed: 0,
            rows_fetched: 0,
            rows_persisted: 0,
            rows_dropped: 0,
            empty_buckets: 0,
            probe_failures: 0,
            early_stops: 0,
            failed_pages: Vec::new(),
            cancelled: false,
        }
    }
}

enum StreamOutcome {
    Finished,
    Cancelled,
}

pub struct BackfillDriver {
    store: Arc<dyn WatermarkStore>,
    pipelines: Vec<Box<dyn StreamPipeline>>,
    settings: DriverSettings,
    reporter: Arc<dyn ProgressReporter>,
}

impl BackfillDriver {
    pub fn new(
        store: Arc<dyn WatermarkStore>,
        pipelines: Vec<Box<dyn StreamPipeline>>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            store,
            pipelines,
            settings,
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn streams(&self) -> Vec<StreamId> {
        self.pipelines.iter().map(|p| p.stream()).collect()
    }

    /// Visits `buckets` in order. Page failures are recorded and skipped; watermark read or
    /// establish failures abort the run.
    pub async fn run(&self, buckets: &[Bucket], cancel: &CancellationToken) -> Result<BackfillSummary> {
        let mut summary = BackfillSummary::start(buckets.len());
        self.reporter.report(&ProgressEvent::RunStarted {
            run_id: summary.run_id,
            buckets: buckets.len(),
            streams: self.streams().iter().map(ToString::to_string).collect(),
        });

        'buckets: for bucket in buckets {
            for pipeline in &self.pipelines {
                if cancel.is_cancelled() {
                    self.reporter.report(&ProgressEvent::Cancelled {
                        stream: Some(pipeline.stream().to_string()),
                        bucket: Some(bucket.date()),
                    });
                    summary.cancelled = true;
                    break 'buckets;
                }
                let span = info_span!("stream_bucket", stream = %pipeline.stream(), %bucket);
                let outcome = self
                    .run_stream_bucket(pipeline.as_ref(), *bucket, cancel, &mut summary)
                    .instrument(span)
                    .await?;
                if let StreamOutcome::Cancelled = outcome {
                    self.reporter.report(&ProgressEvent::Cancelled {
                        stream: Some(pipeline.stream().to_string()),
                        bucket: Some(bucket.date()),
                    });
                    summary.cancelled = true;
                    break 'buckets;
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            run_id = %summary.run_id,
            pages_completed = summary.pages_completed,
            pages_failed = summary.pages_failed,
            rows_persisted = summary.rows_persisted,
            cancelled = summary.cancelled,
            "backfill finished"
        );
        Ok(summary)
    }

    async fn run_stream_bucket(
        &self,
        pipeline: &dyn StreamPipeline,
        bucket: Bucket,
        cancel: &CancellationToken,
        summary: &mut BackfillSummary,
    ) -> Result<StreamOutcome> {
        let stream = pipeline.stream().to_string();
        let date = bucket.date();
        let window = bucket.window(self.settings.tz_offset);
        let page_size = self.settings.page_size;
        let store = self.store.as_ref();

        let mut existing = store
            .get(&stream, date)
            .await
            .with_context(|| format!("reading watermark for {stream} {bucket}"))?;
        if let Some(rescaled) = existing.as_ref().and_then(|wm| wm.rescaled(page_size)) {
            store
                .rebase(&rescaled)
                .await
                .with_context(|| format!("rebasing watermark for {stream} {bucket}"))?;
            info!(
                stream = %stream,
                %bucket,
                from_page_size = ?existing.as_ref().and_then(|wm| wm.page_size),
                page_size,
                last_page = rescaled.last_page,
                total_pages = ?rescaled.total_pages,
                "page size changed; watermark rebased"
            );
            existing = Some(rescaled);
        }

        let (last_page, total_pages) = match existing {
            Some(watermark) if watermark.total_pages.is_some() || watermark.total_count.is_some() => {
                (watermark.last_page, watermark.effective_total_pages(page_size))
            }
            unprobed => {
                let resume_from = unprobed.map_or(0, |watermark| watermark.last_page);
                let window_ref = &window;
                let probed = retry_with_backoff(
                    &self.settings.retry,
                    cancel,
                    &format!("{stream} {bucket} probe"),
                    move || async move { AttemptOutcome::from(pipeline.probe(window_ref).await) },
                )
                .await;
                let total_count = match probed {
                    Retried::Done(count) => count,
                    Retried::Cancelled => return Ok(StreamOutcome::Cancelled),
                    Retried::Exhausted { attempts, error } | Retried::Fatal { attempts, error } => {
                        summary.probe_failures += 1;
                        self.reporter.report(&ProgressEvent::ProbeFailed {
                            stream,
                            bucket: date,
                            attempts,
                            error,
                        });
                        return Ok(StreamOutcome::Finished);
                    }
                };
                let total_pages = total_pages_for(total_count, page_size);
                store
                    .establish(&stream, date, total_pages, total_count, page_size)
                    .await
                    .with_context(|| format!("establishing watermark for {stream} {bucket}"))?;
                self.reporter.report(&ProgressEvent::Probed {
                    stream: stream.clone(),
                    bucket: date,
                    total_count,
                    total_pages,
                });
                (resume_from, total_pages)
            }
        };

        if total_pages == 0 {
            summary.empty_buckets += 1;
            self.reporter.report(&ProgressEvent::BucketEmpty { stream, bucket: date });
            return Ok(StreamOutcome::Finished);
        }
        if last_page >= total_pages {
            self.reporter.report(&ProgressEvent::AlreadyComplete {
                stream,
                bucket: date,
                last_page,
                total_pages,
            });
            return Ok(StreamOutcome::Finished);
        }

        let window_ref = &window;
        let prep = match retry_with_backoff(
            &self.settings.retry,
            cancel,
            &format!("{stream} {bucket} prepare"),
            move || async move { AttemptOutcome::from(pipeline.prepare(window_ref).await) },
        )
        .await
        {
            Retried::Done(prep) => prep,
            Retried::Cancelled => return Ok(StreamOutcome::Cancelled),
            Retried::Exhausted { error, .. } | Retried::Fatal { error, .. } => {
                self.reporter.report(&ProgressEvent::EnrichmentUnavailable {
                    stream: stream.clone(),
                    bucket: date,
                    error,
                });
                BucketPrep::default()
            }
        };

        // First hard-failed page; later pages still persist but the watermark stays below it.
        let mut gap: Option<u32> = None;
        let mut empty_streak = 0u32;
        for page in (last_page + 1)..=total_pages {
            if cancel.is_cancelled() {
                return Ok(StreamOutcome::Cancelled);
            }
            let frozen = gap.is_some();
            let stream_ref = stream.as_str();
            let prep_ref = &prep;
            let result = retry_with_backoff(
                &self.settings.retry,
                cancel,
                &format!("{stream} {bucket} page {page}/{total_pages}"),
                move || async move {
                    let report = match pipeline.process_page(prep_ref, window_ref, page, page_size).await {
                        Ok(report) => report,
                        Err(err) if err.is_fatal() => return AttemptOutcome::Fatal(err.to_string()),
                        Err(err) => return AttemptOutcome::Transient(err.to_string()),
                    };
                    if !frozen {
                        if let Err(err) = store.advance(stream_ref, date, page).await {
                            return AttemptOutcome::Transient(format!("advancing watermark: {err}"));
                        }
                    }
                    AttemptOutcome::Success(report)
                },
            )
            .await;

            let report = match result {
                Retried::Done(report) => report,
                Retried::Cancelled => return Ok(StreamOutcome::Cancelled),
                failed => {
                    if let Some((attempts, error, fatal)) = failed.failure() {
                        gap.get_or_insert(page);
                        summary.pages_failed += 1;
                        summary.failed_pages.push(FailedPage {
                            stream: stream.clone(),
                            bucket: date,
                            page,
                            attempts,
                            fatal,
                            error: error.to_string(),
                        });
                        self.reporter.report(&ProgressEvent::PageFailed {
                            stream: stream.clone(),
                            bucket: date,
                            page,
                            total_pages,
                            attempts,
                            fatal,
                            error: error.to_string(),
                        });
                    }
                    empty_streak = 0;
                    continue;
                }
            };

            summary.pages_completed += 1;
            summary.rows_fetched += report.fetched;
            summary.rows_persisted += report.persisted;
            summary.rows_dropped += report.dropped;
            self.reporter.report(&ProgressEvent::PageCompleted {
                stream: stream.clone(),
                bucket: date,
                page,
                total_pages,
                fetched: report.fetched,
                persisted: report.persisted,
                advanced: !frozen,
            });

            empty_streak = if report.is_empty() { empty_streak + 1 } else { 0 };
            let stop_after = self.settings.empty_page_stop_after;
            if stop_after > 0 && empty_streak >= stop_after && page < total_pages {
                if let Err(err) = store.truncate_total_pages(&stream, date, page).await {
                    warn!(stream = %stream, %bucket, page, error = %err, "could not record shortened page total");
                }
                summary.early_stops += 1;
                self.reporter.report(&ProgressEvent::EarlyStop {
                    stream: stream.clone(),
                    bucket: date,
                    page,
                    empty_streak,
                });
                break;
            }

            if page < total_pages && !pause(self.settings.page_pause, cancel).await {
                return Ok(StreamOutcome::Cancelled);
            }
        }

        Ok(StreamOutcome::Finished)
    }
}

/// Builds the production driver: one client per upstream service, Postgres sinks and watermarks.
pub async fn connect_driver(config: &BackfillConfig) -> Result<BackfillDriver> {
    if config.service_key.trim().is_empty() {
        bail!("SERVICE_KEY is not set");
    }
    let bid_public: Arc<dyn PageSource> = Arc::new(OpenApiClient::new(
        config.bid_public_base.clone(),
        &config.service_key,
        config.http_client_config(),
    )?);
    let scsbid: Arc<dyn PageSource> = Arc::new(OpenApiClient::new(
        config.scsbid_base.clone(),
        &config.service_key,
        config.http_client_config(),
    )?);

    let pool = connect_pool(&config.database_url, config.max_connections).await?;
    run_migrations(&pool).await?;
    let sink = Arc::new(PgSink::new(pool.clone()));
    let store: Arc<dyn WatermarkStore> = Arc::new(PgWatermarkStore::new(pool));

    let pipelines = pipelines_for(config, bid_public, scsbid, sink);
    Ok(BackfillDriver::new(store, pipelines, DriverSettings::from(config)))
}

pub async fn run_backfill(
    config: &BackfillConfig,
    selection: &BucketSelection,
    cancel: &CancellationToken,
) -> Result<BackfillSummary> {
    let buckets = selection.buckets(config.tz_offset, Utc::now());
    if buckets.is_empty() {
        warn!(?selection, "no buckets selected");
    }
    let driver = connect_driver(config).await?;
    driver.run(&buckets, cancel).await
}
