//! Per-stream fetch, extract and persist steps the driver runs for every page.

use std::sync::Arc;

use async_trait::async_trait;
use bidfill_adapters::{
    build_base_amount_map, enrich_notices, extract_notice_rows, extract_prep_price_rows,
    extract_result_rows, AdapterError, Endpoint, PageFetcher, PageSource,
};
use bidfill_core::{BaseAmountMap, BucketWindow, StreamId, StreamKind, WorkType};
use bidfill_storage::{NoticeSink, OpeningResultSink, PrepPriceSink, RetryDisposition, StoreError};
use thiserror::Error;
use tracing::debug;

use crate::retry::AttemptOutcome;
use crate::BackfillConfig;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Adapter(err) => err.disposition() == RetryDisposition::NonRetryable,
            Self::Store(_) => false,
        }
    }
}

impl<T> From<Result<T, PipelineError>> for AttemptOutcome<T> {
    fn from(result: Result<T, PipelineError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) if err.is_fatal() => Self::Fatal(err.to_string()),
            Err(err) => Self::Transient(err.to_string()),
        }
    }
}

/// Per-bucket state produced once before paging starts.
#[derive(Debug, Clone, Default)]
pub struct BucketPrep {
    pub base_amounts: BaseAmountMap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageReport {
    /// Items present on the upstream page.
    pub fetched: usize,
    pub persisted: usize,
    pub enriched: usize,
    pub dropped: usize,
}

impl PageReport {
    pub fn is_empty(&self) -> bool {
        self.fetched == 0
    }
}

#[async_trait]
pub trait StreamPipeline: Send + Sync {
    fn stream(&self) -> StreamId;

    async fn probe(&self, window: &BucketWindow) -> Result<u64, PipelineError>;

    async fn prepare(&self, _window: &BucketWindow) -> Result<BucketPrep, PipelineError> {
        Ok(BucketPrep::default())
    }

    /// Fetch, extract and durably persist one page.
    async fn process_page(
        &self,
        prep: &BucketPrep,
        window: &BucketWindow,
        page_no: u32,
        page_size: u32,
    ) -> Result<PageReport, PipelineError>;
}

pub struct NoticePipeline {
    work_type: WorkType,
    notices: PageFetcher,
    base_amounts: Option<PageFetcher>,
    sink: Arc<dyn NoticeSink>,
    enrich_window_days: u32,
    map_page_size: u32,
    keep_without_base: bool,
}

impl NoticePipeline {
    pub fn new(source: Arc<dyn PageSource>, work_type: WorkType, sink: Arc<dyn NoticeSink>) -> Self {
        Self {
            work_type,
            notices: PageFetcher::new(source.clone(), Endpoint::NoticeList, work_type),
            base_amounts: Some(PageFetcher::new(source, Endpoint::BaseAmount, work_type)),
            sink,
            enrich_window_days: 0,
            map_page_size: 100,
            keep_without_base: false,
        }
    }

    pub fn without_enrichment(mut self) -> Self {
        self.base_amounts = None;
        self
    }

    pub fn enrich_window_days(mut self, days: u32) -> Self {
        self.enrich_window_days = days;
        self
    }

    pub fn keep_without_base(mut self, keep: bool) -> Self {
        self.keep_without_base = keep;
        self
    }
}

#[async_trait]
impl StreamPipeline for NoticePipeline {
    fn stream(&self) -> StreamId {
        StreamId::notice(self.work_type)
    }

    async fn probe(&self, window: &BucketWindow) -> Result<u64, PipelineError> {
        Ok(self.notices.probe(window).await?)
    }

    async fn prepare(&self, window: &BucketWindow) -> Result<BucketPrep, PipelineError> {
        let Some(fetcher) = &self.base_amounts else {
            return Ok(BucketPrep::default());
        };
        let widened = window
            .bucket
            .widened_window(*window.begin.offset(), self.enrich_window_days);
        let base_amounts = build_base_amount_map(fetcher, &widened, self.map_page_size).await?;
        Ok(BucketPrep { base_amounts })
    }

    async fn process_page(
        &self,
        prep: &BucketPrep,
        window: &BucketWindow,
        page_no: u32,
        page_size: u32,
    ) -> Result<PageReport, PipelineError> {
        let page = self.notices.fetch(window, page_no, page_size).await?;
        let rows = extract_notice_rows(&page, self.work_type);
        let enriched = enrich_notices(rows, &prep.base_amounts, self.keep_without_base);
        let persisted = self.sink.upsert_notices(&enriched.rows).await?;
        debug!(page_no, filled = enriched.filled, dropped = enriched.dropped, "notice page persisted");
        Ok(PageReport {
            fetched: page.items().len(),
            persisted,
            enriched: enriched.filled,
            dropped: enriched.dropped,
        })
    }
}

pub struct PrepPricePipeline {
    work_type: WorkType,
    fetcher: PageFetcher,
    sink: Arc<dyn PrepPriceSink>,
}

impl PrepPricePipeline {
    pub fn new(source: Arc<dyn PageSource>, work_type: WorkType, sink: Arc<dyn PrepPriceSink>) -> Self {
        Self {
            work_type,
            fetcher: PageFetcher::new(source, Endpoint::PrepPriceDetail, work_type),
            sink,
        }
    }
}

#[async_trait]
impl StreamPipeline for PrepPricePipeline {
    fn stream(&self) -> StreamId {
        StreamId::prep_price(self.work_type)
    }

    async fn probe(&self, window: &BucketWindow) -> Result<u64, PipelineError> {
        Ok(self.fetcher.probe(window).await?)
    }

    async fn process_page(
        &self,
        _prep: &BucketPrep,
        window: &BucketWindow,
        page_no: u32,
        page_size: u32,
    ) -> Result<PageReport, PipelineError> {
        let page = self.fetcher.fetch(window, page_no, page_size).await?;
        let rows = extract_prep_price_rows(&page);
        let persisted = self.sink.upsert_prep_prices(&rows).await?;
        Ok(PageReport {
            fetched: page.items().len(),
            persisted,
            ..PageReport::default()
        })
    }
}

pub struct OpeningResultPipeline {
    work_type: WorkType,
    fetcher: PageFetcher,
    sink: Arc<dyn OpeningResultSink>,
}

impl OpeningResultPipeline {
    pub fn new(source: Arc<dyn PageSource>, work_type: WorkType, sink: Arc<dyn OpeningResultSink>) -> Self {
        Self {
            work_type,
            fetcher: PageFetcher::new(source, Endpoint::OpeningResult, work_type),
            sink,
        }
    }
}

#[async_trait]
impl StreamPipeline for OpeningResultPipeline {
    fn stream(&self) -> StreamId {
        StreamId::opening_result(self.work_type)
    }

    async fn probe(&self, window: &BucketWindow) -> Result<u64, PipelineError> {
        Ok(self.fetcher.probe(window).await?)
    }

    async fn process_page(
        &self,
        _prep: &BucketPrep,
        window: &BucketWindow,
        page_no: u32,
        page_size: u32,
    ) -> Result<PageReport, PipelineError> {
        let page = self.fetcher.fetch(window, page_no, page_size).await?;
        let rows = extract_result_rows(&page);
        let persisted = self.sink.upsert_results(&rows).await?;
        Ok(PageReport {
            fetched: page.items().len(),
            persisted,
            ..PageReport::default()
        })
    }
}

/// One pipeline per enabled stream, in configured order. Notices and base amounts come from
/// `bid_public`; prep prices and opening results from `scsbid`.
pub fn pipelines_for<S>(
    config: &BackfillConfig,
    bid_public: Arc<dyn PageSource>,
    scsbid: Arc<dyn PageSource>,
    sink: Arc<S>,
) -> Vec<Box<dyn StreamPipeline>>
where
    S: NoticeSink + PrepPriceSink + OpeningResultSink + 'static,
{
    config
        .streams
        .iter()
        .map(|kind| -> Box<dyn StreamPipeline> {
            match kind {
                StreamKind::Notice => Box::new(
                    NoticePipeline::new(bid_public.clone(), config.work_type, sink.clone())
                        .enrich_window_days(config.enrich_window_days)
                        .keep_without_base(config.store_notice_without_base),
                ),
                StreamKind::PrepPrice => Box::new(PrepPricePipeline::new(
                    scsbid.clone(),
                    config.work_type,
                    sink.clone(),
                )),
                StreamKind::OpeningResult => Box::new(OpeningResultPipeline::new(
                    scsbid.clone(),
                    config.work_type,
                    sink.clone(),
                )),
            }
        })
        .collect()
}
