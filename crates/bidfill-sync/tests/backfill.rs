use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bidfill_adapters::{AdapterError, PageSource};
use bidfill_core::{Bucket, WorkType};
use bidfill_storage::{BackoffPolicy, InMemorySink, InMemoryWatermarkStore, WatermarkStore};
use bidfill_sync::{
    BackfillDriver, DriverSettings, NoticePipeline, PrepPricePipeline, ProgressEvent,
    ProgressReporter, RecordingReporter, StreamPipeline,
};
use chrono::NaiveDate;
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;

const NOTICE_OP: &str = "getBidPblancListInfoCnstwk";
const BASE_OP: &str = "getBidPblancListInfoCnstwkBsisAmount";
const PREP_OP: &str = "getOpengResultListInfoCnstwkPreparPcDetail";
const NOTICE: &str = "notice:cnstwk";

#[derive(Debug, Clone, Copy)]
enum Failure {
    /// Malformed payload for the next `n` requests; `None` keeps failing.
    Transient(Option<u32>),
    /// Upstream rejects the service key.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Call {
    operation: String,
    page_no: u32,
    rows: u32,
}

impl Call {
    fn is_probe(&self) -> bool {
        self.page_no == 1 && self.rows == 1
    }
}

/// Fake upstream that serves `totals[operation]` synthetic records and follows a failure script.
#[derive(Default)]
struct ScriptedSource {
    totals: HashMap<String, u64>,
    empty_from: HashMap<String, u32>,
    notices_without_base: bool,
    failures: Mutex<HashMap<(String, u32), Failure>>,
    probe_failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedSource {
    fn with_total(mut self, operation: &str, total: u64) -> Self {
        self.totals.insert(operation.to_string(), total);
        self
    }

    fn empty_from(mut self, operation: &str, page_no: u32) -> Self {
        self.empty_from.insert(operation.to_string(), page_no);
        self
    }

    fn notices_without_base(mut self) -> Self {
        self.notices_without_base = true;
        self
    }

    fn fail_page(self, operation: &str, page_no: u32, failure: Failure) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert((operation.to_string(), page_no), failure);
        self
    }

    fn fail_probe(self, operation: &str, times: u32) -> Self {
        self.probe_failures
            .lock()
            .unwrap()
            .insert(operation.to_string(), times);
        self
    }

    fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    fn item(&self, operation: &str, index: u64) -> JsonValue {
        let bid_no = format!("R25BK{index:05}");
        match operation {
            BASE_OP => json!({"bidNtceNo": bid_no, "bidNtceOrd": "000", "bssamt": "2500000"}),
            PREP_OP => json!({
                "bidNtceNo": bid_no,
                "bidNtceOrd": "000",
                "compnoRsrvtnPrceSno": (index % 15) + 1,
                "bsisPlnprc": "1000000"
            }),
            _ if self.notices_without_base => json!({"bidNtceNo": bid_no, "bidNtceOrd": "000"}),
            _ => json!({"bidNtceNo": bid_no, "bidNtceOrd": "000", "bssamt": "1000000"}),
        }
    }

    fn scripted_failure(&self, call: &Call) -> Option<Result<JsonValue, AdapterError>> {
        let malformed = || -> Result<JsonValue, AdapterError> {
            Err(AdapterError::Malformed {
                operation: call.operation.clone(),
                message: "missing `response` envelope".into(),
            })
        };
        if call.is_probe() {
            let mut probes = self.probe_failures.lock().unwrap();
            let remaining = probes.get_mut(&call.operation)?;
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
            return Some(malformed());
        }
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&(call.operation.clone(), call.page_no))? {
            Failure::Fatal => Some(Ok(json!({
                "response": {"header": {"resultCode": "30", "resultMsg": "SERVICE KEY IS NOT REGISTERED ERROR."}}
            }))),
            Failure::Transient(None) => Some(malformed()),
            Failure::Transient(Some(0)) => None,
            Failure::Transient(Some(remaining)) => {
                *remaining -= 1;
                Some(malformed())
            }
        }
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn fetch_json(
        &self,
        operation: &str,
        params: &[(&str, String)],
    ) -> Result<JsonValue, AdapterError> {
        let param = |name: &str| -> u32 {
            params
                .iter()
                .find(|(key, _)| *key == name)
                .and_then(|(_, value)| value.parse().ok())
                .unwrap_or(1)
        };
        let call = Call {
            operation: operation.to_string(),
            page_no: param("pageNo"),
            rows: param("numOfRows"),
        };
        self.calls.lock().unwrap().push(call.clone());
        if let Some(outcome) = self.scripted_failure(&call) {
            return outcome;
        }

        let total = self.totals.get(operation).copied().unwrap_or(0);
        let exhausted = self
            .empty_from
            .get(operation)
            .is_some_and(|from| call.page_no >= *from);
        let start = u64::from(call.page_no - 1) * u64::from(call.rows);
        let end = (start + u64::from(call.rows)).min(total);
        let items: Vec<JsonValue> = if exhausted {
            Vec::new()
        } else {
            (start..end).map(|index| self.item(operation, index)).collect()
        };
        Ok(json!({
            "response": {
                "header": {"resultCode": "00", "resultMsg": "NORMAL SERVICE."},
                "body": {"items": {"item": items}, "totalCount": total, "pageNo": call.page_no}
            }
        }))
    }
}

/// Cancels `token` once `page` of any stream completes.
struct CancelAfterPage {
    token: CancellationToken,
    page: u32,
}

impl ProgressReporter for CancelAfterPage {
    fn report(&self, event: &ProgressEvent) {
        if let ProgressEvent::PageCompleted { page, .. } = event {
            if *page == self.page {
                self.token.cancel();
            }
        }
    }
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
}

fn settings() -> DriverSettings {
    DriverSettings {
        page_size: 100,
        page_pause: Duration::from_millis(500),
        retry: BackoffPolicy::default(),
        tz_offset: bidfill_core::kst(),
        empty_page_stop_after: 0,
    }
}

fn notices_only(source: &Arc<ScriptedSource>, sink: &Arc<InMemorySink>) -> Vec<Box<dyn StreamPipeline>> {
    vec![Box::new(
        NoticePipeline::new(source.clone(), WorkType::Cnstwk, sink.clone()).without_enrichment(),
    )]
}

struct Harness {
    source: Arc<ScriptedSource>,
    sink: Arc<InMemorySink>,
    store: Arc<InMemoryWatermarkStore>,
    reporter: Arc<RecordingReporter>,
}

impl Harness {
    fn new(source: ScriptedSource) -> Self {
        Self {
            source: Arc::new(source),
            sink: Arc::new(InMemorySink::new()),
            store: Arc::new(InMemoryWatermarkStore::new()),
            reporter: Arc::new(RecordingReporter::new()),
        }
    }

    fn driver(&self, pipelines: Vec<Box<dyn StreamPipeline>>, settings: DriverSettings) -> BackfillDriver {
        BackfillDriver::new(self.store.clone(), pipelines, settings).with_reporter(self.reporter.clone())
    }

    fn notice_driver(&self) -> BackfillDriver {
        self.driver(notices_only(&self.source, &self.sink), settings())
    }

    async fn watermark(&self, stream: &str, day: u32) -> Option<(u32, Option<u32>)> {
        self.store
            .get(stream, date(day))
            .await
            .unwrap()
            .map(|w| (w.last_page, w.total_pages))
    }
}

fn page_calls(calls: &[Call], operation: &str) -> Vec<u32> {
    calls
        .iter()
        .filter(|call| call.operation == operation && !call.is_probe())
        .map(|call| call.page_no)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn hard_failed_page_is_the_only_page_refetched_next_run() {
    let h = Harness::new(
        ScriptedSource::default()
            .with_total(NOTICE_OP, 250)
            .fail_page(NOTICE_OP, 3, Failure::Transient(Some(6))),
    );
    let buckets = [Bucket::new(date(1))];

    let first = h.notice_driver().run(&buckets, &CancellationToken::new()).await.unwrap();
    assert_eq!(first.pages_completed, 2);
    assert_eq!(first.pages_failed, 1);
    assert_eq!(first.failed_pages[0].page, 3);
    assert_eq!(first.failed_pages[0].attempts, 6);
    assert!(!first.failed_pages[0].fatal);
    assert_eq!(h.watermark(NOTICE, 1).await, Some((2, Some(3))));
    assert_eq!(h.sink.notice_count().await, 200);
    assert_eq!(page_calls(&h.source.take_calls(), NOTICE_OP), vec![1, 2, 3, 3, 3, 3, 3, 3]);

    let second = h.notice_driver().run(&buckets, &CancellationToken::new()).await.unwrap();
    assert_eq!(second.pages_completed, 1);
    assert_eq!(second.pages_failed, 0);
    assert_eq!(h.source.take_calls(), vec![Call { operation: NOTICE_OP.into(), page_no: 3, rows: 100 }]);
    assert_eq!(h.watermark(NOTICE, 1).await, Some((3, Some(3))));
    assert_eq!(h.sink.notice_count().await, 250);
}

#[tokio::test(start_paused = true)]
async fn changing_page_size_rebases_progress_without_losing_rows() {
    let h = Harness::new(
        ScriptedSource::default()
            .with_total(NOTICE_OP, 250)
            .fail_page(NOTICE_OP, 3, Failure::Transient(Some(6))),
    );
    let buckets = [Bucket::new(date(1))];

    h.notice_driver().run(&buckets, &CancellationToken::new()).await.unwrap();
    assert_eq!(h.watermark(NOTICE, 1).await, Some((2, Some(3))));
    assert_eq!(h.sink.notice_count().await, 200);
    h.source.take_calls();

    let wider = DriverSettings { page_size: 300, ..settings() };
    let second = h
        .driver(notices_only(&h.source, &h.sink), wider)
        .run(&buckets, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.pages_failed, 0);
    assert_eq!(h.source.take_calls(), vec![Call { operation: NOTICE_OP.into(), page_no: 1, rows: 300 }]);
    assert_eq!(h.sink.notice_count().await, 250);
    let wm = h.store.get(NOTICE, date(1)).await.unwrap().unwrap();
    assert_eq!((wm.last_page, wm.total_pages, wm.page_size), (1, Some(1), Some(300)));
}

#[tokio::test(start_paused = true)]
async fn completed_bucket_makes_no_requests() {
    let h = Harness::new(ScriptedSource::default().with_total(NOTICE_OP, 120));
    let buckets = [Bucket::new(date(1))];

    h.notice_driver().run(&buckets, &CancellationToken::new()).await.unwrap();
    let before = h.sink.batches_written();
    h.source.take_calls();

    let again = h.notice_driver().run(&buckets, &CancellationToken::new()).await.unwrap();
    assert_eq!(again.pages_completed, 0);
    assert!(h.source.take_calls().is_empty());
    assert_eq!(h.sink.batches_written(), before);
    assert!(h
        .reporter
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::AlreadyComplete { last_page: 2, total_pages: 2, .. })));
}

#[tokio::test(start_paused = true)]
async fn empty_bucket_is_recorded_and_never_probed_again() {
    let h = Harness::new(ScriptedSource::default());
    let buckets = [Bucket::new(date(2))];

    let summary = h.notice_driver().run(&buckets, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.empty_buckets, 1);
    assert_eq!(h.watermark(NOTICE, 2).await, Some((0, Some(0))));
    assert_eq!(h.source.take_calls().len(), 1);

    h.notice_driver().run(&buckets, &CancellationToken::new()).await.unwrap();
    assert!(h.source.take_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn pages_after_a_gap_persist_without_moving_the_watermark() {
    let h = Harness::new(
        ScriptedSource::default()
            .with_total(NOTICE_OP, 500)
            .fail_page(NOTICE_OP, 2, Failure::Transient(None)),
    );

    let summary = h
        .notice_driver()
        .run(&[Bucket::new(date(1))], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.pages_completed, 4);
    assert_eq!(h.sink.notice_count().await, 400);
    assert_eq!(h.watermark(NOTICE, 1).await, Some((1, Some(5))));
    let advanced: Vec<(u32, bool)> = h
        .reporter
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::PageCompleted { page, advanced, .. } => Some((page, advanced)),
            _ => None,
        })
        .collect();
    assert_eq!(advanced, vec![(1, true), (3, false), (4, false), (5, false)]);
    assert_eq!(h.reporter.failed_pages(NOTICE), vec![2]);
}

#[tokio::test(start_paused = true)]
async fn rejected_service_key_is_not_retried() {
    let h = Harness::new(
        ScriptedSource::default()
            .with_total(NOTICE_OP, 300)
            .fail_page(NOTICE_OP, 2, Failure::Fatal),
    );

    let summary = h
        .notice_driver()
        .run(&[Bucket::new(date(1))], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.pages_failed, 1);
    assert_eq!(summary.failed_pages[0].attempts, 1);
    assert!(summary.failed_pages[0].fatal);
    assert!(summary.failed_pages[0].error.contains("30"));
    assert_eq!(page_calls(&h.source.take_calls(), NOTICE_OP), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn base_amounts_fill_notices_that_lack_them() {
    let h = Harness::new(
        ScriptedSource::default()
            .with_total(NOTICE_OP, 150)
            .with_total(BASE_OP, 150)
            .notices_without_base(),
    );
    let pipeline = NoticePipeline::new(h.source.clone(), WorkType::Cnstwk, h.sink.clone());

    let summary = h
        .driver(vec![Box::new(pipeline)], settings())
        .run(&[Bucket::new(date(1))], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.rows_persisted, 150);
    assert_eq!(summary.rows_dropped, 0);
    let notice = h.sink.notice("R25BK00042", "000").await.unwrap();
    assert_eq!(notice.base_amount, 2_500_000);
    assert_eq!(page_calls(&h.source.take_calls(), BASE_OP), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn notices_without_base_are_dropped_unless_kept() {
    let h = Harness::new(ScriptedSource::default().with_total(NOTICE_OP, 40).notices_without_base());

    let dropped = h
        .driver(
            vec![Box::new(NoticePipeline::new(h.source.clone(), WorkType::Cnstwk, h.sink.clone()))],
            settings(),
        )
        .run(&[Bucket::new(date(1))], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(dropped.rows_dropped, 40);
    assert_eq!(h.sink.notice_count().await, 0);
    assert_eq!(h.watermark(NOTICE, 1).await, Some((1, Some(1))));

    let kept = h
        .driver(
            vec![Box::new(
                NoticePipeline::new(h.source.clone(), WorkType::Cnstwk, h.sink.clone()).keep_without_base(true),
            )],
            settings(),
        )
        .run(&[Bucket::new(date(2))], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(kept.rows_persisted, 40);
    assert!(h.sink.notices().await.iter().all(|n| n.base_amount == 0));
}

#[tokio::test(start_paused = true)]
async fn unavailable_base_amounts_do_not_block_notices() {
    let h = Harness::new(
        ScriptedSource::default()
            .with_total(NOTICE_OP, 80)
            .with_total(BASE_OP, 80)
            .fail_page(BASE_OP, 1, Failure::Transient(None)),
    );

    let summary = h
        .driver(
            vec![Box::new(NoticePipeline::new(h.source.clone(), WorkType::Cnstwk, h.sink.clone()))],
            settings(),
        )
        .run(&[Bucket::new(date(1))], &CancellationToken::new())
        .await
        .unwrap();

    assert!(h
        .reporter
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::EnrichmentUnavailable { .. })));
    assert_eq!(summary.pages_completed, 1);
    assert_eq!(h.sink.notice_count().await, 80);
}

#[tokio::test(start_paused = true)]
async fn empty_pages_end_the_bucket_early() {
    let h = Harness::new(
        ScriptedSource::default()
            .with_total(NOTICE_OP, 500)
            .empty_from(NOTICE_OP, 2),
    );
    let buckets = [Bucket::new(date(1))];
    let settings = DriverSettings {
        empty_page_stop_after: 2,
        ..settings()
    };

    let summary = h
        .driver(notices_only(&h.source, &h.sink), settings.clone())
        .run(&buckets, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.early_stops, 1);
    assert_eq!(page_calls(&h.source.take_calls(), NOTICE_OP), vec![1, 2, 3]);
    assert_eq!(h.watermark(NOTICE, 1).await, Some((3, Some(3))));

    h.driver(notices_only(&h.source, &h.sink), settings)
        .run(&buckets, &CancellationToken::new())
        .await
        .unwrap();
    assert!(h.source.take_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_at_the_next_page_boundary() {
    let h = Harness::new(ScriptedSource::default().with_total(NOTICE_OP, 500));
    let cancel = CancellationToken::new();
    let driver = BackfillDriver::new(h.store.clone(), notices_only(&h.source, &h.sink), settings()).with_reporter(
        Arc::new(CancelAfterPage {
            token: cancel.clone(),
            page: 2,
        }),
    );

    let summary = driver
        .run(&[Bucket::new(date(1)), Bucket::new(date(2))], &cancel)
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.pages_completed, 2);
    assert_eq!(h.watermark(NOTICE, 1).await, Some((2, Some(5))));
    assert_eq!(h.watermark(NOTICE, 2).await, None);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_leaves_no_watermark() {
    let h = Harness::new(
        ScriptedSource::default()
            .with_total(NOTICE_OP, 50)
            .fail_probe(NOTICE_OP, 6),
    );
    let buckets = [Bucket::new(date(1))];

    let summary = h.notice_driver().run(&buckets, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.probe_failures, 1);
    assert_eq!(h.watermark(NOTICE, 1).await, None);

    let retry = h.notice_driver().run(&buckets, &CancellationToken::new()).await.unwrap();
    assert_eq!(retry.pages_completed, 1);
    assert_eq!(h.watermark(NOTICE, 1).await, Some((1, Some(1))));
}

#[tokio::test(start_paused = true)]
async fn unreadable_watermark_store_aborts_the_run() {
    let h = Harness::new(ScriptedSource::default().with_total(NOTICE_OP, 50));
    h.store.toggle_offline();

    let err = h
        .notice_driver()
        .run(&[Bucket::new(date(1))], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("reading watermark"));
    assert!(h.source.take_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_sink_failures_are_retried() {
    let h = Harness::new(ScriptedSource::default().with_total(NOTICE_OP, 150));
    h.sink.fail_next_writes(2);

    let summary = h
        .notice_driver()
        .run(&[Bucket::new(date(1))], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.pages_failed, 0);
    assert_eq!(page_calls(&h.source.take_calls(), NOTICE_OP), vec![1, 1, 1, 2]);
    assert_eq!(h.sink.notice_count().await, 150);
}

#[tokio::test(start_paused = true)]
async fn transient_watermark_failures_are_retried_with_the_page() {
    let h = Harness::new(ScriptedSource::default().with_total(NOTICE_OP, 150));
    h.store.establish(NOTICE, date(1), 2, 150, 100).await.unwrap();
    h.store.fail_next_writes(2);

    let summary = h
        .notice_driver()
        .run(&[Bucket::new(date(1))], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.pages_failed, 0);
    assert_eq!(page_calls(&h.source.take_calls(), NOTICE_OP), vec![1, 1, 1, 2]);
    assert_eq!(h.watermark(NOTICE, 1).await, Some((2, Some(2))));
}

#[tokio::test(start_paused = true)]
async fn unrecorded_page_fails_and_keeps_the_watermark() {
    let h = Harness::new(ScriptedSource::default().with_total(NOTICE_OP, 150));
    h.store.establish(NOTICE, date(1), 2, 150, 100).await.unwrap();
    h.store.fail_next_writes(6);
    let buckets = [Bucket::new(date(1))];

    let first = h.notice_driver().run(&buckets, &CancellationToken::new()).await.unwrap();
    assert_eq!(first.pages_failed, 1);
    assert_eq!(first.failed_pages[0].page, 1);
    assert_eq!(first.failed_pages[0].attempts, 6);
    assert!(first.failed_pages[0].error.contains("advancing watermark"));
    assert_eq!(first.pages_completed, 1);
    assert_eq!(h.watermark(NOTICE, 1).await, Some((0, Some(2))));
    assert_eq!(h.sink.notice_count().await, 150);
    h.source.take_calls();

    let second = h.notice_driver().run(&buckets, &CancellationToken::new()).await.unwrap();
    assert_eq!(second.pages_failed, 0);
    assert_eq!(page_calls(&h.source.take_calls(), NOTICE_OP), vec![1, 2]);
    assert_eq!(h.watermark(NOTICE, 1).await, Some((2, Some(2))));
}

#[tokio::test(start_paused = true)]
async fn streams_run_in_order_within_each_bucket() {
    let h = Harness::new(
        ScriptedSource::default()
            .with_total(NOTICE_OP, 30)
            .with_total(PREP_OP, 45),
    );
    let pipelines: Vec<Box<dyn StreamPipeline>> = vec![
        Box::new(NoticePipeline::new(h.source.clone(), WorkType::Cnstwk, h.sink.clone()).without_enrichment()),
        Box::new(PrepPricePipeline::new(h.source.clone(), WorkType::Cnstwk, h.sink.clone())),
    ];

    h.driver(pipelines, settings())
        .run(&[Bucket::new(date(1)), Bucket::new(date(2))], &CancellationToken::new())
        .await
        .unwrap();

    let probed: Vec<(String, NaiveDate)> = h
        .reporter
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::Probed { stream, bucket, .. } => Some((stream, bucket)),
            _ => None,
        })
        .collect();
    assert_eq!(
        probed,
        vec![
            (NOTICE.to_string(), date(1)),
            ("prep15:cnstwk".to_string(), date(1)),
            (NOTICE.to_string(), date(2)),
            ("prep15:cnstwk".to_string(), date(2)),
        ]
    );
    assert_eq!(h.sink.notice_count().await, 30);
    assert_eq!(h.sink.prep_price_count().await, 45);
}
