use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bidfill_adapters::{
    build_base_amount_map, extract_notice_rows, AdapterError, Endpoint, PageFetcher, PageSource,
};
use bidfill_core::{kst, Bucket, NoticeKey, WorkType};
use chrono::NaiveDate;
use serde_json::{json, Value as JsonValue};

#[derive(Default)]
struct CannedSource {
    pages: HashMap<u32, JsonValue>,
    calls: Mutex<Vec<Vec<(String, String)>>>,
}

impl CannedSource {
    fn with_page(mut self, page_no: u32, body: JsonValue) -> Self {
        self.pages.insert(page_no, body);
        self
    }

    fn calls(&self) -> Vec<Vec<(String, String)>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageSource for CannedSource {
    async fn fetch_json(
        &self,
        _operation: &str,
        params: &[(&str, String)],
    ) -> Result<JsonValue, AdapterError> {
        let owned: Vec<_> = params.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        let page_no: u32 = owned
            .iter()
            .find(|(k, _)| k == "pageNo")
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(1);
        self.calls.lock().unwrap().push(owned);
        Ok(self
            .pages
            .get(&page_no)
            .cloned()
            .unwrap_or_else(|| json!({"response": {"header": {"resultCode": "03"}, "body": {"totalCount": 0}}})))
    }
}

fn envelope(total: u64, items: JsonValue) -> JsonValue {
    json!({
        "response": {
            "header": {"resultCode": "00", "resultMsg": "NORMAL SERVICE."},
            "body": {"items": items, "totalCount": total}
        }
    })
}

fn bucket() -> Bucket {
    Bucket::new(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap())
}

#[tokio::test]
async fn fetch_sends_period_query_parameters() {
    let source = Arc::new(CannedSource::default().with_page(
        2,
        envelope(250, json!({"item": [{"bidNtceNo": "R25BK0001", "bidNtceOrd": "000", "bssamt": "1000"}]})),
    ));
    let fetcher = PageFetcher::new(source.clone(), Endpoint::NoticeList, WorkType::Cnstwk);

    let page = fetcher.fetch(&bucket().window(kst()), 2, 100).await.unwrap();
    assert_eq!(page.page_no(), 2);
    assert_eq!(page.total_count(), 250);
    assert_eq!(extract_notice_rows(&page, WorkType::Cnstwk).len(), 1);

    let calls = source.calls();
    let params: HashMap<_, _> = calls[0].iter().cloned().collect();
    assert_eq!(params["inqryDiv"], "1");
    assert_eq!(params["inqryBgnDt"], "202503010000");
    assert_eq!(params["inqryEndDt"], "202503012359");
    assert_eq!(params["numOfRows"], "100");
}

#[tokio::test]
async fn probe_requests_a_single_row() {
    let source = Arc::new(CannedSource::default().with_page(1, envelope(250, json!({"item": []}))));
    let fetcher = PageFetcher::new(source.clone(), Endpoint::PrepPriceDetail, WorkType::Cnstwk);

    assert_eq!(fetcher.probe(&bucket().window(kst())).await.unwrap(), 250);
    let params: HashMap<_, _> = source.calls()[0].iter().cloned().collect();
    assert_eq!(params["pageNo"], "1");
    assert_eq!(params["numOfRows"], "1");
}

#[tokio::test]
async fn base_amount_map_walks_every_page() {
    let source = Arc::new(
        CannedSource::default()
            .with_page(
                1,
                envelope(3, json!({"item": [
                    {"bidNtceNo": "A", "bidNtceOrd": "1", "bssamt": "100"},
                    {"bidNtceNo": "B", "bidNtceOrd": "1", "bssamt": "200"}
                ]})),
            )
            .with_page(
                2,
                envelope(3, json!({"item": {"bidNtceNo": "C", "bidNtceOrd": "000", "bssamt": "300"}})),
            ),
    );
    let fetcher = PageFetcher::new(source.clone(), Endpoint::BaseAmount, WorkType::Cnstwk);

    let map = build_base_amount_map(&fetcher, &bucket().widened_window(kst(), 2), 2)
        .await
        .unwrap();
    assert_eq!(map.len(), 3);
    assert_eq!(map.lookup(&NoticeKey::new("C", "1")).map(|h| h.base), Some(300));
    assert_eq!(source.calls().len(), 2);
    let params: HashMap<_, _> = source.calls()[0].iter().cloned().collect();
    assert_eq!(params["inqryBgnDt"], "202502270000");
}

#[tokio::test]
async fn upstream_errors_fail_the_map_build() {
    let source = Arc::new(CannedSource::default().with_page(
        1,
        json!({"response": {"header": {"resultCode": "20", "resultMsg": "SERVICE ACCESS DENIED ERROR."}}}),
    ));
    let fetcher = PageFetcher::new(source, Endpoint::BaseAmount, WorkType::Cnstwk);
    let err = build_base_amount_map(&fetcher, &bucket().window(kst()), 100)
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Upstream { ref code, .. } if code == "20"));
}
