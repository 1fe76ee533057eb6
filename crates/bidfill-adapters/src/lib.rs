//! Page fetchers for the procurement OpenAPI services and the row extractors that read their payloads.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bidfill_core::{total_pages_for, BaseAmountMap, BucketWindow, WorkType};
use bidfill_storage::{FetchError, OpenApiClient, RetryDisposition};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub mod extract;

pub use extract::{
    enrich_notices, extract_base_amount_map, extract_notice_rows, extract_prep_price_rows,
    extract_result_rows, EnrichedNotices,
};

pub const CRATE_NAME: &str = "bidfill-adapters";

pub const DEFAULT_BID_PUBLIC_BASE: &str = "http://apis.data.go.kr/1230000/ad/BidPublicInfoService";
pub const DEFAULT_SCSBID_BASE: &str = "http://apis.data.go.kr/1230000/as/ScsbidInfoService";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{operation} returned result code {code}: {message}")]
    Upstream {
        operation: String,
        code: String,
        message: String,
    },
    #[error("malformed payload from {operation}: {message}")]
    Malformed { operation: String, message: String },
}

impl AdapterError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Fetch(err) => err.disposition(),
            Self::Upstream { code, .. } => classify_result_code(code),
            Self::Malformed { .. } => RetryDisposition::Retryable,
        }
    }
}

/// Header result codes that no retry can fix: bad parameters, unknown operation, key or IP rejected.
pub fn classify_result_code(code: &str) -> RetryDisposition {
    match code.trim() {
        "10" | "11" | "12" | "20" | "30" | "31" | "32" => RetryDisposition::NonRetryable,
        _ => RetryDisposition::Retryable,
    }
}

fn is_success_code(code: &str) -> bool {
    // "03" is NODATA_ERROR, which is just an empty page.
    matches!(code.trim(), "00" | "0" | "03")
}

#[derive(Debug, Default, Deserialize)]
struct ResponseHeader {
    #[serde(rename = "resultCode", default)]
    result_code: Option<String>,
    #[serde(rename = "resultMsg", default)]
    result_msg: Option<String>,
}

/// One decoded page of an upstream list operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    operation: String,
    page_no: u32,
    body: JsonValue,
}

impl RawPage {
    /// Validate the `response` envelope; error result codes become [`AdapterError::Upstream`].
    pub fn from_json(operation: &str, page_no: u32, body: JsonValue) -> Result<Self, AdapterError> {
        let Some(response) = body.get("response") else {
            return Err(AdapterError::Malformed {
                operation: operation.to_string(),
                message: "missing `response` envelope".to_string(),
            });
        };
        let header = response
            .get("header")
            .cloned()
            .and_then(|h| serde_json::from_value::<ResponseHeader>(h).ok())
            .unwrap_or_default();
        if let Some(code) = header.result_code.as_deref() {
            if !is_success_code(code) {
                return Err(AdapterError::Upstream {
                    operation: operation.to_string(),
                    code: code.trim().to_string(),
                    message: header.result_msg.unwrap_or_default(),
                });
            }
        }
        Ok(Self {
            operation: operation.to_string(),
            page_no,
            body,
        })
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn page_no(&self) -> u32 {
        self.page_no
    }

    pub fn json(&self) -> &JsonValue {
        &self.body
    }

    /// `response.body.totalCount`, numeric or string; zero when absent.
    pub fn total_count(&self) -> u64 {
        match self.body.pointer("/response/body/totalCount") {
            Some(JsonValue::Number(n)) => n.as_u64().unwrap_or(0),
            Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn items(&self) -> Vec<&JsonValue> {
        extract::item_list(self.body.pointer("/response/body/items"))
    }
}

/// Raw JSON transport for one upstream service.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_json(
        &self,
        operation: &str,
        params: &[(&str, String)],
    ) -> Result<JsonValue, AdapterError>;
}

#[async_trait]
impl PageSource for OpenApiClient {
    async fn fetch_json(
        &self,
        operation: &str,
        params: &[(&str, String)],
    ) -> Result<JsonValue, AdapterError> {
        Ok(self.get_json(operation, params).await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    NoticeList,
    BaseAmount,
    PrepPriceDetail,
    OpeningResult,
}

impl Endpoint {
    pub fn operation(self, work_type: WorkType) -> String {
        let w = work_type.api_suffix();
        match self {
            Self::NoticeList => format!("getBidPblancListInfo{w}"),
            Self::BaseAmount => format!("getBidPblancListInfo{w}BsisAmount"),
            Self::PrepPriceDetail => format!("getOpengResultListInfo{w}PreparPcDetail"),
            Self::OpeningResult => format!("getOpengResultListInfo{w}"),
        }
    }
}

/// Period-query fetcher (`inqryDiv=1`) for one operation.
#[derive(Clone)]
pub struct PageFetcher {
    source: Arc<dyn PageSource>,
    operation: String,
}

impl fmt::Debug for PageFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFetcher")
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

impl PageFetcher {
    pub fn new(source: Arc<dyn PageSource>, endpoint: Endpoint, work_type: WorkType) -> Self {
        Self {
            source,
            operation: endpoint.operation(work_type),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub async fn fetch(
        &self,
        window: &BucketWindow,
        page_no: u32,
        page_size: u32,
    ) -> Result<RawPage, AdapterError> {
        let params = [
            ("inqryDiv", "1".to_string()),
            ("inqryBgnDt", window.inqry_bgn_dt()),
            ("inqryEndDt", window.inqry_end_dt()),
            ("pageNo", page_no.to_string()),
            ("numOfRows", page_size.max(1).to_string()),
        ];
        let body = self.source.fetch_json(&self.operation, &params).await?;
        let page = RawPage::from_json(&self.operation, page_no, body)?;
        debug!(
            operation = %self.operation,
            page_no,
            items = page.items().len(),
            total_count = page.total_count(),
            "page fetched"
        );
        Ok(page)
    }

    /// Page 1 with a single row, read only for `totalCount`.
    pub async fn probe(&self, window: &BucketWindow) -> Result<u64, AdapterError> {
        Ok(self.fetch(window, 1, 1).await?.total_count())
    }
}

/// Walk every page of the base-amount operation for `window`; any failing page fails the build.
pub async fn build_base_amount_map(
    fetcher: &PageFetcher,
    window: &BucketWindow,
    page_size: u32,
) -> Result<BaseAmountMap, AdapterError> {
    let mut map = BaseAmountMap::new();
    let mut page_no = 1;
    loop {
        let page = fetcher.fetch(window, page_no, page_size).await?;
        map.extend(extract_base_amount_map(&page));
        let total_pages = total_pages_for(page.total_count(), page_size);
        if page_no >= total_pages || page.items().is_empty() {
            break;
        }
        page_no += 1;
    }
    debug!(operation = fetcher.operation(), entries = map.len(), "base amount map built");
    Ok(map)
}
