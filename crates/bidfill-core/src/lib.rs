//! Core domain model for bucketed procurement backfills.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod plan;

pub const CRATE_NAME: &str = "bidfill-core";

/// Upstream date-time parameter format (`YYYYMMDDHHMM`).
pub const API_DATETIME_FORMAT: &str = "%Y%m%d%H%M";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown work type `{0}`")]
    WorkType(String),
    #[error("unknown stream kind `{0}`")]
    StreamKind(String),
    #[error("stream id `{0}` is not of the form <kind>:<worktype>")]
    StreamId(String),
    #[error("utc offset of {0} hours is out of range")]
    Offset(i32),
}

/// Procurement category; every upstream operation exists once per work type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkType {
    Cnstwk,
    Servc,
    Thng,
    Frgcpt,
}

impl WorkType {
    pub fn slug(self) -> &'static str {
        match self {
            Self::Cnstwk => "cnstwk",
            Self::Servc => "servc",
            Self::Thng => "thng",
            Self::Frgcpt => "frgcpt",
        }
    }

    /// Suffix used in upstream operation names, e.g. `getBidPblancListInfoCnstwk`.
    pub fn api_suffix(self) -> &'static str {
        match self {
            Self::Cnstwk => "Cnstwk",
            Self::Servc => "Servc",
            Self::Thng => "Thng",
            Self::Frgcpt => "Frgcpt",
        }
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for WorkType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cnstwk" => Ok(Self::Cnstwk),
            "servc" => Ok(Self::Servc),
            "thng" => Ok(Self::Thng),
            "frgcpt" => Ok(Self::Frgcpt),
            other => Err(ParseError::WorkType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Notice,
    PrepPrice,
    OpeningResult,
}

impl StreamKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Notice => "notice",
            Self::PrepPrice => "prep15",
            Self::OpeningResult => "result",
        }
    }
}

impl FromStr for StreamKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "notice" => Ok(Self::Notice),
            "prep15" | "prep" => Ok(Self::PrepPrice),
            "result" => Ok(Self::OpeningResult),
            other => Err(ParseError::StreamKind(other.to_string())),
        }
    }
}

/// Independent watermark lineage, rendered as `<kind>:<worktype>` (e.g. `notice:cnstwk`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub kind: StreamKind,
    pub work_type: WorkType,
}

impl StreamId {
    pub fn new(kind: StreamKind, work_type: WorkType) -> Self {
        Self { kind, work_type }
    }

    pub fn notice(work_type: WorkType) -> Self {
        Self::new(StreamKind::Notice, work_type)
    }

    pub fn prep_price(work_type: WorkType) -> Self {
        Self::new(StreamKind::PrepPrice, work_type)
    }

    pub fn opening_result(work_type: WorkType) -> Self {
        Self::new(StreamKind::OpeningResult, work_type)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.work_type.slug())
    }
}

impl FromStr for StreamId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, work_type) = s
            .split_once(':')
            .ok_or_else(|| ParseError::StreamId(s.to_string()))?;
        Ok(Self::new(kind.parse()?, work_type.parse()?))
    }
}

pub fn fixed_offset_hours(hours: i32) -> Result<FixedOffset, ParseError> {
    hours
        .checked_mul(3600)
        .and_then(FixedOffset::east_opt)
        .ok_or(ParseError::Offset(hours))
}

/// Korea Standard Time, the civil timezone the upstream APIs index by.
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("nine hours is a valid utc offset")
}

/// One calendar day in the fixed backfill timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bucket(NaiveDate);

impl Bucket {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// Inclusive `[00:00, 23:59]` query window for this day in `offset`.
    pub fn window(&self, offset: FixedOffset) -> BucketWindow {
        self.widened_window(offset, 0)
    }

    /// Query window spanning `days` extra calendar days on each side.
    pub fn widened_window(&self, offset: FixedOffset, days: u32) -> BucketWindow {
        let spread = Duration::days(i64::from(days));
        let first = self.0 - spread;
        let last = self.0 + spread;
        BucketWindow {
            bucket: *self,
            begin: local_minute(offset, first, 0, 0),
            end: local_minute(offset, last, 23, 59),
        }
    }
}

impl From<NaiveDate> for Bucket {
    fn from(date: NaiveDate) -> Self {
        Self(date)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

fn local_minute(offset: FixedOffset, date: NaiveDate, hour: u32, minute: u32) -> DateTime<FixedOffset> {
    let naive = date
        .and_hms_opt(hour, minute, 0)
        .expect("hour and minute are always in range here");
    // Fixed offsets have no gaps or folds.
    match offset.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        _ => offset.from_utc_datetime(&naive),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketWindow {
    pub bucket: Bucket,
    pub begin: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl BucketWindow {
    pub fn inqry_bgn_dt(&self) -> String {
        self.begin.format(API_DATETIME_FORMAT).to_string()
    }

    pub fn inqry_end_dt(&self) -> String {
        self.end.format(API_DATETIME_FORMAT).to_string()
    }
}

/// `ceil(total_count / page_size)`, or zero for an empty bucket.
pub fn total_pages_for(total_count: u64, page_size: u32) -> u32 {
    if total_count == 0 {
        return 0;
    }
    let page_size = u64::from(page_size.max(1));
    let pages = total_count.div_ceil(page_size);
    u32::try_from(pages).unwrap_or(u32::MAX)
}

/// Durable pagination progress for one (stream, bucket) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub stream: String,
    pub bucket: NaiveDate,
    pub last_page: u32,
    pub total_pages: Option<u32>,
    pub total_count: Option<u64>,
    /// Rows per page `last_page` and `total_pages` were counted in; `None` on rows that predate it.
    pub page_size: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl Watermark {
    /// Probed empty: never fetched again.
    pub fn is_empty_complete(&self) -> bool {
        self.total_pages == Some(0) && self.total_count == Some(0)
    }

    /// Stored page total, recomputed from the count when the row predates a probe.
    pub fn effective_total_pages(&self, page_size: u32) -> u32 {
        match (self.total_pages, self.total_count) {
            (Some(pages), _) => pages,
            (None, Some(count)) => total_pages_for(count, page_size),
            (None, None) => 0,
        }
    }

    pub fn is_complete(&self, page_size: u32) -> bool {
        self.last_page >= self.effective_total_pages(page_size)
    }

    /// Same progress counted in pages of `page_size` rows.
    ///
    /// Only pages fully covered at the stored size stay done; a page that straddles the old
    /// boundary is fetched again. Returns `None` when no conversion is needed or the stored
    /// size is unknown.
    pub fn rescaled(&self, page_size: u32) -> Option<Watermark> {
        let page_size = page_size.max(1);
        let old = self.page_size.filter(|old| *old != page_size)?;
        let old_rows = |pages: u32| u64::from(pages) * u64::from(old);
        let bound = match (self.total_pages, self.total_count) {
            (Some(pages), Some(count)) => old_rows(pages).min(count),
            (Some(pages), None) => old_rows(pages),
            (None, Some(count)) => count,
            (None, None) => return None,
        };
        let total_pages = total_pages_for(bound, page_size);
        let last_page = if self.is_complete(old) {
            total_pages
        } else {
            let done = old_rows(self.last_page).min(bound) / u64::from(page_size);
            u32::try_from(done).unwrap_or(u32::MAX).min(total_pages)
        };
        Some(Watermark {
            last_page,
            total_pages: Some(total_pages),
            page_size: Some(page_size),
            updated_at: Utc::now(),
            ..self.clone()
        })
    }
}

/// Three-digit ordinal form used to match notice ordinals across endpoints (`"1"` -> `"001"`).
pub fn normalize_ord(ord: &str) -> String {
    let digits = ord.trim().trim_start_matches('0');
    let value: u32 = digits.parse().unwrap_or(0);
    format!("{value:03}")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NoticeKey {
    pub bid_no: String,
    pub ord: String,
}

impl NoticeKey {
    pub fn new(bid_no: impl Into<String>, ord: &str) -> Self {
        Self {
            bid_no: bid_no.into().trim().to_string(),
            ord: normalize_ord(ord),
        }
    }
}

/// Bid notice, keyed by (bid number, notice ordinal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoticeRow {
    pub bid_no: String,
    pub ord: String,
    pub base_amount: i64,
    pub range_low: Option<f64>,
    pub range_high: Option<f64>,
    pub lower_rate: Option<f64>,
    pub owner_id: String,
    pub work_type: String,
    pub announced_at: Option<NaiveDateTime>,
    pub vat_included: bool,
}

impl NoticeRow {
    pub fn key(&self) -> NoticeKey {
        NoticeKey::new(self.bid_no.clone(), &self.ord)
    }

    pub fn has_base_amount(&self) -> bool {
        self.base_amount > 0
    }

    /// Fill base amount and range bounds from an enrichment hit; returns whether anything changed.
    pub fn apply_base_amount(&mut self, hit: &BaseAmountHit) -> bool {
        if self.has_base_amount() || hit.base <= 0 {
            return false;
        }
        self.base_amount = hit.base;
        if hit.low.is_some() {
            self.range_low = hit.low;
        }
        if hit.high.is_some() {
            self.range_high = hit.high;
        }
        true
    }
}

/// One preliminary-price candidate of a bid, keyed by (bid, ordinal, component number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepPriceRow {
    pub bid_no: String,
    pub ord: String,
    pub comp_sno: i32,
    pub bsis_plnprc: i64,
    pub drawn_flag: bool,
    pub draw_seq: Option<i32>,
    pub final_plnprc: Option<i64>,
}

/// Bid opening result; NULL incoming fields never erase stored ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningResultRow {
    pub bid_no: String,
    pub ord: String,
    pub est_price: Option<i64>,
    pub presmpt_price: Option<i64>,
    pub bidders_cnt: Option<i32>,
    pub rebid_flag: bool,
    pub rl_openg_dt: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseAmountHit {
    pub base: i64,
    pub low: Option<f64>,
    pub high: Option<f64>,
    pub open_dt: Option<String>,
}

/// Secondary base-amount lookup built once per bucket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaseAmountMap {
    entries: HashMap<NoticeKey, BaseAmountHit>,
}

impl BaseAmountMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: NoticeKey, hit: BaseAmountHit) {
        self.entries.insert(key, hit);
    }

    /// Exact ordinal first, then the `001` and `000` ordinals of the same bid.
    pub fn lookup(&self, key: &NoticeKey) -> Option<&BaseAmountHit> {
        self.entries.get(key).or_else(|| {
            ["001", "000"].iter().find_map(|ord| {
                self.entries.get(&NoticeKey {
                    bid_no: key.bid_no.clone(),
                    ord: (*ord).to_string(),
                })
            })
        })
    }

    pub fn extend(&mut self, other: BaseAmountMap) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
