//! Best-effort row extraction from upstream list payloads.
//!
//! Field names drift between operations and API revisions, so every column is read through an
//! alias list (matched case-insensitively). Blank strings count as missing.

use std::collections::HashMap;

use bidfill_core::{
    normalize_ord, BaseAmountHit, BaseAmountMap, NoticeKey, NoticeRow, OpeningResultRow, PrepPriceRow,
    WorkType,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;

use crate::RawPage;

const BID_NO: &[&str] = &["bidNtceNo", "bidNo", "bid_ntce_no"];
const BID_ORD: &[&str] = &["bidNtceOrd", "bidOrd", "ntceOrd", "bid_ntce_ord"];
const BASE_AMOUNT: &[&str] = &["bssamt", "bssAmt", "baseAmt", "bidBssAmt"];
const RANGE_LOW: &[&str] = &["plnprcEsttRngBgnRate", "rsrvtnPrceRngBgnRate", "rngBgnRate"];
const RANGE_HIGH: &[&str] = &["plnprcEsttRngEndRate", "rsrvtnPrceRngEndRate", "rngEndRate"];

fn is_present(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

/// First non-blank value among `names`.
pub fn first_value<'a>(item: &'a JsonValue, names: &[&str]) -> Option<&'a JsonValue> {
    let object = item.as_object()?;
    names.iter().find_map(|name| {
        object
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
            .filter(|value| is_present(value))
    })
}

pub fn value_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn first_text(item: &JsonValue, names: &[&str]) -> Option<String> {
    first_value(item, names).and_then(value_text)
}

/// Integer amount; tolerates thousands separators and `1234.0`-style decimals.
pub fn parse_amount(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        JsonValue::String(s) => {
            let cleaned: String = s.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
            cleaned.parse::<i64>().ok().or_else(|| {
                cleaned
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

fn first_amount(item: &JsonValue, names: &[&str]) -> Option<i64> {
    first_value(item, names).and_then(parse_amount)
}

fn first_i32(item: &JsonValue, names: &[&str]) -> Option<i32> {
    first_amount(item, names).and_then(|v| i32::try_from(v).ok())
}

/// Rates arrive as fractions (`0.98`) or percents (`98`, `"-2%"`); both become fractions.
pub fn to_fraction(value: &JsonValue) -> Option<f64> {
    let raw = match value {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().trim_end_matches('%').replace(',', "").trim().parse().ok()?,
        _ => return None,
    };
    if !raw.is_finite() {
        return None;
    }
    Some(if raw.abs() > 1.0 { raw / 100.0 } else { raw })
}

fn first_fraction(item: &JsonValue, names: &[&str]) -> Option<f64> {
    first_value(item, names).and_then(to_fraction)
}

fn first_flag(item: &JsonValue, names: &[&str]) -> bool {
    first_text(item, names).is_some_and(|v| v.eq_ignore_ascii_case("y"))
}

/// `YYYYMMDDHHMM`, `YYYY-MM-DD HH:MM[:SS]` or a bare date (midnight).
pub fn parse_compact_datetime(text: &str) -> Option<NaiveDateTime> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    if digits.len() >= 12 {
        NaiveDateTime::parse_from_str(&digits[..12], "%Y%m%d%H%M").ok()
    } else if digits.len() >= 8 {
        NaiveDate::parse_from_str(&digits[..8], "%Y%m%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    } else {
        None
    }
}

fn first_datetime(item: &JsonValue, names: &[&str]) -> Option<NaiveDateTime> {
    first_text(item, names).and_then(|s| parse_compact_datetime(&s))
}

fn bid_identity(item: &JsonValue) -> Option<(String, String)> {
    let bid_no = first_text(item, BID_NO)?;
    let ord = first_text(item, BID_ORD).unwrap_or_else(|| "1".to_string());
    Some((bid_no, normalize_ord(&ord)))
}

/// Normalize `items` into a list of record objects: `[..]`, `{"item": [..]}`, `{"item": {..}}`.
pub fn item_list(items: Option<&JsonValue>) -> Vec<&JsonValue> {
    match items {
        Some(JsonValue::Array(list)) => list.iter().filter(|v| v.is_object()).collect(),
        Some(JsonValue::Object(map)) => match map.get("item") {
            Some(JsonValue::Array(list)) => list.iter().filter(|v| v.is_object()).collect(),
            Some(single @ JsonValue::Object(_)) => vec![single],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Items without a bid number come back with an empty `bid_no` so `enrich_notices` counts them
/// as dropped.
pub fn extract_notice_rows(page: &RawPage, work_type: WorkType) -> Vec<NoticeRow> {
    page.items()
        .into_iter()
        .map(|item| {
            let (bid_no, ord) = bid_identity(item).unwrap_or_default();
            NoticeRow {
                bid_no,
                ord,
                base_amount: first_amount(item, BASE_AMOUNT).unwrap_or(0).max(0),
                range_low: first_fraction(item, RANGE_LOW),
                range_high: first_fraction(item, RANGE_HIGH),
                lower_rate: first_fraction(item, &["sucsfbidLwltRate", "lwltRate"]),
                owner_id: first_text(item, &["dminsttCd", "asignBdgtInsttCd", "insttCd", "ownerId"])
                    .unwrap_or_default(),
                work_type: work_type.api_suffix().to_string(),
                announced_at: first_datetime(item, &["bidNtceDt", "ntceDt", "rgstDt"]),
                vat_included: true,
            }
        })
        .collect()
}

/// Candidates without a component number are numbered `1..N` within their (bid, ord) group.
pub fn extract_prep_price_rows(page: &RawPage) -> Vec<PrepPriceRow> {
    let mut seen: HashMap<(String, String), i32> = HashMap::new();
    let mut rows = Vec::new();
    for item in page.items() {
        let Some((bid_no, ord)) = bid_identity(item) else {
            continue;
        };
        let group = seen.entry((bid_no.clone(), ord.clone())).or_insert(0);
        *group += 1;
        let comp_sno = first_i32(
            item,
            &["compnoRsrvtnPrceSno", "compSno", "compNo", "rsrvtnPrceSno", "sno"],
        )
        .filter(|sno| *sno > 0)
        .unwrap_or(*group);

        rows.push(PrepPriceRow {
            bid_no,
            ord,
            comp_sno,
            bsis_plnprc: first_amount(item, &["bsisPlnprc", "rsrvtnPrce", "bsisPlnprcAmt", "rsrvtnAmt"])
                .unwrap_or(0),
            drawn_flag: first_flag(item, &["drwtYn", "drawYn"]),
            draw_seq: first_i32(item, &["drwtNum", "drwtOrdr", "drawSeq"]),
            final_plnprc: first_amount(item, &["plnprc", "finalPlnprc", "fnlPlnprc"]),
        });
    }
    rows
}

pub fn extract_result_rows(page: &RawPage) -> Vec<OpeningResultRow> {
    page.items()
        .into_iter()
        .filter_map(|item| {
            let (bid_no, ord) = bid_identity(item)?;
            Some(OpeningResultRow {
                bid_no,
                ord,
                est_price: first_amount(
                    item,
                    &["estmtPrice", "estPrice", "prdprc", "eprc", "esttPric", "esttAmt"],
                ),
                presmpt_price: first_amount(item, &["presmptPrce", "presmptPrice", "prcmp", "prsmptPrc"]),
                bidders_cnt: first_i32(item, &["opengBddprcnt", "bidderCnt", "prtcptCnum"]),
                rebid_flag: first_flag(item, &["rbidYn", "reBidYn", "rebdYn"]),
                rl_openg_dt: first_datetime(item, &["rlOpengDt", "opengDt"]),
            })
        })
        .collect()
}

/// Entries without a positive base amount are skipped so they cannot shadow ordinal fallbacks.
pub fn extract_base_amount_map(page: &RawPage) -> BaseAmountMap {
    let mut map = BaseAmountMap::new();
    for item in page.items() {
        let Some((bid_no, ord)) = bid_identity(item) else {
            continue;
        };
        let base = first_amount(item, BASE_AMOUNT).unwrap_or(0);
        if base <= 0 {
            continue;
        }
        map.insert(
            NoticeKey::new(bid_no, &ord),
            BaseAmountHit {
                base,
                low: first_fraction(item, RANGE_LOW),
                high: first_fraction(item, RANGE_HIGH),
                open_dt: first_text(item, &["bssamtOpenDt", "opengDt"]),
            },
        );
    }
    map
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichedNotices {
    pub rows: Vec<NoticeRow>,
    pub filled: usize,
    pub dropped: usize,
}

/// Fill missing base amounts from `map`, then apply the data-quality filter.
pub fn enrich_notices(rows: Vec<NoticeRow>, map: &BaseAmountMap, keep_without_base: bool) -> EnrichedNotices {
    let mut out = EnrichedNotices::default();
    for mut row in rows {
        if row.bid_no.trim().is_empty() {
            out.dropped += 1;
            continue;
        }
        if !row.has_base_amount() {
            if let Some(hit) = map.lookup(&row.key()) {
                if row.apply_base_amount(hit) {
                    out.filled += 1;
                }
            }
        }
        if row.has_base_amount() || keep_without_base {
            out.rows.push(row);
        } else {
            out.dropped += 1;
        }
    }
    out
}
