//! Structured progress events and their sinks.

use std::sync::Mutex;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: Uuid,
        buckets: usize,
        streams: Vec<String>,
    },
    Probed {
        stream: String,
        bucket: NaiveDate,
        total_count: u64,
        total_pages: u32,
    },
    ProbeFailed {
        stream: String,
        bucket: NaiveDate,
        attempts: u32,
        error: String,
    },
    BucketEmpty {
        stream: String,
        bucket: NaiveDate,
    },
    AlreadyComplete {
        stream: String,
        bucket: NaiveDate,
        last_page: u32,
        total_pages: u32,
    },
    EnrichmentUnavailable {
        stream: String,
        bucket: NaiveDate,
        error: String,
    },
    PageCompleted {
        stream: String,
        bucket: NaiveDate,
        page: u32,
        total_pages: u32,
        fetched: usize,
        persisted: usize,
        /// False while an earlier page of this bucket is failed, which pins the watermark.
        advanced: bool,
    },
    PageFailed {
        stream: String,
        bucket: NaiveDate,
        page: u32,
        total_pages: u32,
        attempts: u32,
        fatal: bool,
        error: String,
    },
    EarlyStop {
        stream: String,
        bucket: NaiveDate,
        page: u32,
        empty_streak: u32,
    },
    Cancelled {
        stream: Option<String>,
        bucket: Option<NaiveDate>,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Writes every event as a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

fn percent(page: u32, total_pages: u32) -> f64 {
    if total_pages == 0 {
        return 100.0;
    }
    (f64::from(page) * 1000.0 / f64::from(total_pages)).round() / 10.0
}

impl ProgressReporter for TracingReporter {
    fn report(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::RunStarted {
                run_id,
                buckets,
                streams,
            } => info!(%run_id, buckets, streams = %streams.join(","), "backfill started"),
            ProgressEvent::Probed {
                stream,
                bucket,
                total_count,
                total_pages,
            } => info!(stream = %stream, %bucket, total_count, total_pages, "probed"),
            ProgressEvent::ProbeFailed {
                stream,
                bucket,
                attempts,
                error,
            } => warn!(stream = %stream, %bucket, attempts, %error, "probe failed; bucket left for next run"),
            ProgressEvent::BucketEmpty { stream, bucket } => info!(stream = %stream, %bucket, "no records; skipped"),
            ProgressEvent::AlreadyComplete {
                stream,
                bucket,
                last_page,
                total_pages,
            } => info!(stream = %stream, %bucket, last_page, total_pages, "already complete"),
            ProgressEvent::EnrichmentUnavailable { stream, bucket, error } => {
                warn!(stream = %stream, %bucket, %error, "base amount map unavailable; continuing without it")
            }
            ProgressEvent::PageCompleted {
                stream,
                bucket,
                page,
                total_pages,
                fetched,
                persisted,
                advanced,
            } => info!(
                stream = %stream,
                %bucket,
                page,
                total_pages,
                percent = percent(*page, *total_pages),
                fetched,
                persisted,
                advanced,
                "page done"
            ),
            ProgressEvent::PageFailed {
                stream,
                bucket,
                page,
                total_pages,
                attempts,
                fatal,
                error,
            } => warn!(
                stream = %stream,
                %bucket,
                page,
                total_pages,
                attempts,
                fatal,
                %error,
                "page skipped after failure"
            ),
            ProgressEvent::EarlyStop {
                stream,
                bucket,
                page,
                empty_streak,
            } => info!(stream = %stream, %bucket, page, empty_streak, "consecutive empty pages; ending bucket"),
            ProgressEvent::Cancelled { stream, bucket } => warn!(
                stream = stream.as_deref().unwrap_or("-"),
                bucket = ?bucket,
                "cancelled"
            ),
        }
    }
}

/// Keeps every event in memory, optionally forwarding to another reporter.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<ProgressEvent>>,
    forward: Option<Box<dyn ProgressReporter>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarding_to(reporter: Box<dyn ProgressReporter>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            forward: Some(reporter),
        }
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn completed_pages(&self, stream: &str) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::PageCompleted { stream: s, page, .. } if s == stream => Some(page),
                _ => None,
            })
            .collect()
    }

    pub fn failed_pages(&self, stream: &str) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::PageFailed { stream: s, page, .. } if s == stream => Some(page),
                _ => None,
            })
            .collect()
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        if let Some(forward) = &self.forward {
            forward.report(event);
        }
    }
}
