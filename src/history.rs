//! Request history tracking for debugging and diagnostics.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::transport::Method;

/// How a recorded request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestOutcome {
    /// A response was received (any HTTP status).
    Response,
    /// The request timed out or the transport failed.
    Failure,
}

/// A recorded request in the history.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: u64,
    pub category: String,
    pub method: Method,
    pub path: String,
    pub outcome: RequestOutcome,
    pub status: Option<u16>,
    pub error: Option<String>,
    /// Seconds since history creation
    pub timestamp: f64,
}

/// Tracks the most recent requests made to one bridge.
#[derive(Debug, Clone)]
pub struct RequestHistory {
    counts: HashMap<RequestOutcome, usize>,
    categories: HashMap<String, usize>,
    last_error: Option<String>,
    start_time: Instant,
    entries: VecDeque<HistoryEntry>,
    max_entries: usize,
}

impl Default for RequestHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestHistory {
    pub const DEFAULT_MAX_ENTRIES: usize = 100;

    pub fn new() -> Self {
        Self::with_max_entries(Self::DEFAULT_MAX_ENTRIES)
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            counts: HashMap::new(),
            categories: HashMap::new(),
            last_error: None,
            start_time: Instant::now(),
            entries: VecDeque::new(),
            max_entries,
        }
    }

    /// Record a request that received a response.
    pub fn record_response(
        &mut self,
        id: u64,
        category: &str,
        method: Method,
        path: &str,
        status: u16,
    ) {
        self.push(HistoryEntry {
            id,
            category: category.to_string(),
            method,
            path: path.to_string(),
            outcome: RequestOutcome::Response,
            status: Some(status),
            error: None,
            timestamp: self.start_time.elapsed().as_secs_f64(),
        });
    }

    /// Record a request that failed without a response.
    pub fn record_failure(
        &mut self,
        id: u64,
        category: &str,
        method: Method,
        path: &str,
        error: &str,
    ) {
        self.last_error = Some(error.to_string());
        self.push(HistoryEntry {
            id,
            category: category.to_string(),
            method,
            path: path.to_string(),
            outcome: RequestOutcome::Failure,
            status: None,
            error: Some(error.to_string()),
            timestamp: self.start_time.elapsed().as_secs_f64(),
        });
    }

    fn push(&mut self, entry: HistoryEntry) {
        *self.counts.entry(entry.outcome).or_default() += 1;
        *self.categories.entry(entry.category.clone()).or_default() += 1;

        self.entries.push_back(entry);
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.categories.clear();
        self.entries.clear();
        self.last_error = None;
    }

    pub fn summary(&self) -> HistorySummary {
        let count = |o: RequestOutcome| self.counts.get(&o).copied().unwrap_or(0);
        HistorySummary {
            response_count: count(RequestOutcome::Response),
            failure_count: count(RequestOutcome::Failure),
            per_category: self.categories.clone(),
            total_entries: self.entries.len(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Summary of request history for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySummary {
    pub response_count: usize,
    pub failure_count: usize,
    pub per_category: HashMap<String, usize>,
    pub total_entries: usize,
    pub last_error: Option<String>,
}
