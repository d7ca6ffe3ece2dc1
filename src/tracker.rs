//! Per-engine query statistics: outcome counters, the one-minute activity
//! window and, when enabled, a bounded history of recent transactions.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::clock::Clock;
use crate::logger::{self, BreadcrumbFlags};
use crate::resolver::{Transaction, TransactionListener, TransactionStatus};

/// Window of query timestamps kept for the activity graph.
pub const ACTIVITY_WINDOW_MS: u64 = 60_000;
pub const HISTORY_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerCounters {
    pub num_requests: u64,
    pub recent_queries: u64,
    pub send_failures: u64,
    pub http_errors: u64,
    pub bad_responses: u64,
    pub canceled: u64,
}

#[derive(Default)]
struct TrackerInner {
    num_requests: u64,
    send_failures: u64,
    http_errors: u64,
    bad_responses: u64,
    canceled: u64,
    activity: VecDeque<u64>,
    history: VecDeque<Transaction>,
    history_enabled: bool,
    last_transaction: Option<Transaction>,
}

impl TrackerInner {
    fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(ACTIVITY_WINDOW_MS);
        while self.activity.front().is_some_and(|time| *time < cutoff) {
            self.activity.pop_front();
        }
    }
}

/// Counters and recent history of resolved queries, shared between the
/// resolver (writer) and the host (reader).
pub struct QueryTracker {
    inner: Mutex<TrackerInner>,
    clock: Arc<dyn Clock>,
}

impl QueryTracker {
    pub fn new(history_enabled: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                history_enabled,
                activity: VecDeque::with_capacity(256),
                ..TrackerInner::default()
            }),
            clock,
        }
    }

    pub fn record(&self, transaction: &Transaction) {
        let now = self.clock.now_ms();
        let mut guard = self.inner.lock();
        match transaction.status {
            TransactionStatus::Complete => guard.num_requests = guard.num_requests.saturating_add(1),
            TransactionStatus::SendFail => guard.send_failures += 1,
            TransactionStatus::HttpError => guard.http_errors += 1,
            TransactionStatus::BadResponse => guard.bad_responses += 1,
            TransactionStatus::Canceled => guard.canceled += 1,
        }
        guard.activity.push_back(transaction.query_time_ms);
        guard.prune(now);
        if guard.history_enabled {
            if guard.history.len() >= HISTORY_SIZE {
                guard.history.pop_front();
            }
            guard.history.push_back(transaction.clone());
        }
        guard.last_transaction = Some(transaction.clone());
    }

    pub fn num_requests(&self) -> u64 {
        self.inner.lock().num_requests
    }

    /// Seed the request counter with a value persisted by the host.
    pub fn restore_num_requests(&self, value: u64) {
        self.inner.lock().num_requests = value;
        logger::breadcrumb(BreadcrumbFlags::DNS, format!("restored request count {value}"));
    }

    /// Queries issued at or after `since_ms`, within the activity window.
    pub fn count_queries_since(&self, since_ms: u64) -> usize {
        let now = self.clock.now_ms();
        let mut guard = self.inner.lock();
        guard.prune(now);
        guard.activity.iter().filter(|time| **time >= since_ms).count()
    }

    pub fn set_history_enabled(&self, enabled: bool) {
        let mut guard = self.inner.lock();
        guard.history_enabled = enabled;
        if !enabled {
            guard.history.clear();
        }
    }

    pub fn history_enabled(&self) -> bool {
        self.inner.lock().history_enabled
    }

    /// Oldest first.
    pub fn recent_transactions(&self) -> Vec<Transaction> {
        self.inner.lock().history.iter().cloned().collect()
    }

    pub fn last_transaction(&self) -> Option<Transaction> {
        self.inner.lock().last_transaction.clone()
    }

    pub fn counters(&self) -> TrackerCounters {
        let now = self.clock.now_ms();
        let mut guard = self.inner.lock();
        guard.prune(now);
        TrackerCounters {
            num_requests: guard.num_requests,
            recent_queries: guard.activity.len() as u64,
            send_failures: guard.send_failures,
            http_errors: guard.http_errors,
            bad_responses: guard.bad_responses,
            canceled: guard.canceled,
        }
    }
}

impl TransactionListener for QueryTracker {
    fn on_transaction(&self, transaction: &Transaction) {
        self.record(transaction);
    }
}
