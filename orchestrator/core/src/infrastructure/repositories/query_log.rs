// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Bounded in-memory log of repository queries, fed by [`QueryTimer`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::domain::errors::RepositoryError;

const DEFAULT_CAPACITY: usize = 1000;
const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: QueryLevel,
    pub entity: String,
    pub operation: String,
    pub query: String,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryLogFilter {
    pub entity: Option<String>,
    pub operation: Option<String>,
    pub level: Option<QueryLevel>,
    pub user_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl QueryLogFilter {
    fn matches(&self, entry: &QueryLogEntry) -> bool {
        self.entity.as_ref().is_none_or(|e| &entry.entity == e)
            && self.operation.as_ref().is_none_or(|o| &entry.operation == o)
            && self.level.is_none_or(|l| entry.level == l)
            && self
                .user_id
                .as_ref()
                .is_none_or(|u| entry.user_id.as_ref() == Some(u))
            && self.since.is_none_or(|since| entry.timestamp >= since)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub count: usize,
    pub failures: usize,
    pub average_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    pub total: usize,
    pub failures: usize,
    pub average_ms: f64,
    pub max_ms: u64,
    pub by_operation: BTreeMap<String, OperationStats>,
}

#[derive(Debug)]
pub struct QueryLog {
    entries: Mutex<VecDeque<QueryLogEntry>>,
    capacity: usize,
    enabled: AtomicBool,
    slow_threshold: Duration,
}

impl Default for QueryLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl QueryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
            enabled: AtomicBool::new(true),
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
        }
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    pub fn record(&self, entry: QueryLogEntry) {
        if !self.is_enabled() || self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Matching entries, oldest first.
    pub fn entries(&self, filter: &QueryLogFilter) -> Vec<QueryLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn slow_queries(&self, threshold: Duration) -> Vec<QueryLogEntry> {
        let threshold_ms = threshold.as_millis() as u64;
        self.entries
            .lock()
            .iter()
            .filter(|e| e.duration_ms >= threshold_ms)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> QueryStats {
        let entries = self.entries.lock();
        if entries.is_empty() {
            return QueryStats::default();
        }

        let mut stats = QueryStats {
            total: entries.len(),
            ..QueryStats::default()
        };
        let mut total_ms = 0u64;
        let mut per_op_ms: BTreeMap<String, u64> = BTreeMap::new();

        for entry in entries.iter() {
            total_ms += entry.duration_ms;
            stats.max_ms = stats.max_ms.max(entry.duration_ms);
            let failed = entry.level == QueryLevel::Error;
            if failed {
                stats.failures += 1;
            }
            let op = stats.by_operation.entry(entry.operation.clone()).or_default();
            op.count += 1;
            if failed {
                op.failures += 1;
            }
            *per_op_ms.entry(entry.operation.clone()).or_default() += entry.duration_ms;
        }

        stats.average_ms = total_ms as f64 / stats.total as f64;
        for (operation, op) in stats.by_operation.iter_mut() {
            let sum = per_op_ms.get(operation).copied().unwrap_or_default();
            op.average_ms = sum as f64 / op.count as f64;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Times one repository call and reports it to tracing, metrics and the
/// query log.
pub struct QueryTimer {
    log: Arc<QueryLog>,
    entity: String,
    operation: &'static str,
    query: String,
    user_id: Option<String>,
    started: Instant,
}

impl QueryTimer {
    pub fn start(
        log: Arc<QueryLog>,
        entity: &str,
        operation: &'static str,
        query: String,
        user_id: Option<String>,
    ) -> Self {
        Self {
            log,
            entity: entity.to_string(),
            operation,
            query,
            user_id,
            started: Instant::now(),
        }
    }

    /// Record the outcome and hand the result back unchanged.
    pub fn finish<R>(self, result: Result<R, RepositoryError>) -> Result<R, RepositoryError> {
        let elapsed = self.started.elapsed();
        let duration_ms = elapsed.as_millis() as u64;

        metrics::histogram!(
            "docforge_repository_query_duration_seconds",
            "entity" => self.entity.clone(),
            "operation" => self.operation,
            "success" => if result.is_ok() { "true" } else { "false" }
        )
        .record(elapsed.as_secs_f64());

        let (level, error) = match &result {
            Ok(_) if elapsed >= self.log.slow_threshold() => {
                warn!(
                    entity = %self.entity,
                    operation = self.operation,
                    duration_ms,
                    query = %self.query,
                    "Slow repository query"
                );
                (QueryLevel::Warn, None)
            }
            Ok(_) => {
                debug!(
                    entity = %self.entity,
                    operation = self.operation,
                    duration_ms,
                    "Repository query succeeded"
                );
                (QueryLevel::Info, None)
            }
            Err(e) => {
                warn!(
                    entity = %self.entity,
                    operation = self.operation,
                    duration_ms,
                    kind = %e.kind(),
                    error = %e,
                    "Repository query failed"
                );
                (QueryLevel::Error, Some(e.to_string()))
            }
        };

        self.log.record(QueryLogEntry {
            timestamp: Utc::now(),
            level,
            entity: self.entity,
            operation: self.operation.to_string(),
            query: self.query,
            duration_ms,
            error,
            user_id: self.user_id,
        });

        result
    }
}
