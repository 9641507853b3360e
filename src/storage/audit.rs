// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Append-only storage for audit records.
//!
//! Every executed operation, every security-gate rejection and every cache
//! integrity mismatch ends up here. Records are never rewritten: stores only
//! expose append and read.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::StoragePaths;
use crate::error::Severity;

/// Outcome class of an audited event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Security,
}

/// An audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    /// Unique record ID.
    pub record_id: String,
    /// Operation this record belongs to, if any.
    pub operation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// User who triggered the event (if known).
    pub actor: Option<String>,
    /// Operation type or security event kind.
    pub action: String,
    /// Resource affected (`kind/id`).
    pub resource: Option<String>,
    pub outcome: AuditOutcome,
    pub severity: Severity,
    /// Request origin (IP address or service name).
    pub origin: Option<String>,
    /// SHA-256 of the operation context.
    pub context_hash: Option<String>,
    pub duration_ms: Option<u64>,
    pub error_code: Option<String>,
    /// Additional details as JSON (already redacted).
    pub details: Option<serde_json::Value>,
}

impl AuditRecord {
    pub fn new(action: impl Into<String>, outcome: AuditOutcome, severity: Severity) -> Self {
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            operation_id: None,
            timestamp: Utc::now(),
            actor: None,
            action: action.into(),
            resource: None,
            outcome,
            severity,
            origin: None,
            context_hash: None,
            duration_ms: None,
            error_code: None,
            details: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_operation(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_context_hash(mut self, hash: impl Into<String>) -> Self {
        self.context_hash = Some(hash.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    fn date(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }
}

/// Error type for audit store operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("audit store unavailable: {0}")]
    Unavailable(String),
}

pub type AuditStoreResult<T> = Result<T, AuditStoreError>;

/// Durable sink for audit records.
pub trait AuditStore: Send + Sync {
    /// Append to the main log.
    fn append(&self, record: &AuditRecord) -> AuditStoreResult<()>;

    /// Append to the high-priority log. Called in addition to [`AuditStore::append`].
    fn append_critical(&self, record: &AuditRecord) -> AuditStoreResult<()>;
}

// =============================================================================
// JSONL files
// =============================================================================

/// Audit store writing one JSONL file per UTC day.
#[derive(Debug)]
pub struct JsonlAuditStore {
    paths: StoragePaths,
    // Serializes appends from this process so lines never interleave.
    write_lock: Mutex<()>,
}

impl JsonlAuditStore {
    /// Create the store, making sure the audit directories exist.
    pub fn open(paths: StoragePaths) -> AuditStoreResult<Self> {
        fs::create_dir_all(paths.audit_dir())?;
        fs::create_dir_all(paths.critical_dir())?;
        Ok(Self {
            paths,
            write_lock: Mutex::new(()),
        })
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    fn append_line(&self, path: &std::path::Path, record: &AuditRecord) -> AuditStoreResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| AuditStoreError::Unavailable("audit write lock poisoned".to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    fn read_file(path: &std::path::Path) -> AuditStoreResult<Vec<AuditRecord>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping unreadable audit line"
                ),
            }
        }
        Ok(records)
    }

    /// Read audit records for a specific date (`YYYY-MM-DD`).
    pub fn read_events(&self, date: &str) -> AuditStoreResult<Vec<AuditRecord>> {
        Self::read_file(&self.paths.audit_events_file(date))
    }

    /// Read critical records for a specific date.
    pub fn read_critical(&self, date: &str) -> AuditStoreResult<Vec<AuditRecord>> {
        Self::read_file(&self.paths.critical_events_file(date))
    }

    /// Read records for an inclusive date range.
    pub fn read_events_range(
        &self,
        start_date: &str,
        end_date: &str,
    ) -> AuditStoreResult<Vec<AuditRecord>> {
        let start = NaiveDate::parse_from_str(start_date, "%Y-%m-%d")
            .map_err(|e| AuditStoreError::InvalidDate(format!("{start_date}: {e}")))?;
        let end = NaiveDate::parse_from_str(end_date, "%Y-%m-%d")
            .map_err(|e| AuditStoreError::InvalidDate(format!("{end_date}: {e}")))?;

        let mut all = Vec::new();
        let mut current = start;
        while current <= end {
            all.extend(self.read_events(&current.format("%Y-%m-%d").to_string())?);
            current = current
                .succ_opt()
                .ok_or_else(|| AuditStoreError::InvalidDate("date overflow".to_string()))?;
        }
        Ok(all)
    }

    /// Records of one actor on a given date.
    pub fn search_by_actor(&self, actor: &str, date: &str) -> AuditStoreResult<Vec<AuditRecord>> {
        Ok(self
            .read_events(date)?
            .into_iter()
            .filter(|r| r.actor.as_deref() == Some(actor))
            .collect())
    }

    /// Records touching one resource on a given date.
    pub fn search_by_resource(
        &self,
        resource: &str,
        date: &str,
    ) -> AuditStoreResult<Vec<AuditRecord>> {
        Ok(self
            .read_events(date)?
            .into_iter()
            .filter(|r| r.resource.as_deref() == Some(resource))
            .collect())
    }
}

impl AuditStore for JsonlAuditStore {
    fn append(&self, record: &AuditRecord) -> AuditStoreResult<()> {
        let path = self.paths.audit_events_file(&record.date());
        self.append_line(&path, record)
    }

    fn append_critical(&self, record: &AuditRecord) -> AuditStoreResult<()> {
        let path = self.paths.critical_events_file(&record.date());
        self.append_line(&path, record)
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Audit store kept in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
    critical: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn critical_records(&self) -> Vec<AuditRecord> {
        self.critical.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Records with the given outcome.
    pub fn with_outcome(&self, outcome: AuditOutcome) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.outcome == outcome)
            .collect()
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, record: &AuditRecord) -> AuditStoreResult<()> {
        self.records
            .lock()
            .map_err(|_| AuditStoreError::Unavailable("memory audit lock poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }

    fn append_critical(&self, record: &AuditRecord) -> AuditStoreResult<()> {
        self.critical
            .lock()
            .map_err(|_| AuditStoreError::Unavailable("memory audit lock poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, JsonlAuditStore) {
        let temp = TempDir::new().unwrap();
        let store = JsonlAuditStore::open(StoragePaths::new(temp.path())).unwrap();
        (temp, store)
    }

    fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    #[test]
    fn builder_sets_fields() {
        let record = AuditRecord::new("content.create", AuditOutcome::Failure, Severity::Warning)
            .with_operation("op-1")
            .with_actor("user_123")
            .with_resource("content/42")
            .with_origin("10.0.0.1")
            .with_error_code("unauthorized");

        assert_eq!(record.operation_id.as_deref(), Some("op-1"));
        assert_eq!(record.actor.as_deref(), Some("user_123"));
        assert_eq!(record.resource.as_deref(), Some("content/42"));
        assert_eq!(record.error_code.as_deref(), Some("unauthorized"));
        assert!(!record.is_critical());
    }

    #[test]
    fn log_and_read_events() {
        let (_temp, store) = setup();

        let first = AuditRecord::new("content.create", AuditOutcome::Success, Severity::Info)
            .with_actor("user_1");
        let second = AuditRecord::new("media.delete", AuditOutcome::Failure, Severity::Warning)
            .with_actor("user_2");

        store.append(&first).unwrap();
        store.append(&second).unwrap();

        let events = store.read_events(&today()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], first);
        assert_eq!(events[1].action, "media.delete");
    }

    #[test]
    fn torn_line_does_not_hide_the_day() {
        let (_temp, store) = setup();
        let first = AuditRecord::new("content.create", AuditOutcome::Success, Severity::Info);
        store.append(&first).unwrap();

        let path = store.paths().audit_events_file(&today());
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"timestamp\":\"2026-\n").unwrap();
        drop(file);

        let second = AuditRecord::new("content.update", AuditOutcome::Success, Severity::Info);
        store.append(&second).unwrap();

        let events = store.read_events(&today()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], first);
        assert_eq!(events[1].action, "content.update");
    }

    #[test]
    fn critical_records_go_to_their_own_file() {
        let (_temp, store) = setup();
        let record =
            AuditRecord::new("lockout_entered", AuditOutcome::Security, Severity::Critical);
        store.append(&record).unwrap();
        store.append_critical(&record).unwrap();

        assert_eq!(store.read_events(&today()).unwrap().len(), 1);
        let critical = store.read_critical(&today()).unwrap();
        assert_eq!(critical.len(), 1);
        assert!(critical[0].is_critical());
    }

    #[test]
    fn missing_day_reads_empty() {
        let (_temp, store) = setup();
        assert!(store.read_events("1999-01-01").unwrap().is_empty());
    }

    #[test]
    fn range_spans_days() {
        let (_temp, store) = setup();
        let day1 = NaiveDate::from_ymd_opt(2026, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc();
        let day3 = NaiveDate::from_ymd_opt(2026, 3, 3)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc();

        store
            .append(&AuditRecord::new("a", AuditOutcome::Success, Severity::Info).at(day1))
            .unwrap();
        store
            .append(&AuditRecord::new("b", AuditOutcome::Success, Severity::Info).at(day3))
            .unwrap();

        let all = store.read_events_range("2026-03-01", "2026-03-03").unwrap();
        assert_eq!(all.len(), 2);
        assert!(matches!(
            store.read_events_range("nope", "2026-03-03"),
            Err(AuditStoreError::InvalidDate(_))
        ));
    }

    #[test]
    fn search_by_actor_and_resource() {
        let (_temp, store) = setup();
        store
            .append(
                &AuditRecord::new("content.update", AuditOutcome::Success, Severity::Info)
                    .with_actor("target")
                    .with_resource("content/1"),
            )
            .unwrap();
        store
            .append(
                &AuditRecord::new("content.update", AuditOutcome::Success, Severity::Info)
                    .with_actor("other")
                    .with_resource("content/1"),
            )
            .unwrap();

        assert_eq!(store.search_by_actor("target", &today()).unwrap().len(), 1);
        assert_eq!(
            store.search_by_resource("content/1", &today()).unwrap().len(),
            2
        );
    }

    #[test]
    fn memory_store_filters_by_outcome() {
        let store = MemoryAuditStore::new();
        store
            .append(&AuditRecord::new("a", AuditOutcome::Success, Severity::Info))
            .unwrap();
        store
            .append(&AuditRecord::new("b", AuditOutcome::Security, Severity::Warning))
            .unwrap();

        assert_eq!(store.records().len(), 2);
        assert_eq!(store.with_outcome(AuditOutcome::Security).len(), 1);
        assert!(store.critical_records().is_empty());
    }
}
