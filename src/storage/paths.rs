// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Path layout for durable framework data.
//!
//! ```text
//! {root}/
//!   operations.redb            # transactional store
//!   audit/
//!     {date}/events.jsonl      # every audit record
//!     critical/{date}.jsonl    # high-priority copy of critical records
//! ```

use std::path::{Path, PathBuf};

/// Default root when `OPGUARD_DATA_DIR` is unset.
pub const DATA_ROOT: &str = "/var/lib/opguard";

/// Storage path utilities.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::new(DATA_ROOT)
    }
}

impl StoragePaths {
    /// Create a new StoragePaths with a custom root (useful for testing).
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// redb file holding operation side effects.
    pub fn database_file(&self) -> PathBuf {
        self.root.join("operations.redb")
    }

    // ========== Audit Paths ==========

    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    /// Daily audit log (JSONL).
    pub fn audit_events_file(&self, date: &str) -> PathBuf {
        self.audit_dir().join(date).join("events.jsonl")
    }

    pub fn critical_dir(&self) -> PathBuf {
        self.audit_dir().join("critical")
    }

    /// Daily high-priority log of critical records (JSONL).
    pub fn critical_events_file(&self, date: &str) -> PathBuf {
        self.critical_dir().join(format!("{date}.jsonl"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_root() {
        let paths = StoragePaths::default();
        assert_eq!(paths.root(), Path::new(DATA_ROOT));
    }

    #[test]
    fn audit_layout() {
        let paths = StoragePaths::new("/tmp/opguard");
        assert_eq!(
            paths.audit_events_file("2026-01-31"),
            PathBuf::from("/tmp/opguard/audit/2026-01-31/events.jsonl")
        );
        assert_eq!(
            paths.critical_events_file("2026-01-31"),
            PathBuf::from("/tmp/opguard/audit/critical/2026-01-31.jsonl")
        );
        assert_eq!(
            paths.database_file(),
            PathBuf::from("/tmp/opguard/operations.redb")
        );
    }
}
