//! Test-progress journal enabling resume after a crash
//!
//! A single JSON file (`variables.json` by convention) holds the five-field
//! progress record. Every write replaces the whole file through a temp file
//! and an atomic rename, so a crash mid-write can lose the latest update but
//! never corrupt the previous consistent record. A missing or malformed file
//! yields empty defaults (fresh run).

use crate::error::{Result, TorrError};
use crate::logging::get_logger;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// The persisted progress record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// A cyclic test is in flight and may be resumed
    #[serde(default)]
    pub resume: bool,

    /// The raw start command of the in-flight cyclic test
    #[serde(default = "empty_object")]
    pub command: serde_json::Value,

    /// Index of the last completed test in the sequence
    #[serde(default)]
    pub current_test_index: i64,

    /// Cycle the in-flight test reached last
    #[serde(default)]
    pub cycle_index: u32,

    /// Last user inputs, republished for UI prefill
    #[serde(default = "empty_object")]
    pub current_inputs: serde_json::Value,
}

impl Default for JournalRecord {
    fn default() -> Self {
        Self {
            resume: false,
            command: empty_object(),
            current_test_index: 0,
            cycle_index: 0,
            current_inputs: empty_object(),
        }
    }
}

/// Journal manager; the file is open only for the duration of one read or
/// write.
pub struct Journal {
    path: PathBuf,
    record: JournalRecord,
    logger: crate::logging::StructuredLogger,
}

impl Journal {
    /// Open the journal, falling back to defaults when the file is missing
    /// or unreadable.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let logger = get_logger("journal");
        let path = path.as_ref().to_path_buf();

        let record = match Self::load(&path) {
            Ok(Some(record)) => {
                logger.info(&format!("Loaded journal from {}", path.display()));
                record
            }
            Ok(None) => {
                logger.info("No journal file found, starting fresh");
                JournalRecord::default()
            }
            Err(e) => {
                logger.error(&format!("Journal unreadable, starting fresh: {}", e));
                JournalRecord::default()
            }
        };

        Self {
            path,
            record,
            logger,
        }
    }

    fn load(path: &Path) -> Result<Option<JournalRecord>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        let record: JournalRecord = serde_json::from_str(&contents)?;
        Ok(Some(record))
    }

    /// Current record
    pub fn record(&self) -> &JournalRecord {
        &self.record
    }

    /// Apply a mutation and commit the whole record to disk.
    ///
    /// The in-memory record is updated even when the disk write fails, so a
    /// running test keeps its progress; the caller decides whether a failed
    /// commit is fatal (it never is for the workflow, per the error policy).
    pub fn update<F: FnOnce(&mut JournalRecord)>(&mut self, mutate: F) -> Result<()> {
        mutate(&mut self.record);
        self.commit()
    }

    fn commit(&self) -> Result<()> {
        let contents = serde_json::to_string(&self.record)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)
            .map_err(|e| TorrError::journal(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| TorrError::journal(format!("rename into {}: {}", self.path.display(), e)))?;

        self.logger.debug("Committed journal record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_record_values() {
        let r = JournalRecord::default();
        assert!(!r.resume);
        assert_eq!(r.current_test_index, 0);
        assert_eq!(r.cycle_index, 0);
        assert_eq!(r.command, json!({}));
        assert_eq!(r.current_inputs, json!({}));
    }

    #[test]
    fn missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path().join("variables.json"));
        assert_eq!(*journal.record(), JournalRecord::default());
    }

    #[test]
    fn malformed_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("variables.json");
        std::fs::write(&path, "{ not json").unwrap();
        let journal = Journal::open(&path);
        assert_eq!(*journal.record(), JournalRecord::default());
    }

    #[test]
    fn update_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("variables.json");

        let mut journal = Journal::open(&path);
        journal
            .update(|r| {
                r.resume = true;
                r.command = json!({"command": "start", "mode": "cyclic", "cycles": 3});
                r.cycle_index = 1;
                r.current_test_index = 7;
            })
            .unwrap();

        let reloaded = Journal::open(&path);
        assert!(reloaded.record().resume);
        assert_eq!(reloaded.record().cycle_index, 1);
        assert_eq!(reloaded.record().current_test_index, 7);
        assert_eq!(reloaded.record().command["cycles"], json!(3));
    }

    #[test]
    fn partial_records_fill_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("variables.json");
        std::fs::write(&path, r#"{"resume": true, "cycle_index": 2}"#).unwrap();

        let journal = Journal::open(&path);
        assert!(journal.record().resume);
        assert_eq!(journal.record().cycle_index, 2);
        assert_eq!(journal.record().current_test_index, 0);
        assert_eq!(journal.record().command, json!({}));
    }

    #[test]
    fn commit_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("variables.json");

        let mut journal = Journal::open(&path);
        journal.update(|r| r.cycle_index = 5).unwrap();
        journal.update(|r| r.cycle_index = 6).unwrap();

        // No temp file left behind, and the file parses as one record
        assert!(!path.with_extension("json.tmp").exists());
        let reloaded = Journal::open(&path);
        assert_eq!(reloaded.record().cycle_index, 6);
    }
}
