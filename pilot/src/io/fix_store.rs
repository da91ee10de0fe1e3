//! Append-only JSON-lines log backing the fix registry.
//!
//! Every change appends the full record as one line; on load later lines win.
//! The log is rewritten atomically once it carries far more lines than live
//! records.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::fix_registry::ErrorRecord;
use crate::io::config::write_atomic;

/// Handle to the on-disk log.
#[derive(Debug)]
pub struct FixLog {
    path: PathBuf,
    lines: usize,
}

impl FixLog {
    /// Open (or create) the log and fold it into live records.
    ///
    /// Records are returned in order of their latest line, oldest first.
    /// Malformed lines are skipped.
    pub fn open(path: &Path) -> Result<(Self, Vec<ErrorRecord>)> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };

        let mut lines = 0;
        let mut latest: HashMap<String, (usize, ErrorRecord)> = HashMap::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            lines += 1;
            match serde_json::from_str::<ErrorRecord>(line) {
                Ok(record) => {
                    latest.insert(record.key(), (line_no, record));
                }
                Err(err) => {
                    warn!(path = %path.display(), line = line_no + 1, err = %err, "skipping malformed fix record");
                }
            }
        }
        let mut ordered: Vec<(usize, ErrorRecord)> = latest.into_values().collect();
        ordered.sort_by_key(|(line_no, _)| *line_no);
        let records = ordered.into_iter().map(|(_, record)| record).collect();

        debug!(path = %path.display(), lines, "loaded fix log");
        Ok((
            Self {
                path: path.to_path_buf(),
                lines,
            },
            records,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn append(&mut self, record: &ErrorRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serialize fix record")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))?;
        self.lines += 1;
        Ok(())
    }

    /// Replace the log with exactly `records` (temp file + rename).
    pub fn rewrite<'a>(&mut self, records: impl IntoIterator<Item = &'a ErrorRecord>) -> Result<()> {
        let mut buf = String::new();
        let mut count = 0;
        for record in records {
            buf.push_str(&serde_json::to_string(record).context("serialize fix record")?);
            buf.push('\n');
            count += 1;
        }
        write_atomic(&self.path, &buf)?;
        debug!(path = %self.path.display(), records = count, "compacted fix log");
        self.lines = count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sig: &str, occurrences: u64) -> ErrorRecord {
        let mut rec = ErrorRecord::new(sig, "read_file", sig);
        rec.occurrences = occurrences;
        rec
    }

    #[test]
    fn later_lines_win_and_order_follows_last_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fixes.jsonl");
        let (mut log, records) = FixLog::open(&path).expect("open");
        assert!(records.is_empty());
        log.append(&record("a", 1)).expect("append");
        log.append(&record("b", 1)).expect("append");
        log.append(&record("a", 2)).expect("append");

        let (reopened, records) = FixLog::open(&path).expect("reopen");
        assert_eq!(reopened.lines(), 3);
        let sigs: Vec<(&str, u64)> = records
            .iter()
            .map(|r| (r.signature.as_str(), r.occurrences))
            .collect();
        assert_eq!(sigs, vec![("b", 1), ("a", 2)]);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fixes.jsonl");
        let good = serde_json::to_string(&record("ok", 4)).expect("serialize");
        fs::write(&path, format!("{{not json\n{good}\n\n")).expect("write");
        let (_, records) = FixLog::open(&path).expect("open");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].occurrences, 4);
    }

    #[test]
    fn rewrite_compacts_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("fixes.jsonl");
        let (mut log, _) = FixLog::open(&path).expect("open");
        for n in 1..=4 {
            log.append(&record("a", n)).expect("append");
        }
        let live = record("a", 4);
        log.rewrite([&live]).expect("rewrite");
        assert_eq!(log.lines(), 1);
        let (_, records) = FixLog::open(&path).expect("reopen");
        assert_eq!(records, vec![live]);
    }
}
