//! Durable local queue for undelivered trail records.
//!
//! One JSON object per line, appended when delivery fails and drained by
//! [`DurableQueue::flush`]. Every operation here is best-effort: the queue
//! must never raise into the pipeline it observes, so I/O errors are
//! deliberately swallowed (logged at debug level).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::now_ms;

/// One buffered delivery: the logical destination path and the exact payload
/// that was going to be sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRecord {
    pub path: String,
    pub payload: Value,
    pub queued_at_ms: i64,
}

/// Append-only queue file with a crude size cap: once the file grows past
/// `max_bytes`, the oldest half of its lines is dropped before the next
/// append. Recent records are preserved over old ones.
pub struct DurableQueue {
    path: PathBuf,
    max_bytes: u64,
    // At most one enqueue/flush in flight per queue file.
    lock: Mutex<()>,
}

impl DurableQueue {
    pub fn new(path: PathBuf, max_bytes: u64) -> Self {
        Self {
            path,
            max_bytes,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Appends one record. Never raises; filesystem errors are swallowed.
    pub fn enqueue(&self, target_path: &str, payload: Value) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.try_enqueue(target_path, payload) {
            log::debug!("[TRAIL] queue append failed (dropping record): {}", e);
        }
    }

    fn try_enqueue(&self, target_path: &str, payload: Value) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Crude size cap: drop the oldest half of lines before appending.
        if let Ok(meta) = fs::metadata(&self.path) {
            if meta.len() > self.max_bytes {
                let text = fs::read_to_string(&self.path)?;
                let lines: Vec<&str> = text.lines().collect();
                let keep = &lines[lines.len() / 2..];
                let mut rewritten = keep.join("\n");
                if !rewritten.is_empty() {
                    rewritten.push('\n');
                }
                fs::write(&self.path, rewritten)?;
            }
        }

        let record = QueuedRecord {
            path: target_path.to_string(),
            payload,
            queued_at_ms: now_ms(),
        };
        let line = serde_json::to_string(&record).map_err(std::io::Error::other)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Re-attempts delivery for up to `limit` queued records in file order.
    /// Records whose delivery still fails stay queued in their relative
    /// order, together with anything beyond the limit; the file is removed
    /// once fully drained. Returns the number of records delivered.
    pub fn flush<F>(&self, limit: usize, mut deliver: F) -> usize
    where
        F: FnMut(&str, &Value) -> Result<(), String>,
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        if !self.path.exists() {
            return 0;
        }
        let Ok(text) = fs::read_to_string(&self.path) else {
            return 0;
        };

        let mut remaining: Vec<&str> = Vec::new();
        let mut sent = 0usize;

        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if sent >= limit {
                remaining.push(line);
                continue;
            }
            match serde_json::from_str::<QueuedRecord>(line) {
                Ok(rec) => match deliver(&rec.path, &rec.payload) {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        log::debug!("[TRAIL] queued record re-delivery failed: {}", e);
                        remaining.push(line);
                    }
                },
                // Unparseable lines stay queued; eviction will age them out.
                Err(_) => remaining.push(line),
            }
        }

        if remaining.is_empty() {
            let _ = fs::remove_file(&self.path);
        } else {
            let mut rewritten = remaining.join("\n");
            rewritten.push('\n');
            let _ = fs::write(&self.path, rewritten);
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue_in(dir: &tempfile::TempDir, max_bytes: u64) -> DurableQueue {
        DurableQueue::new(dir.path().join("queue.jsonl"), max_bytes)
    }

    fn read_records(queue: &DurableQueue) -> Vec<QueuedRecord> {
        let text = fs::read_to_string(queue.path()).unwrap();
        text.lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_enqueue_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(&dir, 5_000_000);
        queue.enqueue("/executions", json!({"execution_id": "e1"}));
        queue.enqueue("/executions/e1/steps", json!({"step_id": "s1"}));

        let records = read_records(&queue);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "/executions");
        assert_eq!(records[1].payload["step_id"], "s1");
        assert!(records[0].queued_at_ms > 0);
    }

    #[test]
    fn test_size_cap_evicts_oldest_half() {
        let dir = tempfile::tempdir().unwrap();
        // Each record line is ~90 bytes; four lines push the file past the cap.
        let queue = queue_in(&dir, 300);
        for i in 0..4 {
            queue.enqueue("/executions", json!({"i": i, "pad": "x".repeat(40)}));
        }
        assert!(fs::metadata(queue.path()).unwrap().len() > 300);

        queue.enqueue("/executions", json!({"i": 4, "pad": "x".repeat(40)}));

        let records = read_records(&queue);
        assert_eq!(records.len(), 3);
        let ids: Vec<i64> = records
            .iter()
            .map(|r| r.payload["i"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_flush_drains_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(&dir, 5_000_000);
        for i in 0..3 {
            queue.enqueue("/executions", json!({"i": i}));
        }

        let mut delivered = Vec::new();
        let sent = queue.flush(50, |path, payload| {
            delivered.push((path.to_string(), payload["i"].as_i64().unwrap()));
            Ok(())
        });

        assert_eq!(sent, 3);
        assert_eq!(delivered.len(), 3);
        assert_eq!(delivered[0].1, 0);
        assert!(!queue.path().exists());
    }

    #[test]
    fn test_flush_respects_limit_and_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(&dir, 5_000_000);
        for i in 0..3 {
            queue.enqueue("/executions", json!({"i": i}));
        }

        let sent = queue.flush(1, |_, _| Ok(()));
        assert_eq!(sent, 1);

        let ids: Vec<i64> = read_records(&queue)
            .iter()
            .map(|r| r.payload["i"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_flush_keeps_failed_records_queued() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(&dir, 5_000_000);
        for i in 0..3 {
            queue.enqueue("/executions", json!({"i": i}));
        }

        let sent = queue.flush(50, |_, payload| {
            if payload["i"] == 1 {
                Err("collector rejected".to_string())
            } else {
                Ok(())
            }
        });

        assert_eq!(sent, 2);
        let ids: Vec<i64> = read_records(&queue)
            .iter()
            .map(|r| r.payload["i"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_flush_on_missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(&dir, 5_000_000);
        let sent = queue.flush(50, |_, _| Ok(()));
        assert_eq!(sent, 0);
    }
}
