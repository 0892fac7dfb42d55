//! Execution/step lifecycle and the delivery protocol.

use decision_trail_types::{ExecutionRecord, StepError, StepRecord, StepStatus};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::now_ms;
use crate::queue::DurableQueue;
use crate::redact::redact;

/// Queued records re-attempted before each fresh send. Bounds the latency a
/// single pipeline call can spend on backlog while keeping the queue from
/// growing unboundedly under intermittent connectivity.
const FLUSH_BATCH: usize = 25;

/// Client configuration. The queue path is explicit; there is no process-wide
/// default file.
#[derive(Debug, Clone)]
pub struct TrailConfig {
    pub base_url: String,
    pub app: String,
    pub timeout: Duration,
    /// When set, delivery failures are absorbed and the pipeline continues.
    /// When cleared, delivery failures propagate to the caller (the record is
    /// still queued either way).
    pub fail_open: bool,
    pub queue_path: PathBuf,
    pub max_queue_bytes: u64,
    /// Merged into every execution's tags.
    pub default_tags: Vec<String>,
}

impl TrailConfig {
    pub fn new(base_url: impl Into<String>, queue_path: impl Into<PathBuf>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            app: "app".to_string(),
            timeout: Duration::from_secs(3),
            fail_open: true,
            queue_path: queue_path.into(),
            max_queue_bytes: 5_000_000,
            default_tags: Vec::new(),
        }
    }
}

/// Tracing client. One blocking network call per execution/step submission,
/// plus up to one bounded flush batch before it; no background threads.
pub struct TrailClient {
    config: TrailConfig,
    http: reqwest::blocking::Client,
    queue: DurableQueue,
}

impl TrailClient {
    pub fn new(config: TrailConfig) -> Result<Self, String> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
        let queue = DurableQueue::new(config.queue_path.clone(), config.max_queue_bytes);
        Ok(Self {
            config,
            http,
            queue,
        })
    }

    // =====================================================
    // Execution lifecycle
    // =====================================================

    /// Starts a new execution and returns its id.
    ///
    /// The id is generated locally, so under fail-open configuration the call
    /// succeeds even when the collector is unreachable; the record is then
    /// buffered for a later flush.
    pub fn start_execution(
        &self,
        name: &str,
        metadata: Value,
        tags: &[&str],
    ) -> Result<String, String> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            name: name.to_string(),
            app: self.config.app.clone(),
            created_at_ms: now_ms(),
            metadata: redact(&metadata),
            tags: merge_tags(tags, &self.config.default_tags),
        };
        let payload =
            serde_json::to_value(&record).map_err(|e| format!("serialize failed: {}", e))?;
        self.post("/executions", payload)?;
        Ok(execution_id)
    }

    /// Begins a step and returns its scope. The start time is stamped here;
    /// dropping the scope stamps the end time, redacts the record, and
    /// submits it for delivery on every exit path.
    pub fn step(
        &self,
        execution_id: &str,
        name: &str,
        input: Value,
        tags: &[&str],
    ) -> StepScope<'_> {
        let record = StepRecord {
            step_id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            name: name.to_string(),
            status: StepStatus::Success,
            started_at_ms: now_ms(),
            ended_at_ms: 0,
            duration_ms: 0,
            input,
            output: Value::Object(serde_json::Map::new()),
            reasoning: String::new(),
            artifacts: Value::Object(serde_json::Map::new()),
            error: None,
            tags: merge_tags(tags, &[]),
        };
        StepScope {
            client: self,
            record: Some(record),
        }
    }

    /// Closure form of [`TrailClient::step`]: runs `body` inside a step
    /// scope. An `Err` from the body is recorded as a step ERROR (kind and
    /// message captured) and then returned to the caller unchanged — the
    /// instrumentation never masks a pipeline failure.
    pub fn run_step<T, E, F>(
        &self,
        execution_id: &str,
        name: &str,
        input: Value,
        tags: &[&str],
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&mut StepScope<'_>) -> Result<T, E>,
        E: std::fmt::Display,
    {
        let mut scope = self.step(execution_id, name, input, tags);
        match body(&mut scope) {
            Ok(value) => Ok(value),
            Err(e) => {
                scope.fail(std::any::type_name::<E>(), e.to_string());
                Err(e)
            }
        }
    }

    // =====================================================
    // Buffering + delivery
    // =====================================================

    /// Re-attempts up to `limit` queued records. Returns the delivered count.
    pub fn flush(&self, limit: usize) -> usize {
        self.queue.flush(limit, |path, payload| self.post_raw(path, payload))
    }

    fn post_raw(&self, path: &str, payload: &Value) -> Result<(), String> {
        let url = format!("{}{}", self.config.base_url, path);
        let response = self
            .http
            .post(&url)
            .json(payload)
            .send()
            .map_err(|e| format!("Trail delivery to {} failed: {}", path, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("Collector returned status {} for {}", status, path));
        }
        Ok(())
    }

    /// Delivery protocol: opportunistic bounded flush of the backlog, then a
    /// direct send. On failure the record is queued; fail-open absorbs the
    /// error, fail-closed propagates it.
    fn post(&self, path: &str, payload: Value) -> Result<(), String> {
        self.flush(FLUSH_BATCH);

        match self.post_raw(path, &payload) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.queue.enqueue(path, payload);
                if self.config.fail_open {
                    log::warn!("[TRAIL] delivery failed, record queued: {}", e);
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    fn deliver_step(&self, mut record: StepRecord) -> Result<(), String> {
        record.ended_at_ms = now_ms();
        record.duration_ms = record.ended_at_ms - record.started_at_ms;
        record.input = redact(&record.input);
        record.output = redact(&record.output);
        record.artifacts = redact(&record.artifacts);

        let path = format!("/executions/{}/steps", record.execution_id);
        let payload =
            serde_json::to_value(&record).map_err(|e| format!("serialize failed: {}", e))?;
        self.post(&path, payload)
    }
}

fn merge_tags(call_tags: &[&str], defaults: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for tag in call_tags
        .iter()
        .map(|t| t.to_string())
        .chain(defaults.iter().cloned())
    {
        if !tag.is_empty() && !merged.contains(&tag) {
            merged.push(tag);
        }
    }
    merged
}

// =====================================================
// Step scope
// =====================================================

/// Scoped capture handle for one step.
///
/// Dropping the scope finalizes and delivers the record: normal drops record
/// SUCCESS (unless [`StepScope::fail`] was called), drops during a panic
/// unwind record ERROR. Call [`StepScope::finish`] instead of dropping to
/// observe the delivery result under fail-closed configuration.
pub struct StepScope<'a> {
    client: &'a TrailClient,
    record: Option<StepRecord>,
}

impl StepScope<'_> {
    pub fn step_id(&self) -> &str {
        &self.record.as_ref().expect("step already finished").step_id
    }

    /// Replaces the step's output structure. Last write wins.
    pub fn set_output(&mut self, data: Value) {
        if let Some(rec) = self.record.as_mut() {
            rec.output = data;
        }
    }

    /// Replaces the reasoning text.
    pub fn set_reasoning(&mut self, text: impl Into<String>) {
        if let Some(rec) = self.record.as_mut() {
            rec.reasoning = text.into();
        }
    }

    /// Inserts or overwrites one artifact entry.
    pub fn add_artifact(&mut self, key: &str, value: Value) {
        if let Some(rec) = self.record.as_mut() {
            if !rec.artifacts.is_object() {
                rec.artifacts = Value::Object(serde_json::Map::new());
            }
            if let Some(map) = rec.artifacts.as_object_mut() {
                map.insert(key.to_string(), value);
            }
        }
    }

    /// Appends tags not already present, preserving order.
    pub fn add_tags(&mut self, tags: &[&str]) {
        if let Some(rec) = self.record.as_mut() {
            for tag in tags {
                let tag = tag.to_string();
                if !tag.is_empty() && !rec.tags.contains(&tag) {
                    rec.tags.push(tag);
                }
            }
        }
    }

    /// Marks the step as failed with a captured error kind and message.
    pub fn fail(&mut self, kind: impl Into<String>, message: impl Into<String>) {
        if let Some(rec) = self.record.as_mut() {
            rec.status = StepStatus::Error;
            rec.error = Some(StepError {
                kind: kind.into(),
                message: message.into(),
            });
        }
    }

    /// Finalizes and delivers the record, surfacing the delivery result.
    pub fn finish(mut self) -> Result<(), String> {
        match self.record.take() {
            Some(rec) => self.client.deliver_step(rec),
            None => Ok(()),
        }
    }
}

impl Drop for StepScope<'_> {
    fn drop(&mut self) {
        let Some(mut record) = self.record.take() else {
            return;
        };
        // A scope dropped while unwinding records the failure rather than a
        // phantom success.
        if std::thread::panicking() && record.error.is_none() {
            record.status = StepStatus::Error;
            record.error = Some(StepError {
                kind: "panic".to_string(),
                message: "step scope dropped during panic unwind".to_string(),
            });
        }
        if let Err(e) = self.client.deliver_step(record) {
            log::warn!("[TRAIL] step delivery failed on scope exit: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueuedRecord;
    use decision_trail_types::StepRecord;
    use serde_json::json;

    // No listener on the discard port, so every send fails fast and every
    // record lands in the queue file where the tests can inspect it.
    fn offline_client(dir: &tempfile::TempDir, fail_open: bool) -> TrailClient {
        let mut config = TrailConfig::new("http://127.0.0.1:9", dir.path().join("queue.jsonl"));
        config.app = "test-app".to_string();
        config.timeout = Duration::from_millis(500);
        config.fail_open = fail_open;
        config.default_tags = vec!["env:test".to_string()];
        TrailClient::new(config).unwrap()
    }

    fn queued_records(dir: &tempfile::TempDir) -> Vec<QueuedRecord> {
        let text = std::fs::read_to_string(dir.path().join("queue.jsonl")).unwrap();
        text.lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_fail_open_returns_id_and_queues_record() {
        let dir = tempfile::tempdir().unwrap();
        let client = offline_client(&dir, true);

        let id = client
            .start_execution("run", json!({"api_key": "sk-1", "region": "eu"}), &["a"])
            .unwrap();
        assert!(!id.is_empty());

        let records = queued_records(&dir);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "/executions");
        assert_eq!(records[0].payload["execution_id"], id.as_str());
        assert_eq!(records[0].payload["app"], "test-app");
        // Metadata redacted before it ever touches the wire or the queue.
        assert_eq!(records[0].payload["metadata"]["api_key"], "***REDACTED***");
        assert_eq!(records[0].payload["metadata"]["region"], "eu");
        // Call tags first, then client defaults, de-duplicated.
        assert_eq!(records[0].payload["tags"], json!(["a", "env:test"]));
    }

    #[test]
    fn test_fail_closed_propagates_but_still_queues() {
        let dir = tempfile::tempdir().unwrap();
        let client = offline_client(&dir, false);

        let result = client.start_execution("run", json!({}), &[]);
        assert!(result.is_err());

        let records = queued_records(&dir);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "/executions");
    }

    #[test]
    fn test_step_scope_success_path() {
        let dir = tempfile::tempdir().unwrap();
        let client = offline_client(&dir, true);

        {
            let mut scope = client.step("exec-1", "fetch", json!({"token": "t", "q": "x"}), &["io"]);
            scope.set_output(json!({"rows": 3}));
            scope.set_reasoning("fetched three rows");
            scope.add_artifact("sample", json!([1, 2, 3]));
            scope.add_tags(&["io", "cache_miss"]);
        }

        let records = queued_records(&dir);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "/executions/exec-1/steps");

        let step: StepRecord = serde_json::from_value(records[0].payload.clone()).unwrap();
        assert_eq!(step.status, StepStatus::Success);
        assert_eq!(step.execution_id, "exec-1");
        assert_eq!(step.input["token"], "***REDACTED***");
        assert_eq!(step.input["q"], "x");
        assert_eq!(step.output["rows"], 3);
        assert_eq!(step.reasoning, "fetched three rows");
        assert_eq!(step.artifacts["sample"], json!([1, 2, 3]));
        assert_eq!(step.tags, vec!["io", "cache_miss"]);
        assert!(step.ended_at_ms >= step.started_at_ms);
        assert_eq!(step.duration_ms, step.ended_at_ms - step.started_at_ms);
        assert!(step.error.is_none());
    }

    #[test]
    fn test_run_step_records_error_and_reraises() {
        let dir = tempfile::tempdir().unwrap();
        let client = offline_client(&dir, true);

        let result: Result<(), String> =
            client.run_step("exec-1", "parse", json!({}), &[], |scope| {
                scope.set_reasoning("about to fail");
                Err("boom: malformed payload".to_string())
            });
        assert_eq!(result.unwrap_err(), "boom: malformed payload");

        let records = queued_records(&dir);
        let step: StepRecord = serde_json::from_value(records[0].payload.clone()).unwrap();
        assert_eq!(step.status, StepStatus::Error);
        let error = step.error.unwrap();
        assert!(error.kind.contains("String"));
        assert_eq!(error.message, "boom: malformed payload");
        // Recorded state from before the failure is kept.
        assert_eq!(step.reasoning, "about to fail");
    }

    #[test]
    fn test_run_step_passes_value_through_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let client = offline_client(&dir, true);

        let value: Result<i64, String> =
            client.run_step("exec-1", "count", json!({}), &[], |scope| {
                scope.set_output(json!({"count": 7}));
                Ok(7)
            });
        assert_eq!(value.unwrap(), 7);

        let records = queued_records(&dir);
        let step: StepRecord = serde_json::from_value(records[0].payload.clone()).unwrap();
        assert_eq!(step.status, StepStatus::Success);
        assert_eq!(step.output["count"], 7);
    }

    #[test]
    fn test_merge_tags_first_seen_order() {
        let defaults = vec!["team:ops".to_string(), "a".to_string()];
        let merged = merge_tags(&["a", "b", "a"], &defaults);
        assert_eq!(merged, vec!["a", "b", "team:ops"]);
    }
}
