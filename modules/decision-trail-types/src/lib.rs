//! Shared types for the decision trail collector and its SDK/RPC clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =====================================================
// Record Types
// =====================================================

/// One end-to-end run of an instrumented pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub name: String,
    pub app: String,
    pub created_at_ms: i64,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Terminal status of a recorded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "ERROR")]
    Error,
}

/// Error captured from a failed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub kind: String,
    pub message: String,
}

/// One recorded unit of work within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub execution_id: String,
    pub name: String,
    pub status: StepStatus,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub duration_ms: i64,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub artifacts: Value,
    #[serde(default)]
    pub error: Option<StepError>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// An execution together with its steps, ordered by start time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetail {
    pub execution: ExecutionRecord,
    pub steps: Vec<StepRecord>,
}

// =====================================================
// RPC Request / Response Types
// =====================================================

/// Acknowledgment for a record submission.
#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl Ack {
    pub fn execution(id: impl Into<String>) -> Self {
        Self {
            ok: true,
            execution_id: Some(id.into()),
            step_id: None,
        }
    }

    pub fn step(id: impl Into<String>) -> Self {
        Self {
            ok: true,
            execution_id: None,
            step_id: Some(id.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// =====================================================
// Diff Types
// =====================================================

/// Comparison row for one step name across two executions.
///
/// `None` on a side means that execution has no step with this name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffRow {
    pub step: String,
    pub a_status: Option<StepStatus>,
    pub b_status: Option<StepStatus>,
    pub a_duration_ms: Option<i64>,
    pub b_duration_ms: Option<i64>,
    pub a_keywords: Option<Value>,
    pub b_keywords: Option<Value>,
    pub a_reasoning: Option<String>,
    pub b_reasoning: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DiffResponse {
    pub a: ExecutionRecord,
    pub b: ExecutionRecord,
    pub diff: Vec<DiffRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&StepStatus::Success).unwrap(),
            "\"SUCCESS\""
        );
        assert_eq!(
            serde_json::to_string(&StepStatus::Error).unwrap(),
            "\"ERROR\""
        );
        let parsed: StepStatus = serde_json::from_str("\"ERROR\"").unwrap();
        assert_eq!(parsed, StepStatus::Error);
    }

    #[test]
    fn test_step_record_defaults_on_sparse_payload() {
        let json = r#"{
            "step_id": "s1",
            "execution_id": "e1",
            "name": "fetch",
            "status": "SUCCESS",
            "started_at_ms": 1000,
            "ended_at_ms": 1250,
            "duration_ms": 250
        }"#;
        let rec: StepRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.duration_ms, rec.ended_at_ms - rec.started_at_ms);
        assert!(rec.error.is_none());
        assert!(rec.tags.is_empty());
        assert!(rec.reasoning.is_empty());
    }
}
