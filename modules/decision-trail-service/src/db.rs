//! SQLite storage for the decision trail collector.
//!
//! Two entities, executions and steps, keyed by their client-assigned ids
//! with insert-or-overwrite semantics. Structured fields are stored as
//! serialized text blobs and are opaque to the store beyond substring search.

use decision_trail_types::{
    ExecutionDetail, ExecutionRecord, StepError, StepRecord, StepStatus,
};
use rusqlite::{Connection, Result as SqliteResult};
use serde_json::Value;
use std::sync::Mutex;

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &str) -> SqliteResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS executions (
                execution_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                app TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                metadata_json TEXT,
                tags_json TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_created ON executions(created_at_ms DESC)",
            [],
        )?;

        // No foreign key on execution_id: a step may arrive before (or
        // without) its execution and is stored regardless.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS steps (
                step_id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at_ms INTEGER NOT NULL,
                ended_at_ms INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                input_json TEXT,
                output_json TEXT,
                reasoning TEXT,
                artifacts_json TEXT,
                error_json TEXT,
                tags_json TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_steps_execution ON steps(execution_id)",
            [],
        )?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_steps_name ON steps(name)", [])?;

        Ok(())
    }

    // =====================================================
    // Upserts
    // =====================================================

    /// Insert-or-overwrite by execution_id. Re-sending an id replaces the
    /// prior record, never errors — records arrive out of order and must be
    /// independently idempotent.
    pub fn upsert_execution(&self, record: &ExecutionRecord) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO executions
                (execution_id, name, app, created_at_ms, metadata_json, tags_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.execution_id,
                record.name,
                record.app,
                record.created_at_ms,
                serde_json::to_string(&record.metadata).unwrap_or_default(),
                serde_json::to_string(&record.tags).unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    /// Insert-or-overwrite by step_id. No existence check against the
    /// execution.
    pub fn upsert_step(&self, record: &StepRecord) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO steps
                (step_id, execution_id, name, status, started_at_ms, ended_at_ms,
                 duration_ms, input_json, output_json, reasoning, artifacts_json,
                 error_json, tags_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                record.step_id,
                record.execution_id,
                record.name,
                serde_json::to_string(&record.status)
                    .unwrap_or_default()
                    .trim_matches('"'),
                record.started_at_ms,
                record.ended_at_ms,
                record.duration_ms,
                serde_json::to_string(&record.input).unwrap_or_default(),
                serde_json::to_string(&record.output).unwrap_or_default(),
                record.reasoning,
                serde_json::to_string(&record.artifacts).unwrap_or_default(),
                record
                    .error
                    .as_ref()
                    .map(|e| serde_json::to_string(e).unwrap_or_default()),
                serde_json::to_string(&record.tags).unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    // =====================================================
    // Queries
    // =====================================================

    pub fn list_executions(&self, limit: usize) -> SqliteResult<Vec<ExecutionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT execution_id, name, app, created_at_ms, metadata_json, tags_json
             FROM executions ORDER BY created_at_ms DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map([limit], |row| row_to_execution(row))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }

    /// Fetches one execution with its steps ordered by start time, or `None`
    /// if the execution id is unknown.
    pub fn get_execution(&self, execution_id: &str) -> SqliteResult<Option<ExecutionDetail>> {
        let conn = self.conn.lock().unwrap();
        let execution = match conn.query_row(
            "SELECT execution_id, name, app, created_at_ms, metadata_json, tags_json
             FROM executions WHERE execution_id = ?1",
            [execution_id],
            |row| row_to_execution(row),
        ) {
            Ok(e) => e,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut stmt = conn.prepare(
            "SELECT step_id, execution_id, name, status, started_at_ms, ended_at_ms,
                    duration_ms, input_json, output_json, reasoning, artifacts_json,
                    error_json, tags_json
             FROM steps WHERE execution_id = ?1 ORDER BY started_at_ms ASC",
        )?;
        let steps = stmt
            .query_map([execution_id], |row| row_to_step(row))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(Some(ExecutionDetail { execution, steps }))
    }

    /// Substring search across execution name, metadata blob, and any step's
    /// name, reasoning, or input/output/artifacts blobs. One matching step is
    /// enough; results are de-duplicated per execution, newest first. SQLite
    /// LIKE makes the match case-insensitive for ASCII, consistently across
    /// all fields.
    pub fn search(&self, query: &str, limit: usize) -> SqliteResult<Vec<ExecutionRecord>> {
        let conn = self.conn.lock().unwrap();
        let like = format!("%{}%", query);
        let mut stmt = conn.prepare(
            "SELECT DISTINCT e.execution_id, e.name, e.app, e.created_at_ms,
                    e.metadata_json, e.tags_json
             FROM executions e
             LEFT JOIN steps s ON s.execution_id = e.execution_id
             WHERE e.name LIKE ?1
                OR e.metadata_json LIKE ?1
                OR s.name LIKE ?1
                OR s.reasoning LIKE ?1
                OR s.input_json LIKE ?1
                OR s.output_json LIKE ?1
                OR s.artifacts_json LIKE ?1
             ORDER BY e.created_at_ms DESC
             LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(rusqlite::params![like, limit], |row| row_to_execution(row))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }
}

// =====================================================
// Row mapping
// =====================================================

fn row_to_execution(row: &rusqlite::Row) -> rusqlite::Result<ExecutionRecord> {
    let metadata_str: Option<String> = row.get(4)?;
    let tags_str: Option<String> = row.get(5)?;
    Ok(ExecutionRecord {
        execution_id: row.get(0)?,
        name: row.get(1)?,
        app: row.get(2)?,
        created_at_ms: row.get(3)?,
        metadata: parse_blob(metadata_str),
        tags: parse_tags(tags_str),
    })
}

fn row_to_step(row: &rusqlite::Row) -> rusqlite::Result<StepRecord> {
    let status_str: String = row.get(3)?;
    let input_str: Option<String> = row.get(7)?;
    let output_str: Option<String> = row.get(8)?;
    let artifacts_str: Option<String> = row.get(10)?;
    let error_str: Option<String> = row.get(11)?;
    let tags_str: Option<String> = row.get(12)?;

    Ok(StepRecord {
        step_id: row.get(0)?,
        execution_id: row.get(1)?,
        name: row.get(2)?,
        status: parse_status(&status_str),
        started_at_ms: row.get(4)?,
        ended_at_ms: row.get(5)?,
        duration_ms: row.get(6)?,
        input: parse_blob(input_str),
        output: parse_blob(output_str),
        reasoning: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        artifacts: parse_blob(artifacts_str),
        error: error_str.and_then(|s| serde_json::from_str::<StepError>(&s).ok()),
        tags: parse_tags(tags_str),
    })
}

fn parse_blob(text: Option<String>) -> Value {
    text.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
}

fn parse_tags(text: Option<String>) -> Vec<String> {
    text.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn parse_status(s: &str) -> StepStatus {
    match s {
        "SUCCESS" => StepStatus::Success,
        // Unknown status likely indicates corruption; default to Error not Success.
        _ => StepStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution(id: &str, name: &str, created_at_ms: i64) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: id.to_string(),
            name: name.to_string(),
            app: "test".to_string(),
            created_at_ms,
            metadata: json!({}),
            tags: vec![],
        }
    }

    fn step(id: &str, execution_id: &str, name: &str, started_at_ms: i64) -> StepRecord {
        StepRecord {
            step_id: id.to_string(),
            execution_id: execution_id.to_string(),
            name: name.to_string(),
            status: StepStatus::Success,
            started_at_ms,
            ended_at_ms: started_at_ms + 10,
            duration_ms: 10,
            input: json!({}),
            output: json!({}),
            reasoning: String::new(),
            artifacts: json!({}),
            error: None,
            tags: vec![],
        }
    }

    #[test]
    fn test_execution_upsert_is_idempotent() {
        let db = Db::open(":memory:").unwrap();
        db.upsert_execution(&execution("e1", "first", 100)).unwrap();

        let mut replacement = execution("e1", "second", 100);
        replacement.metadata = json!({"retry": true});
        db.upsert_execution(&replacement).unwrap();

        let all = db.list_executions(50).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "second");
        assert_eq!(all[0].metadata["retry"], true);
    }

    #[test]
    fn test_step_upsert_overwrites_by_id() {
        let db = Db::open(":memory:").unwrap();
        db.upsert_execution(&execution("e1", "run", 100)).unwrap();

        let mut s = step("s1", "e1", "fetch", 1000);
        db.upsert_step(&s).unwrap();
        s.status = StepStatus::Error;
        s.error = Some(StepError {
            kind: "Timeout".to_string(),
            message: "upstream gave up".to_string(),
        });
        db.upsert_step(&s).unwrap();

        let detail = db.get_execution("e1").unwrap().unwrap();
        assert_eq!(detail.steps.len(), 1);
        assert_eq!(detail.steps[0].status, StepStatus::Error);
        assert_eq!(detail.steps[0].error.as_ref().unwrap().kind, "Timeout");
    }

    #[test]
    fn test_step_without_execution_is_accepted() {
        let db = Db::open(":memory:").unwrap();
        db.upsert_step(&step("s1", "ghost", "orphan", 1000)).unwrap();
        // Not visible through get_execution, but stored without error.
        assert!(db.get_execution("ghost").unwrap().is_none());
    }

    #[test]
    fn test_duration_round_trip() {
        let db = Db::open(":memory:").unwrap();
        db.upsert_execution(&execution("e1", "run", 100)).unwrap();
        let mut s = step("s1", "e1", "fetch", 1000);
        s.ended_at_ms = 1250;
        s.duration_ms = 250;
        db.upsert_step(&s).unwrap();

        let detail = db.get_execution("e1").unwrap().unwrap();
        assert_eq!(detail.steps[0].duration_ms, 250);
        assert_eq!(
            detail.steps[0].duration_ms,
            detail.steps[0].ended_at_ms - detail.steps[0].started_at_ms
        );
    }

    #[test]
    fn test_list_is_newest_first_and_limited() {
        let db = Db::open(":memory:").unwrap();
        db.upsert_execution(&execution("e1", "old", 100)).unwrap();
        db.upsert_execution(&execution("e2", "new", 300)).unwrap();
        db.upsert_execution(&execution("e3", "mid", 200)).unwrap();

        let all = db.list_executions(2).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].execution_id, "e2");
        assert_eq!(all[1].execution_id, "e3");
    }

    #[test]
    fn test_get_execution_steps_ordered_by_start() {
        let db = Db::open(":memory:").unwrap();
        db.upsert_execution(&execution("e1", "run", 100)).unwrap();
        db.upsert_step(&step("s2", "e1", "later", 2000)).unwrap();
        db.upsert_step(&step("s1", "e1", "earlier", 1000)).unwrap();

        let detail = db.get_execution("e1").unwrap().unwrap();
        assert_eq!(detail.steps[0].name, "earlier");
        assert_eq!(detail.steps[1].name, "later");
    }

    #[test]
    fn test_get_missing_execution_is_none() {
        let db = Db::open(":memory:").unwrap();
        assert!(db.get_execution("nope").unwrap().is_none());
    }

    #[test]
    fn test_search_matches_name_and_step_fields() {
        let db = Db::open(":memory:").unwrap();
        db.upsert_execution(&execution("e1", "alpha-run", 100)).unwrap();
        let mut s = step("s1", "e1", "analyze", 1000);
        s.reasoning = "found special-token-42 in corpus".to_string();
        db.upsert_step(&s).unwrap();

        db.upsert_execution(&execution("e2", "beta-run", 200)).unwrap();

        let by_name = db.search("alpha", 50).unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].execution_id, "e1");

        let by_reasoning = db.search("special-token-42", 50).unwrap();
        assert_eq!(by_reasoning.len(), 1);
        assert_eq!(by_reasoning[0].execution_id, "e1");

        assert!(db.search("no-such-needle", 50).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trail.db");
        {
            let db = Db::open(path.to_str().unwrap()).unwrap();
            db.upsert_execution(&execution("e1", "run", 100)).unwrap();
            db.upsert_step(&step("s1", "e1", "fetch", 1000)).unwrap();
        }

        let db = Db::open(path.to_str().unwrap()).unwrap();
        let detail = db.get_execution("e1").unwrap().unwrap();
        assert_eq!(detail.execution.name, "run");
        assert_eq!(detail.steps.len(), 1);
    }

    #[test]
    fn test_search_deduplicates_across_matching_steps() {
        let db = Db::open(":memory:").unwrap();
        db.upsert_execution(&execution("e1", "run", 100)).unwrap();
        for i in 0..3 {
            let mut s = step(&format!("s{}", i), "e1", "loop", 1000 + i);
            s.reasoning = "needle".to_string();
            db.upsert_step(&s).unwrap();
        }
        let hits = db.search("needle", 50).unwrap();
        assert_eq!(hits.len(), 1);
    }
}
