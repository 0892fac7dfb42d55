//! Axum route handlers for the collector HTTP surface.

use crate::db::Db;
use crate::diff;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use decision_trail_types::*;
use std::sync::Arc;

const DEFAULT_LIMIT: usize = 50;

pub struct AppState {
    pub db: Arc<Db>,
}

// POST /executions
pub async fn create_execution(
    State(state): State<Arc<AppState>>,
    Json(record): Json<ExecutionRecord>,
) -> (StatusCode, Json<RpcResponse<Ack>>) {
    match state.db.upsert_execution(&record) {
        Ok(()) => (
            StatusCode::OK,
            Json(RpcResponse::ok(Ack::execution(record.execution_id))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to store execution: {}", e))),
        ),
    }
}

// POST /executions/{execution_id}/steps
pub async fn create_step(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
    Json(mut record): Json<StepRecord>,
) -> (StatusCode, Json<RpcResponse<Ack>>) {
    // The path is authoritative for the owning execution.
    record.execution_id = execution_id;
    match state.db.upsert_step(&record) {
        Ok(()) => (
            StatusCode::OK,
            Json(RpcResponse::ok(Ack::step(record.step_id))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to store step: {}", e))),
        ),
    }
}

// GET /executions?limit=N
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> (StatusCode, Json<RpcResponse<Vec<ExecutionRecord>>>) {
    match state.db.list_executions(query.limit.unwrap_or(DEFAULT_LIMIT)) {
        Ok(entries) => (StatusCode::OK, Json(RpcResponse::ok(entries))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to list executions: {}", e))),
        ),
    }
}

// GET /executions/{execution_id}
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> (StatusCode, Json<RpcResponse<ExecutionDetail>>) {
    match state.db.get_execution(&execution_id) {
        Ok(Some(detail)) => (StatusCode::OK, Json(RpcResponse::ok(detail))),
        Ok(None) => (StatusCode::NOT_FOUND, Json(RpcResponse::err("not_found"))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to fetch execution: {}", e))),
        ),
    }
}

// GET /search?q=&limit=
pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> (StatusCode, Json<RpcResponse<Vec<ExecutionRecord>>>) {
    match state
        .db
        .search(&query.q, query.limit.unwrap_or(DEFAULT_LIMIT))
    {
        Ok(entries) => (StatusCode::OK, Json(RpcResponse::ok(entries))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Search failed: {}", e))),
        ),
    }
}

// GET /executions/{execution_id}/diff/{other_id}
pub async fn diff_executions(
    State(state): State<Arc<AppState>>,
    Path((execution_id, other_id)): Path<(String, String)>,
) -> (StatusCode, Json<RpcResponse<DiffResponse>>) {
    let a = match state.db.get_execution(&execution_id) {
        Ok(detail) => detail,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RpcResponse::err(format!("Failed to fetch execution: {}", e))),
            );
        }
    };
    let b = match state.db.get_execution(&other_id) {
        Ok(detail) => detail,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RpcResponse::err(format!("Failed to fetch execution: {}", e))),
            );
        }
    };

    // Either side missing yields a combined not-found.
    let (Some(a), Some(b)) = (a, b) else {
        return (StatusCode::NOT_FOUND, Json(RpcResponse::err("not_found")));
    };

    let rows = diff::diff_executions(&a, &b);
    (
        StatusCode::OK,
        Json(RpcResponse::ok(DiffResponse {
            a: a.execution,
            b: b.execution,
            diff: rows,
        })),
    )
}
