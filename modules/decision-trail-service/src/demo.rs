//! Server-side demo pipeline: a five-step competitor selection run recorded
//! straight into storage, exercising the LLM wrapper and the full step shape.

use crate::db::Db;
use crate::llm::{self, LlmConfig};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use decision_trail_types::{Ack, ExecutionRecord, RpcResponse, StepError, StepRecord, StepStatus};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

use crate::routes::AppState;

const REFERENCE_CATEGORY: &str = "Sports & Outdoors > Water Bottles";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub asin: String,
    pub title: String,
    pub price: f64,
    pub rating: f64,
    pub reviews: i64,
}

fn product(asin: &str, title: &str, price: f64, rating: f64, reviews: i64) -> Product {
    Product {
        asin: asin.to_string(),
        title: title.to_string(),
        price,
        rating,
        reviews,
    }
}

fn reference_product() -> Product {
    product(
        "B0REF932",
        "TrailPeak Steel Bottle 32oz Insulated",
        29.99,
        4.2,
        1247,
    )
}

fn mock_catalog() -> Vec<Product> {
    vec![
        product("B0CMP101", "HydroPeak 32oz Wide Mouth Flask", 44.99, 4.5, 8932),
        product("B0CMP102", "Summit Rambler 26oz Tumbler", 34.99, 4.4, 5621),
        product("B0CMP103", "Budget Water Bottle 32oz", 8.99, 3.2, 45),
        product("B0CMP104", "Bottle Cleaning Brush Set", 12.99, 4.6, 3421),
        product("B0CMP105", "Replacement Lid for 32oz Flask", 9.99, 4.7, 2100),
        product("B0CMP106", "Glacier Quencher 30oz Bottle", 35.00, 4.3, 4102),
    ]
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =====================================================
// Deterministic pipeline stages
// =====================================================

fn mock_search(keywords: &[String]) -> (i64, Vec<Product>, String) {
    let mut items = mock_catalog();
    items.shuffle(&mut rand::thread_rng());
    let total: i64 = rand::thread_rng().gen_range(500..=5000);
    let reasoning = format!(
        "Mock catalog search for keywords={:?}; returned {} shuffled candidates out of {} simulated matches.",
        keywords,
        items.len(),
        total
    );
    (total, items, reasoning)
}

struct FilterOutcome {
    filters: Value,
    evaluations: Vec<Value>,
    qualified: Vec<Product>,
    selected: Option<Product>,
    reasoning: String,
}

fn apply_filters(reference: &Product, candidates: &[Product]) -> FilterOutcome {
    let min_price = 0.5 * reference.price;
    let max_price = 2.0 * reference.price;
    let min_rating = 3.8;
    let min_reviews = 100;

    let filters = json!({
        "price_range": {
            "min": (min_price * 100.0).round() / 100.0,
            "max": (max_price * 100.0).round() / 100.0,
            "rule": "0.5x - 2x of reference price"
        },
        "min_rating": { "value": min_rating, "rule": ">= 3.8 stars" },
        "min_reviews": { "value": min_reviews, "rule": ">= 100 reviews" },
    });

    let mut evaluations = Vec::new();
    let mut qualified = Vec::new();

    for c in candidates {
        let price_ok = c.price >= min_price && c.price <= max_price;
        let rating_ok = c.rating >= min_rating;
        let reviews_ok = c.reviews >= min_reviews;
        let passes = price_ok && rating_ok && reviews_ok;

        evaluations.push(json!({
            "asin": c.asin,
            "title": c.title,
            "metrics": { "price": c.price, "rating": c.rating, "reviews": c.reviews },
            "filter_results": {
                "price_range": {
                    "passed": price_ok,
                    "detail": format!("${} vs ${:.2}-${:.2}", c.price, min_price, max_price)
                },
                "min_rating": {
                    "passed": rating_ok,
                    "detail": format!("{} vs >= {}", c.rating, min_rating)
                },
                "min_reviews": {
                    "passed": reviews_ok,
                    "detail": format!("{} vs >= {}", c.reviews, min_reviews)
                },
            },
            "qualified": passes,
        }));
        if passes {
            qualified.push(c.clone());
        }
    }

    let selected = qualified.iter().max_by_key(|c| c.reviews).cloned();
    FilterOutcome {
        filters,
        evaluations,
        qualified,
        selected,
        reasoning: "Applied deterministic price/rating/review filters; selected max reviews among qualified.".to_string(),
    }
}

// =====================================================
// Step recording
// =====================================================

#[allow(clippy::too_many_arguments)]
fn record_step(
    db: &Db,
    execution_id: &str,
    name: &str,
    status: StepStatus,
    started_at_ms: i64,
    ended_at_ms: i64,
    input: Value,
    output: Value,
    reasoning: String,
    artifacts: Value,
    error: Option<StepError>,
) -> Result<(), String> {
    let record = StepRecord {
        step_id: uuid::Uuid::new_v4().to_string(),
        execution_id: execution_id.to_string(),
        name: name.to_string(),
        status,
        started_at_ms,
        ended_at_ms,
        duration_ms: ended_at_ms - started_at_ms,
        input,
        output,
        reasoning,
        artifacts,
        error,
        tags: vec!["demo".to_string()],
    };
    db.upsert_step(&record)
        .map_err(|e| format!("Failed to store step {}: {}", name, e))
}

// =====================================================
// Route handler
// =====================================================

// POST /demo/run
pub async fn demo_run(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Ack>>) {
    let config = match LlmConfig::from_env() {
        Ok(c) => c,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, Json(RpcResponse::err(e))),
    };

    let reference = reference_product();
    let execution_id = uuid::Uuid::new_v4().to_string();
    let execution = ExecutionRecord {
        execution_id: execution_id.clone(),
        name: "competitor_selection".to_string(),
        app: "collector-demo".to_string(),
        created_at_ms: now_ms(),
        metadata: json!({ "reference_asin": reference.asin }),
        tags: vec!["demo".to_string()],
    };
    if let Err(e) = state.db.upsert_execution(&execution) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to store execution: {}", e))),
        );
    }

    let client = reqwest::Client::new();
    match run_pipeline(&state.db, &client, &config, &execution_id, &reference).await {
        Ok(()) => (
            StatusCode::OK,
            Json(RpcResponse::ok(Ack::execution(execution_id))),
        ),
        Err(e) => {
            // Record an explicit failure step so the trail shows the error.
            let t = now_ms();
            let _ = record_step(
                &state.db,
                &execution_id,
                "demo_failed",
                StepStatus::Error,
                t,
                t,
                json!({ "hint": "Demo pipeline failed" }),
                json!({}),
                "Captured a failure from the demo pipeline and stored it for audit.".to_string(),
                json!({}),
                Some(StepError {
                    kind: "PipelineError".to_string(),
                    message: e.clone(),
                }),
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RpcResponse::err(format!("Demo pipeline failed: {}", e))),
            )
        }
    }
}

async fn run_pipeline(
    db: &Db,
    client: &reqwest::Client,
    config: &LlmConfig,
    execution_id: &str,
    reference: &Product,
) -> Result<(), String> {
    // Failure toggle for demos of the error path (default off).
    let fail_rate: f64 = std::env::var("TRAIL_SIM_FAIL_RATE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    if fail_rate > 0.0 && rand::thread_rng().r#gen::<f64>() < fail_rate {
        return Err("Simulated failure: keyword generation LLM timeout".to_string());
    }

    // Step 1: keyword generation (LLM)
    let t0 = now_ms();
    let kw = llm::generate_keywords(client, config, &reference.title, REFERENCE_CATEGORY).await?;
    record_step(
        db,
        execution_id,
        "keyword_generation",
        StepStatus::Success,
        t0,
        now_ms(),
        json!({ "product_title": reference.title, "category": REFERENCE_CATEGORY }),
        json!({ "keywords": kw.keywords, "model": kw.model }),
        kw.reasoning.clone(),
        json!({ "prompt": kw.prompt, "raw_text": kw.raw_text }),
        None,
    )?;

    // Step 2: candidate search (mock catalog)
    let t0 = now_ms();
    let (total, candidates, search_reasoning) = mock_search(&kw.keywords);
    record_step(
        db,
        execution_id,
        "candidate_search",
        StepStatus::Success,
        t0,
        now_ms(),
        json!({ "keywords": kw.keywords, "limit": 50 }),
        json!({ "total_results": total, "candidates_fetched": candidates.len() }),
        search_reasoning,
        json!({ "candidates": candidates }),
        None,
    )?;

    // Step 3: deterministic filters
    let t0 = now_ms();
    let outcome = apply_filters(reference, &candidates);
    record_step(
        db,
        execution_id,
        "apply_filters",
        StepStatus::Success,
        t0,
        now_ms(),
        json!({ "reference_product": reference, "candidates_count": candidates.len() }),
        json!({
            "passed": outcome.qualified.len(),
            "failed": candidates.len() - outcome.qualified.len()
        }),
        outcome.reasoning.clone(),
        json!({ "filters_applied": outcome.filters, "evaluations": outcome.evaluations }),
        None,
    )?;

    // Step 4: LLM relevance evaluation over the filter survivors
    let pairs: Vec<(String, String)> = outcome
        .qualified
        .iter()
        .map(|c| (c.asin.clone(), c.title.clone()))
        .collect();

    let t0 = now_ms();
    let rel = llm::relevance_check(client, config, &reference.title, REFERENCE_CATEGORY, &pairs)
        .await?;
    let t1 = now_ms();

    let rel_map: HashMap<&str, &llm::RelevanceEvaluation> = rel
        .evaluations
        .iter()
        .map(|e| (e.asin.as_str(), e))
        .collect();

    // Join the LLM verdicts back into the filter evaluations for the trail.
    let mut evaluations = outcome.evaluations.clone();
    for eval in &mut evaluations {
        let asin = eval["asin"].as_str().unwrap_or_default().to_string();
        if let Some(verdict) = rel_map.get(asin.as_str()) {
            eval["llm_is_competitor"] = json!(verdict.is_competitor);
            eval["llm_confidence"] = json!(verdict.confidence);
        }
    }

    let confirmed: Vec<&Product> = outcome
        .qualified
        .iter()
        .filter(|c| {
            rel_map
                .get(c.asin.as_str())
                .and_then(|e| e.is_competitor)
                .unwrap_or(false)
        })
        .collect();

    let selected: Option<Product> = confirmed
        .iter()
        .max_by_key(|c| c.reviews)
        .map(|c| (*c).clone())
        .or_else(|| outcome.selected.clone());
    let selected_confidence = selected
        .as_ref()
        .and_then(|s| rel_map.get(s.asin.as_str()))
        .and_then(|e| e.confidence);

    record_step(
        db,
        execution_id,
        "llm_relevance_evaluation",
        StepStatus::Success,
        t0,
        t1,
        json!({ "candidates_count": pairs.len(), "model": config.model }),
        json!({ "confirmed_competitors": confirmed.len(), "model": rel.model }),
        rel.reasoning.clone(),
        json!({
            "prompt": rel.prompt,
            "raw_text": rel.raw_text,
            "evaluations": evaluations,
            "selected": selected,
        }),
        None,
    )?;

    // Step 5: final decision
    let t0 = now_ms();
    record_step(
        db,
        execution_id,
        "final_decision",
        StepStatus::Success,
        t0,
        now_ms(),
        json!({
            "qualified_candidates": confirmed.len(),
            "reference_asin": reference.asin,
            "total_candidates": candidates.len(),
            "after_filters": outcome.qualified.len(),
            "after_llm": confirmed.len(),
        }),
        json!({
            "selected_asin": selected.as_ref().map(|s| s.asin.clone()),
            "selected_title": selected.as_ref().map(|s| s.title.clone()),
            "confidence": selected_confidence,
            "selected_competitor": selected,
            "qualified_asins": confirmed.iter().map(|c| c.asin.clone()).collect::<Vec<_>>(),
        }),
        "Selected the best competitor from filter pass rate, LLM relevance, and closeness to the reference product."
            .to_string(),
        json!({
            "reference": reference,
            "selection_rule": "If LLM-confirmed competitors exist, pick max(reviews). Else fall back to the filter selection.",
        }),
        None,
    )?;

    Ok(())
}
