//! Demo pipeline driver — records a mock competitor-selection run through the
//! decision trail SDK. Pure call-site usage: every stage is wrapped in a step
//! scope, so the whole decision path lands in the collector (or the local
//! queue when the collector is down).

use decision_trail_sdk::{TrailClient, TrailConfig};
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::{Value, json};

fn mock_catalog() -> Vec<Value> {
    vec![
        json!({"asin": "B0CMP101", "title": "HydroPeak 32oz Wide Mouth Flask", "price": 44.99, "rating": 4.5, "reviews": 8932}),
        json!({"asin": "B0CMP102", "title": "Summit Rambler 26oz Tumbler", "price": 34.99, "rating": 4.4, "reviews": 5621}),
        json!({"asin": "B0CMP103", "title": "Budget Water Bottle 32oz", "price": 8.99, "rating": 3.2, "reviews": 45}),
        json!({"asin": "B0CMP104", "title": "Bottle Cleaning Brush Set", "price": 12.99, "rating": 4.6, "reviews": 3421}),
        json!({"asin": "B0CMP105", "title": "Replacement Lid for 32oz Flask", "price": 9.99, "rating": 4.7, "reviews": 2100}),
        json!({"asin": "B0CMP106", "title": "Glacier Quencher 30oz Bottle", "price": 35.00, "rating": 4.3, "reviews": 4102}),
    ]
}

fn simulate_keywords(title: &str) -> (Vec<String>, String) {
    let variants = [
        vec!["stainless steel bottle insulated", "vacuum insulated bottle 32oz"],
        vec!["32oz insulated water bottle", "double wall steel bottle"],
        vec!["sports water bottle insulated", "steel thermos bottle"],
    ];
    let pick = rand::thread_rng().gen_range(0..variants.len());
    let keywords: Vec<String> = variants[pick].iter().map(|s| s.to_string()).collect();
    let reasoning = format!(
        "Extracted attributes from '{}' (material=steel, capacity=32oz, feature=insulated); picked keyword variant #{} for broader recall.",
        title, pick
    );
    (keywords, reasoning)
}

fn mock_search(keywords: &[String]) -> (i64, Vec<Value>, String) {
    let mut items = mock_catalog();
    items.shuffle(&mut rand::thread_rng());
    let total: i64 = rand::thread_rng().gen_range(500..=5000);
    let reasoning = format!(
        "Mock API: returning {} candidates (shuffled) for keywords={:?}; simulated total matches={}.",
        items.len(),
        keywords,
        total
    );
    (total, items, reasoning)
}

/// Price within 0.5x-2x of the reference, rating >= 3.8, reviews >= 100,
/// obvious accessories rejected by title.
fn apply_filters(reference: &Value, candidates: &[Value]) -> (Value, Vec<Value>, Vec<Value>) {
    let ref_price = reference["price"].as_f64().unwrap_or_default();
    let (min_price, max_price) = (0.5 * ref_price, 2.0 * ref_price);
    let (min_rating, min_reviews) = (3.8, 100);

    let filters = json!({
        "price_range": { "min": min_price, "max": max_price, "rule": "0.5x - 2x of reference price" },
        "min_rating": { "value": min_rating, "rule": ">= 3.8 stars" },
        "min_reviews": { "value": min_reviews, "rule": ">= 100 reviews" },
        "remove_accessories": { "rule": "Reject titles containing lid/brush/bag/carrier" },
    });

    let mut evaluations = Vec::new();
    let mut qualified = Vec::new();

    for c in candidates {
        let title = c["title"].as_str().unwrap_or_default().to_lowercase();
        let price = c["price"].as_f64().unwrap_or_default();
        let rating = c["rating"].as_f64().unwrap_or_default();
        let reviews = c["reviews"].as_i64().unwrap_or_default();

        let price_ok = price >= min_price && price <= max_price;
        let rating_ok = rating >= min_rating;
        let reviews_ok = reviews >= min_reviews;
        let accessory = ["lid", "brush", "bag", "carrier"]
            .iter()
            .any(|w| title.contains(w));
        let passes = price_ok && rating_ok && reviews_ok && !accessory;

        evaluations.push(json!({
            "asin": c["asin"],
            "qualified": passes,
            "checks": {
                "price_range": price_ok,
                "min_rating": rating_ok,
                "min_reviews": reviews_ok,
                "not_accessory": !accessory,
            },
        }));
        if passes {
            qualified.push(c.clone());
        }
    }

    (filters, evaluations, qualified)
}

fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let base_url =
        std::env::var("TRAIL_API_URL").unwrap_or_else(|_| "http://127.0.0.1:9103".to_string());
    let queue_path = std::env::var("TRAIL_QUEUE_PATH")
        .unwrap_or_else(|_| "./trail_queue.jsonl".to_string());

    log::info!("Recording demo run against collector at {}", base_url);

    let mut config = TrailConfig::new(base_url, queue_path);
    config.app = "demo".to_string();
    config.default_tags = vec!["demo".to_string()];
    let trail = TrailClient::new(config).expect("Failed to build trail client");

    let reference = json!({
        "asin": "B0REF932",
        "title": "TrailPeak Steel Bottle 32oz Insulated",
        "price": 29.99,
        "rating": 4.2,
        "reviews": 1247,
        "category": "Sports & Outdoors > Water Bottles",
    });

    let execution_id = trail
        .start_execution(
            "competitor_selection",
            json!({ "reference_asin": reference["asin"] }),
            &[],
        )
        .expect("Failed to start execution");

    let (keywords, _) = trail
        .run_step::<_, String, _>(
            &execution_id,
            "keyword_generation",
            json!({ "product_title": reference["title"], "category": reference["category"] }),
            &[],
            |scope| {
                let (keywords, reasoning) =
                    simulate_keywords(reference["title"].as_str().unwrap_or_default());
                scope.set_output(json!({ "keywords": keywords, "model": "mock-model" }));
                scope.set_reasoning(reasoning.clone());
                Ok((keywords, reasoning))
            },
        )
        .expect("keyword step failed");

    let candidates = trail
        .run_step::<_, String, _>(
            &execution_id,
            "candidate_search",
            json!({ "keywords": keywords, "limit": 50 }),
            &[],
            |scope| {
                let (total, candidates, reasoning) = mock_search(&keywords);
                scope.set_output(json!({
                    "total_results": total,
                    "candidates_fetched": candidates.len(),
                }));
                scope.add_artifact("candidates", json!(candidates));
                scope.set_reasoning(reasoning);
                Ok(candidates)
            },
        )
        .expect("search step failed");

    trail
        .run_step::<_, String, _>(
            &execution_id,
            "apply_filters_and_select",
            json!({ "reference_product": reference, "candidates_count": candidates.len() }),
            &[],
            |scope| {
                let (filters, evaluations, qualified) = apply_filters(&reference, &candidates);
                let selected = qualified
                    .iter()
                    .max_by_key(|c| c["reviews"].as_i64().unwrap_or_default())
                    .cloned();
                scope.add_artifact("filters_applied", filters);
                scope.add_artifact("evaluations", json!(evaluations));
                scope.set_output(json!({
                    "passed": qualified.len(),
                    "failed": candidates.len() - qualified.len(),
                    "selected": selected,
                }));
                scope.set_reasoning(
                    "Applied deterministic business filters plus accessory elimination; selected highest review count among qualified.",
                );
                Ok(())
            },
        )
        .expect("filter step failed");

    println!("Execution recorded: {}", execution_id);
}
