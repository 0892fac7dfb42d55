//! Decision Trail Collector — standalone binary that receives, stores, and
//! queries execution trails emitted by instrumented pipelines.
//!
//! Default: http://127.0.0.1:9103/

mod db;
mod demo;
mod diff;
mod llm;
mod routes;

use routes::AppState;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let port: u16 = std::env::var("TRAIL_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9103);

    let db_path = std::env::var("TRAIL_DB_PATH").unwrap_or_else(|_| "./decision_trail.db".to_string());

    log::info!("Opening database at: {}", db_path);
    let database = Arc::new(db::Db::open(&db_path).expect("Failed to open database"));

    let state = Arc::new(AppState { db: database });

    let cors = tower_http::cors::CorsLayer::permissive();

    let app = axum::Router::new()
        // Record ingestion
        .route(
            "/executions",
            axum::routing::post(routes::create_execution).get(routes::list_executions),
        )
        .route(
            "/executions/:execution_id",
            axum::routing::get(routes::get_execution),
        )
        .route(
            "/executions/:execution_id/steps",
            axum::routing::post(routes::create_step),
        )
        // Query / diff
        .route(
            "/executions/:execution_id/diff/:other_id",
            axum::routing::get(routes::diff_executions),
        )
        .route("/search", axum::routing::get(routes::search))
        // Demo pipeline
        .route("/demo/run", axum::routing::post(demo::demo_run))
        .with_state(state)
        .layer(cors);

    let addr = format!("127.0.0.1:{}", port);
    log::info!("Decision Trail Collector listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}
