//! HTTP endpoints for operators: liveness and the list of connected bots.

use actix_web::{web, HttpResponse};
use serde::Serialize;

use crate::db::DbPoolStatus;
use crate::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    connected_bots: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<DbPoolStatus>,
}

#[derive(Debug, Serialize)]
struct BotsResponse {
    bots: Vec<String>,
    total: usize,
}

/// Health check endpoint handler
/// Returns a JSON response with server status and timestamp
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy",
        timestamp: chrono::Utc::now().to_rfc3339(),
        connected_bots: state.registry.connection_count().await,
        database: state.db.as_ref().map(|db| db.get_pool_status()),
    })
}

pub async fn list_bots(state: web::Data<AppState>) -> HttpResponse {
    let bots = state.registry.list_ids().await;
    HttpResponse::Ok().json(BotsResponse {
        total: bots.len(),
        bots,
    })
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/debug/bots", web::get().to(list_bots));
}
