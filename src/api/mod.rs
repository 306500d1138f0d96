//! API endpoints for the abuse defense engine.
//!
//! Exposes the ingress classification endpoint consumed by the
//! request-handling layer and the admin surface for tenant settings,
//! whitelist/blacklist management, and manual blocks.

use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;
use futures::future::join_all;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::{DefenseController, IngestGate};
use crate::models::{RequestMeta, SettingsUpdate};
use crate::store::StoreError;

pub struct ApiState {
    pub engine: Arc<IngestGate>,
    pub defense: Arc<DefenseController>,
    pub metrics: Option<PrometheusHandle>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/classify").route(web::post().to(classify)))
            .service(
                web::resource("/tenants/{tenant_id}/settings")
                    .route(web::get().to(get_settings))
                    .route(web::put().to(update_settings)),
            )
            .service(
                web::resource("/tenants/{tenant_id}/whitelist")
                    .route(web::post().to(add_whitelist)),
            )
            .service(
                web::resource("/tenants/{tenant_id}/whitelist/{ip}")
                    .route(web::delete().to(remove_whitelist)),
            )
            .service(
                web::resource("/tenants/{tenant_id}/blacklist")
                    .route(web::post().to(add_blacklist)),
            )
            .service(
                web::resource("/tenants/{tenant_id}/blacklist/{ip}")
                    .route(web::delete().to(remove_blacklist)),
            )
            .service(web::resource("/tenants/{tenant_id}/block").route(web::post().to(block_ip)))
            .service(
                web::resource("/tenants/{tenant_id}/unblock").route(web::post().to(unblock_ip)),
            )
            .service(
                web::resource("/tenants/{tenant_id}/bulk-block")
                    .route(web::post().to(bulk_block)),
            )
            .service(
                web::resource("/tenants/{tenant_id}/bulk-unblock")
                    .route(web::post().to(bulk_unblock)),
            )
            .service(
                web::resource("/tenants/{tenant_id}/blocks").route(web::get().to(active_blocks)),
            ),
    )
    .service(web::resource("/metrics").route(web::get().to(render_metrics)));
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Classification request from the request-handling layer
#[derive(Debug, Serialize, Deserialize)]
pub struct ClassifyRequest {
    pub ip: String,
    #[serde(flatten)]
    pub meta: RequestMeta,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IpRequest {
    pub ip: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockRequest {
    pub ip: String,
    pub reason: String,
    #[serde(default)]
    pub permanent: bool,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkBlockRequest {
    pub ips: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkIpsRequest {
    pub ips: Vec<String>,
}

#[derive(Serialize)]
struct BulkResponse {
    requested: usize,
    succeeded: usize,
}

#[derive(Serialize)]
struct UnblockResponse {
    unblocked: bool,
}

fn store_error(e: StoreError) -> HttpResponse {
    HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
}

async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Ingress endpoint: classify one request and return the decision.
async fn classify(state: web::Data<ApiState>, req: web::Json<ClassifyRequest>) -> impl Responder {
    let decision = state.engine.classify(&req.ip, &req.meta).await;
    HttpResponse::Ok().json(decision)
}

async fn get_settings(state: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    let tenant_id = path.into_inner();
    HttpResponse::Ok().json(state.defense.get_settings(&tenant_id).await)
}

async fn update_settings(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    req: web::Json<SettingsUpdate>,
) -> impl Responder {
    let tenant_id = path.into_inner();
    match state
        .defense
        .update_settings(&tenant_id, req.into_inner())
        .await
    {
        Ok(settings) => HttpResponse::Ok().json(settings),
        Err(e) => store_error(e),
    }
}

async fn add_whitelist(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    req: web::Json<IpRequest>,
) -> impl Responder {
    let tenant_id = path.into_inner();
    match state.defense.add_to_whitelist(&tenant_id, &req.ip).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "added": req.ip })),
        Err(e) => store_error(e),
    }
}

async fn remove_whitelist(
    state: web::Data<ApiState>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let (tenant_id, ip) = path.into_inner();
    match state.defense.remove_from_whitelist(&tenant_id, &ip).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "removed": ip })),
        Err(e) => store_error(e),
    }
}

async fn add_blacklist(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    req: web::Json<IpRequest>,
) -> impl Responder {
    let tenant_id = path.into_inner();
    match state.defense.add_to_blacklist(&tenant_id, &req.ip).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "added": req.ip })),
        Err(e) => store_error(e),
    }
}

async fn remove_blacklist(
    state: web::Data<ApiState>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let (tenant_id, ip) = path.into_inner();
    match state.defense.remove_from_blacklist(&tenant_id, &ip).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "removed": ip })),
        Err(e) => store_error(e),
    }
}

async fn block_ip(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    req: web::Json<BlockRequest>,
) -> impl Responder {
    let tenant_id = path.into_inner();
    match state
        .defense
        .block(
            &tenant_id,
            &req.ip,
            &req.reason,
            "admin",
            req.permanent,
            req.duration_seconds,
            Utc::now(),
        )
        .await
    {
        Ok(record) => HttpResponse::Ok().json(record),
        Err(e) => store_error(e),
    }
}

async fn unblock_ip(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    req: web::Json<IpRequest>,
) -> impl Responder {
    let tenant_id = path.into_inner();
    match state.defense.unblock(&tenant_id, &req.ip).await {
        Ok(unblocked) => HttpResponse::Ok().json(UnblockResponse { unblocked }),
        Err(e) => store_error(e),
    }
}

async fn bulk_block(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    req: web::Json<BulkBlockRequest>,
) -> impl Responder {
    let tenant_id = path.into_inner();
    let now = Utc::now();
    let results = join_all(req.ips.iter().map(|ip| {
        state
            .defense
            .block(&tenant_id, ip, &req.reason, "admin", false, None, now)
    }))
    .await;

    HttpResponse::Ok().json(BulkResponse {
        requested: req.ips.len(),
        succeeded: results.iter().filter(|r| r.is_ok()).count(),
    })
}

async fn bulk_unblock(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    req: web::Json<BulkIpsRequest>,
) -> impl Responder {
    let tenant_id = path.into_inner();
    let results = join_all(
        req.ips
            .iter()
            .map(|ip| state.defense.unblock(&tenant_id, ip)),
    )
    .await;

    HttpResponse::Ok().json(BulkResponse {
        requested: req.ips.len(),
        succeeded: results
            .iter()
            .filter(|r| matches!(r, Ok(true)))
            .count(),
    })
}

async fn active_blocks(state: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    let tenant_id = path.into_inner();
    HttpResponse::Ok().json(state.defense.active_blocks(&tenant_id).await)
}

async fn render_metrics(state: web::Data<ApiState>) -> impl Responder {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok().body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}
