// src/routes/metrics_route.rs
use actix_web::web;

use crate::services::metrics_service::{list_dlq, list_jobs, metrics, overview, retry_dlq, workers};

pub fn queuectl_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/", web::get().to(overview))
            .route("/jobs", web::get().to(list_jobs))
            .route("/dlq", web::get().to(list_dlq))
            .route("/dlq/{id}/retry", web::post().to(retry_dlq))
            .route("/metrics", web::get().to(metrics))
            .route("/workers", web::get().to(workers)),
    );
}
