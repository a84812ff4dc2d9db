// src/services/metrics_service.rs
use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::dashboard::metrics::render_dashboard;
use crate::error::QueueError;
use crate::job::JobState;
use crate::store::JobStore;
use crate::utils::pagination::PaginationQuery;

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub state: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

pub async fn overview(store: web::Data<JobStore>) -> impl Responder {
    match render_dashboard(&store).await {
        Ok(html) => HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .body(html),
        Err(e) => {
            error!(error = %e, "dashboard render failed");
            HttpResponse::InternalServerError().body("failed to render dashboard")
        }
    }
}

pub async fn list_jobs(store: web::Data<JobStore>, query: web::Query<JobsQuery>) -> HttpResponse {
    let state = match query.state.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => match raw.parse::<JobState>() {
            Ok(state) => Some(state),
            Err(e) => return error_response(e),
        },
        None => None,
    };

    let total = match store.count_jobs(state).await {
        Ok(total) => total,
        Err(e) => return error_response(e),
    };
    let page = PaginationQuery {
        page: query.page,
        limit: query.limit,
    };
    let pagination = page.resolve(usize::try_from(total).unwrap_or(0));

    match store.list_jobs(state, &pagination).await {
        Ok(jobs) => HttpResponse::Ok().json(json!({
            "jobs": jobs,
            "pagination": pagination,
        })),
        Err(e) => error_response(e),
    }
}

pub async fn list_dlq(store: web::Data<JobStore>, query: web::Query<PaginationQuery>) -> HttpResponse {
    let total = match store.count_dead_letters().await {
        Ok(total) => total,
        Err(e) => return error_response(e),
    };
    let pagination = query.resolve(usize::try_from(total).unwrap_or(0));

    match store.list_dead_letters(&pagination).await {
        Ok(entries) => HttpResponse::Ok().json(json!({
            "dlq": entries,
            "pagination": pagination,
        })),
        Err(e) => error_response(e),
    }
}

pub async fn metrics(store: web::Data<JobStore>) -> HttpResponse {
    match store.count_by_state().await {
        Ok(counts) => HttpResponse::Ok().json(counts),
        Err(e) => error_response(e),
    }
}

pub async fn workers(store: web::Data<JobStore>) -> HttpResponse {
    match store.active_workers().await {
        Ok(workers) => HttpResponse::Ok().json(json!({ "workers": workers })),
        Err(e) => error_response(e),
    }
}

pub async fn retry_dlq(store: web::Data<JobStore>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    match store.retry_dead_letter(&id).await {
        Ok(job) => {
            info!(job_id = %job.id, "dlq entry retried from dashboard");
            HttpResponse::Ok().json(json!({ "status": "retried", "job": job }))
        }
        Err(e) => error_response(e),
    }
}

fn error_response(e: QueueError) -> HttpResponse {
    match e {
        QueueError::NotFound(_) => HttpResponse::NotFound().json(json!({ "error": e.to_string() })),
        QueueError::Validation(_) | QueueError::InvalidConfig { .. } => {
            HttpResponse::BadRequest().json(json!({ "error": e.to_string() }))
        }
        _ => {
            error!(error = %e, "dashboard request failed");
            HttpResponse::InternalServerError().json(json!({ "error": "internal error" }))
        }
    }
}
