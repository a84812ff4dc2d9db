// src/dashboard/metrics.rs
use actix_web::{web, App, HttpServer};
use anyhow::{Context as AnyhowContext, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::Serialize;
use tera::{Context, Tera};
use tracing::{error, info};

use crate::job::JobState;
use crate::routes::metrics_route::queuectl_routes;
use crate::store::JobStore;
use crate::utils::pagination::Pagination;

const TEMPLATE: &str = "dashboard.html.tera";
const RECENT: usize = 20;

pub static TEMPLATES: Lazy<Tera> = Lazy::new(|| {
    let mut tera = Tera::default();
    if let Err(e) = tera.add_raw_template(TEMPLATE, include_str!("../templates/dashboard.html.tera")) {
        error!(error = %e, "failed to load dashboard template");
    }
    tera
});

#[derive(Serialize)]
struct Card {
    state: &'static str,
    count: i64,
}

/// Render the HTML overview: per-state counts, busy workers, the most recent
/// jobs and dead letters.
pub async fn render_dashboard(store: &JobStore) -> Result<String> {
    let counts = store.count_by_state().await?;
    let cards: Vec<Card> = JobState::ALL
        .iter()
        .map(|state| Card {
            state: state.as_str(),
            count: counts.get(*state),
        })
        .collect();

    let recent = Pagination::first(RECENT);
    let jobs = store.list_jobs(None, &recent).await?;
    let dead_letters = store.list_dead_letters(&recent).await?;
    let workers = store.active_workers().await?;

    let mut context = Context::new();
    context.insert("cards", &cards);
    context.insert("dlq_count", &counts.dlq_count);
    context.insert("jobs", &jobs);
    context.insert("dead_letters", &dead_letters);
    context.insert("workers", &workers);
    context.insert("generated_at", &Utc::now().to_rfc3339());

    TEMPLATES
        .render(TEMPLATE, &context)
        .with_context(|| format!("failed to render {TEMPLATE}"))
}

/// Serve the dashboard and JSON endpoints until the server is stopped.
pub async fn serve(store: JobStore, host: &str, port: u16) -> std::io::Result<()> {
    info!(host, port, "dashboard listening");
    let data = web::Data::new(store);

    HttpServer::new(move || App::new().app_data(data.clone()).configure(queuectl_routes))
        .bind((host, port))?
        .run()
        .await
}
