//! Batch processing of register lookups: spreadsheet uploads become jobs,
//! jobs fan out one lookup per row, and finished jobs are exported as
//! workbooks, per-client archives or power of attorney PDFs.

use crate::api::{AppState, DocumentSet};
use crate::config::Config;
use crate::documents::{ChromeRenderer, RenderError, Template};
use crate::jobs::JobTracker;
use registry::{RateLimiter, Registry};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;

pub mod api;
pub mod bundle;
pub mod config;
pub mod documents;
pub mod jobs;
pub mod metrics_defs;
pub mod spreadsheet;

#[derive(thiserror::Error, Debug)]
pub enum BatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Documents(#[from] RenderError),
}

async fn serve_api(
    config: &Config,
    state: AppState,
    ready: Arc<AtomicBool>,
) -> Result<(), BatchError> {
    let app = api::router(state, config);
    let listener =
        TcpListener::bind(format!("{}:{}", config.listener.host, config.listener.port)).await?;
    tracing::info!(
        host = %config.listener.host,
        port = config.listener.port,
        "api listening"
    );

    ready.store(true, Ordering::Relaxed);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Runs the job API and the admin listener until either fails.
pub async fn run(
    config: Config,
    registry: Arc<dyn Registry>,
    limiter: Arc<RateLimiter>,
) -> Result<(), BatchError> {
    let documents = match &config.documents {
        Some(documents) => Some(DocumentSet {
            template: Template::load(&documents.template_path).await?,
            renderer: Arc::new(ChromeRenderer::new(documents.browser_path.clone())),
        }),
        None => {
            tracing::info!("no documents configured, power of attorney download disabled");
            None
        }
    };

    let tracker = Arc::new(JobTracker::new(&config.jobs, registry, limiter));
    let state = AppState::new(tracker, documents);

    let ready = Arc::new(AtomicBool::new(false));
    let is_ready = {
        let ready = ready.clone();
        move || ready.load(Ordering::Relaxed)
    };
    let admin = AdminService::<_, BatchError>::new(is_ready);

    tokio::try_join!(
        serve_api(&config, state, ready),
        run_http_service(
            &config.admin_listener.host,
            config.admin_listener.port,
            admin
        ),
    )?;

    Ok(())
}
