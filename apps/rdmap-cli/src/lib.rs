pub mod http;
pub mod telemetry;

use anyhow::Context;
use std::sync::Arc;

use rdmap_core::config::Settings;
use rdmap_search::SearchService;

pub use http::{router, AppState};

/// Builds the embedder and the search service from settings.
pub fn build_service(settings: &Settings) -> anyhow::Result<Arc<SearchService>> {
    let embedder = rdmap_embed::build_embedder(&settings.embedding).context("configuring embedder")?;
    let service = SearchService::from_settings(settings, embedder).context("configuring search service")?;
    Ok(Arc::new(service))
}
