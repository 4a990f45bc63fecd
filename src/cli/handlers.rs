use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::{
    app::App,
    reconcile::RebuildOutcome,
    search::SearchRequest,
};

use super::progress::SyncProgress;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn handle_status(app: &App) -> Result<()> {
    let status = app.reconciler.status().context("Failed to compute sync status")?;
    print_json(&status)
}

pub fn handle_sync(app: &App, reset: bool) -> Result<()> {
    let progress = SyncProgress::new();
    let report = app
        .reconciler
        .rebuild(reset, &progress)
        .context("Rebuild failed, the previous index is still live")?;

    if report.outcome == RebuildOutcome::Rebuilt {
        log::info!("{}", report.message);
    }
    print_json(&report)
}

pub struct SearchArgs {
    pub query: Option<String>,
    pub occasions: Vec<String>,
    pub color_base: Vec<String>,
    pub color_commercial: Vec<String>,
    pub sizes: Vec<String>,
    pub target_occasion: Option<String>,
    pub limit: Option<usize>,
}

pub fn handle_search(app: &App, args: SearchArgs) -> Result<()> {
    let config = &app.config.search;
    let query = args.query.unwrap_or_default();
    let mut request = SearchRequest::new(&query, args.limit.unwrap_or(config.default_limit), config);
    request.occasions = args.occasions;
    request.color_base = args.color_base;
    request.color_commercial = args.color_commercial;
    request.sizes = args.sizes;
    request.target_occasion = args.target_occasion;

    if request.query.is_empty() && !request.has_filters() {
        bail!("Provide a query or at least one filter");
    }

    let response = app.search.search(&request)?;
    print_json(&response)
}

pub fn handle_similar(app: &App, id: &str, limit: Option<usize>) -> Result<()> {
    let limit = limit.unwrap_or(app.config.search.default_limit);
    let response = app.search.similar(id, limit)?;
    print_json(&response)
}

pub fn handle_rewrite(app: &App, query: &str, occasion: Option<&str>) -> Result<()> {
    let result = app.search.rewrite(query, occasion)?;
    print_json(&result)
}
