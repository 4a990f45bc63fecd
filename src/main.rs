use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app;
mod catalog;
mod cli;
mod config;
mod facets;
mod generator;
mod images;
mod inventory;
mod llm;
mod lock;
mod normalize;
mod reconcile;
mod rewrite;
mod search;
#[cfg(test)]
mod tests;
mod vocabulary;

use app::AppFactory;
use cli::Command;

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    // logs go to stderr, stdout carries the JSON output
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let paths = AppFactory::get_paths()?;
    let app = AppFactory::create_app(&paths)?;

    match args.command {
        Command::Status {} => cli::handle_status(&app),
        Command::Sync { reset } => cli::handle_sync(&app, reset),
        Command::Search {
            query,
            occasion,
            color_base,
            color_commercial,
            size,
            target_occasion,
            limit,
        } => cli::handle_search(
            &app,
            cli::SearchArgs {
                query,
                occasions: occasion,
                color_base,
                color_commercial,
                sizes: size,
                target_occasion,
                limit,
            },
        ),
        Command::Similar { id, limit } => cli::handle_similar(&app, &id, limit),
        Command::Rewrite { query, occasion } => cli::handle_rewrite(&app, &query, occasion.as_deref()),
    }
}
