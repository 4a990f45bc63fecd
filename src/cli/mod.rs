use clap::{Parser, Subcommand};

mod handlers;
mod progress;

pub use handlers::*;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compare the inventory with the index
    Status {},

    /// Bring the index up to date with the inventory
    Sync {
        /// Regenerate every item's metadata and ignore cached embeddings
        #[clap(long, default_value = "false")]
        reset: bool,
    },

    /// Search the catalog
    Search {
        /// Free-text query, e.g. "vestido longo azul para madrinha"
        #[clap(allow_hyphen_values = true)]
        query: Option<String>,

        /// Occasion filter (repeatable)
        #[clap(short, long)]
        occasion: Vec<String>,

        /// Base color filter (repeatable)
        #[clap(long)]
        color_base: Vec<String>,

        /// Commercial color filter (repeatable)
        #[clap(long)]
        color_commercial: Vec<String>,

        /// Size filter (repeatable)
        #[clap(short, long)]
        size: Vec<String>,

        /// Occasion used to disambiguate the query, not a filter
        #[clap(long)]
        target_occasion: Option<String>,

        /// Number of results
        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Items similar to an indexed item
    Similar {
        /// Inventory item id
        id: String,

        /// Number of results
        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Show how a query is rewritten
    Rewrite {
        #[clap(allow_hyphen_values = true)]
        query: String,

        /// Occasion used to disambiguate the query
        #[clap(short, long)]
        occasion: Option<String>,
    },
}
