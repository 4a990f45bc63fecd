pub mod factory;

use crate::config::Config;
use crate::reconcile::Reconciler;
use crate::search::SearchService;

pub use factory::AppFactory;

/// Everything a command needs, built once per process.
pub struct App {
    pub config: Config,
    pub search: SearchService,
    pub reconciler: Reconciler,
}
