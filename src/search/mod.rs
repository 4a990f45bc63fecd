//! Search orchestration: query rewriting, progressive-expansion kNN over the
//! live index generation, facet constraints, reranking and the inventory
//! fallback scan.

mod constraints;
mod fallback;
mod request;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub use constraints::{
    color_tier, constrain, query_from_record, rank_by_color_tier, rerank, satisfies, Candidate,
    ColorTier,
};
pub use fallback::scan_by_facets;
pub use request::{HitSource, SearchFailure, SearchHit, SearchRequest, SearchResponse, SearchStats};

use crate::catalog::{query_embedding_text, CatalogError, IndexService, IndexSnapshot};
use crate::config::SearchConfig;
use crate::facets::FacetQuery;
use crate::inventory::{InventoryError, InventoryStore};
use crate::rewrite::{QueryRewriter, RewriteResult};
use crate::vocabulary::VocabularyDigest;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("item {0} is not in the index")]
    NotIndexed(String),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),
}

/// Candidates gathered by the progressive loop.
struct Gathered {
    candidates: Vec<Candidate>,
    windows: Vec<usize>,
}

pub struct SearchService {
    index: Arc<IndexService>,
    inventory: Arc<dyn InventoryStore>,
    rewriter: Option<Arc<QueryRewriter>>,
    config: SearchConfig,
    digest_values_per_facet: usize,
    /// Vocabulary digest of the generation it was computed from
    digest: Mutex<Option<(Option<u64>, Arc<VocabularyDigest>)>>,
}

impl SearchService {
    pub fn new(
        index: Arc<IndexService>,
        inventory: Arc<dyn InventoryStore>,
        rewriter: Option<Arc<QueryRewriter>>,
        config: SearchConfig,
        digest_values_per_facet: usize,
    ) -> Self {
        Self {
            index,
            inventory,
            rewriter,
            config,
            digest_values_per_facet,
            digest: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    fn digest_for(&self, snapshot: &IndexSnapshot) -> Arc<VocabularyDigest> {
        let compute = || {
            Arc::new(VocabularyDigest::from_records(
                snapshot.metadata(),
                self.digest_values_per_facet,
            ))
        };

        let Ok(mut guard) = self.digest.lock() else {
            return compute();
        };
        match guard.as_ref() {
            Some((generation, digest)) if *generation == snapshot.generation() => digest.clone(),
            _ => {
                let digest = compute();
                *guard = Some((snapshot.generation(), digest.clone()));
                digest
            }
        }
    }

    /// Rewrite a query against the live vocabulary.
    pub fn rewrite(&self, query: &str, target_occasion: Option<&str>) -> Result<RewriteResult, SearchError> {
        let Some(rewriter) = &self.rewriter else {
            return Ok(RewriteResult {
                rewritten_query: query.trim().to_string(),
                ..Default::default()
            });
        };
        let snapshot = self.index.snapshot()?;
        let digest = self.digest_for(&snapshot);
        Ok(rewriter.rewrite(query, target_occasion, &digest))
    }

    /// Validate a JSON request and run it.
    pub fn search_json(&self, body: &serde_json::Value) -> Result<SearchResponse, SearchError> {
        let request = SearchRequest::from_json(body, &self.config)?;
        self.search(&request)
    }

    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let limit = request.limit.clamp(1, self.config.max_limit);
        let _span = tracing::info_span!("search", limit).entered();

        let rewritten = if request.query.is_empty() {
            RewriteResult::default()
        } else {
            self.rewrite(&request.query, request.target_occasion.as_deref())?
        };

        let mut facets = rewritten.extracted_facets.clone();
        facets.merge(&request.facet_filters());
        let sizes = request.size_filter();

        let mut stats = SearchStats {
            rewritten_query: rewritten.rewritten_query.clone(),
            ..Default::default()
        };

        let snapshot = self.index.snapshot()?;
        let mut ranked = Vec::new();

        let text = query_embedding_text(&rewritten.rewritten_query, &facets);
        if let (Some(text), false) = (text, snapshot.count() == 0) {
            let vector = self.index.embed_query(&text)?;
            let gathered = self.gather(&snapshot, &vector, limit, HashSet::new(), |candidates| {
                candidates
                    .iter()
                    .filter(|c| satisfies(c, &facets, &sizes))
                    .count()
                    >= limit
            })?;
            stats.rounds = gathered.windows.len();
            stats.windows = gathered.windows;
            stats.candidates_seen = gathered.candidates.len();

            // Explicit filters never degrade; only facets read from the query text do
            let (explicit, _) = constrain(gathered.candidates, &request.facet_filters(), &sizes, false);
            let (mut kept, degraded) =
                constrain(explicit, &facets, &sizes, self.config.degrade_constraints);
            stats.constraints_degraded = degraded;

            if facets.has_color_terms() {
                rank_by_color_tier(&mut kept, &facets);
            } else {
                rerank(&mut kept, &facets, false);
            }
            kept.truncate(limit);
            ranked = kept;
        }

        let filters = fallback_filters(&request.facet_filters(), &rewritten.extracted_facets);
        let has_filters = request.has_filters() || !filters.is_empty();
        if ranked.is_empty() && has_filters {
            log::info!("index produced no usable results, scanning inventory");
            ranked = scan_by_facets(self.inventory.as_ref(), &filters, &sizes, limit)?;
            stats.fallback_used = true;
        }

        Ok(self.respond(ranked, &facets, stats, request, has_filters))
    }

    /// Items similar to an indexed item, ranked with color weighted highest.
    pub fn similar(&self, item_id: &str, limit: usize) -> Result<SearchResponse, SearchError> {
        let limit = limit.clamp(1, self.config.max_limit);
        let snapshot = self.index.snapshot()?;

        let position = snapshot
            .position_of(item_id)
            .ok_or_else(|| SearchError::NotIndexed(item_id.to_string()))?;
        let (Some(record), Some(vector)) = (snapshot.record(position), snapshot.index().vector(position)) else {
            return Err(SearchError::NotIndexed(item_id.to_string()));
        };
        let facets = query_from_record(record);
        let vector = vector.to_vec();

        let seen = HashSet::from([item_id.to_string()]);
        let gathered = self.gather(&snapshot, &vector, limit, seen, |candidates| candidates.len() >= limit)?;

        let stats = SearchStats {
            rounds: gathered.windows.len(),
            candidates_seen: gathered.candidates.len(),
            windows: gathered.windows,
            ..Default::default()
        };
        let mut candidates = gathered.candidates;
        rerank(&mut candidates, &facets, true);
        candidates.truncate(limit);

        let request = serde_json::json!({"similarTo": item_id, "limit": limit});
        let error = candidates
            .is_empty()
            .then(|| SearchFailure::no_results(request, false));

        Ok(SearchResponse {
            items: candidates.iter().map(|c| c.to_hit(None)).collect(),
            error,
            stats,
        })
    }

    /// Progressive expansion kNN.
    ///
    /// Each round only consumes the positions newly exposed by the wider
    /// window; ids already seen are skipped. Stops when `enough` holds or the
    /// index is exhausted.
    fn gather<F>(
        &self,
        snapshot: &IndexSnapshot,
        vector: &[f32],
        limit: usize,
        mut seen: HashSet<String>,
        enough: F,
    ) -> Result<Gathered, SearchError>
    where
        F: Fn(&[Candidate]) -> bool,
    {
        let total = snapshot.count();
        let mut k = limit
            .saturating_mul(self.config.k_multiplier)
            .max(self.config.k_minimum)
            .min(total);

        let mut processed = 0;
        let mut windows = Vec::new();
        let mut candidates = Vec::new();

        while processed < total {
            let _round = tracing::debug_span!("knn_round", k, processed).entered();
            windows.push(k);
            let neighbors = snapshot.index().search(vector, k).map_err(CatalogError::from)?;

            for neighbor in neighbors.iter().skip(processed) {
                let Some(record) = snapshot.record(neighbor.position) else {
                    continue;
                };
                if !seen.insert(record.id.clone()) {
                    continue;
                }
                let Some(item) = self.inventory.get(&record.id)? else {
                    log::debug!("indexed item {} no longer in inventory", record.id);
                    continue;
                };
                if !item.status.is_sellable() {
                    continue;
                }
                let order = candidates.len();
                candidates.push(Candidate::from_index(record, item, neighbor.distance, order));
            }
            processed = k;

            if enough(&candidates) || processed >= total {
                break;
            }
            k = (k + self.config.expansion_step).max(k * 2).min(total);
        }

        Ok(Gathered { candidates, windows })
    }

    fn respond(
        &self,
        ranked: Vec<Candidate>,
        facets: &FacetQuery,
        stats: SearchStats,
        request: &SearchRequest,
        had_filters: bool,
    ) -> SearchResponse {
        let color_terms = facets.has_color_terms();
        let items: Vec<SearchHit> = ranked
            .iter()
            .map(|c| c.to_hit(color_terms.then(|| color_tier(c, facets))))
            .collect();

        let error = items.is_empty().then(|| {
            let requested = serde_json::to_value(request).unwrap_or(serde_json::Value::Null);
            SearchFailure::no_results(requested, had_filters)
        });

        SearchResponse { items, error, stats }
    }
}

/// The parts of a facet query the inventory itself can answer.
fn filter_facets(facets: &FacetQuery) -> FacetQuery {
    FacetQuery {
        occasions: facets.occasions.clone(),
        color_base: facets.color_base.clone(),
        color_commercial: facets.color_commercial.clone(),
        category: facets.category.clone(),
        ..Default::default()
    }
}

/// Filters for the inventory scan. Explicit colors replace the colors read
/// from the query text, so a commercial color is never widened to its hue.
fn fallback_filters(explicit: &FacetQuery, extracted: &FacetQuery) -> FacetQuery {
    let mut filters = filter_facets(extracted);
    if explicit.has_color_terms() {
        filters.color_base = Default::default();
        filters.color_commercial = Default::default();
    }
    filters.merge(&filter_facets(explicit));
    filters
}
