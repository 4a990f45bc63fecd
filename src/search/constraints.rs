//! Facet constraints and reranking over search candidates.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::facets::{FacetKind, FacetQuery, FacetRecord, FacetSet, FacetTerms, Facets};
use crate::inventory::InventoryItem;
use crate::normalize::base_hue;
use crate::search::request::{HitSource, SearchHit};

static EMPTY: FacetSet = BTreeSet::new();

/// Facets a candidate must match when the query names them.
const HARD_FACETS: [FacetKind; 2] = [FacetKind::Occasions, FacetKind::Silhouette];

/// How well a candidate's color matches the requested colors. Lower ranks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorTier {
    Commercial,
    Base,
    None,
}

/// A live, sellable item surfaced by the index or the fallback scan.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub item: InventoryItem,
    /// Indexed facets merged with the item's live occasion and color fields
    pub facets: Facets,
    pub base_colors: FacetSet,
    pub commercial_colors: FacetSet,
    pub record: Option<FacetRecord>,
    pub distance: Option<f32>,
    /// Arrival order, i.e. ANN order for index candidates
    pub order: usize,
}

impl Candidate {
    pub fn from_index(record: &FacetRecord, item: InventoryItem, distance: f32, order: usize) -> Self {
        Self::build(Some(record.clone()), item, Some(distance), order)
    }

    pub fn from_inventory(item: InventoryItem, order: usize) -> Self {
        Self::build(None, item, None, order)
    }

    fn build(record: Option<FacetRecord>, item: InventoryItem, distance: Option<f32>, order: usize) -> Self {
        let mut facets = record.as_ref().map(|r| r.facets.clone()).unwrap_or_default();
        facets.extend(FacetKind::Occasions, item.occasion_set());

        let mut base_colors = item.base_colors();
        let mut commercial_colors = item.commercial_colors();
        for color in facets.get(FacetKind::Colors).into_iter().flatten() {
            match base_hue(color) {
                Some(hue) if hue == *color => {
                    base_colors.insert(hue);
                }
                Some(hue) => {
                    base_colors.insert(hue);
                    commercial_colors.insert(color.clone());
                }
                None => {
                    commercial_colors.insert(color.clone());
                }
            }
        }
        facets.extend(FacetKind::Colors, base_colors.iter().chain(commercial_colors.iter()));

        Self {
            item,
            facets,
            base_colors,
            commercial_colors,
            record,
            distance,
            order,
        }
    }

    pub fn id(&self) -> &str {
        &self.item.id
    }

    pub fn facet(&self, kind: FacetKind) -> &FacetSet {
        self.facets.get(kind).unwrap_or(&EMPTY)
    }

    pub fn category(&self) -> Option<&str> {
        self.item
            .category
            .as_deref()
            .or_else(|| self.record.as_ref().and_then(|r| r.category.as_deref()))
    }

    /// Hit with live inventory fields, falling back to the indexed snapshot.
    pub fn to_hit(&self, color_match: Option<ColorTier>) -> SearchHit {
        let record_title = self.record.as_ref().map(|r| r.title.as_str()).unwrap_or_default();
        let record_description = self.record.as_ref().map(|r| r.description.as_str()).unwrap_or_default();
        let pick = |live: &str, indexed: &str| {
            if live.trim().is_empty() { indexed.to_string() } else { live.to_string() }
        };

        SearchHit {
            id: self.item.id.clone(),
            title: pick(&self.item.title, record_title),
            description: pick(&self.item.description, record_description),
            category: self.category().map(str::to_string),
            price: self.item.price,
            image: self.item.image.clone(),
            occasions: self.item.occasion_set().into_iter().collect(),
            color_base: self.item.color_base.clone(),
            color_commercial: self.item.color_commercial.clone(),
            sizes: self.item.sizes.clone(),
            distance: self.distance,
            color_match,
            source: if self.record.is_some() { HitSource::Index } else { HitSource::Fallback },
        }
    }
}

/// Tier of `candidate` against the requested colors.
pub fn color_tier(candidate: &Candidate, query: &FacetQuery) -> ColorTier {
    let generic = &query.colors.include;
    if !candidate.commercial_colors.is_disjoint(&query.color_commercial.include)
        || !candidate.commercial_colors.is_disjoint(generic)
    {
        return ColorTier::Commercial;
    }
    if !candidate.base_colors.is_disjoint(&query.color_base.include)
        || !candidate.base_colors.is_disjoint(generic)
    {
        return ColorTier::Base;
    }
    ColorTier::None
}

fn excluded(terms: &FacetTerms, actual: &FacetSet) -> bool {
    terms.excluded_by(actual)
}

/// Whether `candidate` satisfies every hard constraint and no negation.
pub fn satisfies(candidate: &Candidate, query: &FacetQuery, sizes: &FacetSet) -> bool {
    for kind in HARD_FACETS {
        if !query.terms(kind).wanted_by(candidate.facet(kind)) {
            return false;
        }
    }

    if let Some(category) = query.category.as_deref() {
        if candidate.category() != Some(category) {
            return false;
        }
    }

    if query.has_color_terms() && color_tier(candidate, query) == ColorTier::None {
        return false;
    }

    if !sizes.is_empty() && sizes.is_disjoint(&candidate.item.size_set()) {
        return false;
    }

    let negated = FacetKind::ALL
        .iter()
        .any(|kind| excluded(query.terms(*kind), candidate.facet(*kind)))
        || excluded(&query.color_base, &candidate.base_colors)
        || excluded(&query.color_commercial, &candidate.commercial_colors);

    !negated
}

/// Keep the candidates satisfying the constraints.
///
/// With `degrade`, a constraint set that would eliminate everything is
/// dropped instead and the unconstrained list returned. The flag tells the
/// caller that happened.
pub fn constrain(
    candidates: Vec<Candidate>,
    query: &FacetQuery,
    sizes: &FacetSet,
    degrade: bool,
) -> (Vec<Candidate>, bool) {
    let (kept, rejected): (Vec<Candidate>, Vec<Candidate>) = candidates
        .into_iter()
        .partition(|c| satisfies(c, query, sizes));

    if kept.is_empty() && degrade && !rejected.is_empty() {
        log::debug!("constraints eliminated all {} candidates, degrading to rerank", rejected.len());
        return (rejected, true);
    }
    (kept, false)
}

fn facet_weight(kind: FacetKind) -> u32 {
    match kind {
        FacetKind::Occasions | FacetKind::Silhouette => 3,
        FacetKind::Neckline | FacetKind::Sleeves | FacetKind::Fabrics => 2,
        FacetKind::Details => 1,
        // scored through the color tiers
        FacetKind::Colors => 0,
    }
}

/// Weighted sum of facet matches. `loose` weighs color far above everything else.
pub fn score(candidate: &Candidate, query: &FacetQuery, loose: bool) -> u32 {
    let facet_score: u32 = FacetKind::ALL
        .iter()
        .filter(|kind| {
            let wanted = &query.terms(**kind).include;
            !wanted.is_empty() && !wanted.is_disjoint(candidate.facet(**kind))
        })
        .map(|kind| facet_weight(*kind))
        .sum();

    let color_score = match (color_tier(candidate, query), loose) {
        (ColorTier::Commercial, false) => 4,
        (ColorTier::Base, false) => 2,
        (ColorTier::Commercial, true) => 20,
        (ColorTier::Base, true) => 10,
        (ColorTier::None, _) => 0,
    };

    facet_score + color_score
}

/// Order by score, ties by original order.
pub fn rerank(candidates: &mut [Candidate], query: &FacetQuery, loose: bool) {
    candidates.sort_by_cached_key(|c| (std::cmp::Reverse(score(c, query, loose)), c.order));
}

/// Order by color tier, keeping the original order inside each tier.
pub fn rank_by_color_tier(candidates: &mut [Candidate], query: &FacetQuery) {
    candidates.sort_by_cached_key(|c| (color_tier(c, query), c.order));
}

/// Facet query describing `record`, used to find items like it.
pub fn query_from_record(record: &FacetRecord) -> FacetQuery {
    let mut query = FacetQuery::default();
    for kind in FacetKind::ALL {
        if kind == FacetKind::Colors {
            continue;
        }
        if let Some(values) = record.facets.get(kind) {
            query.terms_mut(kind).include = values.clone();
        }
    }
    for color in record.facets.get(FacetKind::Colors).into_iter().flatten() {
        match base_hue(color) {
            Some(hue) if hue == *color => {
                query.color_base.include.insert(hue);
            }
            Some(hue) => {
                query.color_base.include.insert(hue);
                query.color_commercial.include.insert(color.clone());
            }
            None => {
                query.color_commercial.include.insert(color.clone());
            }
        }
    }
    query
}
