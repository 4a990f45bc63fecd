//! Exhaustive inventory scan used when the index yields nothing usable.

use crate::facets::{FacetQuery, FacetSet};
use crate::inventory::{InventoryError, InventoryStore};
use crate::search::constraints::{rank_by_color_tier, satisfies, Candidate};

const PAGE_SIZE: usize = 200;

/// Scan the store page by page for available items matching the requested
/// occasions, colors and sizes, stopping once `limit` items are collected.
pub fn scan_by_facets(
    store: &dyn InventoryStore,
    filters: &FacetQuery,
    sizes: &FacetSet,
    limit: usize,
) -> Result<Vec<Candidate>, InventoryError> {
    let mut matches = Vec::new();
    let mut cursor = None;
    let mut scanned = 0;

    loop {
        let page = store.scan(cursor, PAGE_SIZE)?;
        scanned += page.items.len();

        for item in page.items {
            if !item.status.is_sellable() {
                continue;
            }
            let candidate = Candidate::from_inventory(item, matches.len());
            if satisfies(&candidate, filters, sizes) {
                matches.push(candidate);
                if matches.len() >= limit {
                    break;
                }
            }
        }

        match page.next {
            Some(next) if matches.len() < limit => cursor = Some(next),
            _ => break,
        }
    }

    log::debug!("fallback scan checked {} items, {} matched", scanned, matches.len());
    rank_by_color_tier(&mut matches, filters);
    Ok(matches)
}
