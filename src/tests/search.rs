use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::json;

use super::{CannedChat, Harness, ItemSpec};
use crate::catalog::IndexSnapshot;
use crate::config::SearchConfig;
use crate::inventory::{
    EmbeddingStatus, InventoryError, InventoryItem, InventoryStore, ItemStatus, ItemUpdate, ReembedPolicy,
    ScanPage,
};
use crate::llm::ChatModel;
use crate::reconcile::NoProgress;
use crate::search::{ColorTier, HitSource, SearchError, SearchRequest, SearchService};

fn catalog() -> Vec<InventoryItem> {
    vec![
        ItemSpec {
            id: "royal",
            title: "Vestido Aurora",
            description: "Longo azul royal com brilho",
            occasions: &["madrinha"],
            color_base: Some("Azul"),
            color_commercial: Some("Azul Royal"),
            sizes: &["P", "M"],
        }
        .build(),
        ItemSpec {
            id: "marinho",
            title: "Vestido Celeste",
            description: "Midi azul marinho",
            occasions: &["madrinha"],
            color_base: Some("azul"),
            color_commercial: Some("Azul Marinho"),
            sizes: &["M"],
        }
        .build(),
        ItemSpec {
            id: "rosa",
            title: "Vestido Flor",
            description: "Longo rosa em tule",
            occasions: &["formatura"],
            color_base: Some("rosa"),
            color_commercial: None,
            sizes: &["G"],
        }
        .build(),
        ItemSpec {
            id: "preto",
            title: "Vestido Noite",
            description: "Longo preto sereia",
            occasions: &["Black Tie"],
            color_base: Some("preto"),
            color_commercial: None,
            sizes: &["M"],
        }
        .build(),
        ItemSpec {
            id: "vermelho",
            title: "Vestido Paixao",
            description: "Longo vermelho fluido",
            occasions: &["madrinha"],
            color_base: Some("vermelho"),
            color_commercial: None,
            sizes: &["M"],
        }
        .build(),
    ]
}

fn synced() -> Harness {
    let harness = Harness::new(catalog());
    harness.reconciler.rebuild(false, &NoProgress).unwrap();
    harness
}

fn ids(response: &crate::search::SearchResponse) -> Vec<&str> {
    response.items.iter().map(|hit| hit.id.as_str()).collect()
}

const MADRINHA_REWRITE: &str = r#"{"rewritten_query": "vestido azul royal madrinha",
    "facets": {"occasions": ["madrinha"], "colors": ["azul royal"]}}"#;

#[test]
fn test_madrinha_azul_royal_ranks_by_color_tier() {
    let harness = synced();
    let chat = CannedChat::new(MADRINHA_REWRITE);
    let search = harness.search(Some(chat.clone() as Arc<dyn ChatModel>), SearchConfig::default());

    let request = SearchRequest::new("Vestido azul royal para madrinha", 5, search.config());
    let response = search.search(&request).unwrap();

    assert_eq!(ids(&response), vec!["royal", "marinho"]);
    assert_eq!(response.items[0].color_match, Some(ColorTier::Commercial));
    assert_eq!(response.items[1].color_match, Some(ColorTier::Base));
    assert!(response.error.is_none());
    assert_eq!(response.stats.rewritten_query, "vestido azul royal madrinha");

    // same query, differently cased: served from the rewrite cache
    let again = search
        .search(&SearchRequest::new("vestido AZUL royal para Madrinha", 5, search.config()))
        .unwrap();
    assert_eq!(ids(&again), vec!["royal", "marinho"]);
    assert_eq!(chat.calls(), 1);
}

#[test]
fn test_unavailable_color_reports_no_results() {
    let harness = synced();
    let search = harness.search(None, SearchConfig::default());

    let response = search
        .search_json(&json!({"query": "vestido longo", "colorBase": ["Verde"]}))
        .unwrap();

    assert!(response.items.is_empty());
    assert!(response.stats.fallback_used);
    let error = response.error.expect("no_results outcome");
    assert_eq!(error.kind, "no_results");
    assert_eq!(error.requested["colorBase"], json!(["Verde"]));
    assert!(!error.guidance.is_empty());
}

#[test]
fn test_black_tie_and_gala_are_the_same_occasion() {
    let harness = synced();
    let search = harness.search(None, SearchConfig::default());

    let black_tie = search
        .search_json(&json!({"query": "vestido longo", "occasions": ["Black Tie"]}))
        .unwrap();
    let gala = search
        .search_json(&json!({"query": "vestido longo", "occasions": "gala"}))
        .unwrap();

    assert_eq!(ids(&black_tie), vec!["preto"]);
    assert_eq!(ids(&black_tie), ids(&gala));
}

#[test]
fn test_size_filter_is_hard() {
    let harness = synced();
    let search = harness.search(None, SearchConfig::default());

    let response = search
        .search_json(&json!({"query": "vestido longo", "sizes": ["g"]}))
        .unwrap();
    assert_eq!(ids(&response), vec!["rosa"]);
    assert_eq!(response.items[0].source, HitSource::Index);
}

#[test]
fn test_expansion_rounds_are_logarithmic() {
    let mut items: Vec<InventoryItem> = (0..120)
        .map(|i| {
            ItemSpec {
                id: &format!("item-{i:03}"),
                title: "Vestido Longo",
                description: "Longo azul para madrinha",
                occasions: &["madrinha"],
                color_base: Some("azul"),
                color_commercial: None,
                sizes: &["M"],
            }
            .build()
        })
        .collect();
    items.push(
        ItemSpec {
            id: "unico",
            title: "Macacao",
            description: "Macacao verde pantalona",
            occasions: &["formatura"],
            color_base: Some("verde"),
            color_commercial: None,
            sizes: &["GG"],
        }
        .build(),
    );
    let harness = Harness::new(items);
    harness.reconciler.rebuild(false, &NoProgress).unwrap();

    let config = SearchConfig {
        k_multiplier: 1,
        k_minimum: 2,
        expansion_step: 2,
        ..SearchConfig::default()
    };
    let search = harness.search(None, config);
    let response = search
        .search_json(&json!({"query": "vestido longo azul madrinha", "sizes": ["GG"], "limit": 1}))
        .unwrap();

    assert_eq!(ids(&response), vec!["unico"]);
    assert!(!response.stats.fallback_used);
    // ceil(log2(121 / 1)) = 7
    assert!(response.stats.expansions() <= 7, "{:?}", response.stats);
    assert!(response.stats.candidates_seen <= 121);
}

/// Inventory that records how often each item is read.
struct CountingStore {
    inner: Arc<dyn InventoryStore>,
    reads: Mutex<HashMap<String, usize>>,
}

impl InventoryStore for CountingStore {
    fn scan(&self, cursor: Option<usize>, page_size: usize) -> Result<ScanPage, InventoryError> {
        self.inner.scan(cursor, page_size)
    }

    fn get(&self, id: &str) -> Result<Option<InventoryItem>, InventoryError> {
        *self.reads.lock().unwrap().entry(id.to_string()).or_default() += 1;
        self.inner.get(id)
    }

    fn insert(&self, item: InventoryItem) -> Result<(), InventoryError> {
        self.inner.insert(item)
    }

    fn set_embedding_status(&self, id: &str, status: EmbeddingStatus) -> Result<(), InventoryError> {
        self.inner.set_embedding_status(id, status)
    }

    fn clear_embedding_status(&self, seen: &InventoryItem) -> Result<bool, InventoryError> {
        self.inner.clear_embedding_status(seen)
    }

    fn apply_update(
        &self,
        id: &str,
        update: ItemUpdate,
        policy: ReembedPolicy,
    ) -> Result<InventoryItem, InventoryError> {
        self.inner.apply_update(id, update, policy)
    }

    fn soft_delete(&self, id: &str) -> Result<InventoryItem, InventoryError> {
        self.inner.soft_delete(id)
    }
}

#[test]
fn test_expansion_windows_never_reread_positions() {
    let mut items: Vec<InventoryItem> = (0..120)
        .map(|i| {
            ItemSpec {
                id: &format!("item-{i:03}"),
                title: "Vestido Longo",
                description: "Longo azul para madrinha",
                occasions: &["madrinha"],
                color_base: Some("azul"),
                color_commercial: None,
                sizes: &["M"],
            }
            .build()
        })
        .collect();
    items.push(
        ItemSpec {
            id: "unico",
            title: "Macacao",
            description: "Macacao verde pantalona",
            occasions: &["formatura"],
            color_base: Some("verde"),
            color_commercial: None,
            sizes: &["GG"],
        }
        .build(),
    );
    let harness = Harness::new(items);
    harness.reconciler.rebuild(false, &NoProgress).unwrap();

    let counting = Arc::new(CountingStore {
        inner: harness.store(),
        reads: Mutex::new(HashMap::new()),
    });
    let config = SearchConfig {
        k_multiplier: 1,
        k_minimum: 2,
        expansion_step: 2,
        ..SearchConfig::default()
    };
    let search = SearchService::new(harness.index.clone(), counting.clone(), None, config, 32);
    let response = search
        .search_json(&json!({"query": "vestido longo azul madrinha", "sizes": ["GG"], "limit": 1}))
        .unwrap();

    assert_eq!(ids(&response), vec!["unico"]);
    assert_eq!(response.stats.windows, vec![2, 4, 8, 16, 32, 64, 121]);
    assert_eq!(response.stats.rounds, 7);

    let reads = counting.reads.lock().unwrap();
    assert_eq!(reads.len(), 121);
    assert!(reads.values().all(|&n| n == 1), "{reads:?}");
}

#[test]
fn test_explicit_commercial_color_excludes_same_hue() {
    let harness = synced();
    let search = harness.search(None, SearchConfig::default());

    let response = search
        .search_json(&json!({"query": "vestido", "colorCommercial": ["Azul Royal"]}))
        .unwrap();
    assert_eq!(ids(&response), vec!["royal"]);
    assert!(!response.stats.fallback_used);
    assert_eq!(response.items[0].color_match, Some(ColorTier::Commercial));
}

#[test]
fn test_fallback_commercial_color_excludes_same_hue() {
    let harness = Harness::new(catalog());
    let search = harness.search(None, SearchConfig::default());

    let response = search
        .search_json(&json!({"colorCommercial": ["Azul Royal"]}))
        .unwrap();
    assert!(response.stats.fallback_used);
    assert_eq!(ids(&response), vec!["royal"]);
}

#[test]
fn test_duplicate_index_entries_are_returned_once() {
    let harness = synced();
    let snapshot = harness.index.snapshot().unwrap();

    // the same items twice over, as a corrupted generation would have them
    let mut index = crate::catalog::VectorIndex::new(snapshot.index().dimensions());
    let mut metadata = Vec::new();
    for _ in 0..2 {
        for (position, record) in snapshot.metadata().iter().enumerate() {
            index.push(snapshot.index().vector(position).unwrap().to_vec()).unwrap();
            metadata.push(record.clone());
        }
    }
    harness
        .index
        .install(IndexSnapshot::new(Some(99), index, metadata).unwrap())
        .unwrap();

    let search = harness.search(None, SearchConfig::default());
    let response = search.search(&SearchRequest::new("vestido longo", 48, search.config())).unwrap();

    let unique: HashSet<&str> = ids(&response).into_iter().collect();
    assert_eq!(unique.len(), response.items.len());
    assert_eq!(response.items.len(), 5);
}

#[test]
fn test_unsellable_items_are_never_returned() {
    let harness = synced();
    harness
        .inventory
        .apply_update(
            "royal",
            ItemUpdate {
                status: Some(ItemStatus::Archived),
                ..Default::default()
            },
            ReembedPolicy::default(),
        )
        .unwrap();
    harness.inventory.soft_delete("marinho").unwrap();

    let search = harness.search(None, SearchConfig::default());
    let response = search
        .search_json(&json!({"query": "vestido azul", "colorBase": ["azul"]}))
        .unwrap();

    assert!(response.items.is_empty());
    assert!(response.error.is_some());
}

#[test]
fn test_live_fields_override_stale_snapshot() {
    let harness = synced();
    harness
        .inventory
        .apply_update(
            "rosa",
            ItemUpdate {
                price: Some(120.0),
                sizes: Some(vec!["PP".to_string()]),
                ..Default::default()
            },
            ReembedPolicy::default(),
        )
        .unwrap();

    let search = harness.search(None, SearchConfig::default());
    let response = search
        .search_json(&json!({"query": "vestido rosa", "sizes": ["PP"]}))
        .unwrap();

    assert_eq!(ids(&response), vec!["rosa"]);
    assert_eq!(response.items[0].price, Some(120.0));
    assert_eq!(response.items[0].sizes, vec!["PP"]);
}

#[test]
fn test_fallback_scan_without_index() {
    let harness = Harness::new(catalog());
    let search = harness.search(None, SearchConfig::default());

    let response = search.search_json(&json!({"colorBase": "rosa"})).unwrap();
    assert!(response.stats.fallback_used);
    assert_eq!(ids(&response), vec!["rosa"]);
    assert_eq!(response.items[0].source, HitSource::Fallback);
    assert!(response.items[0].distance.is_none());
}

#[test]
fn test_extracted_constraints_degrade_explicit_ones_do_not() {
    let harness = synced();
    let chat = CannedChat::new(r#"{"rewritten_query": "vestido sereia", "facets": {"silhouette": ["sereia"]}}"#);
    let search = harness.search(Some(chat as Arc<dyn ChatModel>), SearchConfig::default());

    // no item has a silhouette facet, so the extracted constraint is dropped
    let response = search
        .search(&SearchRequest::new("vestido sereia", 3, search.config()))
        .unwrap();
    assert!(response.stats.constraints_degraded);
    assert!(!response.items.is_empty());

    let strict = harness.search(
        None,
        SearchConfig {
            degrade_constraints: false,
            ..SearchConfig::default()
        },
    );
    let response = strict
        .search_json(&json!({"query": "vestido sereia", "colorBase": ["verde"]}))
        .unwrap();
    assert!(response.items.is_empty());
    assert!(!response.stats.constraints_degraded);
}

#[test]
fn test_similar_items_rank_by_color() {
    let harness = synced();
    let search = harness.search(None, SearchConfig::default());

    let response = search.similar("royal", 3).unwrap();
    let found = ids(&response);
    assert!(!found.contains(&"royal"));
    assert_eq!(found[0], "marinho");
    assert_eq!(response.items.len(), 3);

    assert!(matches!(search.similar("nope", 3), Err(SearchError::NotIndexed(_))));
}

#[test]
fn test_malformed_request_is_rejected() {
    let harness = synced();
    let search = harness.search(None, SearchConfig::default());

    let result = search.search_json(&json!({"query": "vestido", "sizes": 42}));
    assert!(matches!(result, Err(SearchError::Validation { ref field, .. }) if field == "sizes"));
}
