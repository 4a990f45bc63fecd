//! Tests against the real local embedding model.
//!
//! These download the model on first run and are ignored by default.
//! Run with: cargo test embeddings -- --ignored

use crate::catalog::{
    content_hash, embedding_text, query_embedding_text, Embedder, EmbeddingModel, IndexStore,
    VectorIndex,
};
use crate::facets::{FacetKind, FacetQuery, FacetRecord, Facets};

const MODEL: &str = "multilingual-e5-small";

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    dot / (norm_a * norm_b)
}

fn record(id: &str, title: &str, description: &str, occasion: &str) -> FacetRecord {
    let mut facets = Facets::default();
    facets.extend(FacetKind::Occasions, [occasion]);
    FacetRecord {
        id: id.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        category: Some("vestido".to_string()),
        facets,
        keywords: vec![],
        image: None,
        embedded_at: chrono::Utc::now(),
    }
}

#[test]
#[ignore = "requires model download"]
fn test_similar_dresses_score_higher() {
    let dir = tempfile::tempdir().unwrap();
    let model = EmbeddingModel::new(MODEL, dir.path().to_path_buf(), None)
        .expect("Failed to initialize embedding model");

    let long_blue = model.embed("Vestido longo azul royal para madrinha").unwrap();
    let long_navy = model.embed("Vestido longo azul marinho para casamento").unwrap();
    let unrelated = model.embed("Manual de instalação de ar condicionado").unwrap();

    assert_eq!(long_blue.len(), model.dimensions());
    let close = cosine_similarity(&long_blue, &long_navy);
    let far = cosine_similarity(&long_blue, &unrelated);
    assert!(close > far, "close={close} far={far}");
}

#[test]
#[ignore = "requires model download"]
fn test_embed_commit_and_search() {
    let dir = tempfile::tempdir().unwrap();
    let model = EmbeddingModel::new(MODEL, dir.path().to_path_buf(), None)
        .expect("Failed to initialize embedding model");

    let records = vec![
        record("1", "Vestido Aurora", "Longo azul royal com brilho", "madrinha"),
        record("2", "Vestido Flor", "Curto rosa em renda", "formatura"),
        record("3", "Macacão Noite", "Pantalona preta de alfaiataria", "black tie"),
    ];
    let texts: Vec<String> = records.iter().filter_map(embedding_text).collect();
    assert_eq!(texts.len(), 3);

    let vectors = model.embed_batch(&texts).unwrap();
    let mut index = VectorIndex::new(model.dimensions());
    for vector in vectors {
        index.push(vector).unwrap();
    }

    let store = IndexStore::new(dir.path().join("index"));
    let generation = store.commit(&index, &records, &model.model_id_hash()).unwrap();
    assert_eq!(store.current_generation().unwrap(), Some(generation));

    let mut facets = FacetQuery::default();
    facets
        .terms_mut(FacetKind::Occasions)
        .include
        .insert("madrinha".to_string());
    let query = query_embedding_text("vestido azul para madrinha", &facets).unwrap();
    let neighbors = index.search(&model.embed(&query).unwrap(), 3).unwrap();
    assert_eq!(records[neighbors[0].position].id, "1");

    // the cache key moves with the text, not with the record id
    assert_ne!(content_hash(MODEL, &texts[0]), content_hash(MODEL, &texts[1]));
}
