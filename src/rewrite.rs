//! Query understanding: free text to a rewritten query plus structured facets.
//!
//! Results are cached per (target occasion, folded query). The cache is
//! bounded by a TTL and by a capacity ceiling, both enforced when writing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::facets::{FacetKind, FacetQuery, FacetTerms};
use crate::llm::{extract_json_object, string_field, string_list, ChatModel, ChatRequest};
use crate::normalize::{base_hue, canonical_color, canonical_occasion, fold_text, slugify};
use crate::vocabulary::VocabularyDigest;

const SYSTEM_PROMPT: &str = "Você interpreta buscas de clientes de uma loja de aluguel de vestidos. \
Responda somente com um objeto JSON com as chaves: \
rewritten_query (a busca reescrita de forma clara para busca semântica, mantendo cores e detalhes pedidos), \
facets (objeto com listas: occasions, colors, fabrics, silhouette, neckline, sleeves, details), \
excluded (objeto com as mesmas chaves de facets, com valores que a cliente NÃO quer), \
excluded_terms (lista de termos negados, ex.: 'sem manga' → 'manga'), \
category ('noiva', 'festa' ou null). \
Extraia apenas o que a cliente pediu. A ocasião alvo, quando informada, serve só para desambiguar: \
não a inclua em facets se a cliente não a mencionou. Use o vocabulário do catálogo quando couber.";

/// Negations the model may miss: "sem brilho", "não quero manga longa", "nada de renda".
static NEGATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:sem|nao(?:\s+quero)?|nada\s+de)\s+")
        .expect("Failed to compile negation regex")
});

/// Words that end a negated phrase.
const PHRASE_BREAKS: [&str; 12] = [
    "e", "ou", "mas", "com", "para", "pra", "porque", "nem", "que", "sem", "nao", "nada",
];
const MAX_NEGATED_WORDS: usize = 3;

/// Output of one rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteResult {
    pub rewritten_query: String,
    pub extracted_facets: FacetQuery,
    pub excluded_terms: Vec<String>,
    /// True when the model output could not be used.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

impl RewriteResult {
    fn fallback(query: &str) -> Self {
        Self {
            rewritten_query: query.trim().to_string(),
            fallback: true,
            ..Default::default()
        }
    }
}

type CacheKey = (String, String);

struct CacheEntry {
    value: RewriteResult,
    inserted: Instant,
}

/// TTL and capacity bounded rewrite cache.
///
/// Expired entries are never returned; they are purged, together with the
/// oldest entries beyond capacity, on the next write.
pub struct RewriteCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl RewriteCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(query: &str, target_occasion: Option<&str>) -> CacheKey {
        (
            target_occasion.map(canonical_occasion).unwrap_or_default(),
            fold_text(query),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn get(&self, key: &CacheKey) -> Option<RewriteResult> {
        self.get_at(key, Instant::now())
    }

    pub fn insert(&self, key: CacheKey, value: RewriteResult) {
        self.insert_at(key, value, Instant::now())
    }

    fn get_at(&self, key: &CacheKey, now: Instant) -> Option<RewriteResult> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|entry| now.saturating_duration_since(entry.inserted) < self.ttl)
            .map(|entry| entry.value.clone())
    }

    fn insert_at(&self, key: CacheKey, value: RewriteResult, now: Instant) {
        let Ok(mut entries) = self.entries.lock() else {
            log::warn!("rewrite cache lock poisoned, skipping insert");
            return;
        };

        entries.insert(
            key,
            CacheEntry {
                value,
                inserted: now,
            },
        );

        entries.retain(|_, entry| now.saturating_duration_since(entry.inserted) < self.ttl);

        if entries.len() > self.capacity {
            let mut by_age: Vec<(CacheKey, Instant)> = entries
                .iter()
                .map(|(k, entry)| (k.clone(), entry.inserted))
                .collect();
            by_age.sort_by_key(|(_, inserted)| *inserted);
            let overflow = entries.len() - self.capacity;
            for (k, _) in by_age.into_iter().take(overflow) {
                entries.remove(&k);
            }
        }
    }
}

pub struct QueryRewriter {
    chat: Arc<dyn ChatModel>,
    model: String,
    cache: RewriteCache,
}

impl QueryRewriter {
    pub fn new(chat: Arc<dyn ChatModel>, model: &str, cache: RewriteCache) -> Self {
        Self {
            chat,
            model: model.to_string(),
            cache,
        }
    }

    pub fn cache(&self) -> &RewriteCache {
        &self.cache
    }

    /// Rewrite `query`, consulting the cache first.
    ///
    /// `target_occasion` only disambiguates; it never becomes a facet the
    /// shopper did not ask for. Model failures fall back to the original
    /// query with no facets and are not cached.
    pub fn rewrite(
        &self,
        query: &str,
        target_occasion: Option<&str>,
        hints: &VocabularyDigest,
    ) -> RewriteResult {
        let key = RewriteCache::key(query, target_occasion);
        if key.1.is_empty() {
            return RewriteResult::fallback(query);
        }

        if let Some(hit) = self.cache.get(&key) {
            log::debug!("rewrite cache hit for '{}'", key.1);
            return hit;
        }

        let mut user = format!("Busca: {}", query.trim());
        if !key.0.is_empty() {
            user.push_str(&format!("\nOcasião alvo (apenas contexto): {}", key.0));
        }
        user.push_str(&format!("\nVocabulário do catálogo: {}", hints.to_prompt_json()));

        let request = ChatRequest::new(&self.model, SYSTEM_PROMPT, user);
        let parsed = match self.chat.complete(&request) {
            Ok(output) => extract_json_object(&output),
            Err(err) => {
                log::warn!("query rewrite failed, using original query: {}", err);
                return RewriteResult::fallback(query);
            }
        };

        let Some(map) = parsed else {
            log::warn!("query rewrite returned no JSON object, using original query");
            return RewriteResult::fallback(query);
        };

        let result = interpret(query, &map, hints);
        self.cache.insert(key, result.clone());
        result
    }
}

fn nested_list(map: &Map<String, Value>, section: &str, key: &str) -> Vec<String> {
    match map.get(section) {
        Some(Value::Object(inner)) => string_list(inner, key),
        _ => Vec::new(),
    }
}

/// Route a color value to the commercial or base terms.
///
/// A commercial name also wants its base hue, which is the second ranking tier.
fn add_color(include: bool, raw: &str, query: &mut FacetQuery) {
    let color = canonical_color(raw);
    if color.is_empty() {
        return;
    }
    let hue = base_hue(&color);

    let (commercial, base) = if include {
        (&mut query.color_commercial.include, &mut query.color_base.include)
    } else {
        (&mut query.color_commercial.exclude, &mut query.color_base.exclude)
    };

    match hue {
        Some(hue) if hue == color => {
            base.insert(hue);
        }
        Some(hue) => {
            commercial.insert(color);
            // negating "azul royal" does not negate every blue
            if include {
                base.insert(hue);
            }
        }
        None => {
            commercial.insert(color);
        }
    }
}

/// Facet a negated term belongs to, judged by where it was observed.
fn facet_for_term(term: &str, hints: &VocabularyDigest) -> Option<FacetKind> {
    FacetKind::ALL.into_iter().find(|kind| {
        let canonical = kind.canonicalize(term);
        hints.values(*kind).iter().any(|v| *v == canonical)
    })
}

/// Phrases following a negation in folded text, cut at punctuation or a
/// connector and capped at a few words.
fn negated_phrases(folded: &str) -> Vec<String> {
    NEGATION
        .find_iter(folded)
        .filter_map(|m| {
            let clause = folded[m.end()..]
                .split([',', '.', ';', '!', '?'])
                .next()
                .unwrap_or_default();
            let words: Vec<&str> = clause
                .split_whitespace()
                .take_while(|word| !PHRASE_BREAKS.contains(word))
                .take(MAX_NEGATED_WORDS)
                .collect();
            (!words.is_empty()).then(|| words.join(" "))
        })
        .collect()
}

/// A negated value and where it applies.
enum Negated {
    Color(String),
    Facet(FacetKind, String),
}

impl Negated {
    fn term(&self) -> &str {
        match self {
            Negated::Color(term) | Negated::Facet(_, term) => term,
        }
    }
}

/// Resolve a negated phrase: the longest leading part observed in the
/// catalog vocabulary wins, then a plain base hue, else the whole phrase as a detail.
fn resolve_negated(phrase: &str, hints: &VocabularyDigest) -> Negated {
    let words: Vec<&str> = phrase.split(' ').collect();
    for len in (1..=words.len()).rev() {
        let prefix = words[..len].join(" ");
        match facet_for_term(&prefix, hints) {
            Some(FacetKind::Colors) => return Negated::Color(canonical_color(&prefix)),
            Some(kind) => return Negated::Facet(kind, kind.canonicalize(&prefix)),
            None => {}
        }
    }

    if let Some(first) = words.first() {
        if base_hue(first).as_deref() == Some(*first) {
            return Negated::Color(first.to_string());
        }
    }
    Negated::Facet(FacetKind::Details, FacetKind::Details.canonicalize(phrase))
}

/// Terms the model reported as excluded are taken as whole values.
fn resolve_excluded_term(term: &str, hints: &VocabularyDigest) -> Negated {
    if base_hue(term).is_some() {
        return Negated::Color(term.to_string());
    }
    let kind = facet_for_term(term, hints).unwrap_or(FacetKind::Details);
    Negated::Facet(kind, kind.canonicalize(term))
}

fn interpret(query: &str, map: &Map<String, Value>, hints: &VocabularyDigest) -> RewriteResult {
    let mut facets = FacetQuery::default();

    for kind in FacetKind::ALL {
        if kind == FacetKind::Colors {
            continue;
        }
        let terms = facets.terms_mut(kind);
        terms.include = kind.canonical_set(nested_list(map, "facets", kind.name()));
        terms.exclude = kind.canonical_set(nested_list(map, "excluded", kind.name()));
    }
    for color in nested_list(map, "facets", "colors") {
        add_color(true, &color, &mut facets);
    }
    for color in nested_list(map, "excluded", "colors") {
        add_color(false, &color, &mut facets);
    }

    facets.category = string_field(map, "category")
        .map(|c| slugify(&c))
        .filter(|c| c == "noiva" || c == "festa");

    let negations: Vec<Negated> = string_list(map, "excluded_terms")
        .iter()
        .map(|t| fold_text(t))
        .filter(|t| !t.is_empty())
        .map(|t| resolve_excluded_term(&t, hints))
        .chain(
            negated_phrases(&fold_text(query))
                .iter()
                .map(|phrase| resolve_negated(phrase, hints)),
        )
        .collect();

    // Every excluded term is also a negated facet value, unless one already covers it
    for negated in &negations {
        match negated {
            Negated::Color(color) => add_color(false, color, &mut facets),
            Negated::Facet(kind, value) => {
                let covered = FacetKind::ALL
                    .iter()
                    .any(|k| facets.terms(*k).exclude.contains(&k.canonicalize(value)));
                if !covered {
                    facets.terms_mut(*kind).exclude.insert(value.clone());
                }
            }
        }
    }

    let mut excluded_terms: Vec<String> = negations.iter().map(|n| n.term().to_string()).collect();
    excluded_terms.sort();
    excluded_terms.dedup();

    // A wanted value cannot also be negated
    for kind in FacetKind::ALL {
        let FacetTerms { include, exclude } = facets.terms_mut(kind);
        include.retain(|v| !exclude.contains(v));
    }

    let mut rewritten = string_field(map, "rewritten_query").unwrap_or_else(|| query.trim().to_string());
    let folded_rewritten = fold_text(&rewritten);
    for color in &facets.color_commercial.include {
        if !folded_rewritten.contains(color.as_str()) {
            rewritten.push(' ');
            rewritten.push_str(color);
        }
    }

    RewriteResult {
        rewritten_query: rewritten,
        extracted_facets: facets,
        excluded_terms,
        fallback: false,
    }
}
