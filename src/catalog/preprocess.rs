//! Text preparation for embedding generation.
//!
//! Item text is title, description, facet tokens and keywords joined in a
//! fixed order, so the same record always produces the same text and the
//! same cache key.

use sha2::{Digest, Sha256};

use crate::facets::{FacetQuery, FacetRecord};

/// Maximum content length for embedding input (characters, not tokens)
const MAX_CONTENT_LENGTH: usize = 1024;

const TRUNCATION_SUFFIX: &str = "...";

/// Build the embedding input for an indexed record.
///
/// Returns `None` when the record carries no text at all.
pub fn embedding_text(record: &FacetRecord) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();

    for part in [record.title.trim(), record.description.trim()] {
        if !part.is_empty() {
            parts.push(part);
        }
    }

    let tokens = record.facets.tokens();
    let keywords: Vec<&str> = record
        .keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .collect();

    let mut content = parts.join(" - ");
    if !tokens.is_empty() {
        push_section(&mut content, &tokens.join(", "));
    }
    if !keywords.is_empty() {
        push_section(&mut content, &keywords.join(", "));
    }

    if content.is_empty() {
        None
    } else {
        Some(truncate_content(&content))
    }
}

/// Build the embedding input for a shopper query.
///
/// Without query text, the wanted facet tokens stand in for it.
pub fn query_embedding_text(query: &str, facets: &FacetQuery) -> Option<String> {
    let query = query.trim();
    let tokens = facets.include_tokens();

    let content = match (query.is_empty(), tokens.is_empty()) {
        (true, true) => return None,
        (true, false) => tokens.join(" "),
        (false, true) => query.to_string(),
        (false, false) => format!("{} {}", query, tokens.join(" ")),
    };

    Some(truncate_content(&content))
}

fn push_section(content: &mut String, section: &str) {
    if !content.is_empty() {
        content.push_str(". ");
    }
    content.push_str(section);
}

fn truncate_content(content: &str) -> String {
    if content.chars().count() <= MAX_CONTENT_LENGTH {
        return content.to_string();
    }

    let max_chars = MAX_CONTENT_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = content.chars().take(max_chars).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}

/// Cache key for an embedding: SHA-256 over model name and text, truncated to 64 bits.
///
/// Stable across processes, unlike `DefaultHasher`.
pub fn content_hash(model_name: &str, text: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();

    let mut key = [0u8; 8];
    key.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(key)
}
