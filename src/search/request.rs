use serde::Serialize;
use serde_json::Value;

use crate::config::SearchConfig;
use crate::facets::{FacetQuery, FacetSet, FacetTerms};
use crate::normalize::{base_hue, canonical_color, canonical_occasion, canonical_set, canonical_size};
use crate::search::constraints::ColorTier;
use crate::search::SearchError;

/// A validated search request. `limit` is already clamped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub occasions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub color_base: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub color_commercial: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sizes: Vec<String>,
    /// Disambiguation hint for the rewriter, never a filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_occasion: Option<String>,
    pub limit: usize,
}

fn validation(field: &str, message: impl Into<String>) -> SearchError {
    SearchError::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

/// A string or an array of strings. `null` and absence mean empty.
fn string_or_list(body: &serde_json::Map<String, Value>, field: &str) -> Result<Vec<String>, SearchError> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(vec![]),
        Some(Value::String(s)) => Ok(if s.trim().is_empty() { vec![] } else { vec![s.trim().to_string()] }),
        Some(Value::Array(values)) => values
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.trim().to_string()),
                other => Err(validation(field, format!("expected strings, found {other}"))),
            })
            .filter(|v| !matches!(v, Ok(s) if s.is_empty()))
            .collect(),
        Some(other) => Err(validation(field, format!("expected a string or an array of strings, found {other}"))),
    }
}

fn optional_string(body: &serde_json::Map<String, Value>, field: &str) -> Result<Option<String>, SearchError> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string()).filter(|s| !s.is_empty())),
        Some(other) => Err(validation(field, format!("expected a string, found {other}"))),
    }
}

impl SearchRequest {
    pub fn new(query: &str, limit: usize, config: &SearchConfig) -> Self {
        Self {
            query: query.trim().to_string(),
            limit: limit.clamp(1, config.max_limit),
            ..Default::default()
        }
    }

    /// Validate a JSON request body. Nothing is processed on failure.
    pub fn from_json(value: &Value, config: &SearchConfig) -> Result<Self, SearchError> {
        let body = value
            .as_object()
            .ok_or_else(|| validation("body", "expected a JSON object"))?;

        let query = optional_string(body, "query")?.unwrap_or_default();
        let limit = match body.get("limit") {
            None | Some(Value::Null) => config.default_limit,
            Some(Value::Number(n)) => match n.as_i64() {
                Some(n) => n.clamp(1, config.max_limit as i64) as usize,
                None => return Err(validation("limit", format!("expected an integer, found {n}"))),
            },
            Some(Value::String(s)) => match s.trim().parse::<i64>() {
                Ok(n) => n.clamp(1, config.max_limit as i64) as usize,
                Err(_) => return Err(validation("limit", format!("expected an integer, found \"{s}\""))),
            },
            Some(other) => return Err(validation("limit", format!("expected an integer, found {other}"))),
        };

        let request = Self {
            query,
            occasions: string_or_list(body, "occasions")?,
            color_base: string_or_list(body, "colorBase")?,
            color_commercial: string_or_list(body, "colorCommercial")?,
            sizes: string_or_list(body, "sizes")?,
            target_occasion: optional_string(body, "targetOccasion")?,
            limit,
        };

        if request.query.is_empty() && !request.has_filters() {
            return Err(validation("query", "provide a query or at least one filter"));
        }

        Ok(request)
    }

    pub fn has_filters(&self) -> bool {
        !self.occasions.is_empty()
            || !self.color_base.is_empty()
            || !self.color_commercial.is_empty()
            || !self.sizes.is_empty()
    }

    /// Explicit filters as facet constraints.
    ///
    /// A commercial color filter matches the commercial name only; its base
    /// hue is not implied. A commercial name that is a bare hue filters by hue.
    pub fn facet_filters(&self) -> FacetQuery {
        let mut facets = FacetQuery {
            occasions: FacetTerms::including(&self.occasions, canonical_occasion),
            ..Default::default()
        };

        for color in &self.color_base {
            let color = canonical_color(color);
            if let Some(hue) = base_hue(&color).or_else(|| Some(color).filter(|c| !c.is_empty())) {
                facets.color_base.include.insert(hue);
            }
        }
        for color in &self.color_commercial {
            let color = canonical_color(color);
            if color.is_empty() {
                continue;
            }
            if base_hue(&color).as_deref() == Some(color.as_str()) {
                facets.color_base.include.insert(color);
            } else {
                facets.color_commercial.include.insert(color);
            }
        }

        facets
    }

    pub fn size_filter(&self) -> FacetSet {
        canonical_set(&self.sizes, canonical_size)
    }
}

/// Where a hit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HitSource {
    Index,
    Fallback,
}

/// One ranked item with live inventory fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub occasions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_commercial: Option<String>,
    pub sizes: Vec<String>,
    /// Cosine distance to the query; absent for fallback hits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_match: Option<ColorTier>,
    pub source: HitSource,
}

/// A valid request that matched nothing. Returned, never raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchFailure {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub requested: Value,
    pub guidance: String,
}

impl SearchFailure {
    pub fn no_results(requested: Value, had_filters: bool) -> Self {
        let guidance = if had_filters {
            "Remove or widen some filters (occasion, color, size) and try again."
        } else {
            "Try a broader description, e.g. the occasion or the main color."
        };
        Self {
            kind: "no_results".to_string(),
            message: "No available items match this search.".to_string(),
            requested,
            guidance: guidance.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchStats {
    /// ANN searches issued, the first one included
    pub rounds: usize,
    /// Window size of each ANN search, in order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub windows: Vec<usize>,
    pub candidates_seen: usize,
    pub fallback_used: bool,
    pub constraints_degraded: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rewritten_query: String,
}

impl SearchStats {
    /// Window expansions after the first search.
    pub fn expansions(&self) -> usize {
        self.rounds.saturating_sub(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResponse {
    pub items: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SearchFailure>,
    pub stats: SearchStats,
}
