//! Facet records stored next to every index position, and the query-side
//! facet constraints extracted from shopper input.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::normalize::{canonical_color, canonical_occasion, canonical_set, fold_text};

pub type FacetSet = BTreeSet<String>;

/// The structured facets a catalog item can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetKind {
    Occasions,
    Colors,
    Fabrics,
    Silhouette,
    Neckline,
    Sleeves,
    Details,
}

impl FacetKind {
    pub const ALL: [FacetKind; 7] = [
        FacetKind::Occasions,
        FacetKind::Colors,
        FacetKind::Fabrics,
        FacetKind::Silhouette,
        FacetKind::Neckline,
        FacetKind::Sleeves,
        FacetKind::Details,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FacetKind::Occasions => "occasions",
            FacetKind::Colors => "colors",
            FacetKind::Fabrics => "fabrics",
            FacetKind::Silhouette => "silhouette",
            FacetKind::Neckline => "neckline",
            FacetKind::Sleeves => "sleeves",
            FacetKind::Details => "details",
        }
    }

    /// Canonicalize a raw value for this facet.
    pub fn canonicalize(&self, raw: &str) -> String {
        match self {
            FacetKind::Occasions => canonical_occasion(raw),
            FacetKind::Colors => canonical_color(raw),
            _ => fold_text(raw),
        }
    }

    fn canon_fn(&self) -> fn(&str) -> String {
        match self {
            FacetKind::Occasions => canonical_occasion,
            FacetKind::Colors => canonical_color,
            _ => fold_text,
        }
    }

    pub fn canonical_set<I, S>(&self, values: I) -> FacetSet
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        canonical_set(values, self.canon_fn())
    }
}

/// Facets of an indexed item. An absent facet is omitted from the stored
/// record; constraints treat it like an empty set, so it matches no
/// requested value and trips no negation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Facets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occasions: Option<FacetSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colors: Option<FacetSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fabrics: Option<FacetSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silhouette: Option<FacetSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neckline: Option<FacetSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleeves: Option<FacetSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<FacetSet>,
}

impl Facets {
    pub fn get(&self, kind: FacetKind) -> Option<&FacetSet> {
        self.slot(kind).as_ref()
    }

    fn slot(&self, kind: FacetKind) -> &Option<FacetSet> {
        match kind {
            FacetKind::Occasions => &self.occasions,
            FacetKind::Colors => &self.colors,
            FacetKind::Fabrics => &self.fabrics,
            FacetKind::Silhouette => &self.silhouette,
            FacetKind::Neckline => &self.neckline,
            FacetKind::Sleeves => &self.sleeves,
            FacetKind::Details => &self.details,
        }
    }

    fn slot_mut(&mut self, kind: FacetKind) -> &mut Option<FacetSet> {
        match kind {
            FacetKind::Occasions => &mut self.occasions,
            FacetKind::Colors => &mut self.colors,
            FacetKind::Fabrics => &mut self.fabrics,
            FacetKind::Silhouette => &mut self.silhouette,
            FacetKind::Neckline => &mut self.neckline,
            FacetKind::Sleeves => &mut self.sleeves,
            FacetKind::Details => &mut self.details,
        }
    }

    /// Canonicalize and merge values into a facet. Empty input leaves it untouched.
    pub fn extend<I, S>(&mut self, kind: FacetKind, values: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let values = kind.canonical_set(values);
        if values.is_empty() {
            return;
        }
        self.slot_mut(kind).get_or_insert_with(FacetSet::new).extend(values);
    }

    pub fn is_empty(&self) -> bool {
        FacetKind::ALL.iter().all(|kind| self.get(*kind).is_none())
    }

    /// All facet tokens in a stable order, used to build embedding text.
    pub fn tokens(&self) -> Vec<&str> {
        FacetKind::ALL
            .iter()
            .filter_map(|kind| self.get(*kind))
            .flat_map(|set| set.iter().map(String::as_str))
            .collect()
    }
}

/// Immutable snapshot of an item taken when it was embedded.
///
/// Lives at the same position in the metadata array as its vector in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub facets: Facets,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub embedded_at: chrono::DateTime<chrono::Utc>,
}

/// Wanted and negated values for one facet of a query.
///
/// Empty terms impose no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetTerms {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub include: FacetSet,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub exclude: FacetSet,
}

impl FacetTerms {
    pub fn including<I, S>(values: I, canon: fn(&str) -> String) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            include: canonical_set(values, canon),
            exclude: FacetSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// True when `actual` shares a wanted value, or nothing is wanted.
    pub fn wanted_by(&self, actual: &FacetSet) -> bool {
        self.include.is_empty() || !self.include.is_disjoint(actual)
    }

    /// True when `actual` carries any negated value.
    pub fn excluded_by(&self, actual: &FacetSet) -> bool {
        !self.exclude.is_disjoint(actual)
    }
}

/// Facet constraints for one search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetQuery {
    #[serde(default)]
    pub occasions: FacetTerms,
    #[serde(default)]
    pub colors: FacetTerms,
    #[serde(default)]
    pub fabrics: FacetTerms,
    #[serde(default)]
    pub silhouette: FacetTerms,
    #[serde(default)]
    pub neckline: FacetTerms,
    #[serde(default)]
    pub sleeves: FacetTerms,
    #[serde(default)]
    pub details: FacetTerms,
    /// Requested base hues (`azul`, `verde`).
    #[serde(default)]
    pub color_base: FacetTerms,
    /// Requested commercial color names (`azul royal`).
    #[serde(default)]
    pub color_commercial: FacetTerms,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl FacetQuery {
    pub fn terms(&self, kind: FacetKind) -> &FacetTerms {
        match kind {
            FacetKind::Occasions => &self.occasions,
            FacetKind::Colors => &self.colors,
            FacetKind::Fabrics => &self.fabrics,
            FacetKind::Silhouette => &self.silhouette,
            FacetKind::Neckline => &self.neckline,
            FacetKind::Sleeves => &self.sleeves,
            FacetKind::Details => &self.details,
        }
    }

    pub fn terms_mut(&mut self, kind: FacetKind) -> &mut FacetTerms {
        match kind {
            FacetKind::Occasions => &mut self.occasions,
            FacetKind::Colors => &mut self.colors,
            FacetKind::Fabrics => &mut self.fabrics,
            FacetKind::Silhouette => &mut self.silhouette,
            FacetKind::Neckline => &mut self.neckline,
            FacetKind::Sleeves => &mut self.sleeves,
            FacetKind::Details => &mut self.details,
        }
    }

    pub fn has_color_terms(&self) -> bool {
        !self.colors.include.is_empty()
            || !self.color_base.include.is_empty()
            || !self.color_commercial.include.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        FacetKind::ALL.iter().all(|kind| self.terms(*kind).is_empty())
            && self.color_base.is_empty()
            && self.color_commercial.is_empty()
            && self.category.is_none()
    }

    /// Merge `other` into `self`, unioning every facet.
    pub fn merge(&mut self, other: &FacetQuery) {
        for kind in FacetKind::ALL {
            let theirs = other.terms(kind).clone();
            let ours = self.terms_mut(kind);
            ours.include.extend(theirs.include);
            ours.exclude.extend(theirs.exclude);
        }
        self.color_base.include.extend(other.color_base.include.iter().cloned());
        self.color_base.exclude.extend(other.color_base.exclude.iter().cloned());
        self.color_commercial
            .include
            .extend(other.color_commercial.include.iter().cloned());
        self.color_commercial
            .exclude
            .extend(other.color_commercial.exclude.iter().cloned());
        if self.category.is_none() {
            self.category = other.category.clone();
        }
    }

    /// Wanted tokens across all facets, used to build richer embedding text.
    pub fn include_tokens(&self) -> Vec<&str> {
        let mut tokens: Vec<&str> = FacetKind::ALL
            .iter()
            .flat_map(|kind| self.terms(*kind).include.iter().map(String::as_str))
            .collect();
        tokens.extend(self.color_commercial.include.iter().map(String::as_str));
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_canonicalizes() {
        let mut facets = Facets::default();
        facets.extend(FacetKind::Occasions, ["Black Tie", "Gala", ""]);
        facets.extend(FacetKind::Colors, ["Azul  Royal"]);

        assert_eq!(facets.get(FacetKind::Occasions).map(|s| s.len()), Some(1));
        assert!(facets.get(FacetKind::Colors).unwrap().contains("azul royal"));
        assert!(facets.get(FacetKind::Fabrics).is_none());
    }

    #[test]
    fn test_extend_with_only_empty_values_keeps_facet_absent() {
        let mut facets = Facets::default();
        facets.extend(FacetKind::Sleeves, ["", "   "]);
        assert!(facets.get(FacetKind::Sleeves).is_none());
        assert!(facets.is_empty());
    }

    #[test]
    fn test_facets_serde_skips_absent() {
        let mut facets = Facets::default();
        facets.extend(FacetKind::Silhouette, ["Sereia"]);
        let json = serde_json::to_value(&facets).unwrap();
        assert_eq!(json, serde_json::json!({"silhouette": ["sereia"]}));
    }

    #[test]
    fn test_terms_matching() {
        let terms = FacetTerms {
            include: ["sereia".to_string()].into(),
            exclude: ["tomara que caia".to_string()].into(),
        };
        let actual: FacetSet = ["sereia".to_string(), "tomara que caia".to_string()].into();
        assert!(terms.wanted_by(&actual));
        assert!(terms.excluded_by(&actual));
        assert!(FacetTerms::default().wanted_by(&FacetSet::new()));
    }

    #[test]
    fn test_query_merge_and_emptiness() {
        let mut a = FacetQuery::default();
        assert!(a.is_empty());

        let mut b = FacetQuery::default();
        b.occasions.include.insert("madrinha".into());
        b.color_base.include.insert("azul".into());
        a.merge(&b);

        assert!(!a.is_empty());
        assert!(a.has_color_terms());
        assert!(a.occasions.include.contains("madrinha"));
    }
}
