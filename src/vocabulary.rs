//! Per-facet digest of values observed in the index.
//!
//! Passed to the vision and rewrite models as soft hints so generated and
//! extracted facets converge on the catalog's existing wording.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::facets::{FacetKind, FacetRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct VocabularyDigest {
    values: BTreeMap<&'static str, Vec<String>>,
}

impl VocabularyDigest {
    /// The `per_facet` most frequent values of each facet, most frequent first.
    pub fn from_records(records: &[FacetRecord], per_facet: usize) -> Self {
        let mut values = BTreeMap::new();

        for kind in FacetKind::ALL {
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for set in records.iter().filter_map(|r| r.facets.get(kind)) {
                for value in set {
                    *counts.entry(value.as_str()).or_default() += 1;
                }
            }
            if counts.is_empty() {
                continue;
            }

            let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
            values.insert(
                kind.name(),
                ranked
                    .into_iter()
                    .take(per_facet)
                    .map(|(value, _)| value.to_string())
                    .collect(),
            );
        }

        Self { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self, kind: FacetKind) -> &[String] {
        self.values.get(kind.name()).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Compact JSON for prompts; `{}` when nothing has been observed.
    pub fn to_prompt_json(&self) -> String {
        serde_json::to_string(&self.values).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facets::Facets;

    fn record(occasions: &[&str], colors: &[&str]) -> FacetRecord {
        let mut facets = Facets::default();
        facets.extend(FacetKind::Occasions, occasions);
        facets.extend(FacetKind::Colors, colors);
        FacetRecord {
            id: "x".to_string(),
            title: String::new(),
            description: String::new(),
            category: None,
            facets,
            keywords: vec![],
            image: None,
            embedded_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_most_frequent_first_and_capped() {
        let records = vec![
            record(&["madrinha", "formatura"], &["azul royal"]),
            record(&["madrinha"], &["verde"]),
            record(&["gala", "Black Tie"], &[]),
            record(&["gala"], &[]),
            record(&["madrinha"], &[]),
        ];

        let digest = VocabularyDigest::from_records(&records, 2);
        assert_eq!(digest.values(FacetKind::Occasions), ["madrinha", "gala"]);
        assert_eq!(digest.values(FacetKind::Colors), ["azul royal", "verde"]);
        assert!(digest.values(FacetKind::Fabrics).is_empty());
    }

    #[test]
    fn test_prompt_json() {
        assert_eq!(VocabularyDigest::default().to_prompt_json(), "{}");

        let digest = VocabularyDigest::from_records(&[record(&["gala"], &[])], 5);
        assert_eq!(digest.to_prompt_json(), r#"{"occasions":["gala"]}"#);
    }
}
