//! Concept detection over normalised query text.

use regex::Regex;

use crate::config::ConceptEntry;
use crate::error::ConfigError;
use crate::rules::compile_pattern;
use crate::text;

/// Course concepts and the surface forms that mention them.
#[derive(Debug, Clone)]
pub struct ConceptCatalog {
    concepts: Vec<(String, Regex)>,
}

impl ConceptCatalog {
    pub fn new(entries: &[ConceptEntry]) -> Result<Self, ConfigError> {
        let concepts = entries
            .iter()
            .filter(|e| !e.aliases.is_empty())
            .map(|entry| {
                let alternatives: Vec<String> = entry
                    .aliases
                    .iter()
                    .map(|a| regex::escape(&text::normalize(a)))
                    .collect();
                let pattern = format!(r"\b(?:{})\b", alternatives.join("|"));
                Ok((entry.id.clone(), compile_pattern("concepts", &pattern)?))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { concepts })
    }

    /// Concept ids mentioned in `normalized`, ordered by first mention.
    pub fn detect(&self, normalized: &str) -> Vec<String> {
        let mut hits: Vec<(usize, &str)> = self
            .concepts
            .iter()
            .filter_map(|(id, re)| re.find(normalized).map(|m| (m.start(), id.as_str())))
            .collect();
        hits.sort_by_key(|(pos, _)| *pos);
        hits.into_iter().map(|(_, id)| id.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.concepts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConceptsConfig;

    fn catalog() -> ConceptCatalog {
        ConceptCatalog::new(&ConceptsConfig::default().catalog).unwrap()
    }

    #[test]
    fn test_detect_single_concept() {
        assert_eq!(
            catalog().detect(&text::normalize("I don't understand Gradient Descent")),
            vec!["gradient_descent"]
        );
    }

    #[test]
    fn test_detect_orders_by_first_mention() {
        let found = catalog().detect(&text::normalize(
            "does regularization help with overfitting in a neural net?",
        ));
        assert_eq!(found, vec!["regularization", "overfitting", "neural_networks"]);
    }

    #[test]
    fn test_detect_aliases_and_boundaries() {
        let c = catalog();
        assert_eq!(c.detect("how does backprop work"), vec!["backpropagation"]);
        // "sgd" alias must not fire inside another word.
        assert!(c.detect("sgdx is not a thing").is_empty());
        assert!(c.detect("what is the weather today").is_empty());
    }

    #[test]
    fn test_detect_hyphenated_alias() {
        assert_eq!(
            catalog().detect(&text::normalize("explain k-fold cross-validation")),
            vec!["cross_validation"]
        );
    }
}
