//! Syllabus lookup backing the `syllabus_lookup` responder tool.

use async_trait::async_trait;

use crate::config::{SyllabusConfig, SyllabusSection};
use crate::text;

/// Lookup of course-structure facts by topic.
#[async_trait]
pub trait SyllabusService: Send + Sync {
    /// Sections relevant to `topic`, best match first.
    async fn lookup(&self, topic: &str) -> Vec<SyllabusSection>;
}

/// Syllabus sections held in memory, matched by word overlap.
#[derive(Debug, Clone, Default)]
pub struct StaticSyllabus {
    sections: Vec<SyllabusSection>,
}

impl StaticSyllabus {
    pub fn new(sections: Vec<SyllabusSection>) -> Self {
        Self { sections }
    }

    pub fn from_config(config: &SyllabusConfig) -> Self {
        Self::new(config.sections.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    fn overlap(query_words: &[String], section: &SyllabusSection) -> usize {
        let haystack = text::normalize(&format!("{} {}", section.topic, section.text));
        let topic = text::normalize(&section.topic);
        query_words
            .iter()
            .map(|w| {
                if topic.contains(w.as_str()) {
                    2
                } else if haystack.contains(w.as_str()) {
                    1
                } else {
                    0
                }
            })
            .sum()
    }
}

#[async_trait]
impl SyllabusService for StaticSyllabus {
    async fn lookup(&self, topic: &str) -> Vec<SyllabusSection> {
        let words: Vec<String> = text::normalize(topic)
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
            .map(str::to_string)
            .collect();
        if words.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(usize, &SyllabusSection)> = self
            .sections
            .iter()
            .map(|s| (Self::overlap(&words, s), s))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().map(|(_, s)| s.clone()).collect()
    }
}
