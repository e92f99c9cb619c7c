//! Intent router: deterministic rule tier with a model-assisted fallback.
//!
//! The rule tier walks an ordered table top to bottom and stops at the first
//! rule whose signal fires. When the resulting confidence is below the
//! configured floor, the classifier tier asks the language model for the
//! same closed set of intents. Classifier answers are cached per normalised
//! query so that routing stays a pure function of the query within a process.

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;
use tracing::{debug, warn};

use crate::brain::Brain;
use crate::config::{IntentProfiles, RouterConfig, ScaffoldingConfig};
use crate::error::ConfigError;
use crate::rules::{NormalizedText, PatternSet};
use crate::scaffolding::ConfusionDetector;
use crate::types::{GenerationRequest, Intent, RoutingDecision, RoutingTier};

/// Confidence added per additional matching pattern of the winning rule.
const EXTRA_MATCH_BONUS: f64 = 0.05;

#[derive(Debug, Clone)]
enum Signal {
    Patterns(PatternSet),
    Confusion,
    Fallback,
}

#[derive(Debug, Clone)]
struct CompiledIntentRule {
    name: String,
    intent: Intent,
    signal: Signal,
    base_confidence: f64,
}

/// Routes approved queries to an intent and response profile.
pub struct IntentRouter {
    rules: Vec<CompiledIntentRule>,
    profiles: IntentProfiles,
    confusion: ConfusionDetector,
    confusion_trigger: f64,
    confidence_floor: f64,
    classifier: Option<Brain>,
    classifier_template: String,
    classifier_confidence: f64,
    cache: Option<Mutex<LruCache<String, Intent>>>,
}

impl IntentRouter {
    pub fn new(
        config: &RouterConfig,
        scaffolding: &ScaffoldingConfig,
    ) -> Result<Self, ConfigError> {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                let signal = if rule.fallback {
                    Signal::Fallback
                } else if rule.confusion {
                    Signal::Confusion
                } else {
                    Signal::Patterns(PatternSet::compile(
                        &format!("router.{}", rule.name),
                        &rule.patterns,
                    )?)
                };
                Ok(CompiledIntentRule {
                    name: rule.name.clone(),
                    intent: rule.intent,
                    signal,
                    base_confidence: rule.base_confidence,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let cache = if config.classifier_enabled {
            NonZeroUsize::new(config.classifier_cache_size).map(|n| Mutex::new(LruCache::new(n)))
        } else {
            None
        };

        Ok(Self {
            rules,
            profiles: config.profiles.clone(),
            confusion: ConfusionDetector::new(scaffolding)?,
            confusion_trigger: config.confusion_trigger,
            confidence_floor: config.confidence_floor,
            classifier: None,
            classifier_template: config.classifier_template.clone(),
            classifier_confidence: config.classifier_confidence,
            cache,
        })
    }

    /// Enable the classifier tier. Ignored when the config disabled it.
    pub fn with_classifier(mut self, brain: Brain) -> Self {
        if self.cache.is_some() {
            self.classifier = Some(brain);
        }
        self
    }

    fn decision(&self, intent: Intent, confidence: f64, rule: &str, tier: RoutingTier) -> RoutingDecision {
        RoutingDecision {
            intent,
            profile: self.profiles.get(intent).clone(),
            confidence: confidence.clamp(0.0, 1.0),
            rule: rule.to_string(),
            tier,
        }
    }

    /// Rule tier only. Pure: identical input always yields the same decision.
    pub fn route_rules(&self, query: &str) -> RoutingDecision {
        let text = NormalizedText::new(query);
        let confusion = self.confusion.score(&text.normalized);

        for rule in &self.rules {
            let confidence = match &rule.signal {
                Signal::Patterns(set) => match set.match_count(&text.normalized) {
                    0 => continue,
                    n => (rule.base_confidence + EXTRA_MATCH_BONUS * (n - 1) as f64).min(1.0),
                },
                Signal::Confusion if confusion >= self.confusion_trigger && confusion > 0.0 => {
                    rule.base_confidence
                }
                Signal::Confusion => continue,
                Signal::Fallback => rule.base_confidence,
            };
            return self.decision(rule.intent, confidence, &rule.name, RoutingTier::Rules);
        }

        // Table without a fallback row.
        self.decision(Intent::QuickAnswer, 0.0, "no_rule_matched", RoutingTier::Rules)
    }

    /// Full routing: rule tier, then the classifier when confidence is low.
    pub async fn route(&self, query: &str) -> RoutingDecision {
        let by_rules = self.route_rules(query);
        if by_rules.confidence >= self.confidence_floor {
            return by_rules;
        }
        let (Some(brain), Some(cache)) = (&self.classifier, &self.cache) else {
            return by_rules;
        };

        let key = NormalizedText::new(query).normalized;
        let cached = cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .copied();
        if let Some(intent) = cached {
            debug!(intent = %intent, "Classifier cache hit");
            return self.decision(
                intent,
                self.classifier_confidence,
                "classifier",
                RoutingTier::Classifier,
            );
        }

        let request = GenerationRequest::new(self.classifier_template.clone(), 0.0)
            .var("query", query)
            .var(
                "intents",
                Intent::all().iter().map(|i| i.as_str()).collect::<Vec<_>>(),
            );
        match brain.generate(request).await {
            Ok(response) => match response.text.parse::<Intent>() {
                Ok(intent) => {
                    cache
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .put(key, intent);
                    debug!(intent = %intent, fallback = %by_rules.intent, "Classifier routed query");
                    self.decision(
                        intent,
                        self.classifier_confidence,
                        "classifier",
                        RoutingTier::Classifier,
                    )
                }
                Err(_) => {
                    warn!(reply = %response.text, "Classifier reply is not an intent; keeping rule fallback");
                    by_rules
                }
            },
            Err(e) => {
                warn!(error = %e, "Classifier failed; keeping rule fallback");
                by_rules
            }
        }
    }
}
