//! Prompt templates addressed by template id.
//!
//! Each template id has a `system` and a `user` part rendered with
//! handlebars. Built-in templates can be overridden per part from
//! configuration (`[prompts.templates]`, keys like `"tutor.system"`).

use handlebars::Handlebars;
use serde_json::{Map, Value};

use crate::config::PromptsConfig;
use crate::error::{ConfigError, LlmError};
use crate::types::ScaffoldingLevel;

/// A rendered prompt ready for a chat-style model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

const SHARED_CONTEXT: &str = r#"{{#if history}}
Recent conversation:
{{#each history}}
{{role}}: {{text}}
{{/each}}
{{/if}}
{{#if passages}}
Course material (cite with the bracketed number, e.g. [1]):
{{#each passages}}
[{{index}}] ({{source_id}}) {{text}}
{{/each}}
{{else}}
No course material was retrieved for this question.
{{/if}}
{{#if tool_results}}
Tool results so far:
{{#each tool_results}}
- {{name}}: {{output}}
{{/each}}
{{/if}}
{{#if budget_exhausted}}
You have used all available tool calls. Answer now with what you have.
{{/if}}"#;

const TUTOR_SYSTEM: &str = r#"You are a patient teaching assistant for a single university course.
Teach; do not just tell. Ask at most one guiding question per reply.
Support level: {{level}}. {{level_guidance}}
Only use facts from the course material and cite them as [n]. Never write a complete,
submittable solution to graded work unless the support level is "demonstrated"."#;

const EXPLAIN_SYSTEM: &str = r#"You are a teaching assistant for a single university course.
Give a clear, medium-depth explanation with one small example. Avoid long digressions.
Support level: {{level}}. {{level_guidance}}
Only use facts from the course material and cite them as [n]."#;

const MATH_SYSTEM: &str = r#"You are a teaching assistant for the mathematical parts of a university course.
Work step by step, name each rule you apply, and keep notation consistent with the course material.
Support level: {{level}}. {{level_guidance}}
Cite the course material as [n]. Do not finish graded derivations for the student below the
"demonstrated" level; stop at the step they need to do themselves."#;

const CODE_SYSTEM: &str = r#"You are a programming assistant for a university course.
Explain errors precisely, point to the relevant line or concept, and prefer small illustrative
snippets over complete programs. Cite course material as [n] when it applies.
Never write complete solutions to graded assignments."#;

const LOGISTICS_SYSTEM: &str = r#"You answer questions about course logistics: schedule, deadlines, grading
and course structure. Answer in at most {{max_words}} words. Use only the course material and syllabus
results, cite them as [n], and say so plainly if the answer is not there."#;

const QUICK_SYSTEM: &str = r#"You give short, accurate answers about a university course's subject matter.
Answer in at most {{max_words}} words. Cite course material as [n] if any was provided."#;

const ANSWER_USER: &str = r#"{{> shared_context}}

Student question: {{query}}"#;

const CLASSIFIER_SYSTEM: &str = r#"Classify a student's message to a course assistant into exactly one intent.
Reply with the intent name only.
- tutor: wants to understand a concept, is confused, or asks why/how
- explain: asks what something is or for a definition-level explanation
- math: asks for a derivation, proof, formula or calculation
- code: asks about programming, libraries, errors or implementation
- logistics: asks about schedule, deadlines, grading or course structure
- quick_answer: wants a brief fact"#;

const CLASSIFIER_USER: &str = r#"Message: {{query}}
Intent:"#;

/// Guidance appended to teaching prompts for each scaffolding level.
pub fn level_guidance(level: ScaffoldingLevel) -> &'static str {
    match level {
        ScaffoldingLevel::Hint => {
            "Give a single hint that points toward the next step; do not explain the full idea."
        }
        ScaffoldingLevel::Guided => {
            "Lead with questions and partial steps so the student reaches the answer themselves."
        }
        ScaffoldingLevel::Explained => {
            "Explain the idea fully in plain language, then check understanding with one question."
        }
        ScaffoldingLevel::Demonstrated => {
            "Walk through a complete worked example step by step, then restate the key idea."
        }
    }
}

const BUILTIN: &[(&str, &str, &str)] = &[
    ("tutor", TUTOR_SYSTEM, ANSWER_USER),
    ("explain", EXPLAIN_SYSTEM, ANSWER_USER),
    ("math", MATH_SYSTEM, ANSWER_USER),
    ("code", CODE_SYSTEM, ANSWER_USER),
    ("logistics", LOGISTICS_SYSTEM, ANSWER_USER),
    ("quick_answer", QUICK_SYSTEM, ANSWER_USER),
    ("intent_classifier", CLASSIFIER_SYSTEM, CLASSIFIER_USER),
];

/// Registry of prompt templates.
pub struct PromptLibrary {
    registry: Handlebars<'static>,
}

impl PromptLibrary {
    /// Built-in templates only.
    pub fn builtin() -> Self {
        Self::from_config(&PromptsConfig::default())
            .unwrap_or_else(|_| Self {
                registry: Handlebars::new(),
            })
    }

    /// Built-in templates with configured overrides applied on top.
    pub fn from_config(config: &PromptsConfig) -> Result<Self, ConfigError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(false);
        registry.register_escape_fn(handlebars::no_escape);

        let register = |registry: &mut Handlebars<'static>, name: &str, source: &str| {
            registry
                .register_template_string(name, source)
                .map_err(|e| ConfigError::InvalidPattern {
                    table: "prompts".to_string(),
                    pattern: name.to_string(),
                    message: e.to_string(),
                })
        };

        registry
            .register_partial("shared_context", SHARED_CONTEXT)
            .map_err(|e| ConfigError::InvalidPattern {
                table: "prompts".to_string(),
                pattern: "shared_context".to_string(),
                message: e.to_string(),
            })?;

        for (id, system, user) in BUILTIN {
            register(&mut registry, &format!("{id}.system"), system)?;
            register(&mut registry, &format!("{id}.user"), user)?;
        }
        for (name, source) in &config.templates {
            if !name.ends_with(".system") && !name.ends_with(".user") {
                return Err(ConfigError::Invalid {
                    message: format!(
                        "prompt override '{name}' must end with '.system' or '.user'"
                    ),
                });
            }
            register(&mut registry, name, source)?;
        }

        Ok(Self { registry })
    }

    pub fn has_template(&self, template_id: &str) -> bool {
        self.registry
            .has_template(&format!("{template_id}.system"))
            && self.registry.has_template(&format!("{template_id}.user"))
    }

    /// Render both parts of `template_id` with `variables`.
    pub fn render(
        &self,
        template_id: &str,
        variables: &Map<String, Value>,
    ) -> Result<RenderedPrompt, LlmError> {
        if !self.has_template(template_id) {
            return Err(LlmError::UnknownTemplate {
                template_id: template_id.to_string(),
            });
        }
        let data = Value::Object(variables.clone());
        let part = |suffix: &str| {
            self.registry
                .render(&format!("{template_id}.{suffix}"), &data)
                .map(|s| s.trim().to_string())
                .map_err(|e| LlmError::TemplateRender {
                    template_id: template_id.to_string(),
                    message: e.to_string(),
                })
        };
        Ok(RenderedPrompt {
            system: part("system")?,
            user: part("user")?,
        })
    }
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_builtin_templates_present() {
        let lib = PromptLibrary::builtin();
        for id in [
            "tutor",
            "explain",
            "math",
            "code",
            "logistics",
            "quick_answer",
            "intent_classifier",
        ] {
            assert!(lib.has_template(id), "missing template {id}");
        }
        assert!(!lib.has_template("weather"));
    }

    #[test]
    fn test_render_passages_and_level() {
        let lib = PromptLibrary::builtin();
        let rendered = lib
            .render(
                "tutor",
                &vars(json!({
                    "query": "why does <x> & y converge?",
                    "level": "hint",
                    "level_guidance": level_guidance(ScaffoldingLevel::Hint),
                    "passages": [
                        {"index": 1, "source_id": "lec3", "text": "Gradient descent steps downhill."}
                    ]
                })),
            )
            .unwrap();
        assert!(rendered.system.contains("Support level: hint"));
        assert!(rendered.user.contains("[1] (lec3) Gradient descent steps downhill."));
        // No HTML escaping of the student's text.
        assert!(rendered.user.contains("why does <x> & y converge?"));
    }

    #[test]
    fn test_render_without_passages() {
        let lib = PromptLibrary::builtin();
        let rendered = lib
            .render("quick_answer", &vars(json!({"query": "q", "max_words": 60})))
            .unwrap();
        assert!(rendered.user.contains("No course material was retrieved"));
        assert!(rendered.system.contains("at most 60 words"));
    }

    #[test]
    fn test_render_budget_exhausted_note() {
        let lib = PromptLibrary::builtin();
        let rendered = lib
            .render(
                "code",
                &vars(json!({"query": "q", "budget_exhausted": true})),
            )
            .unwrap();
        assert!(rendered.user.contains("used all available tool calls"));
    }

    #[test]
    fn test_unknown_template() {
        let lib = PromptLibrary::builtin();
        let err = lib.render("nope", &Map::new()).unwrap_err();
        assert!(matches!(err, LlmError::UnknownTemplate { .. }));
    }

    #[test]
    fn test_override_from_config() {
        let mut config = PromptsConfig::default();
        config
            .templates
            .insert("quick_answer.system".into(), "Be terse about {{query}}.".into());
        let lib = PromptLibrary::from_config(&config).unwrap();
        let rendered = lib
            .render("quick_answer", &vars(json!({"query": "tensors"})))
            .unwrap();
        assert_eq!(rendered.system, "Be terse about tensors.");
    }

    #[test]
    fn test_override_bad_name_rejected() {
        let mut config = PromptsConfig::default();
        config.templates.insert("tutor".into(), "x".into());
        assert!(PromptLibrary::from_config(&config).is_err());
    }
}
