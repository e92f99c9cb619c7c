//! Subcommand handlers for the Lectern CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lectern_core::brain::Brain;
use lectern_core::config::LecternConfig;
use lectern_core::governor::Governor;
use lectern_core::pipeline::{PipelineServices, ScaffoldingStage, TutorPipeline};
use lectern_core::prompts::PromptLibrary;
use lectern_core::providers::create_provider;
use lectern_core::retrieval::HttpRetrievalClient;
use lectern_core::retry::RetryPolicy;
use lectern_core::router::IntentRouter;
use lectern_core::store::{InMemoryStore, JsonFileStore, LearnerStore};
use lectern_core::syllabus::StaticSyllabus;
use lectern_core::types::{QueryContext, ResponseStatus, Turn};
use tokio_util::sync::CancellationToken;

use crate::Commands;
use crate::callback::CliCallback;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Ask {
            query,
            user,
            role,
            history,
            no_stream,
            json,
        } => {
            let options = AskOptions {
                user,
                role,
                history,
                no_stream,
                json,
            };
            handle_ask(&query, options, workspace).await
        }
        Commands::Route { query, mastery } => handle_route(&query, &mastery, workspace),
        Commands::Mastery { user } => handle_mastery(&user, workspace).await,
        Commands::History { user, limit } => handle_history(&user, limit, workspace).await,
        Commands::Config => handle_config(workspace),
    }
}

fn load(workspace: &Path) -> anyhow::Result<LecternConfig> {
    let config = lectern_core::config::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    Ok(config)
}

/// Store file from config, else the platform data dir.
fn store_path(config: &LecternConfig) -> Option<PathBuf> {
    config.store.path.clone().or_else(|| {
        directories::ProjectDirs::from("dev", "lectern", "lectern")
            .map(|d| d.data_dir().join("learners.json"))
    })
}

fn open_store(config: &LecternConfig) -> anyhow::Result<Arc<dyn LearnerStore>> {
    match store_path(config) {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let store = JsonFileStore::open(&path)
                .with_context(|| format!("opening learner store {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("No data directory available; learner records will not persist");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

fn load_history(path: &Path) -> anyhow::Result<Vec<Turn>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading history file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing history file {}", path.display()))
}

/// Parse `concept=score` pairs.
fn parse_mastery(pairs: &[String]) -> anyhow::Result<HashMap<String, f64>> {
    pairs
        .iter()
        .map(|pair| {
            let (concept, score) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("expected CONCEPT=SCORE, got '{}'", pair))?;
            let score: f64 = score
                .trim()
                .parse()
                .with_context(|| format!("invalid score in '{pair}'"))?;
            if !(0.0..=1.0).contains(&score) {
                anyhow::bail!("score for '{}' must be within [0, 1]", concept.trim());
            }
            Ok((concept.trim().to_string(), score))
        })
        .collect()
}

struct AskOptions {
    user: String,
    role: Option<String>,
    history: Option<PathBuf>,
    no_stream: bool,
    json: bool,
}

async fn handle_ask(query: &str, options: AskOptions, workspace: &Path) -> anyhow::Result<()> {
    let mut config = load(workspace)?;
    if options.no_stream {
        config.llm.use_streaming = false;
    }

    let prompts = Arc::new(PromptLibrary::from_config(&config.prompts)?);
    let provider = create_provider(&config.llm, prompts).context("LLM provider init failed")?;
    let brain = Brain::new(
        provider,
        Duration::from_secs(config.llm.timeout_secs),
        RetryPolicy::from(&config.retry),
    )
    .with_max_tokens(config.llm.max_tokens);

    let services = PipelineServices {
        brain,
        retrieval: Arc::new(HttpRetrievalClient::new(&config.retrieval)),
        syllabus: Arc::new(StaticSyllabus::from_config(&config.syllabus)),
        store: open_store(&config)?,
    };
    let pipeline = TutorPipeline::new(&config, services)?;

    let mut ctx = QueryContext::new(options.user, query);
    if let Some(role) = options.role {
        ctx = ctx.with_role(role);
    }
    if let Some(path) = &options.history {
        ctx = ctx.with_history(load_history(path)?);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted; finishing with the partial answer");
            on_interrupt.cancel();
        }
    });

    let callback = CliCallback::new(options.json);
    let run = pipeline.process(&ctx, &callback, &cancel).await?;
    let payload = &run.payload;

    if options.json {
        println!("{}", serde_json::to_string_pretty(payload)?);
        return Ok(());
    }

    if callback.streamed() {
        println!();
    } else {
        println!("{}", payload.text);
    }
    if !payload.citations.is_empty() {
        println!("\nSources: {}", payload.citations.join(", "));
    }
    match payload.status {
        ResponseStatus::Answered if payload.budget_exhausted => {
            eprintln!("(best-effort answer: tool budget exhausted)");
        }
        ResponseStatus::Partial => eprintln!("(partial answer)"),
        ResponseStatus::Unavailable => eprintln!("(service unavailable; try again later)"),
        ResponseStatus::Rejected if payload.retryable => {
            eprintln!("(course material is unreachable; try again later)");
        }
        _ => {}
    }
    Ok(())
}

fn handle_route(query: &str, mastery: &[String], workspace: &Path) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let scores = parse_mastery(mastery)?;

    // The scope check needs retrieval; only the integrity table is consulted here.
    let governor = Governor::new(
        &config.governor,
        Arc::new(HttpRetrievalClient::new(&config.retrieval)),
        RetryPolicy::none(),
    )?;
    let router = IntentRouter::new(&config.router, &config.scaffolding)?;
    let stage = ScaffoldingStage::new(&config)?;

    let integrity = governor.integrity_violation(query);
    println!(
        "integrity:   {}",
        integrity.as_deref().map_or("ok".to_string(), |rule| format!("violation ({rule})"))
    );

    let decision = router.route_rules(query);
    println!(
        "intent:      {} (rule {}, confidence {:.2}{})",
        decision.intent,
        decision.rule,
        decision.confidence,
        if decision.confidence < config.router.confidence_floor {
            ", classifier would be consulted"
        } else {
            ""
        }
    );
    println!(
        "responder:   {} / template {}",
        decision.profile.responder, decision.profile.template_id
    );

    let concepts = stage.concepts(query);
    let outcome = stage.run(query, None, decision.intent, concepts, &scores);
    println!(
        "concepts:    {}",
        if outcome.concepts.is_empty() {
            "-".to_string()
        } else {
            outcome.concepts.join(", ")
        }
    );
    println!("confusion:   {:.2}", outcome.confusion);
    println!("mastery:     {:.2}", outcome.prior_mastery);
    println!(
        "scaffolding: {}",
        outcome.level.map(|l| l.as_str()).unwrap_or("none")
    );
    Ok(())
}

async fn handle_mastery(user: &str, workspace: &Path) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let store = open_store(&config)?;
    let mut records = store.mastery_for_user(user).await?;
    if records.is_empty() {
        println!("No mastery records for '{user}'.");
        return Ok(());
    }
    records.sort_by(|a, b| a.concept.cmp(&b.concept));
    println!("Mastery for '{}' ({} concepts):", user, records.len());
    for record in &records {
        println!(
            "  {:<24} {:.3}  (decay {:.2}, assessed {})",
            record.concept,
            record.score,
            record.decay_factor,
            record.last_assessed.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn handle_history(user: &str, limit: usize, workspace: &Path) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let store = open_store(&config)?;
    let records = store.interactions_for(user, limit).await?;
    if records.is_empty() {
        println!("No interactions for '{user}'.");
        return Ok(());
    }
    for record in &records {
        let quality = record
            .quality_score
            .map(|q| format!("{q:.2}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<16} {:<12} {:<12} {:<20} q={}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.outcome,
            record.intent.map(|i| i.as_str()).unwrap_or("-"),
            record.scaffolding_level.map(|l| l.as_str()).unwrap_or("-"),
            record.concept_focus.as_deref().unwrap_or("-"),
            quality
        );
    }
    Ok(())
}

fn handle_config(workspace: &Path) -> anyhow::Result<()> {
    let config = lectern_core::config::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    for warning in config.validate() {
        eprintln!("warning: {warning}");
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_mastery_pairs() {
        let parsed = parse_mastery(&["overfitting=0.9".to_string(), " sgd = 0.25".to_string()])
            .unwrap();
        assert_eq!(parsed["overfitting"], 0.9);
        assert_eq!(parsed["sgd"], 0.25);
    }

    #[test]
    fn test_parse_mastery_rejects_bad_input() {
        assert!(parse_mastery(&["overfitting".to_string()]).is_err());
        assert!(parse_mastery(&["overfitting=high".to_string()]).is_err());
        assert!(parse_mastery(&["overfitting=1.5".to_string()]).is_err());
    }

    #[test]
    fn test_load_history_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(
            &path,
            r#"[{"role": "user", "text": "I'm stuck"}, {"role": "assistant", "text": "Try a smaller step."}]"#,
        )
        .unwrap();
        let turns = load_history(&path).unwrap();
        assert_eq!(turns, vec![Turn::user("I'm stuck"), Turn::assistant("Try a smaller step.")]);
    }

    #[test]
    fn test_store_path_prefers_config() {
        let mut config = LecternConfig::default();
        config.store.path = Some(PathBuf::from("/srv/lectern/learners.json"));
        assert_eq!(
            store_path(&config),
            Some(PathBuf::from("/srv/lectern/learners.json"))
        );
    }
}
