use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conclave_core::analysis::PostMessageClassifier;
use conclave_core::providers::Embedder;
use conclave_core::{
    ConversationLog, KnowledgeRetriever, LanguageModel, MessageRouter, PostMessageOrchestrator,
    ProviderRegistry, SessionState, Team, TeamSession, VectorKnowledgeRetriever,
};
use conclave_knowledge::KnowledgeDb;

mod config;

use config::{ConclaveConfig, expand_home};

const SESSION_NAMESPACE: &str = "session";
const PROMPT_NAMESPACE: &str = "prompts";

#[derive(Parser)]
#[command(name = "conclave")]
#[command(version)]
#[command(about = "Conclave - a team of LLM agents that talk to each other")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory, default config and a sample team
    Init,

    /// Show current configuration (secrets masked)
    Config,

    /// Send one message to the team. Unaddressed text goes to the current agent.
    Chat {
        /// The message, optionally addressed as `Name:::message`
        message: Option<String>,

        /// Answer the pending form with a JSON object instead of a message
        #[arg(long)]
        form: Option<String>,
    },

    /// Classify a message without routing it
    Classify {
        message: String,
    },

    /// Inspect the team definition
    Team {
        #[command(subcommand)]
        action: TeamAction,
    },

    /// Inspect or reset the persisted conversation
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Saved prompts
    Prompt {
        #[command(subcommand)]
        action: PromptAction,
    },

    /// Knowledge-base chunks
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },
}

#[derive(Subcommand)]
enum TeamAction {
    /// Check the team file for empty and duplicate agent names
    Validate,
    /// List the agents of the current team snapshot
    Show,
}

#[derive(Subcommand)]
enum HistoryAction {
    Show {
        /// Only the last N top-level entries
        #[arg(long)]
        last: Option<usize>,
    },
    /// Drop the conversation, amended prompts and pending forms
    Clear,
}

#[derive(Subcommand)]
enum PromptAction {
    Save { name: String, text: String },
    List,
    Delete { id: String },
}

#[derive(Subcommand)]
enum KbAction {
    /// Chunk, embed and store a text file
    Ingest { namespace: String, file: PathBuf },
    Query { namespace: String, text: String },
    Delete { namespace: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config),
        Commands::Chat { message, form } => cmd_chat(&cli.config, message, form).await,
        Commands::Classify { message } => cmd_classify(&cli.config, &message).await,
        Commands::Team { action } => cmd_team(&cli.config, action).await,
        Commands::History { action } => cmd_history(&cli.config, action).await,
        Commands::Prompt { action } => cmd_prompt(&cli.config, action).await,
        Commands::Kb { action } => cmd_kb(&cli.config, action).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!("Created default config at {}", config_path.display());
    }

    let team_path = config_dir.join("team.toml");
    if !team_path.exists() {
        tokio::fs::write(&team_path, include_str!("../../../config/team.toml")).await?;
        info!("Created sample team at {}", team_path.display());
    }

    println!("Conclave initialized at {}", config_dir.display());
    println!(
        "Edit {} to configure your API keys and {} to shape your team.",
        config_path.display(),
        team_path.display()
    );
    Ok(())
}

fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ConclaveConfig::load(config_path)?;
    println!("{:#?}", cfg);
    Ok(())
}

/// Read and validate the team file
fn load_team(cfg: &ConclaveConfig) -> Result<Team> {
    let path = expand_home(&cfg.session.team_file);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read team file at {}", path.display()))?;
    let team: Team = toml::from_str(&content)
        .with_context(|| format!("Failed to parse team file at {}", path.display()))?;
    if let Err(errors) = team.validate() {
        let listed: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        bail!("Team '{}' is invalid: {}", team.name, listed.join("; "));
    }
    Ok(team)
}

fn open_db(cfg: &ConclaveConfig) -> Result<KnowledgeDb> {
    let db_path = expand_home(&cfg.knowledge.db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    KnowledgeDb::new(&db_path).context("Failed to open knowledge database")
}

fn build_registry(cfg: &ConclaveConfig) -> ProviderRegistry {
    ProviderRegistry::new(cfg.providers.endpoints(), cfg.defaults.max_tokens).with_retries(
        cfg.providers.max_retries,
        std::time::Duration::from_millis(cfg.providers.retry_delay_ms),
    )
}

fn build_retriever(
    cfg: &ConclaveConfig,
    registry: &ProviderRegistry,
    db: &KnowledgeDb,
) -> Result<VectorKnowledgeRetriever> {
    let embedder: Arc<dyn Embedder> = Arc::new(registry.embedder(
        &cfg.knowledge.embedding_provider,
        &cfg.knowledge.embedding_model,
    )?);
    Ok(
        VectorKnowledgeRetriever::new(embedder, db.clone(), cfg.knowledge.top_k)
            .with_min_score(cfg.knowledge.min_score),
    )
}

/// Persisted session for `team`, or a fresh one when none matches
async fn load_state(db: &KnowledgeDb, team: Team) -> Result<SessionState> {
    let stored = db
        .get_many(SESSION_NAMESPACE)
        .await?
        .into_iter()
        .find(|entry| entry.key == team.name);
    if let Some(entry) = stored {
        match serde_json::from_value::<SessionState>(entry.value) {
            Ok(state) => return Ok(state),
            Err(e) => warn!("Ignoring unreadable stored session: {}", e),
        }
    }
    info!("Starting a fresh session for team '{}'", team.name);
    Ok(SessionState::new(team))
}

async fn save_state(db: &KnowledgeDb, state: &SessionState) -> Result<()> {
    let value = serde_json::to_value(state)?;
    db.put(value, &state.team.name, SESSION_NAMESPACE).await?;
    Ok(())
}

async fn cmd_chat(
    config_path: &Option<PathBuf>,
    message: Option<String>,
    form: Option<String>,
) -> Result<()> {
    let cfg = ConclaveConfig::load(config_path)?;
    let team = load_team(&cfg)?;
    let db = open_db(&cfg)?;
    let registry = Arc::new(build_registry(&cfg));

    let mut router = MessageRouter::new(
        registry.clone() as Arc<dyn LanguageModel>,
        cfg.router.to_router_config(),
    );
    match build_retriever(&cfg, &registry, &db) {
        Ok(retriever) => {
            router = router.with_knowledge(Arc::new(retriever) as Arc<dyn KnowledgeRetriever>)
        }
        Err(e) => warn!("Knowledge bases disabled: {:#}", e),
    }
    let router = Arc::new(router);

    let orchestrator = PostMessageOrchestrator::new(
        registry,
        cfg.defaults.utility_model_args(),
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        cfg.analysis.to_analysis_config(),
    )
    .with_router(router.clone());

    let state = load_state(&db, team).await?;
    let mut session = TeamSession::new(router, orchestrator, state, cfg.session.user_id.clone())
        .with_turn_policy(cfg.session.turn_policy);

    let report = match (message, form) {
        (_, Some(form)) => {
            let values: serde_json::Value =
                serde_json::from_str(&form).context("--form must be a JSON object")?;
            session.submit_form(&values).await?
        }
        (Some(message), None) => session.submit(&message).await?,
        (None, None) => bail!("Nothing to send: pass a message or --form"),
    };

    save_state(&db, session.state()).await?;

    println!("[{}] {}", report.agent_name, report.response);
    println!();
    println!("flag: {}", report.flag);
    if !report.reason.is_empty() {
        println!("reason: {}", report.reason);
    }
    if let Some(url) = &report.meta_data.auth_url {
        let platform = report.meta_data.platform.as_deref().unwrap_or("the service");
        println!("authorize {}: {}", platform, url);
    }
    if let Some(form) = &report.request_form {
        println!(
            "form requested by {}:\n{}",
            form.requesting_agent,
            serde_json::to_string_pretty(&form.schema)?
        );
    }
    if let Some(diff) = &report.prompt_amendment {
        println!("prompt amendments:\n{}", diff);
    }
    Ok(())
}

async fn cmd_classify(config_path: &Option<PathBuf>, message: &str) -> Result<()> {
    let cfg = ConclaveConfig::load(config_path)?;
    let team = load_team(&cfg)?;
    let llm: Arc<dyn LanguageModel> = Arc::new(build_registry(&cfg));
    let classifier = PostMessageClassifier::new(llm, cfg.defaults.utility_model_args());
    let classification = classifier
        .classify(message, &ConversationLog::new(), &team)
        .await?;
    println!("{}", serde_json::to_string_pretty(&classification)?);
    Ok(())
}

async fn cmd_team(config_path: &Option<PathBuf>, action: TeamAction) -> Result<()> {
    let cfg = ConclaveConfig::load(config_path)?;
    match action {
        TeamAction::Validate => {
            let team = load_team(&cfg)?;
            println!("Team '{}' is valid ({} agents).", team.name, team.len());
        }
        TeamAction::Show => {
            let team = load_team(&cfg)?;
            let db = open_db(&cfg)?;
            let state = load_state(&db, team).await?;
            let team = &state.team;
            println!("{} (version {})", team.name, team.version);
            if !team.objectives.is_empty() {
                println!("{}", team.objectives);
            }
            println!();
            for (i, agent) in team.agents.iter().enumerate() {
                let marker = if i == state.current_agent { "*" } else { " " };
                let disabled = if agent.disabled { " [disabled]" } else { "" };
                println!(
                    "{} {} - {} ({}){}",
                    marker, agent.name, agent.title, agent.model_args, disabled
                );
            }
        }
    }
    Ok(())
}

async fn cmd_history(config_path: &Option<PathBuf>, action: HistoryAction) -> Result<()> {
    let cfg = ConclaveConfig::load(config_path)?;
    let team = load_team(&cfg)?;
    let db = open_db(&cfg)?;

    match action {
        HistoryAction::Show { last } => {
            let state = load_state(&db, team).await?;
            let messages = state.history.messages();
            let skip = last.map_or(0, |n| messages.len().saturating_sub(n));
            let shown = ConversationLog::from_messages(messages[skip..].to_vec());
            if shown.is_empty() {
                println!("No conversation yet.");
            } else {
                println!("{}", shown.transcript());
            }
        }
        HistoryAction::Clear => {
            let mut removed = false;
            for entry in db.get_many(SESSION_NAMESPACE).await? {
                if entry.key == team.name {
                    removed |= db.delete(&entry.id).await?;
                }
            }
            if removed {
                println!("Cleared conversation for team '{}'.", team.name);
            } else {
                println!("Nothing to clear.");
            }
        }
    }
    Ok(())
}

async fn cmd_prompt(config_path: &Option<PathBuf>, action: PromptAction) -> Result<()> {
    let cfg = ConclaveConfig::load(config_path)?;
    let db = open_db(&cfg)?;

    match action {
        PromptAction::Save { name, text } => {
            let id = db
                .put(serde_json::Value::String(text), &name, PROMPT_NAMESPACE)
                .await?;
            println!("Saved prompt '{}' ({})", name, id);
        }
        PromptAction::List => {
            let entries = db.get_many(PROMPT_NAMESPACE).await?;
            if entries.is_empty() {
                println!("No saved prompts.");
            }
            for entry in entries {
                let text = entry.value.as_str().unwrap_or_default();
                println!("{}  {}  {}", entry.id, entry.key, text);
            }
        }
        PromptAction::Delete { id } => {
            if db.delete(&id).await? {
                println!("Deleted prompt {}", id);
            } else {
                println!("No prompt with id {}", id);
            }
        }
    }
    Ok(())
}

async fn cmd_kb(config_path: &Option<PathBuf>, action: KbAction) -> Result<()> {
    let cfg = ConclaveConfig::load(config_path)?;
    let db = open_db(&cfg)?;

    match action {
        KbAction::Ingest { namespace, file } => {
            let text = read_text(&file)?;
            let retriever = build_retriever(&cfg, &build_registry(&cfg), &db)?;
            let count = retriever
                .ingest(&namespace, &text, cfg.knowledge.chunk_chars)
                .await?;
            println!("Stored {} chunks in '{}'", count, namespace);
        }
        KbAction::Query { namespace, text } => {
            let retriever = build_retriever(&cfg, &build_registry(&cfg), &db)?;
            match retriever.retrieve(&namespace, &text).await? {
                Some(set) => println!("{}", set.render()),
                None => println!("No matching chunks in '{}'", namespace),
            }
        }
        KbAction::Delete { namespace } => {
            let removed = db.delete_namespace(&namespace).await?;
            println!("Deleted {} chunks from '{}'", removed, namespace);
        }
    }
    Ok(())
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_chat_with_form() {
        let cli = Cli::parse_from(["conclave", "chat", "--form", "{\"a\":1}"]);
        match cli.command {
            Commands::Chat { message, form } => {
                assert!(message.is_none());
                assert_eq!(form.as_deref(), Some("{\"a\":1}"));
            }
            _ => panic!("expected chat"),
        }
    }

    #[test]
    fn test_sample_team_is_valid() {
        let team: Team = toml::from_str(include_str!("../../../config/team.toml")).unwrap();
        assert!(team.validate().is_ok());
        assert_eq!(team.agents.len(), 3);
        assert_eq!(team.agents[1].allowed_contacts, vec!["Scribe"]);
        assert_eq!(team.agents[2].knowledge_base.as_deref(), Some("launch-docs"));
    }

    #[tokio::test]
    async fn test_state_round_trip_through_db() {
        let db = KnowledgeDb::in_memory().unwrap();
        let team = Team::new("Launch", "ship it");
        let mut state = SessionState::new(team.clone());
        state.history.append_turn("Scribe", "hi", "hello");
        save_state(&db, &state).await.unwrap();

        let loaded = load_state(&db, team).await.unwrap();
        assert_eq!(loaded, state);

        let other = load_state(&db, Team::new("Other", "")).await.unwrap();
        assert!(other.history.is_empty());
    }
}
