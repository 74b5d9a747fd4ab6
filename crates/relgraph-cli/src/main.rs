//! Relgraph CLI - relationship graph over heterogeneous documents

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use relgraph_core::RelationshipPipeline;
use relgraph_core::config::Config;
use relgraph_core::domain::backfill::{BackfillReason, BackfillTrigger};
use relgraph_core::domain::documents::{Document, DocumentKey};
use relgraph_core::domain::identity::{EntityKind, SuggestionStatus};
use relgraph_core::domain::relationships::{Direction, RelationshipType, ReviewStatus};
use relgraph_core::domain::semantic::InMemoryVectorIndex;
use relgraph_core::infrastructure::HttpJudgmentOracle;
use relgraph_core::storage::{Database, DatabaseConfig, default_database_path};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "relgraph")]
#[command(author, version, about = "Bidirectional relationship graph over documents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Workspace to operate on
    #[arg(short, long, global = true, env = "RELGRAPH_WORKSPACE", default_value = "default")]
    workspace: String,

    /// Database file (defaults to the config file setting, then the data directory)
    #[arg(long, global = true, env = "RELGRAPH_DATABASE")]
    database: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest documents from a JSON array or JSON Lines file
    Ingest {
        /// File of documents; each may carry an `embedding` array
        file: PathBuf,
    },

    /// Re-run extraction over stored documents
    Backfill {
        /// Why: new-source-connected, rule-updated or manual
        #[arg(short, long, default_value = "manual")]
        reason: String,
        /// Restrict to these source types
        #[arg(short, long = "source-type")]
        source_types: Vec<String>,
        /// Only documents ingested at or after this RFC 3339 instant
        #[arg(long)]
        since: Option<String>,
    },

    /// Manage entities
    Entities {
        #[command(subcommand)]
        action: EntityAction,
    },

    /// Manage the review queue
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },

    /// Query the relationship graph
    Graph {
        #[command(subcommand)]
        action: GraphAction,
    },

    /// Show relationship counts for the workspace
    Stats,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum EntityAction {
    /// List entities
    List {
        #[arg(short, long)]
        kind: Option<String>,
    },
    /// Merge one entity into another
    Merge {
        from: String,
        into: String,
        #[arg(short, long)]
        reason: String,
    },
    /// Move aliases off an entity onto a new entity
    Split {
        entity: String,
        /// Alias ids to move (repeatable)
        #[arg(short, long = "alias", required = true)]
        aliases: Vec<String>,
        #[arg(short, long)]
        reason: String,
    },
    /// List heuristic merge suggestions
    Suggestions {
        #[arg(short, long)]
        status: Option<String>,
    },
}

#[derive(Subcommand)]
enum ReviewAction {
    /// List review items
    List {
        #[arg(short, long, default_value = "open")]
        status: String,
    },
    /// Approve an item, writing it as a manual relationship
    Approve {
        id: String,
        #[arg(short, long)]
        reason: String,
    },
    /// Reject an item
    Reject {
        id: String,
        #[arg(short, long)]
        reason: String,
    },
}

#[derive(Subcommand)]
enum GraphAction {
    /// Nodes within one or two hops
    Neighbors {
        node: String,
        #[arg(short, long, default_value = "both")]
        direction: String,
        /// Relationship types to follow (repeatable)
        #[arg(short = 't', long = "type")]
        types: Vec<String>,
        #[arg(long, default_value_t = 1)]
        hops: u32,
    },
    /// Stored relationships of a node, with evidence
    Relationships {
        node: String,
        #[arg(short, long, default_value = "both")]
        direction: String,
        #[arg(short = 't', long = "type")]
        types: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relgraph=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Ingest { file } => cmd_ingest(&cli, file).await,
        Commands::Backfill {
            reason,
            source_types,
            since,
        } => cmd_backfill(&cli, reason, source_types, since.as_deref()).await,
        Commands::Entities { action } => cmd_entities(&cli, action).await,
        Commands::Review { action } => cmd_review(&cli, action).await,
        Commands::Graph { action } => cmd_graph(&cli, action).await,
        Commands::Stats => cmd_stats(&cli).await,
        Commands::Config { action } => cmd_config(action, cli.quiet),
        Commands::Doctor => cmd_doctor(&cli).await,
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn open_database(cli: &Cli, config: &Config) -> anyhow::Result<Database> {
    let db_config = match &cli.database {
        Some(path) => DatabaseConfig::with_path(path).max_connections(config.database.max_connections),
        None => DatabaseConfig::from_settings(&config.database),
    };
    Database::new(db_config).await
}

async fn open_pipeline(cli: &Cli) -> anyhow::Result<RelationshipPipeline> {
    let config = Config::load()?;
    let db = open_database(cli, &config).await?;
    Ok(RelationshipPipeline::new(&db, config)?)
}

/// Print JSON in json mode, otherwise run the text renderer unless quiet
fn emit<T: Serialize>(cli: &Cli, value: &T, text: impl FnOnce()) -> anyhow::Result<()> {
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text if !cli.quiet => text(),
        OutputFormat::Text => {}
    }
    Ok(())
}

fn parse_direction(s: &str) -> anyhow::Result<Direction> {
    Direction::parse(s).ok_or_else(|| anyhow!("Unknown direction '{}'. Use out, in or both.", s))
}

fn parse_types(types: &[String]) -> anyhow::Result<Vec<RelationshipType>> {
    types
        .iter()
        .map(|t| {
            RelationshipType::parse(t).ok_or_else(|| anyhow!("Unknown relationship type '{}'", t))
        })
        .collect()
}

/// One ingestion record: a document plus an optional embedding for the semantic stage
struct IngestRecord {
    document: Document,
    embedding: Option<Vec<f32>>,
}

fn read_records(path: &Path, workspace: &str) -> anyhow::Result<Vec<IngestRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let values: Vec<Value> = if content.trim_start().starts_with('[') {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {} as a JSON array", path.display()))?
    } else {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("{}:{}: invalid JSON", path.display(), i + 1))
            })
            .collect::<anyhow::Result<_>>()?
    };

    values
        .into_iter()
        .enumerate()
        .map(|(i, mut value)| {
            let obj = value
                .as_object_mut()
                .ok_or_else(|| anyhow!("record {} is not an object", i + 1))?;
            let embedding = obj
                .remove("embedding")
                .map(serde_json::from_value::<Vec<f32>>)
                .transpose()
                .with_context(|| format!("record {}: embedding must be an array of numbers", i + 1))?;
            obj.entry("workspace_id")
                .or_insert_with(|| Value::String(workspace.to_string()));
            let document: Document = serde_json::from_value(value)
                .with_context(|| format!("record {} is not a document", i + 1))?;
            Ok(IngestRecord {
                document,
                embedding,
            })
        })
        .collect()
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_ingest(cli: &Cli, file: &Path) -> anyhow::Result<()> {
    let records = read_records(file, &cli.workspace)?;
    let config = Config::load()?;
    let db = open_database(cli, &config).await?;

    let index = Arc::new(InMemoryVectorIndex::new());
    let mut embedded = 0;
    for record in &records {
        if let Some(embedding) = &record.embedding {
            index
                .upsert(&record.document.workspace_id, record.document.key(), embedding.clone())
                .await;
            embedded += 1;
        }
    }

    let mut pipeline = RelationshipPipeline::new(&db, config.clone())?;
    if config.semantic.enabled && embedded > 0 {
        match HttpJudgmentOracle::from_config(&config.oracle) {
            Ok(oracle) => pipeline = pipeline.with_semantic(index, Arc::new(oracle)),
            Err(e) => warn!(error = %e, "Semantic stage unavailable"),
        }
    }

    let keys: Vec<DocumentKey> = records.iter().map(|r| r.document.key()).collect();
    let results = pipeline
        .ingest_batch(records.into_iter().map(|r| r.document).collect())
        .await;

    let mut reports = Vec::new();
    let mut failures = Vec::new();
    for (key, result) in keys.into_iter().zip(results) {
        match result {
            Ok(report) => reports.push(report),
            Err(e) => {
                warn!(key = %key, error = %e, "Document failed");
                failures.push(format!("{}: {}", key, e));
            }
        }
    }
    info!(ingested = reports.len(), failed = failures.len(), "Ingestion finished");

    let summary = serde_json::json!({ "reports": reports, "failures": failures });
    emit(cli, &summary, || {
        for report in &reports {
            println!(
                "{}  created={} updated={} pending={} review={} promoted={} semantic={}",
                report.document_id,
                report.created,
                report.updated,
                report.pending,
                report.queued_for_review,
                report.promoted,
                report.semantic_status.as_str(),
            );
        }
        for failure in &failures {
            println!("[!!] {}", failure);
        }
        println!("Ingested {} document(s), {} failed.", reports.len(), failures.len());
    })?;

    if reports.is_empty() && !failures.is_empty() {
        return Err(anyhow!("every document failed to ingest"));
    }
    Ok(())
}

async fn cmd_backfill(
    cli: &Cli,
    reason: &str,
    source_types: &[String],
    since: Option<&str>,
) -> anyhow::Result<()> {
    let reason = BackfillReason::parse(reason).ok_or_else(|| {
        anyhow!("Unknown reason '{}'. Use new-source-connected, rule-updated or manual.", reason)
    })?;
    let mut trigger =
        BackfillTrigger::new(&cli.workspace, reason).with_source_types(source_types.to_vec());
    if let Some(since) = since {
        let cutoff = DateTime::parse_from_rfc3339(since)
            .with_context(|| format!("Invalid --since instant: {}", since))?;
        trigger = trigger.with_cutoff(cutoff.with_timezone(&Utc));
    }

    let pipeline = open_pipeline(cli).await?;
    let report = pipeline.trigger_backfill(&trigger).await?;

    emit(cli, &report, || {
        println!("Backfill {} ({})", report.run_id, report.reason);
        println!("  Scanned:   {}", report.scanned);
        println!("  Processed: {}", report.processed);
        println!("  Created:   {}", report.created);
        println!("  Promoted:  {}", report.promoted);
        println!("  Skipped:   {}", report.skipped);
        println!("  Failed:    {}", report.failed);
        for failure in &report.failures {
            println!("    {}", failure);
        }
    })
}

async fn cmd_entities(cli: &Cli, action: &EntityAction) -> anyhow::Result<()> {
    let pipeline = open_pipeline(cli).await?;
    let ws = cli.workspace.as_str();

    match action {
        EntityAction::List { kind } => {
            let kind = kind
                .as_deref()
                .map(|k| EntityKind::parse(k).ok_or_else(|| anyhow!("Unknown entity kind '{}'", k)))
                .transpose()?;
            let entities = pipeline.list_entities(ws, kind).await?;
            emit(cli, &entities, || {
                if entities.is_empty() {
                    println!("No entities.");
                }
                for entity in &entities {
                    println!("{}  {:<8} {}", entity.id, entity.kind.as_str(), entity.display_name);
                }
            })
        }
        EntityAction::Merge { from, into, reason } => {
            let result = pipeline.merge_entities(ws, from, into, reason).await?;
            emit(cli, &result, || {
                println!("Merged {} into {}", result.from_entity_id, result.into_entity_id);
                println!("  Aliases moved:          {}", result.aliases_moved);
                println!("  Relationships rewritten: {}", result.relationships_rewritten);
                println!("  Relationships dropped:   {}", result.relationships_dropped);
            })
        }
        EntityAction::Split {
            entity,
            aliases,
            reason,
        } => {
            let result = pipeline.split_entity(ws, entity, aliases, reason).await?;
            emit(cli, &result, || {
                println!(
                    "Split {} alias(es) off {} onto {} ({})",
                    result.aliases_moved,
                    result.original_entity_id,
                    result.new_entity.id,
                    result.new_entity.display_name
                );
            })
        }
        EntityAction::Suggestions { status } => {
            let status = status
                .as_deref()
                .map(|s| SuggestionStatus::parse(s).ok_or_else(|| anyhow!("Unknown status '{}'", s)))
                .transpose()?;
            let suggestions = pipeline.list_merge_suggestions(ws, status).await?;
            emit(cli, &suggestions, || {
                if suggestions.is_empty() {
                    println!("No merge suggestions.");
                }
                for s in &suggestions {
                    println!(
                        "{}  {} -> {}  {:.2} [{}] {}",
                        s.id,
                        s.entity_id,
                        s.candidate_entity_id,
                        s.confidence,
                        s.signals.join(","),
                        s.status.as_str()
                    );
                }
            })
        }
    }
}

async fn cmd_review(cli: &Cli, action: &ReviewAction) -> anyhow::Result<()> {
    let pipeline = open_pipeline(cli).await?;
    let ws = cli.workspace.as_str();

    match action {
        ReviewAction::List { status } => {
            let status = if status == "all" {
                None
            } else {
                Some(ReviewStatus::parse(status).ok_or_else(|| anyhow!("Unknown status '{}'", status))?)
            };
            let items = pipeline.list_review_items(ws, status).await?;
            emit(cli, &items, || {
                if items.is_empty() {
                    println!("No review items.");
                }
                for item in &items {
                    println!(
                        "{}  {} -{}-> {}  {:.2} ({})",
                        item.id,
                        item.from,
                        item.relationship_type,
                        item.to,
                        item.confidence,
                        item.status.as_str()
                    );
                }
            })
        }
        ReviewAction::Approve { id, reason } => {
            let write = pipeline.approve_review(ws, id, reason).await?;
            emit(cli, &serde_json::json!({ "review_id": id, "write": write.outcome }), || {
                println!("Approved {} ({})", id, write.outcome);
            })
        }
        ReviewAction::Reject { id, reason } => {
            pipeline.reject_review(ws, id, reason).await?;
            emit(cli, &serde_json::json!({ "review_id": id, "status": "rejected" }), || {
                println!("Rejected {}", id);
            })
        }
    }
}

async fn cmd_graph(cli: &Cli, action: &GraphAction) -> anyhow::Result<()> {
    let pipeline = open_pipeline(cli).await?;
    let ws = cli.workspace.as_str();

    match action {
        GraphAction::Neighbors {
            node,
            direction,
            types,
            hops,
        } => {
            let neighbors = pipeline
                .get_neighbors(ws, node, parse_direction(direction)?, &parse_types(types)?, *hops)
                .await?;
            emit(cli, &neighbors, || {
                if neighbors.is_empty() {
                    println!("No neighbors.");
                }
                for n in &neighbors {
                    println!(
                        "hop {}  {} {}  via {}  {:.2}",
                        n.hop,
                        n.kind.as_str(),
                        n.node_id,
                        n.relationship_type,
                        n.confidence
                    );
                }
            })
        }
        GraphAction::Relationships {
            node,
            direction,
            types,
        } => {
            let relationships = pipeline
                .get_relationships(ws, node, parse_direction(direction)?, &parse_types(types)?)
                .await?;
            emit(cli, &relationships, || {
                if relationships.is_empty() {
                    println!("No relationships.");
                }
                for r in &relationships {
                    println!(
                        "{} -{}-> {}  {:.2} {}",
                        r.from,
                        r.relationship_type,
                        r.to,
                        r.confidence,
                        r.source.as_str()
                    );
                    for e in &r.evidence {
                        println!("    \"{}\" ({})", e.quote, e.reasoning);
                    }
                }
            })
        }
    }
}

async fn cmd_stats(cli: &Cli) -> anyhow::Result<()> {
    let pipeline = open_pipeline(cli).await?;
    let stats = pipeline.stats(&cli.workspace).await?;
    let documents = pipeline.documents().count_documents(&cli.workspace).await?;

    emit(cli, &serde_json::json!({ "documents": documents, "stats": stats }), || {
        println!("Workspace {}", cli.workspace);
        println!("  Documents:      {}", documents);
        println!("  Relationships:  {}", stats.relationships);
        println!("    deterministic {}", stats.deterministic);
        println!("    semantic      {}", stats.semantic);
        println!("    manual        {}", stats.manual);
        println!("  Pending:        {}", stats.pending);
        println!("  Open reviews:   {}", stats.open_reviews);
    })
}

fn cmd_config(action: &ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(key, value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn cmd_doctor(cli: &Cli) -> anyhow::Result<()> {
    let quiet = cli.quiet;
    if !quiet {
        println!("Relgraph Health Check");
        println!("=====================");
        println!();
    }

    let mut all_ok = true;

    let config = match Config::load() {
        Ok(config) => {
            if !quiet {
                println!("[OK] Configuration: Valid");
            }
            match config.oracle.resolved_api_key() {
                Ok(Some(_)) => {
                    if !quiet {
                        let redacted = config.oracle.redacted_api_key()?.unwrap_or_default();
                        println!("[OK] Oracle API key: Configured ({})", redacted);
                    }
                }
                Ok(None) => {
                    if !quiet {
                        println!("[--] Oracle API key: Not configured (semantic stage disabled)");
                        println!("     Set RELGRAPH_ORACLE_API_KEY or OPENROUTER_API_KEY");
                    }
                }
                Err(e) => {
                    all_ok = false;
                    if !quiet {
                        println!("[!!] Oracle API key: Error - {}", e);
                    }
                }
            }
            Some(config)
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Configuration: Error - {}", e);
            }
            None
        }
    };

    if let Some(config) = config {
        let path = cli
            .database
            .clone()
            .or_else(|| config.database.path.clone())
            .unwrap_or_else(default_database_path);
        match open_database(cli, &config).await {
            Ok(db) => match db.migration_status().await {
                Ok(status) => {
                    if !quiet {
                        println!(
                            "[OK] Database: {} (schema v{}/{})",
                            path.display(),
                            status.current_version,
                            status.target_version
                        );
                    }
                }
                Err(e) => {
                    all_ok = false;
                    if !quiet {
                        println!("[!!] Database migrations: Error - {}", e);
                    }
                }
            },
            Err(e) => {
                all_ok = false;
                if !quiet {
                    println!("[!!] Database: {} - {}", path.display(), e);
                }
            }
        }
    }

    if !quiet {
        match Config::config_path() {
            Ok(path) if path.exists() => println!("[OK] Config file: {}", path.display()),
            Ok(path) => println!("[--] Config file: {} (using defaults)", path.display()),
            Err(e) => println!("[!!] Config file: {}", e),
        }
        println!();
        if all_ok {
            println!("All checks passed.");
        } else {
            println!("Some checks failed.");
        }
    }

    if all_ok {
        Ok(())
    } else {
        Err(anyhow!("health check failed"))
    }
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
