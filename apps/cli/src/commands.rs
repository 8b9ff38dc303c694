//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use pedia_core::graph_query::{DEFAULT_FULL_GRAPH_LIMIT, DEFAULT_LOCAL_GRAPH_DEPTH};
use pedia_core::stages::{Stage, VerifyStage};
use pedia_core::{
    ArticleGenerator, EntityExtractor, GenerationStep, Generator, GraphService,
    LlmEntityExtractor, MemoryGraphCache, NoopGraphCache, PipelineManager, ProgressSink,
    QueueName, VerifyJob,
};
use pedia_llm::{ChatModel, OpenRouterClient, TavilyClient, WebSearch};
use pedia_shared::{
    AppConfig, Article, ExtractedEntity, init_config, load_config, resolve_db_path,
    validate_api_key,
};
use pedia_storage::Storage;
use serde_json::Value;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Pedia: a self-growing, cross-linked encyclopedia.
#[derive(Parser)]
#[command(
    name = "pedia",
    version,
    about = "Generate encyclopedia articles and grow a cross-linked knowledge graph around them.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Generate and publish an article, then queue it for enrichment.
    Generate {
        /// Topic of the article.
        query: String,
    },

    /// Run the extract, link, enrich and verify workers until Ctrl-C.
    Worker,

    /// Repair missing backlinks and predict new relations.
    Verify {
        /// Verify a single article.
        #[arg(long, conflicts_with = "all")]
        article: Option<String>,

        /// Verify the most recently updated articles.
        #[arg(long)]
        all: bool,

        /// Number of articles covered by --all (defaults to the configured full-scan limit).
        #[arg(long, requires = "all")]
        limit: Option<u32>,
    },

    /// Query the knowledge graph (JSON output).
    Graph {
        #[command(subcommand)]
        action: GraphAction,
    },

    /// Inspect the job queues.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Graph subcommands.
#[derive(Subcommand)]
pub(crate) enum GraphAction {
    /// Published articles and entities with every link between them.
    Full {
        #[arg(long, default_value_t = DEFAULT_FULL_GRAPH_LIMIT)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// One article, its entities and their relations.
    Local {
        /// Article ID.
        article: String,
        #[arg(long, default_value_t = DEFAULT_LOCAL_GRAPH_DEPTH)]
        depth: u32,
    },
    /// Incoming and outgoing relations of one entity.
    Entity {
        /// Entity ID.
        entity: String,
    },
}

/// Queue subcommands.
#[derive(Subcommand)]
pub(crate) enum QueueAction {
    /// Job counts per queue.
    Stats,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "pedia=info",
        1 => "pedia=debug",
        _ => "pedia=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Generate { query } => cmd_generate(&query).await,
        Command::Worker => cmd_worker().await,
        Command::Verify {
            article,
            all,
            limit,
        } => cmd_verify(article, all, limit).await,
        Command::Graph { action } => cmd_graph(action).await,
        Command::Queue { action } => match action {
            QueueAction::Stats => cmd_queue_stats().await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = resolve_db_path(config)?;
    Ok(Arc::new(Storage::open(&path).await?))
}

/// Open an existing database without running migrations.
async fn open_existing(config: &AppConfig) -> Result<Arc<Storage>> {
    let path: PathBuf = resolve_db_path(config)?;
    if !path.exists() {
        return Err(eyre!(
            "no database at '{}'. Run `pedia generate <query>` first.",
            path.display()
        ));
    }
    Ok(Arc::new(Storage::open_readonly(&path).await?))
}

/// Build the pipeline with the configured model and search clients.
fn build_pipeline(config: &AppConfig, storage: Arc<Storage>) -> Result<PipelineManager> {
    validate_api_key(config)?;

    let model: Arc<dyn ChatModel> = Arc::new(OpenRouterClient::from_config(config)?);
    let search = TavilyClient::from_config(config)?.map(|c| Arc::new(c) as Arc<dyn WebSearch>);
    let extractor: Arc<dyn EntityExtractor> = Arc::new(LlmEntityExtractor::new(model.clone()));
    let generator: Arc<dyn ArticleGenerator> = Arc::new(Generator::new(
        model,
        search,
        extractor.clone(),
        config.policy.clone(),
        config.search.max_results,
    ));

    Ok(PipelineManager::new(
        storage,
        generator,
        extractor,
        Arc::new(MemoryGraphCache::new()),
        config.clone(),
    ))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_generate(query: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let pipeline = build_pipeline(&config, storage)?;

    info!(query, "generating article");
    let progress = CliProgress::new();
    let article = pipeline.generate_and_publish(query, &progress).await?;

    println!();
    println!("  Article published!");
    println!("  ID:     {}", article.id);
    println!("  Title:  {}", article.title);
    println!("  Slug:   {}", article.slug);
    println!("  Length: {} chars", article.content.chars().count());
    println!();
    if config.queue.enabled {
        println!("  Run `pedia worker` to extract, link and enrich it.");
        println!();
    }

    Ok(())
}

async fn cmd_worker() -> Result<()> {
    let config = load_config()?;
    if !config.queue.enabled {
        return Err(eyre!(
            "the job queue is disabled; set `queue.enabled = true` in the config"
        ));
    }
    let storage = open_storage(&config).await?;
    let mut pipeline = build_pipeline(&config, storage)?;

    pipeline.start();
    println!("Workers running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    println!("Shutting down, waiting for in-flight jobs...");
    pipeline.shutdown().await;

    print_json(&pipeline.stats().await?)
}

async fn cmd_verify(article: Option<String>, all: bool, limit: Option<u32>) -> Result<()> {
    let config = load_config()?;
    let job = match (article, all) {
        (Some(article_id), _) => VerifyJob::Article { article_id },
        (None, true) => VerifyJob::FullScan {
            limit: limit.unwrap_or(config.verify.full_scan_limit),
        },
        (None, false) => return Err(eyre!("pass --article <ID> or --all")),
    };

    let storage = open_storage(&config).await?;
    let stage = VerifyStage::new(storage, Arc::new(NoopGraphCache), config.verify.clone());
    let report = stage.handle(job).await?;
    print_json(&report)
}

async fn cmd_graph(action: GraphAction) -> Result<()> {
    let config = load_config()?;
    let storage = open_existing(&config).await?;
    let graph = GraphService::new(storage, Arc::new(NoopGraphCache), &config.cache);

    let value: Value = match action {
        GraphAction::Full { limit, offset } => {
            serde_json::to_value(graph.full_graph(limit, offset).await?)?
        }
        GraphAction::Local { article, depth } => {
            serde_json::to_value(graph.local_graph(&article, depth).await?)?
        }
        GraphAction::Entity { entity } => {
            serde_json::to_value(graph.entity_relations(&entity).await?)?
        }
    };
    print_json(&value)
}

async fn cmd_queue_stats() -> Result<()> {
    let config = load_config()?;
    let storage = open_existing(&config).await?;

    println!("{:<10} {:>8} {:>8} {:>10} {:>8}", "QUEUE", "WAITING", "ACTIVE", "COMPLETED", "FAILED");
    for queue in QueueName::ALL {
        let counts = storage.job_counts(queue.as_str()).await?;
        println!(
            "{:<10} {:>8} {:>8} {:>10} {:>8}",
            queue.as_str(),
            counts.waiting,
            counts.active,
            counts.completed,
            counts.failed
        );
    }
    if !config.queue.enabled {
        println!();
        println!("  (the job queue is disabled in the config)");
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Generation progress rendered with an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressSink for CliProgress {
    fn step_start(&self, _step: GenerationStep, detail: &str) {
        self.spinner.set_message(detail.to_string());
    }

    fn step_complete(&self, step: GenerationStep) {
        self.spinner.println(format!("  ✓ {}", step.as_str()));
    }

    fn step_error(&self, step: GenerationStep, error: &str) {
        self.spinner.println(format!("  ✗ {}: {error}", step.as_str()));
    }

    fn content(&self, text: &str) {
        self.spinner
            .set_message(format!("received {} chars", text.chars().count()));
    }

    fn entity_found(&self, entity: &ExtractedEntity) {
        self.spinner.println(format!(
            "    • {} ({}, {:.2})",
            entity.name, entity.entity_type, entity.relevance
        ));
    }

    fn complete(&self, _article: &Article) {
        self.spinner.finish_and_clear();
    }

    fn error(&self, message: &str) {
        self.spinner.abandon_with_message(format!("failed: {message}"));
    }
}
